use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
const FALLBACK_OFFSET_SECS: i32 = 8 * 3600;

/// Timezone that defines calendar days and anchor hours. Built once at
/// startup and passed by value to whoever needs dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Default for ReferenceZone {
    fn default() -> Self {
        Self::resolve(DEFAULT_TIMEZONE)
    }
}

impl ReferenceZone {
    /// Named IANA zone, or fixed UTC+08:00 if the name does not resolve.
    pub fn resolve(name: &str) -> Self {
        match name.trim().parse::<Tz>() {
            Ok(tz) => Self::Named(tz),
            Err(e) => {
                tracing::warn!(timezone = name, error = %e, "Unknown timezone, falling back to UTC+08:00");
                Self::utc_plus_8()
            }
        }
    }

    pub fn utc_plus_8() -> Self {
        Self::Fixed(FixedOffset::east_opt(FALLBACK_OFFSET_SECS).expect("UTC+8 is a valid offset"))
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Named(tz) => at.with_timezone(tz).date_naive(),
            Self::Fixed(off) => at.with_timezone(off).date_naive(),
        }
    }

    /// Map a local wall-clock time to UTC. Ambiguous times take the earlier
    /// mapping; times inside a DST gap move forward to the first valid one.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self {
            Self::Named(tz) => resolve_local(tz, local),
            Self::Fixed(off) => resolve_local(off, local),
        }
    }
}

fn resolve_local<Z: TimeZone>(zone: &Z, local: NaiveDateTime) -> DateTime<Utc> {
    let mut probe = local;
    // DST gaps are at most a few hours; probe in 15 minute steps.
    for _ in 0..=24 {
        if let Some(t) = zone.from_local_datetime(&probe).earliest() {
            return t.with_timezone(&Utc);
        }
        probe += Duration::minutes(15);
    }
    Utc.from_utc_datetime(&local)
}
