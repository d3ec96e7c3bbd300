//! Pure anchor arithmetic: no clocks, no sleeping.

use anyhow::{bail, Result};
use chrono::{DateTime, Days, Duration, NaiveTime, Utc};

use crate::config::zone::ReferenceZone;

/// Sorted, de-duplicated set of local hours (0..=23) at which a cycle runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSet {
    hours: Vec<u32>,
}

impl Default for AnchorSet {
    /// 00:00, 03:00, ... 21:00.
    fn default() -> Self {
        Self {
            hours: (0..24).step_by(3).collect(),
        }
    }
}

impl AnchorSet {
    pub fn new(hours: impl IntoIterator<Item = u32>) -> Result<Self> {
        let mut hours: Vec<u32> = hours.into_iter().collect();
        if let Some(bad) = hours.iter().find(|h| **h > 23) {
            bail!("anchor hour {bad} is out of range 0..=23");
        }
        hours.sort_unstable();
        hours.dedup();
        if hours.is_empty() {
            bail!("at least one anchor hour is required");
        }
        Ok(Self { hours })
    }

    pub fn hours(&self) -> &[u32] {
        &self.hours
    }

    /// Earliest anchor instant at or after `now`. Past today's last anchor
    /// this is the first anchor of the next local day.
    pub fn next_anchor(&self, now: DateTime<Utc>, zone: &ReferenceZone) -> DateTime<Utc> {
        let today = zone.local_date(now);
        // Two days always suffice; the third only matters around DST shifts.
        for offset in 0..3 {
            let Some(day) = today.checked_add_days(Days::new(offset)) else {
                break;
            };
            for &h in &self.hours {
                let Some(t) = NaiveTime::from_hms_opt(h, 0, 0) else {
                    continue;
                };
                let at = zone.to_utc(day.and_time(t));
                if at >= now {
                    return at;
                }
            }
        }
        now
    }

    /// Next instant at or after `now` that sits `delay` past an anchor.
    pub fn next_offset_anchor(
        &self,
        now: DateTime<Utc>,
        zone: &ReferenceZone,
        delay: Duration,
    ) -> DateTime<Utc> {
        self.next_anchor(now - delay, zone) + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn shanghai() -> ReferenceZone {
        ReferenceZone::resolve("Asia/Shanghai")
    }

    // 2025-09-06 in Shanghai; `h:m` is local time.
    fn local(h: u32, m: u32) -> DateTime<Utc> {
        let tz: chrono_tz::Tz = "Asia/Shanghai".parse().unwrap();
        tz.with_ymd_and_hms(2025, 9, 6, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn rejects_bad_anchor_sets() {
        assert!(AnchorSet::new([24]).is_err());
        assert!(AnchorSet::new(Vec::<u32>::new()).is_err());
        assert_eq!(AnchorSet::new([9, 0, 9]).unwrap().hours(), &[0, 9]);
    }

    #[test]
    fn picks_next_anchor_same_day() {
        let a = AnchorSet::default();
        assert_eq!(a.next_anchor(local(10, 30), &shanghai()), local(12, 0));
        assert_eq!(a.next_anchor(local(0, 1), &shanghai()), local(3, 0));
    }

    #[test]
    fn exact_anchor_is_returned_as_is() {
        let a = AnchorSet::default();
        assert_eq!(a.next_anchor(local(15, 0), &shanghai()), local(15, 0));
    }

    #[test]
    fn rolls_to_first_anchor_of_next_day() {
        let a = AnchorSet::new([6, 18]).unwrap();
        let next = a.next_anchor(local(18, 1), &shanghai());
        let tz: chrono_tz::Tz = "Asia/Shanghai".parse().unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2025, 9, 7, 6, 0, 0).unwrap().with_timezone(&Utc));
    }

    #[test]
    fn offset_schedule_tracks_anchor_plus_delay() {
        let a = AnchorSet::default();
        let d = Duration::minutes(15);
        assert_eq!(a.next_offset_anchor(local(3, 5), &shanghai(), d), local(3, 15));
        assert_eq!(a.next_offset_anchor(local(3, 15), &shanghai(), d), local(3, 15));
        assert_eq!(a.next_offset_anchor(local(3, 16), &shanghai(), d), local(6, 15));
    }

    #[test]
    fn next_anchor_is_never_in_the_past_and_on_grid() {
        let sets = [
            AnchorSet::default(),
            AnchorSet::new([0]).unwrap(),
            AnchorSet::new([5, 23]).unwrap(),
        ];
        let zones = [
            shanghai(),
            ReferenceZone::utc_plus_8(),
            ReferenceZone::resolve("UTC"),
            ReferenceZone::resolve("America/New_York"),
        ];
        let start = Utc.with_ymd_and_hms(2025, 3, 8, 0, 0, 0).unwrap();
        for set in &sets {
            for zone in &zones {
                // every 37 minutes across ~3 days, crossing a DST switch
                for step in 0..120 {
                    let now = start + Duration::minutes(37 * step);
                    let next = set.next_anchor(now, zone);
                    assert!(next >= now, "{next} < {now}");
                    assert!(next - now <= Duration::hours(25));
                    let local_hour = match zone {
                        ReferenceZone::Named(tz) => next.with_timezone(tz).hour(),
                        ReferenceZone::Fixed(off) => next.with_timezone(off).hour(),
                    };
                    let in_set = set.hours().contains(&local_hour);
                    // a DST gap may push an anchor one hour later
                    let shifted = set.hours().contains(&(local_hour.saturating_sub(1)));
                    assert!(in_set || shifted, "hour {local_hour} not an anchor");
                    assert_eq!(next.minute(), 0);
                }
            }
        }
    }
}
