use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::sqlite::SqliteStore;
use crate::fetch::types::SourceDefinition;

/// Load source definitions from a file. Supports TOML (`[[sources]]`) or
/// JSON (a bare array, or `{"sources": [...]}`).
pub fn load_sources_from(path: &Path) -> Result<Vec<SourceDefinition>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let defs = parse_sources(&content, ext.as_str())?;
    check_names(&defs)?;
    Ok(defs)
}

#[derive(serde::Deserialize)]
struct SourcesFile {
    sources: Vec<SourceDefinition>,
}

fn parse_sources(s: &str, hint_ext: &str) -> Result<Vec<SourceDefinition>> {
    if hint_ext == "toml" {
        let v: SourcesFile = toml::from_str(s).context("parsing sources TOML")?;
        return Ok(v.sources);
    }
    if let Ok(v) = serde_json::from_str::<Vec<SourceDefinition>>(s) {
        return Ok(v);
    }
    if let Ok(v) = serde_json::from_str::<SourcesFile>(s) {
        return Ok(v.sources);
    }
    // Unknown extension: last chance as TOML.
    toml::from_str::<SourcesFile>(s)
        .map(|v| v.sources)
        .map_err(|e| anyhow!("unsupported sources format: {e}"))
}

fn check_names(defs: &[SourceDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for d in defs {
        let name = d.name.trim();
        if name.is_empty() {
            bail!("source with url {} has an empty name", d.url);
        }
        if !seen.insert(name) {
            bail!("duplicate source name {name:?}");
        }
    }
    Ok(())
}

/// Upsert every definition into the registry. Returns how many were written.
pub async fn seed_registry(store: &SqliteStore, defs: &[SourceDefinition]) -> Result<usize> {
    for d in defs {
        store.upsert_source(d).await?;
    }
    tracing::info!(target: "store", count = defs.len(), "Seeded source registry");
    Ok(defs.len())
}
