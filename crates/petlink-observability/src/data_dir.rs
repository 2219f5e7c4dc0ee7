use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub const DATA_DIR_ENV: &str = "PETLINK_DATA_DIR";

/// Directory holding `trace.jsonl`, `config.json` and `panic.log`.
///
/// `PETLINK_DATA_DIR` wins; otherwise `petlink` under the platform's per-user
/// local data dir.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(DATA_DIR_ENV) {
        let t = p.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("unable to resolve local app data dir"))?;
    Ok(base.join("petlink"))
}
