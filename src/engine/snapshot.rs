use crate::engine::types::PriceRecord;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// On-disk state carried across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    #[serde(default)]
    pub seen_actions: Vec<String>,
    #[serde(default)]
    pub price_history: BTreeMap<String, PriceRecord>,
    #[serde(default)]
    pub last_check_time: Option<String>,
    #[serde(default)]
    pub daily_message_count: u32,
    /// `YYYY-MM-DD`, local calendar date.
    #[serde(default)]
    pub last_daily_reset: Option<String>,
}

impl MonitorSnapshot {
    /// Missing or unreadable files yield an empty state; a stale date zeroes the daily counter.
    pub fn load_or_default(path: &Path, today: NaiveDate) -> Self {
        let mut snap = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<MonitorSnapshot>(&raw) {
                Ok(s) => {
                    info!(
                        seen = s.seen_actions.len(),
                        prices = s.price_history.len(),
                        "state loaded"
                    );
                    s
                }
                Err(e) => {
                    warn!(err = %e, path = %path.display(), "state file corrupt, starting fresh");
                    MonitorSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MonitorSnapshot::default(),
            Err(e) => {
                warn!(err = %e, path = %path.display(), "state file unreadable, starting fresh");
                MonitorSnapshot::default()
            }
        };

        if snap.reset_date() != Some(today) {
            snap.daily_message_count = 0;
            snap.last_daily_reset = Some(today.format("%Y-%m-%d").to_string());
        }
        snap
    }

    pub fn reset_date(&self) -> Option<NaiveDate> {
        self.last_daily_reset
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serialize state")?;
        write_atomic(path, &json)
    }
}

/// Writes `<path>.tmp` then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
