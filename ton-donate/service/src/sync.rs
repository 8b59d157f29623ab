// Copyright (c) 2024 The Botho Foundation

//! Watch state persistence.
//!
//! Each watched address keeps a small JSON file with its high-water mark and
//! running counters, so a tracked watcher resumes where it stopped and
//! `ton-donate status` can report progress.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ton_donate_core::Cursor;

use crate::watch::CycleReport;

/// Persistent state of one watch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchState {
    /// Watched address
    pub address: String,

    /// Last transaction whose predecessors all reached a final outcome
    pub high_water_mark: Option<Cursor>,

    /// Timestamp of the last completed cycle (Unix timestamp)
    pub last_cycle_timestamp: u64,

    #[serde(default)]
    pub totals: WatchTotals,
}

/// Running counters across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchTotals {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub transactions_seen: u64,
    pub notified: u64,
    /// Sum of notified amounts (nanotons)
    pub amount_notified: u64,
    pub already_acknowledged: u64,
    pub discarded: u64,
    pub unattributed: u64,
    pub decode_errors: u64,
    pub notification_failures: u64,
    pub storage_errors: u64,
    /// Cycles that could not page back to the high-water mark
    pub gaps: u64,
}

/// Path of the state file for `address` under `state_dir`.
pub fn state_path(state_dir: impl AsRef<Path>, address: &str) -> PathBuf {
    let name: String = address
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    state_dir.as_ref().join(format!("{}.json", name))
}

impl WatchState {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    /// Load watch state from a file.
    ///
    /// Returns fresh state if the file doesn't exist.
    pub fn load(path: &Path, address: &str) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No watch state for {}, starting from scratch", address);
            return Ok(Self::new(address));
        }

        let content = std::fs::read_to_string(path)?;
        let state: WatchState = serde_json::from_str(&content)?;
        if state.address != address {
            anyhow::bail!(
                "state file {} belongs to {}, not {}",
                path.display(),
                state.address,
                address
            );
        }

        tracing::info!(
            "Loaded watch state for {}: mark={:?}, notified={}",
            address,
            state.high_water_mark.as_ref().map(|c| c.lt),
            state.totals.notified
        );

        Ok(state)
    }

    /// Save watch state to a file.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent corruption.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        tracing::debug!("Saved watch state for {}", self.address);

        Ok(())
    }

    /// Fold a completed cycle into the state.
    ///
    /// The high-water mark only ever moves forward.
    pub fn record_cycle(&mut self, report: &CycleReport) {
        if let Some(cursor) = &report.advanced_to {
            let newer = self
                .high_water_mark
                .as_ref()
                .map_or(true, |mark| cursor.lt > mark.lt);
            if newer {
                self.high_water_mark = Some(cursor.clone());
            }
        }

        self.last_cycle_timestamp = now();

        let t = &mut self.totals;
        t.cycles += 1;
        t.transactions_seen += report.fetched as u64;
        t.notified += report.notified as u64;
        t.amount_notified = t.amount_notified.saturating_add(report.amount_notified);
        t.already_acknowledged += report.already_acknowledged as u64;
        t.discarded += report.discarded as u64;
        t.unattributed += report.unattributed as u64;
        t.decode_errors += report.decode_errors as u64;
        t.notification_failures += report.notification_failures as u64;
        t.storage_errors += report.storage_errors as u64;
        if report.gap {
            t.gaps += 1;
        }
    }

    /// Count a cycle that did not complete.
    pub fn record_failed_cycle(&mut self) {
        self.totals.failed_cycles += 1;
    }

    /// Format a human-readable summary.
    pub fn summary(&self) -> String {
        let last_cycle = if self.last_cycle_timestamp > 0 {
            chrono::DateTime::from_timestamp(self.last_cycle_timestamp as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "unknown".to_string())
        } else {
            "never".to_string()
        };

        let mark = match &self.high_water_mark {
            Some(cursor) => format!("lt {} ({})", cursor.lt, cursor.hash),
            None => "none".to_string(),
        };

        let t = &self.totals;
        format!(
            "Watch State for {}:\n  High-water mark: {}\n  Last cycle: {}\n  Cycles: {} ({} failed)\n  Transactions seen: {}\n  Notified: {} ({} nanotons)\n  Already acknowledged: {}\n  Discarded: {}\n  Unattributed: {}\n  Decode errors: {}\n  Notification failures: {}\n  Storage errors: {}\n  Backfill gaps: {}",
            self.address,
            mark,
            last_cycle,
            t.cycles,
            t.failed_cycles,
            t.transactions_seen,
            t.notified,
            t.amount_notified,
            t.already_acknowledged,
            t.discarded,
            t.unattributed,
            t.decode_errors,
            t.notification_failures,
            t.storage_errors,
            t.gaps
        )
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cursor(lt: u64) -> Cursor {
        Cursor {
            lt,
            hash: format!("h{}", lt),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = WatchState::new("EQaddr");
        state.high_water_mark = Some(cursor(4200));
        state.totals.notified = 3;
        state.save(&path).unwrap();

        let loaded = WatchState::load(&path, "EQaddr").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let state = WatchState::load(&dir.path().join("missing.json"), "EQaddr").unwrap();
        assert_eq!(state.address, "EQaddr");
        assert!(state.high_water_mark.is_none());
    }

    #[test]
    fn test_load_rejects_other_address() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        WatchState::new("EQone").save(&path).unwrap();

        assert!(WatchState::load(&path, "EQtwo").is_err());
    }

    #[test]
    fn test_mark_only_moves_forward() {
        let mut state = WatchState::new("EQaddr");

        state.record_cycle(&CycleReport {
            fetched: 5,
            notified: 2,
            amount_notified: 900,
            advanced_to: Some(cursor(200)),
            ..Default::default()
        });
        assert_eq!(state.high_water_mark, Some(cursor(200)));

        state.record_cycle(&CycleReport {
            advanced_to: Some(cursor(150)),
            ..Default::default()
        });
        assert_eq!(state.high_water_mark, Some(cursor(200)));

        state.record_cycle(&CycleReport::default());
        assert_eq!(state.high_water_mark, Some(cursor(200)));

        assert_eq!(state.totals.cycles, 3);
        assert_eq!(state.totals.transactions_seen, 5);
        assert_eq!(state.totals.amount_notified, 900);
        assert!(state.last_cycle_timestamp > 0);
    }

    #[test]
    fn test_state_path_is_file_safe() {
        let path = state_path(
            "/var/lib/ton-donate",
            "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8",
        );
        assert_eq!(
            path,
            PathBuf::from(
                "/var/lib/ton-donate/0_83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8.json"
            )
        );
    }

    #[test]
    fn test_summary() {
        let state = WatchState::new("EQaddr");
        let summary = state.summary();
        assert!(summary.contains("EQaddr"));
        assert!(summary.contains("never"));
        assert!(summary.contains("High-water mark: none"));
    }
}
