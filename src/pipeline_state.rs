use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Which remote detail records have already been fetched, and when the last
/// successful run finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineState {
    pub schema_version: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub fetched_match_nos: BTreeSet<i64>,
    pub fetched_tournament_nos: BTreeSet<i64>,
    pub created_at: DateTime<Utc>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            last_run: None,
            fetched_match_nos: BTreeSet::new(),
            fetched_tournament_nos: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }
}

impl PipelineState {
    /// A missing file is a fresh start; anything unreadable is
    /// [`PipelineError::StateCorruption`] and needs an operator.
    pub fn load(path: &Path) -> Result<PipelineState> {
        if !path.exists() {
            info!(path = %path.display(), "no pipeline state yet, starting fresh");
            return Ok(PipelineState::default());
        }
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::StateCorruption {
            path: path.to_path_buf(),
            reason: format!("unreadable: {e}"),
        })?;
        let state =
            serde_json::from_str::<PipelineState>(&raw).map_err(|e| PipelineError::StateCorruption {
                path: path.to_path_buf(),
                reason: format!("invalid json: {e}"),
            })?;
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(PipelineError::StateCorruption {
                path: path.to_path_buf(),
                reason: format!(
                    "schema_version {} is not supported (expected {STATE_SCHEMA_VERSION})",
                    state.schema_version
                ),
            }
            .into());
        }
        Ok(state)
    }

    /// Stamps `last_run` and writes the whole document atomically.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_run = Some(Utc::now());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("serialize pipeline state")?;
        fs::write(&tmp, json).context("write pipeline state")?;
        fs::rename(&tmp, path).context("swap pipeline state")?;
        info!(
            path = %path.display(),
            matches = self.fetched_match_nos.len(),
            tournaments = self.fetched_tournament_nos.len(),
            "saved pipeline state"
        );
        Ok(())
    }

    /// Set union; never drops an identifier already recorded.
    pub fn merge(
        &self,
        new_match_nos: impl IntoIterator<Item = i64>,
        new_tournament_nos: impl IntoIterator<Item = i64>,
    ) -> PipelineState {
        let mut next = self.clone();
        next.fetched_match_nos.extend(new_match_nos);
        next.fetched_tournament_nos.extend(new_tournament_nos);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_idempotent_and_union_only() {
        let base = PipelineState::default().merge([1, 2], [10]);
        let once = base.merge([2, 3], [11]);
        let twice = once.merge([2, 3], [11]);
        assert_eq!(once.fetched_match_nos, twice.fetched_match_nos);
        assert_eq!(
            twice.fetched_match_nos.iter().copied().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(twice.fetched_tournament_nos.contains(&10));
    }

    #[test]
    fn missing_file_gives_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = PipelineState::load(&dir.path().join("state.json")).unwrap();
        assert!(state.last_run.is_none());
        assert!(state.fetched_match_nos.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut state = PipelineState::default().merge([5, 1, 3], [7]);
        state.save(&path).unwrap();
        let back = PipelineState::load(&path).unwrap();
        assert_eq!(back, state);
        assert!(back.last_run.is_some());
    }

    #[test]
    fn garbage_is_state_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let err = PipelineState::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::StateCorruption { .. })
        ));
    }

    #[test]
    fn unknown_version_is_state_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"schema_version": 9, "last_run": null, "fetched_match_nos": [],
                "fetched_tournament_nos": [], "created_at": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(PipelineState::load(&path).is_err());
    }
}
