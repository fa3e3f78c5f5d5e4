//! Incremental-rebuild hand-off.
//!
//! A small state file in the build directory records which overlays the
//! previous pass patched. Those overlays are pre-loaded on the next run so
//! their edits start from the pristine backups, and the list is rewritten
//! at the end of every pass from the overlays that were actually loaded
//! and dirtied.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::config::Processor;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RebuildState {
    #[serde(default)]
    pub arm9_patched_overlays: Vec<u32>,
    #[serde(default)]
    pub arm7_patched_overlays: Vec<u32>,
}

impl RebuildState {
    /// Loads the state file; a missing or unreadable file is a fresh state.
    pub fn load(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(err) => {
                warn!("ignoring malformed {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("could not encode rebuild state")?;
        std::fs::write(path, text)
            .with_context(|| format!("could not write {}", path.display()))
    }

    pub fn patched(&self, processor: Processor) -> &[u32] {
        match processor {
            Processor::Arm9 => &self.arm9_patched_overlays,
            Processor::Arm7 => &self.arm7_patched_overlays,
        }
    }

    pub fn set_patched(&mut self, processor: Processor, overlays: Vec<u32>) {
        match processor {
            Processor::Arm9 => self.arm9_patched_overlays = overlays,
            Processor::Arm7 => self.arm7_patched_overlays = overlays,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_is_empty() {
        let state = RebuildState::load(Path::new("does/not/exist.json"));
        assert!(state.patched(Processor::Arm9).is_empty());
        assert!(state.patched(Processor::Arm7).is_empty());
    }

    #[test]
    fn lists_are_kept_per_processor() {
        let mut state = RebuildState::default();
        state.set_patched(Processor::Arm9, vec![1, 3]);
        state.set_patched(Processor::Arm7, vec![2]);
        assert_eq!(state.patched(Processor::Arm9), &[1, 3]);
        assert_eq!(state.patched(Processor::Arm7), &[2]);
    }
}
