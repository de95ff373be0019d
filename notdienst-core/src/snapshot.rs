use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};

use crate::{Config, model::PharmacyRecord};

/// An ordered result set as persisted between runs.
pub type Snapshot = Vec<PharmacyRecord>;

/// The two persisted snapshot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Previous,
    Current,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Previous => "previous",
            Slot::Current => "current",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load/save access to the named snapshot slots.
///
/// `load` returns `Ok(None)` for a slot that has never been written.
pub trait SnapshotStore: Send + Debug {
    fn load(&self, slot: Slot) -> Result<Option<Snapshot>>;
    fn save(&mut self, slot: Slot, records: &[PharmacyRecord]) -> Result<()>;
}

/// Snapshot slots backed by two JSON files.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    previous: PathBuf,
    current: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(previous: impl Into<PathBuf>, current: impl Into<PathBuf>) -> Self {
        Self { previous: previous.into(), current: current.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.snapshot_previous, &config.snapshot_current)
    }

    pub fn path(&self, slot: Slot) -> &Path {
        match slot {
            Slot::Previous => &self.previous,
            Slot::Current => &self.current,
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, slot: Slot) -> Result<Option<Snapshot>> {
        let path = self.path(slot);
        if !path.exists() {
            tracing::debug!(slot = %slot, path = %path.display(), "No snapshot file yet");
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {slot} snapshot: {}", path.display()))?;

        let records: Snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {slot} snapshot: {}", path.display()))?;

        tracing::debug!(slot = %slot, count = records.len(), "Loaded snapshot");
        Ok(Some(records))
    }

    fn save(&mut self, slot: Slot, records: &[PharmacyRecord]) -> Result<()> {
        let path = self.path(slot);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory: {}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(records)
            .with_context(|| format!("Failed to serialize {slot} snapshot"))?;

        fs::write(path, json)
            .with_context(|| format!("Failed to write {slot} snapshot: {}", path.display()))?;

        tracing::info!(slot = %slot, path = %path.display(), count = records.len(), "Snapshot saved");
        Ok(())
    }
}

/// In-memory slots, for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    slots: HashMap<Slot, Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, slot: Slot, records: Snapshot) -> Self {
        self.slots.insert(slot, records);
        self
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, slot: Slot) -> Result<Option<Snapshot>> {
        Ok(self.slots.get(&slot).cloned())
    }

    fn save(&mut self, slot: Slot, records: &[PharmacyRecord]) -> Result<()> {
        self.slots.insert(slot, records.to_vec());
        Ok(())
    }
}

/// Outcome of comparing a fresh result set with the CURRENT slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Rotation {
    /// The fresh set equals CURRENT; nothing was written.
    Unchanged,
    /// CURRENT moved to PREVIOUS and the fresh set became CURRENT.
    /// `previous` is what CURRENT held before (empty if it was never written).
    Rotated { previous: Snapshot },
}

impl Rotation {
    pub fn is_rotated(&self) -> bool {
        matches!(self, Rotation::Rotated { .. })
    }
}

/// Change detection over the PREVIOUS/CURRENT slots.
///
/// PREVIOUS is rewritten on every observed change, so with several runs per
/// day it holds the set from just before the last change rather than the
/// previous calendar day.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotDiffer;

impl SnapshotDiffer {
    pub fn apply(store: &mut dyn SnapshotStore, fresh: &[PharmacyRecord]) -> Result<Rotation> {
        let current = store.load(Slot::Current)?;

        if current.as_deref() == Some(fresh) {
            tracing::debug!(count = fresh.len(), "Result set unchanged; snapshots untouched");
            return Ok(Rotation::Unchanged);
        }

        let previous = current.unwrap_or_default();
        store.save(Slot::Previous, &previous)?;
        store.save(Slot::Current, fresh)?;

        tracing::info!(
            previous = previous.len(),
            current = fresh.len(),
            "Result set changed; snapshots rotated"
        );
        Ok(Rotation::Rotated { previous })
    }
}
