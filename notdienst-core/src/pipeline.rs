//! One acquisition → ranking → change detection → rendering cycle, and the
//! polling loop around it.
//!
//! Failure handling per stage:
//! - acquisition errors abort the run before anything is written;
//! - an empty acquisition leaves snapshots and the page untouched;
//! - snapshot and page write errors are logged and the run still completes.

use anyhow::Result;
use chrono::Local;
use std::time::Duration;

use crate::{
    Config,
    model::PharmacyRecord,
    ranking::rank_by_distance,
    render::PageRenderer,
    snapshot::{FileSnapshotStore, Slot, SnapshotDiffer, SnapshotStore},
    source::{PharmacySource, SourceError, default_source_from_config},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The source returned no entries; nothing was written.
    Empty,
    /// The page was regenerated from `rows` entries.
    Published { rotated: bool, rows: usize },
}

#[derive(Debug)]
pub struct Pipeline {
    source: Box<dyn PharmacySource>,
    store: Box<dyn SnapshotStore>,
    renderer: PageRenderer,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn PharmacySource>,
        store: Box<dyn SnapshotStore>,
        renderer: PageRenderer,
    ) -> Self {
        Self { source, store, renderer }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            default_source_from_config(config)?,
            Box::new(FileSnapshotStore::from_config(config)),
            PageRenderer::from_config(config)?,
        ))
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    pub async fn run_once(&mut self) -> Result<RunOutcome, SourceError> {
        let fetched = self.source.fetch().await.inspect_err(|e| {
            if e.is_timeout() {
                tracing::error!(source = %self.source.id(), error = %e, "Pharmacy entries not found in time; run aborted");
            } else {
                tracing::error!(source = %self.source.id(), error = ?e, "Acquisition failed; run aborted");
            }
        })?;

        if fetched.is_empty() {
            tracing::info!(source = %self.source.id(), "No pharmacy data found; keeping previous output");
            return Ok(RunOutcome::Empty);
        }

        let ranked = rank_by_distance(&fetched);
        tracing::debug!(count = ranked.len(), "Ranked pharmacies by distance");

        let rotated = match SnapshotDiffer::apply(self.store.as_mut(), &ranked) {
            Ok(rotation) => rotation.is_rotated(),
            Err(e) => {
                tracing::error!(error = ?e, "Snapshot update failed");
                false
            }
        };

        let previous = self.load_previous();
        self.publish(&previous, &ranked);

        Ok(RunOutcome::Published { rotated, rows: ranked.len() })
    }

    fn load_previous(&self) -> Vec<PharmacyRecord> {
        match self.store.load(Slot::Previous) {
            Ok(previous) => previous.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = ?e, "Previous snapshot unavailable; rendering current rows only");
                Vec::new()
            }
        }
    }

    fn publish(&self, previous: &[PharmacyRecord], current: &[PharmacyRecord]) {
        let context = self.renderer.context(previous, current, Local::now());

        let written = self.renderer.render(&context).and_then(|html| self.renderer.write(&html));
        if let Err(e) = written {
            tracing::error!(path = %self.renderer.output().display(), error = ?e, "Page not updated");
        }
    }

    /// Run forever, sleeping `interval` after each run. A slow run delays the
    /// next one; runs never overlap.
    pub async fn run_forever(&mut self, interval: Duration) {
        loop {
            match self.run_once().await {
                Ok(outcome) => tracing::info!(?outcome, "Run finished"),
                Err(_) => tracing::warn!("Run aborted; retrying after the next interval"),
            }

            tracing::debug!(secs = interval.as_secs(), "Sleeping until next run");
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        snapshot::{MemorySnapshotStore, Snapshot},
        source::SourceId,
    };
    use async_trait::async_trait;
    use std::{
        fs,
        sync::{Arc, Mutex},
    };

    /// Hands out queued results, one per fetch.
    #[derive(Debug)]
    struct ScriptedSource {
        results: Mutex<Vec<Result<Vec<PharmacyRecord>, SourceError>>>,
    }

    impl ScriptedSource {
        fn new(results: Vec<Result<Vec<PharmacyRecord>, SourceError>>) -> Self {
            let mut results = results;
            results.reverse();
            Self { results: Mutex::new(results) }
        }
    }

    #[async_trait]
    impl PharmacySource for ScriptedSource {
        fn id(&self) -> SourceId {
            SourceId::Feed
        }

        async fn fetch(&self) -> Result<Vec<PharmacyRecord>, SourceError> {
            self.results.lock().unwrap().pop().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Store whose writes always fail.
    #[derive(Debug, Default)]
    struct ReadOnlyStore {
        saves: Arc<Mutex<usize>>,
    }

    impl SnapshotStore for ReadOnlyStore {
        fn load(&self, _slot: Slot) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        fn save(&mut self, _slot: Slot, _records: &[PharmacyRecord]) -> Result<()> {
            *self.saves.lock().unwrap() += 1;
            anyhow::bail!("disk full")
        }
    }

    fn record(name: &str, distance: f64) -> PharmacyRecord {
        PharmacyRecord {
            name: name.to_string(),
            distance,
            distance_text: crate::model::format_distance(distance),
            ..Default::default()
        }
    }

    fn pipeline(
        results: Vec<Result<Vec<PharmacyRecord>, SourceError>>,
        store: Box<dyn SnapshotStore>,
        dir: &tempfile::TempDir,
    ) -> Pipeline {
        let renderer =
            PageRenderer::with_default_template(dir.path().join("index.html"), "Notdienst").unwrap();
        Pipeline::new(Box::new(ScriptedSource::new(results)), store, renderer)
    }

    #[tokio::test]
    async fn publishes_ranked_rows_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = vec![record("far", 9.0), record("near", 1.0)];
        let mut p = pipeline(vec![Ok(fetched)], Box::new(MemorySnapshotStore::new()), &dir);

        let outcome = p.run_once().await.unwrap();

        assert_eq!(outcome, RunOutcome::Published { rotated: true, rows: 2 });
        let current = p.store().load(Slot::Current).unwrap().unwrap();
        assert_eq!(current[0].name, "near");

        let html = fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(html.find("near").unwrap() < html.find("far").unwrap());
    }

    #[tokio::test]
    async fn same_result_twice_rotates_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = vec![record("a", 1.0), record("b", 2.0)];
        let mut p = pipeline(
            vec![Ok(fetched.clone()), Ok(fetched)],
            Box::new(MemorySnapshotStore::new()),
            &dir,
        );

        assert_eq!(p.run_once().await.unwrap(), RunOutcome::Published { rotated: true, rows: 2 });
        assert_eq!(p.run_once().await.unwrap(), RunOutcome::Published { rotated: false, rows: 2 });
    }

    #[tokio::test]
    async fn empty_acquisition_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let seeded = vec![record("kept", 3.0)];
        let store = MemorySnapshotStore::new().with_slot(Slot::Current, seeded.clone());
        let mut p = pipeline(vec![Ok(Vec::new())], Box::new(store), &dir);

        assert_eq!(p.run_once().await.unwrap(), RunOutcome::Empty);

        assert!(!dir.path().join("index.html").exists());
        assert_eq!(p.store().load(Slot::Current).unwrap(), Some(seeded));
        assert_eq!(p.store().load(Slot::Previous).unwrap(), None);
    }

    #[tokio::test]
    async fn acquisition_timeout_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let timeout = SourceError::Timeout {
            url: "https://portal.example/".into(),
            after: Duration::from_secs(10),
        };
        let mut p = pipeline(vec![Err(timeout)], Box::new(MemorySnapshotStore::new()), &dir);

        let err = p.run_once().await.unwrap_err();

        assert!(err.is_timeout());
        assert!(!dir.path().join("index.html").exists());
        assert_eq!(p.store().load(Slot::Current).unwrap(), None);
    }

    #[tokio::test]
    async fn snapshot_write_failure_still_publishes_page() {
        let dir = tempfile::tempdir().unwrap();
        let saves = Arc::new(Mutex::new(0));
        let store = ReadOnlyStore { saves: saves.clone() };
        let mut p = pipeline(vec![Ok(vec![record("a", 1.0)])], Box::new(store), &dir);

        let outcome = p.run_once().await.unwrap();

        assert_eq!(outcome, RunOutcome::Published { rotated: false, rows: 1 });
        assert_eq!(*saves.lock().unwrap(), 1);
        assert!(dir.path().join("index.html").exists());
    }

    #[tokio::test]
    async fn page_shows_rows_from_before_the_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(
            vec![Ok(vec![record("Gestern", 1.0)]), Ok(vec![record("Heute", 2.0)])],
            Box::new(MemorySnapshotStore::new()),
            &dir,
        );

        p.run_once().await.unwrap();
        p.run_once().await.unwrap();

        let html = fs::read_to_string(dir.path().join("index.html")).unwrap();
        let before = html.find("Gestern").unwrap();
        let after = html.find("Heute").unwrap();
        assert!(before < after);
        assert!(html.contains("class=\"changeover\""));
    }
}
