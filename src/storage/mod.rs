//! Pluggable event storage.
//!
//! The relay only talks to [`StorageBackend`]; the concrete engine is picked
//! once at startup by [`open_backend`]:
//!
//! - `redb` – ordered key-value B-tree store with MVCC read snapshots
//! - `log` – append-only record log with an in-memory index
//!
//! Queries stream newest-first through a bounded channel fed from the blocking
//! pool, so a consumer that stops reading (for example a closed websocket)
//! halts the engine at its next send.

mod kv;
mod log;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::{event::Event, filter::Filter};

pub use self::kv::RedbBackend;
pub use self::log::LogBackend;

/// Errors surfaced by storage engines. Only `Init` is fatal; every other
/// variant concerns a single operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage init failed: {0}")]
    Init(String),

    #[error("duplicate event: {0}")]
    Duplicate(String),

    #[error("storage write failed: {0}")]
    Write(String),

    #[error("storage read failed: {0}")]
    Read(String),

    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn init(e: impl fmt::Display) -> Self {
        StorageError::Init(e.to_string())
    }

    pub(crate) fn write(e: impl fmt::Display) -> Self {
        StorageError::Write(e.to_string())
    }

    pub(crate) fn read(e: impl fmt::Display) -> Self {
        StorageError::Read(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Lazy newest-first sequence of query results.
pub type EventStream = ReceiverStream<StorageResult<Event>>;

/// Events buffered between an engine and a slow consumer.
const STREAM_BUFFER: usize = 64;

/// Capability set shared by every storage engine.
pub trait StorageBackend: Send + Sync {
    fn engine(&self) -> Engine;

    /// Open or create the engine's files.
    fn init(&self) -> StorageResult<()>;

    /// Release all resources. Calling it again is a no-op.
    fn close(&self);

    /// Persist a new event; fails with `Duplicate` when the id is known.
    fn save(&self, ev: &Event) -> StorageResult<()>;

    /// Store `ev` unless a stored event with the same replacement key
    /// supersedes it, removing the one it replaces.
    fn replace(&self, ev: &Event) -> StorageResult<()>;

    /// Remove the stored event with `ev.id`, if any.
    fn delete(&self, ev: &Event) -> StorageResult<()>;

    /// Number of matching events, ignoring the filter's limit.
    fn count(&self, filter: &Filter) -> StorageResult<u64>;

    /// Stream matching events, newest first. Must be called from within a
    /// tokio runtime.
    fn query(&self, filter: Filter) -> EventStream;

    /// Write a consistent copy of the store into `dest`, replacing any earlier
    /// copy, and return the path of the written file.
    fn snapshot(&self, dest: &Path) -> StorageResult<PathBuf>;
}

/// Available storage engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Redb,
    Log,
}

impl Engine {
    /// Map a configuration identifier to an engine, defaulting to `redb`.
    pub fn from_id(id: &str) -> Self {
        match id.trim().to_ascii_lowercase().as_str() {
            "redb" => Engine::Redb,
            "log" => Engine::Log,
            other => {
                warn!("unknown storage engine {other:?}, falling back to redb");
                Engine::Redb
            }
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Engine::Redb => "redb",
            Engine::Log => "log",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Engine-specific construction parameters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub engine: Engine,
    /// Directory holding the engine's files.
    pub path: PathBuf,
    /// Cache size hint in bytes; engine default when `None`.
    pub cache_size: Option<usize>,
}

/// Construct (but do not initialize) the configured backend.
pub fn open_backend(cfg: &StorageConfig) -> Arc<dyn StorageBackend> {
    match cfg.engine {
        Engine::Redb => Arc::new(RedbBackend::new(cfg.path.clone(), cfg.cache_size)),
        Engine::Log => Arc::new(LogBackend::new(cfg.path.clone())),
    }
}

/// Producer half handed to engines while they walk their indexes.
pub(crate) struct Emitter {
    tx: mpsc::Sender<StorageResult<Event>>,
}

impl Emitter {
    /// Send one event; `false` once the consumer has gone away.
    pub(crate) fn emit(&self, ev: Event) -> bool {
        self.tx.blocking_send(Ok(ev)).is_ok()
    }
}

/// Run `produce` on the blocking pool and expose its output as a stream.
pub(crate) fn stream_events<F>(produce: F) -> EventStream
where
    F: FnOnce(&Emitter) -> StorageResult<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::task::spawn_blocking(move || {
        let emitter = Emitter { tx };
        if let Err(e) = produce(&emitter) {
            let _ = emitter.tx.blocking_send(Err(e));
        }
    });
    ReceiverStream::new(rx)
}

/// Stream yielding a single error.
pub(crate) fn failed_stream(err: StorageError) -> EventStream {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Err(err));
    ReceiverStream::new(rx)
}

/// Newest first; lowest id first among equal timestamps.
pub(crate) fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Drain a stream into a vector, stopping at the first error.
pub async fn collect(mut stream: EventStream) -> StorageResult<Vec<Event>> {
    use futures_util::StreamExt;
    let mut out = vec![];
    while let Some(item) = stream.next().await {
        out.push(item?);
    }
    Ok(out)
}

/// Behavior every engine must share, instantiated per engine by
/// `backend_conformance!`.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::event::testing::sample_event;
    use futures_util::StreamExt;
    use std::{thread, time::Duration};
    use tempfile::TempDir;

    pub type Make = fn(&Path) -> Arc<dyn StorageBackend>;

    fn ready(make: Make, dir: &TempDir) -> Arc<dyn StorageBackend> {
        let b = make(dir.path());
        b.init().unwrap();
        b
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    pub async fn save_rejects_duplicates(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        let ev = sample_event("aa11", "p1", 1, None, 1);
        b.save(&ev).unwrap();
        assert!(matches!(b.save(&ev), Err(StorageError::Duplicate(_))));
        assert_eq!(b.count(&Filter::default()).unwrap(), 1);
    }

    pub async fn query_newest_first_with_bounds(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        for (id, ts) in [("aa11", 10), ("cc33", 30), ("bb22", 20)] {
            b.save(&sample_event(id, "p1", 1, None, ts)).unwrap();
        }
        b.save(&sample_event("dd44", "p2", 1, None, 40)).unwrap();

        let all = collect(b.query(Filter {
            authors: Some(vec!["p1".into()]),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(ids(&all), vec!["cc33", "bb22", "aa11"]);

        let limited = collect(b.query(Filter {
            kinds: Some(vec![1]),
            limit: Some(2),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(ids(&limited), vec!["dd44", "cc33"]);

        let window = collect(b.query(Filter {
            since: Some(15),
            until: Some(30),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(ids(&window), vec!["cc33", "bb22"]);

        let inverted = collect(b.query(Filter {
            since: Some(30),
            until: Some(10),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert!(inverted.is_empty());
    }

    pub async fn query_and_count_by_ids(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        b.save(&sample_event("aa11", "p1", 1, None, 10)).unwrap();
        b.save(&sample_event("bb22", "p1", 1, None, 20)).unwrap();
        let f = Filter {
            ids: Some(vec!["aa11".into(), "bb22".into(), "zz99".into()]),
            ..Default::default()
        };
        let found = collect(b.query(f.clone())).await.unwrap();
        assert_eq!(ids(&found), vec!["bb22", "aa11"]);
        assert_eq!(b.count(&f).unwrap(), 2);
        let limited = Filter {
            limit: Some(1),
            ..f
        };
        assert_eq!(b.count(&limited).unwrap(), 2);
    }

    pub async fn replace_converges_in_any_order(make: Make) {
        let older = sample_event("bb22", "p1", 30023, Some("slug"), 1);
        let newer = sample_event("cc33", "p1", 30023, Some("slug"), 2);
        let other_slug = sample_event("dd44", "p1", 30023, Some("other"), 1);
        for order in [[&older, &newer], [&newer, &older]] {
            let dir = TempDir::new().unwrap();
            let b = ready(make, &dir);
            b.replace(&other_slug).unwrap();
            for ev in order {
                b.replace(ev).unwrap();
            }
            let stored = collect(b.query(Filter {
                kinds: Some(vec![30023]),
                ..Default::default()
            }))
            .await
            .unwrap();
            assert_eq!(ids(&stored), vec!["cc33", "dd44"]);
        }
    }

    pub async fn replace_tie_keeps_lowest_id(make: Make) {
        let high = sample_event("ff00", "p1", 0, None, 5);
        let low = sample_event("0a00", "p1", 0, None, 5);
        for order in [[&high, &low], [&low, &high]] {
            let dir = TempDir::new().unwrap();
            let b = ready(make, &dir);
            for ev in order {
                b.replace(ev).unwrap();
            }
            let stored = collect(b.query(Filter {
                authors: Some(vec!["p1".into()]),
                ..Default::default()
            }))
            .await
            .unwrap();
            assert_eq!(ids(&stored), vec!["0a00"]);
        }
    }

    pub async fn concurrent_replace_keeps_newest(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        let handles: Vec<_> = (0..8u64)
            .rev()
            .map(|ts| {
                let b = b.clone();
                thread::spawn(move || {
                    let ev = sample_event(&format!("{ts:04}"), "p1", 10_002, None, ts);
                    b.replace(&ev).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stored = collect(b.query(Filter {
            kinds: Some(vec![10_002]),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(ids(&stored), vec!["0007"]);
    }

    pub async fn delete_is_idempotent(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        let ev = sample_event("aa11", "p1", 1, None, 1);
        b.delete(&ev).unwrap();
        b.save(&ev).unwrap();
        b.delete(&ev).unwrap();
        b.delete(&ev).unwrap();
        assert_eq!(b.count(&Filter::default()).unwrap(), 0);
        // a deleted replaceable key accepts older events again
        let newer = sample_event("bb22", "p1", 0, None, 5);
        b.replace(&newer).unwrap();
        b.delete(&newer).unwrap();
        let older = sample_event("cc33", "p1", 0, None, 1);
        b.replace(&older).unwrap();
        assert_eq!(b.count(&Filter::default()).unwrap(), 1);
    }

    pub async fn reopen_keeps_events(make: Make) {
        let dir = TempDir::new().unwrap();
        {
            let b = ready(make, &dir);
            b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
            b.replace(&sample_event("bb22", "p1", 0, None, 2)).unwrap();
            b.save(&sample_event("cc33", "p1", 1, None, 3)).unwrap();
            b.delete(&sample_event("cc33", "p1", 1, None, 3)).unwrap();
            b.close();
        }
        let b = ready(make, &dir);
        let stored = collect(b.query(Filter::default())).await.unwrap();
        assert_eq!(ids(&stored), vec!["bb22", "aa11"]);
        // replacement index survives the restart
        b.replace(&sample_event("dd44", "p1", 0, None, 1)).unwrap();
        assert_eq!(b.count(&Filter::default()).unwrap(), 2);
    }

    pub async fn close_is_idempotent(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        b.close();
        b.close();
        let ev = sample_event("aa11", "p1", 1, None, 1);
        assert!(matches!(b.save(&ev), Err(StorageError::Closed)));
        let mut stream = b.query(Filter::default());
        assert!(matches!(stream.next().await, Some(Err(StorageError::Closed))));
    }

    pub async fn dropped_stream_releases_engine(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        for i in 0..200u64 {
            b.save(&sample_event(&format!("{i:04x}"), "p1", 1, None, i))
                .unwrap();
        }
        let mut stream = b.query(Filter::default());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.created_at, 199);
        drop(stream);
        let writer = b.clone();
        let save = tokio::task::spawn_blocking(move || {
            writer.save(&sample_event("ffff", "p1", 1, None, 1000))
        });
        tokio::time::timeout(Duration::from_secs(5), save)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    pub async fn snapshot_is_reopenable(make: Make) {
        let dir = TempDir::new().unwrap();
        let b = ready(make, &dir);
        b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
        let backups = TempDir::new().unwrap();
        let first = b.snapshot(backups.path()).unwrap();
        b.save(&sample_event("bb22", "p1", 1, None, 2)).unwrap();
        let second = b.snapshot(backups.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_dir(backups.path()).unwrap().count(), 1);

        let restored = make(backups.path());
        restored.init().unwrap();
        let stored = collect(restored.query(Filter::default())).await.unwrap();
        assert_eq!(ids(&stored), vec!["bb22", "aa11"]);
    }
}

/// Instantiate the conformance suite for an engine constructor.
#[cfg(test)]
macro_rules! backend_conformance {
    ($make:expr) => {
        mod conformance_suite {
            use super::*;
            use crate::storage::conformance;

            fn make(path: &std::path::Path) -> std::sync::Arc<dyn crate::storage::StorageBackend> {
                ($make)(path)
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn save_rejects_duplicates() {
                conformance::save_rejects_duplicates(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn query_newest_first_with_bounds() {
                conformance::query_newest_first_with_bounds(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn query_and_count_by_ids() {
                conformance::query_and_count_by_ids(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn replace_converges_in_any_order() {
                conformance::replace_converges_in_any_order(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn replace_tie_keeps_lowest_id() {
                conformance::replace_tie_keeps_lowest_id(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_replace_keeps_newest() {
                conformance::concurrent_replace_keeps_newest(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn delete_is_idempotent() {
                conformance::delete_is_idempotent(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn reopen_keeps_events() {
                conformance::reopen_keeps_events(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn close_is_idempotent() {
                conformance::close_is_idempotent(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn dropped_stream_releases_engine() {
                conformance::dropped_stream_releases_engine(make).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn snapshot_is_reopenable() {
                conformance::snapshot_is_reopenable(make).await;
            }
        }
    };
}

#[cfg(test)]
pub(crate) use backend_conformance;
