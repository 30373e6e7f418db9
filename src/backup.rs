//! Periodic snapshots of the active storage backend.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::StorageBackend;

pub struct BackupScheduler {
    backend: Arc<dyn StorageBackend>,
    dest: PathBuf,
    interval: Duration,
}

impl BackupScheduler {
    pub fn new(backend: Arc<dyn StorageBackend>, dest: PathBuf, interval: Duration) -> Self {
        Self {
            backend,
            dest,
            interval,
        }
    }

    /// Take one snapshot on the blocking pool and return the file written.
    pub async fn run_once(&self) -> Result<PathBuf> {
        let backend = self.backend.clone();
        let dest = self.dest.clone();
        let written = tokio::task::spawn_blocking(move || backend.snapshot(&dest))
            .await
            .context("backup task panicked")?
            .with_context(|| format!("backing up to {}", self.dest.display()))?;
        Ok(written)
    }

    /// Back up every `interval` until `shutdown` fires. The first backup runs
    /// one interval after start; failures are retried at the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_once().await {
                Ok(path) => info!("backup written to {}", path.display()),
                Err(e) => warn!("backup failed, retrying next interval: {e:#}"),
            }
        }
        debug!("backup loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::sample_event;
    use crate::filter::Filter;
    use crate::storage::{collect, open_backend, Engine, StorageConfig};
    use std::fs;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, engine: Engine) -> Arc<dyn StorageBackend> {
        let b = open_backend(&StorageConfig {
            engine,
            path: dir.path().join("db"),
            cache_size: None,
        });
        b.init().unwrap();
        b
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_cycle_is_followed_by_success() {
        for engine in [Engine::Redb, Engine::Log] {
            let dir = TempDir::new().unwrap();
            let b = backend(&dir, engine);
            let dest = dir.path().join("backups");
            // a plain file where the directory should be makes the cycle fail
            fs::write(&dest, b"not a dir").unwrap();
            let scheduler = BackupScheduler::new(b.clone(), dest.clone(), Duration::from_secs(60));

            b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
            assert!(scheduler.run_once().await.is_err());

            // the store keeps serving while the destination is broken
            b.save(&sample_event("bb22", "p1", 1, None, 2)).unwrap();
            assert_eq!(collect(b.query(Filter::default())).await.unwrap().len(), 2);

            fs::remove_file(&dest).unwrap();
            let written = scheduler.run_once().await.unwrap();
            assert!(written.starts_with(&dest));

            b.save(&sample_event("cc33", "p1", 1, None, 3)).unwrap();
            let restored = open_backend(&StorageConfig {
                engine,
                path: dest.clone(),
                cache_size: None,
            });
            restored.init().unwrap();
            assert_eq!(restored.count(&Filter::default()).unwrap(), 2);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loop_backs_up_and_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let b = backend(&dir, Engine::Log);
        b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
        let dest = dir.path().join("backups");
        let scheduler = BackupScheduler::new(b, dest.clone(), Duration::from_millis(20));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !dest.join("events.log").exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
