//! B-tree engine on top of `redb`.
//!
//! Three tables live in one database file:
//!
//! - `events` – event id → event JSON
//! - `by_time` – `"{created_at:020}:{id}"` → id, walked in reverse for
//!   newest-first queries
//! - `replaceable` – replacement key → id of the current winner
//!
//! Each mutation is a single write transaction, so readers never observe a
//! half-applied replacement.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, info, warn};

use super::{
    failed_stream, sort_newest_first, stream_events, Engine, EventStream, StorageBackend,
    StorageError, StorageResult,
};
use crate::{event::Event, filter::Filter};

/// Database file inside the configured directory and inside snapshot targets.
pub const FILE_NAME: &str = "relay.redb";

const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
const BY_TIME: TableDefinition<&str, &str> = TableDefinition::new("by_time");
const REPLACEABLE: TableDefinition<&str, &str> = TableDefinition::new("replaceable");

pub struct RedbBackend {
    dir: PathBuf,
    cache_size: Option<usize>,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbBackend {
    pub fn new(dir: PathBuf, cache_size: Option<usize>) -> Self {
        Self {
            dir,
            cache_size,
            db: RwLock::new(None),
        }
    }

    fn db(&self) -> StorageResult<Arc<Database>> {
        let guard = self.db.read().unwrap_or_else(|poisoned| {
            warn!("redb handle lock was poisoned, recovering");
            poisoned.into_inner()
        });
        guard.clone().ok_or(StorageError::Closed)
    }

    /// Run `f` in one write transaction, committing only if it succeeds.
    fn with_write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let db = self.db()?;
        let txn = db.begin_write().map_err(StorageError::write)?;
        let out = f(&txn)?;
        txn.commit().map_err(StorageError::write)?;
        Ok(out)
    }
}

fn time_key(ev: &Event) -> String {
    format!("{:020}:{}", ev.created_at, ev.id)
}

/// Key range covering the filter's time window. `;` sorts right after `:`.
fn time_bounds(filter: &Filter) -> (String, String) {
    let lo = format!("{:020}:", filter.since.unwrap_or(0));
    let hi = match filter.until {
        Some(until) => format!("{until:020};"),
        None => "~".to_string(),
    };
    (lo, hi)
}

fn decode(bytes: &[u8]) -> StorageResult<Event> {
    serde_json::from_slice(bytes).map_err(StorageError::read)
}

fn load_from(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> StorageResult<Option<Event>> {
    match table.get(id).map_err(StorageError::read)? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn load(txn: &WriteTransaction, id: &str) -> StorageResult<Option<Event>> {
    let events = txn.open_table(EVENTS).map_err(StorageError::read)?;
    load_from(&events, id)
}

fn put(txn: &WriteTransaction, ev: &Event) -> StorageResult<()> {
    let json = serde_json::to_vec(ev).map_err(StorageError::write)?;
    {
        let mut events = txn.open_table(EVENTS).map_err(StorageError::write)?;
        events
            .insert(ev.id.as_str(), json.as_slice())
            .map_err(StorageError::write)?;
    }
    {
        let mut by_time = txn.open_table(BY_TIME).map_err(StorageError::write)?;
        by_time
            .insert(time_key(ev).as_str(), ev.id.as_str())
            .map_err(StorageError::write)?;
    }
    if let Some(key) = ev.replacement_key() {
        let holder = current_holder(txn, &key)?;
        let wins = match holder {
            Some(id) => load(txn, &id)?.map_or(true, |current| ev.supersedes(&current)),
            None => true,
        };
        if wins {
            let mut replaceable = txn.open_table(REPLACEABLE).map_err(StorageError::write)?;
            replaceable
                .insert(key.as_str(), ev.id.as_str())
                .map_err(StorageError::write)?;
        }
    }
    Ok(())
}

/// Id currently registered under a replacement key.
fn current_holder(txn: &WriteTransaction, key: &str) -> StorageResult<Option<String>> {
    let replaceable = txn.open_table(REPLACEABLE).map_err(StorageError::read)?;
    let holder = replaceable
        .get(key)
        .map_err(StorageError::read)?
        .map(|g| g.value().to_string());
    Ok(holder)
}

fn remove(txn: &WriteTransaction, ev: &Event) -> StorageResult<()> {
    {
        let mut events = txn.open_table(EVENTS).map_err(StorageError::write)?;
        events.remove(ev.id.as_str()).map_err(StorageError::write)?;
    }
    {
        let mut by_time = txn.open_table(BY_TIME).map_err(StorageError::write)?;
        by_time
            .remove(time_key(ev).as_str())
            .map_err(StorageError::write)?;
    }
    if let Some(key) = ev.replacement_key() {
        if current_holder(txn, &key)?.as_deref() == Some(ev.id.as_str()) {
            let mut replaceable = txn.open_table(REPLACEABLE).map_err(StorageError::write)?;
            replaceable
                .remove(key.as_str())
                .map_err(StorageError::write)?;
        }
    }
    Ok(())
}

fn copy_events(read: &ReadTransaction, write: &WriteTransaction) -> StorageResult<u64> {
    let src = read.open_table(EVENTS).map_err(StorageError::read)?;
    let mut dst = write.open_table(EVENTS).map_err(StorageError::write)?;
    let mut copied = 0;
    for entry in src.iter().map_err(StorageError::read)? {
        let (k, v) = entry.map_err(StorageError::read)?;
        dst.insert(k.value(), v.value())
            .map_err(StorageError::write)?;
        copied += 1;
    }
    Ok(copied)
}

fn copy_index(
    read: &ReadTransaction,
    write: &WriteTransaction,
    def: TableDefinition<'static, &'static str, &'static str>,
) -> StorageResult<()> {
    let src = read.open_table(def).map_err(StorageError::read)?;
    let mut dst = write.open_table(def).map_err(StorageError::write)?;
    for entry in src.iter().map_err(StorageError::read)? {
        let (k, v) = entry.map_err(StorageError::read)?;
        dst.insert(k.value(), v.value())
            .map_err(StorageError::write)?;
    }
    Ok(())
}

impl StorageBackend for RedbBackend {
    fn engine(&self) -> Engine {
        Engine::Redb
    }

    fn init(&self) -> StorageResult<()> {
        let mut slot = self.db.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(StorageError::init)?;
        let mut builder = Database::builder();
        if let Some(bytes) = self.cache_size {
            builder.set_cache_size(bytes);
        }
        let path = self.dir.join(FILE_NAME);
        let db = builder.create(&path).map_err(StorageError::init)?;
        let txn = db.begin_write().map_err(StorageError::init)?;
        txn.open_table(EVENTS).map_err(StorageError::init)?;
        txn.open_table(BY_TIME).map_err(StorageError::init)?;
        txn.open_table(REPLACEABLE).map_err(StorageError::init)?;
        txn.commit().map_err(StorageError::init)?;
        info!("opened redb store at {}", path.display());
        *slot = Some(Arc::new(db));
        Ok(())
    }

    fn close(&self) {
        let mut slot = self.db.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.take().is_some() {
            debug!("closed redb store at {}", self.dir.display());
        }
    }

    fn save(&self, ev: &Event) -> StorageResult<()> {
        self.with_write(|txn| {
            if load(txn, &ev.id)?.is_some() {
                return Err(StorageError::Duplicate(ev.id.clone()));
            }
            put(txn, ev)
        })
    }

    fn replace(&self, ev: &Event) -> StorageResult<()> {
        let Some(key) = ev.replacement_key() else {
            return match self.save(ev) {
                Err(StorageError::Duplicate(_)) => Ok(()),
                other => other,
            };
        };
        self.with_write(|txn| {
            if load(txn, &ev.id)?.is_some() {
                return Ok(());
            }
            let current = match current_holder(txn, &key)? {
                Some(id) => load(txn, &id)?,
                None => None,
            };
            if let Some(current) = current {
                if !ev.supersedes(&current) {
                    debug!("skipping {}: superseded by {}", ev.id, current.id);
                    return Ok(());
                }
                remove(txn, &current)?;
            }
            put(txn, ev)
        })
    }

    fn delete(&self, ev: &Event) -> StorageResult<()> {
        self.with_write(|txn| match load(txn, &ev.id)? {
            Some(stored) => remove(txn, &stored),
            None => Ok(()),
        })
    }

    fn count(&self, filter: &Filter) -> StorageResult<u64> {
        if matches!((filter.since, filter.until), (Some(s), Some(u)) if s > u) {
            return Ok(0);
        }
        let db = self.db()?;
        let txn = db.begin_read().map_err(StorageError::read)?;
        let events = txn.open_table(EVENTS).map_err(StorageError::read)?;
        let mut total = 0;
        if let Some(ids) = &filter.ids {
            for id in ids {
                if load_from(&events, id)?.is_some_and(|ev| filter.matches(&ev)) {
                    total += 1;
                }
            }
            return Ok(total);
        }
        let by_time = txn.open_table(BY_TIME).map_err(StorageError::read)?;
        let (lo, hi) = time_bounds(filter);
        for entry in by_time
            .range(lo.as_str()..hi.as_str())
            .map_err(StorageError::read)?
        {
            let (_, id) = entry.map_err(StorageError::read)?;
            if load_from(&events, id.value())?.is_some_and(|ev| filter.matches(&ev)) {
                total += 1;
            }
        }
        Ok(total)
    }

    fn query(&self, filter: Filter) -> EventStream {
        let db = match self.db() {
            Ok(db) => db,
            Err(e) => return failed_stream(e),
        };
        stream_events(move |out| {
            if filter.is_unsatisfiable() {
                return Ok(());
            }
            let limit = filter.limit.unwrap_or(usize::MAX);
            let txn = db.begin_read().map_err(StorageError::read)?;
            let events = txn.open_table(EVENTS).map_err(StorageError::read)?;

            if let Some(ids) = &filter.ids {
                let mut found = vec![];
                for id in ids {
                    if let Some(ev) = load_from(&events, id)? {
                        if filter.matches(&ev) {
                            found.push(ev);
                        }
                    }
                }
                sort_newest_first(&mut found);
                for ev in found.into_iter().take(limit) {
                    if !out.emit(ev) {
                        break;
                    }
                }
                return Ok(());
            }

            let by_time = txn.open_table(BY_TIME).map_err(StorageError::read)?;
            let (lo, hi) = time_bounds(&filter);
            let mut sent = 0;
            for entry in by_time
                .range(lo.as_str()..hi.as_str())
                .map_err(StorageError::read)?
                .rev()
            {
                let (_, id) = entry.map_err(StorageError::read)?;
                let Some(ev) = load_from(&events, id.value())? else {
                    continue;
                };
                if !filter.matches(&ev) {
                    continue;
                }
                if !out.emit(ev) {
                    debug!("query consumer went away");
                    break;
                }
                sent += 1;
                if sent >= limit {
                    break;
                }
            }
            Ok(())
        })
    }

    fn snapshot(&self, dest: &Path) -> StorageResult<PathBuf> {
        let db = self.db()?;
        fs::create_dir_all(dest).map_err(StorageError::write)?;
        let target = dest.join(FILE_NAME);
        let tmp = tempfile::NamedTempFile::new_in(dest).map_err(StorageError::write)?;
        let copied = {
            let copy = Database::create(tmp.path()).map_err(StorageError::write)?;
            let read = db.begin_read().map_err(StorageError::read)?;
            let write = copy.begin_write().map_err(StorageError::write)?;
            let copied = copy_events(&read, &write)?;
            copy_index(&read, &write, BY_TIME)?;
            copy_index(&read, &write, REPLACEABLE)?;
            write.commit().map_err(StorageError::write)?;
            copied
        };
        tmp.persist(&target)
            .map_err(|e| StorageError::write(e.error))?;
        debug!("snapshot of {copied} events written to {}", target.display());
        Ok(target)
    }
}
