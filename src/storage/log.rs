//! Append-only record log with an in-memory index.
//!
//! Every mutation appends one newline-delimited JSON record to `events.log`:
//!
//! ```text
//! {"op":"put","event":{...}}
//! {"op":"put","event":{...},"replaces":"<old id>"}
//! {"op":"delete","id":"<id>"}
//! ```
//!
//! The index is rebuilt by replaying the log on `init`. A torn final record
//! left by a crash is truncated. The log is compacted on `init` when dead
//! records outnumber live ones, and while running once enough dead records
//! pile up as well. A replacement is a single record, so replay never
//! observes the old event removed without the new one stored.

use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    ops::Bound,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    failed_stream, sort_newest_first, stream_events, Engine, EventStream, StorageBackend,
    StorageError, StorageResult,
};
use crate::{event::Event, filter::Filter};

/// Log file inside the configured directory and inside snapshot targets.
pub const FILE_NAME: &str = "events.log";

/// Index entries examined per lock acquisition while streaming.
const BATCH: usize = 256;

/// Dead records tolerated before a running store compacts its log.
const COMPACT_MIN_DEAD: u64 = 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Record {
    Put {
        event: Event,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaces: Option<String>,
    },
    Delete {
        id: String,
    },
}

/// Location and indexed attributes of a live event.
#[derive(Debug, Clone)]
struct Slot {
    offset: u64,
    len: usize,
    created_at: u64,
    kind: u32,
    pubkey: String,
    replacement: Option<String>,
}

impl Slot {
    /// Cheap pre-check on indexed attributes before reading the record.
    fn admits(&self, filter: &Filter) -> bool {
        filter
            .authors
            .as_ref()
            .map_or(true, |a| a.iter().any(|p| *p == self.pubkey))
            && filter.kinds.as_ref().map_or(true, |k| k.contains(&self.kind))
            && filter.in_time_range(self.created_at)
    }
}

#[derive(Default)]
struct Index {
    slots: HashMap<String, Slot>,
    by_time: BTreeSet<(u64, String)>,
    /// Replacement key → id of the current winner.
    replaceable: HashMap<String, String>,
}

impl Index {
    fn insert(&mut self, ev: &Event, offset: u64, len: usize) {
        let replacement = ev.replacement_key();
        if let Some(key) = &replacement {
            let wins = match self.replaceable.get(key).and_then(|id| self.slots.get(id).map(|s| (id, s))) {
                Some((id, holder)) => ev.outranks(holder.created_at, id),
                None => true,
            };
            if wins {
                self.replaceable.insert(key.clone(), ev.id.clone());
            }
        }
        self.by_time.insert((ev.created_at, ev.id.clone()));
        self.slots.insert(
            ev.id.clone(),
            Slot {
                offset,
                len,
                created_at: ev.created_at,
                kind: ev.kind,
                pubkey: ev.pubkey.clone(),
                replacement,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<Slot> {
        let slot = self.slots.remove(id)?;
        self.by_time.remove(&(slot.created_at, id.to_string()));
        if let Some(key) = &slot.replacement {
            if self.replaceable.get(key).is_some_and(|holder| holder == id) {
                self.replaceable.remove(key);
            }
        }
        Some(slot)
    }

    fn apply(&mut self, record: Record, offset: u64, len: usize) {
        match record {
            Record::Put { event, replaces } => {
                if let Some(old) = replaces {
                    self.remove(&old);
                }
                self.insert(&event, offset, len);
            }
            Record::Delete { id } => {
                self.remove(&id);
            }
        }
    }
}

/// Open log plus its index.
struct State {
    writer: File,
    reader: Arc<File>,
    /// Length of the log; every byte before it belongs to a complete record.
    end: u64,
    index: Index,
    records: u64,
    /// Set when a failed append could not be rolled back; the file then ends
    /// in a partial record and takes no further writes until reopened.
    broken: bool,
}

/// Live records in log order, captured under the lock for a rewrite.
struct Live {
    reader: Arc<File>,
    end: u64,
    slots: Vec<Slot>,
}

/// A rewritten log not yet moved over the original.
struct Compacted {
    file: tempfile::NamedTempFile,
    writer: File,
    reader: File,
    index: Index,
    end: u64,
}

impl State {
    fn open(path: &Path) -> StorageResult<Self> {
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StorageError::init)?;
        let reader = File::open(path).map_err(StorageError::init)?;

        let mut index = Index::default();
        let mut records = 0;
        let mut offset = 0u64;
        let mut lines = BufReader::new(&reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = lines.read_until(b'\n', &mut line).map_err(StorageError::init)?;
            if n == 0 {
                break;
            }
            let complete = line.last() == Some(&b'\n');
            let parsed = if complete {
                serde_json::from_slice::<Record>(&line[..n - 1]).ok()
            } else {
                None
            };
            match parsed {
                Some(record) => {
                    index.apply(record, offset, n - 1);
                    records += 1;
                    offset += n as u64;
                }
                None => {
                    let at_eof = lines.fill_buf().map_err(StorageError::init)?.is_empty();
                    if !at_eof {
                        return Err(StorageError::Init(format!(
                            "corrupt record at offset {offset} in {}",
                            path.display()
                        )));
                    }
                    warn!("truncating torn record at offset {offset} in {}", path.display());
                    writer.set_len(offset).map_err(StorageError::init)?;
                    break;
                }
            }
        }
        Ok(Self {
            writer,
            reader: Arc::new(reader),
            end: offset,
            index,
            records,
            broken: false,
        })
    }

    fn dead(&self) -> u64 {
        self.records - self.index.slots.len() as u64
    }

    fn wants_compaction(&self) -> bool {
        let dead = self.dead();
        dead >= COMPACT_MIN_DEAD && dead > self.index.slots.len() as u64
    }

    fn live(&self) -> Live {
        let mut slots: Vec<Slot> = self.index.slots.values().cloned().collect();
        slots.sort_by_key(|slot| slot.offset);
        Live {
            reader: self.reader.clone(),
            end: self.end,
            slots,
        }
    }

    /// Replace the log with `compacted`, which must cover every record up
    /// to the current end.
    fn install(&mut self, path: &Path, compacted: Compacted) -> StorageResult<u64> {
        let Compacted {
            file,
            writer,
            reader,
            index,
            end,
        } = compacted;
        file.persist(path).map_err(|e| StorageError::write(e.error))?;
        let dropped = self.dead();
        self.records = index.slots.len() as u64;
        self.writer = writer;
        self.reader = Arc::new(reader);
        self.end = end;
        self.index = index;
        Ok(dropped)
    }

    fn append(&mut self, record: &Record) -> StorageResult<(u64, usize)> {
        if self.broken {
            return Err(StorageError::Write(
                "log ends in a partial record; reopen the store".into(),
            ));
        }
        let mut line = serde_json::to_vec(record).map_err(StorageError::write)?;
        let len = line.len();
        line.push(b'\n');
        let offset = self.end;
        let written = self
            .writer
            .write_all(&line)
            .and_then(|_| self.writer.sync_data());
        if let Err(e) = written {
            let truncated = self.writer.set_len(offset);
            self.roll_back(offset, truncated);
            return Err(StorageError::write(e));
        }
        self.end += line.len() as u64;
        self.records += 1;
        Ok((offset, len))
    }

    /// Settle the log after a failed append of a record starting at `offset`.
    fn roll_back(&mut self, offset: u64, truncated: io::Result<()>) {
        if let Err(e) = truncated {
            warn!("could not truncate log back to {offset} after a failed append: {e}");
            self.broken = true;
        }
    }
}

fn read_event(reader: &File, slot: &Slot) -> StorageResult<Event> {
    let mut buf = vec![0u8; slot.len];
    reader
        .read_exact_at(&mut buf, slot.offset)
        .map_err(StorageError::read)?;
    match serde_json::from_slice(&buf).map_err(StorageError::read)? {
        Record::Put { event, .. } => Ok(event),
        Record::Delete { id } => Err(StorageError::Read(format!(
            "index entry points at delete record for {id}"
        ))),
    }
}

/// Write the live events of `live` into a fresh log next to `path`.
fn rewrite(path: &Path, live: &Live) -> StorageResult<Compacted> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file = tempfile::NamedTempFile::new_in(dir).map_err(StorageError::write)?;
    let mut index = Index::default();
    let mut end = 0u64;
    {
        let mut out = BufWriter::new(file.as_file());
        for slot in &live.slots {
            let event = read_event(&live.reader, slot)?;
            let mut line = serde_json::to_vec(&Record::Put {
                event: event.clone(),
                replaces: None,
            })
            .map_err(StorageError::write)?;
            let len = line.len();
            line.push(b'\n');
            out.write_all(&line).map_err(StorageError::write)?;
            index.insert(&event, end, len);
            end += line.len() as u64;
        }
        out.flush().map_err(StorageError::write)?;
    }
    file.as_file().sync_all().map_err(StorageError::write)?;
    let writer = OpenOptions::new()
        .append(true)
        .open(file.path())
        .map_err(StorageError::write)?;
    let reader = file.reopen().map_err(StorageError::write)?;
    Ok(Compacted {
        file,
        writer,
        reader,
        index,
        end,
    })
}

pub struct LogBackend {
    dir: PathBuf,
    state: Arc<Mutex<Option<State>>>,
    compacting: AtomicBool,
}

impl LogBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            state: Arc::new(Mutex::new(None)),
            compacting: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<State>> {
        lock_state(&self.state)
    }

    fn path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    /// Compact while running if the log is mostly dead records. Live events
    /// are copied without the lock; the result is dropped if anything was
    /// appended meanwhile, and the next mutation tries again.
    fn compact_if_due(&self) {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.compact_live() {
            warn!("compacting {} failed: {e}", self.path().display());
        }
        self.compacting.store(false, Ordering::Release);
    }

    fn compact_live(&self) -> StorageResult<()> {
        let live = {
            let guard = self.lock();
            match guard.as_ref() {
                Some(state) if state.wants_compaction() => state.live(),
                _ => return Ok(()),
            }
        };
        let path = self.path();
        let compacted = rewrite(&path, &live)?;
        let mut guard = self.lock();
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        if state.end != live.end || state.broken {
            debug!("log changed while compacting, will retry");
            return Ok(());
        }
        let dropped = state.install(&path, compacted)?;
        info!("compacted {} ({dropped} dead records dropped)", path.display());
        Ok(())
    }
}

fn lock_state(state: &Mutex<Option<State>>) -> MutexGuard<'_, Option<State>> {
    state.lock().unwrap_or_else(|poisoned| {
        warn!("log store lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Upper bound that still includes every id at `until`.
fn upper_bound(until: Option<u64>) -> Bound<(u64, String)> {
    match until.and_then(|u| u.checked_add(1)) {
        Some(next) => Bound::Excluded((next, String::new())),
        None => Bound::Unbounded,
    }
}

impl StorageBackend for LogBackend {
    fn engine(&self) -> Engine {
        Engine::Log
    }

    fn init(&self) -> StorageResult<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(StorageError::init)?;
        let path = self.path();
        let mut state = State::open(&path)?;
        if state.dead() > state.index.slots.len() as u64 {
            let compacted = rewrite(&path, &state.live()).map_err(StorageError::init)?;
            let dropped = state.install(&path, compacted).map_err(StorageError::init)?;
            info!("compacted {} ({dropped} dead records dropped)", path.display());
        }
        info!(
            "opened log store at {} ({} events)",
            path.display(),
            state.index.slots.len()
        );
        *guard = Some(state);
        Ok(())
    }

    fn close(&self) {
        if self.lock().take().is_some() {
            debug!("closed log store at {}", self.dir.display());
        }
    }

    fn save(&self, ev: &Event) -> StorageResult<()> {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or(StorageError::Closed)?;
        if state.index.slots.contains_key(&ev.id) {
            return Err(StorageError::Duplicate(ev.id.clone()));
        }
        let (offset, len) = state.append(&Record::Put {
            event: ev.clone(),
            replaces: None,
        })?;
        state.index.insert(ev, offset, len);
        Ok(())
    }

    fn replace(&self, ev: &Event) -> StorageResult<()> {
        let Some(key) = ev.replacement_key() else {
            return match self.save(ev) {
                Err(StorageError::Duplicate(_)) => Ok(()),
                other => other,
            };
        };
        let due = {
            let mut guard = self.lock();
            let state = guard.as_mut().ok_or(StorageError::Closed)?;
            if state.index.slots.contains_key(&ev.id) {
                return Ok(());
            }
            let holder = state.index.replaceable.get(&key).and_then(|id| {
                state
                    .index
                    .slots
                    .get(id)
                    .map(|slot| (id.clone(), slot.created_at))
            });
            if let Some((id, created_at)) = &holder {
                if !ev.outranks(*created_at, id) {
                    debug!("skipping {}: superseded by {id}", ev.id);
                    return Ok(());
                }
            }
            let replaces = holder.map(|(id, _)| id);
            let (offset, len) = state.append(&Record::Put {
                event: ev.clone(),
                replaces: replaces.clone(),
            })?;
            if let Some(old) = replaces {
                state.index.remove(&old);
            }
            state.index.insert(ev, offset, len);
            state.wants_compaction()
        };
        if due {
            self.compact_if_due();
        }
        Ok(())
    }

    fn delete(&self, ev: &Event) -> StorageResult<()> {
        let due = {
            let mut guard = self.lock();
            let state = guard.as_mut().ok_or(StorageError::Closed)?;
            if !state.index.slots.contains_key(&ev.id) {
                return Ok(());
            }
            state.append(&Record::Delete { id: ev.id.clone() })?;
            state.index.remove(&ev.id);
            state.wants_compaction()
        };
        if due {
            self.compact_if_due();
        }
        Ok(())
    }

    fn count(&self, filter: &Filter) -> StorageResult<u64> {
        let (reader, slots) = {
            let guard = self.lock();
            let state = guard.as_ref().ok_or(StorageError::Closed)?;
            let slots: Vec<Slot> = match &filter.ids {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| state.index.slots.get(id))
                    .filter(|slot| slot.admits(filter))
                    .cloned()
                    .collect(),
                None => state
                    .index
                    .slots
                    .values()
                    .filter(|slot| slot.admits(filter))
                    .cloned()
                    .collect(),
            };
            (state.reader.clone(), slots)
        };
        let mut total = 0;
        for slot in &slots {
            if filter.matches(&read_event(&reader, slot)?) {
                total += 1;
            }
        }
        Ok(total)
    }

    fn query(&self, filter: Filter) -> EventStream {
        if self.lock().is_none() {
            return failed_stream(StorageError::Closed);
        }
        let shared = self.state.clone();
        stream_events(move |out| {
            if filter.is_unsatisfiable() {
                return Ok(());
            }
            let limit = filter.limit.unwrap_or(usize::MAX);

            if let Some(ids) = &filter.ids {
                let (reader, slots): (_, Vec<Slot>) = {
                    let guard = lock_state(&shared);
                    let state = guard.as_ref().ok_or(StorageError::Closed)?;
                    let slots = ids
                        .iter()
                        .filter_map(|id| state.index.slots.get(id).cloned())
                        .collect();
                    (state.reader.clone(), slots)
                };
                let mut found = vec![];
                for slot in &slots {
                    let ev = read_event(&reader, slot)?;
                    if filter.matches(&ev) {
                        found.push(ev);
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

            let lower = Bound::Included((filter.since.unwrap_or(0), String::new()));
            let mut upper = upper_bound(filter.until);
            let mut sent = 0;
            loop {
                // offsets are only valid against the reader of the same generation
                let (reader, batch): (_, Vec<((u64, String), Option<Slot>)>) = {
                    let guard = lock_state(&shared);
                    let state = guard.as_ref().ok_or(StorageError::Closed)?;
                    let batch = state
                        .index
                        .by_time
                        .range((lower.clone(), upper.clone()))
                        .rev()
                        .take(BATCH)
                        .map(|key| (key.clone(), state.index.slots.get(&key.1).cloned()))
                        .collect();
                    (state.reader.clone(), batch)
                };
                let Some((last, _)) = batch.last() else {
                    return Ok(());
                };
                upper = Bound::Excluded(last.clone());
                let exhausted = batch.len() < BATCH;
                for (_, slot) in batch {
                    let Some(slot) = slot.filter(|s| s.admits(&filter)) else {
                        continue;
                    };
                    let ev = read_event(&reader, &slot)?;
                    if !filter.matches(&ev) {
                        continue;
                    }
                    if !out.emit(ev) {
                        debug!("query consumer went away");
                        return Ok(());
                    }
                    sent += 1;
                    if sent >= limit {
                        return Ok(());
                    }
                }
                if exhausted {
                    return Ok(());
                }
            }
        })
    }

    fn snapshot(&self, dest: &Path) -> StorageResult<PathBuf> {
        let (reader, end) = {
            let guard = self.lock();
            let state = guard.as_ref().ok_or(StorageError::Closed)?;
            (state.reader.clone(), state.end)
        };
        fs::create_dir_all(dest).map_err(StorageError::write)?;
        let target = dest.join(FILE_NAME);
        let mut tmp = tempfile::NamedTempFile::new_in(dest).map_err(StorageError::write)?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut pos = 0u64;
        while pos < end {
            let n = buf.len().min((end - pos) as usize);
            reader
                .read_exact_at(&mut buf[..n], pos)
                .map_err(StorageError::read)?;
            tmp.write_all(&buf[..n]).map_err(StorageError::write)?;
            pos += n as u64;
        }
        tmp.as_file().sync_all().map_err(StorageError::write)?;
        tmp.persist(&target)
            .map_err(|e| StorageError::write(e.error))?;
        debug!("snapshot of {end} log bytes written to {}", target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::sample_event;
    use crate::storage::{backend_conformance, collect};
    use tempfile::TempDir;

    backend_conformance!(|path: &Path| -> Arc<dyn StorageBackend> {
        Arc::new(LogBackend::new(path.to_path_buf()))
    });

    fn log_len(dir: &TempDir) -> u64 {
        fs::metadata(dir.path().join(FILE_NAME)).unwrap().len()
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let b = LogBackend::new(dir.path().to_path_buf());
            b.init().unwrap();
            b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
            b.close();
        }
        let intact = log_len(&dir);
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(FILE_NAME))
            .unwrap();
        f.write_all(br#"{"op":"put","event":{"id":"bb"#).unwrap();
        drop(f);

        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        assert_eq!(log_len(&dir), intact);
        b.save(&sample_event("bb22", "p1", 1, None, 2)).unwrap();
        let stored = collect(b.query(Filter::default())).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn corrupt_middle_record_fails_init() {
        let dir = TempDir::new().unwrap();
        let good = serde_json::to_string(&Record::Delete { id: "x".into() }).unwrap();
        fs::write(
            dir.path().join(FILE_NAME),
            format!("{good}\nnot json\n{good}\n"),
        )
        .unwrap();
        let b = LogBackend::new(dir.path().to_path_buf());
        assert!(matches!(b.init(), Err(StorageError::Init(_))));
    }

    #[test]
    fn replay_compacts_mostly_dead_log() {
        let dir = TempDir::new().unwrap();
        {
            let b = LogBackend::new(dir.path().to_path_buf());
            b.init().unwrap();
            for ts in 0..10u64 {
                b.replace(&sample_event(&format!("{ts:02}"), "p1", 0, None, ts))
                    .unwrap();
            }
            b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
            b.close();
        }
        let before = log_len(&dir);
        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        assert!(log_len(&dir) < before);
        assert_eq!(b.count(&Filter::default()).unwrap(), 2);
        let guard = b.lock();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.records, 2);
        assert_eq!(state.index.replaceable.get("p1:0").unwrap(), "09");
    }

    #[test]
    fn replacement_is_one_record() {
        let dir = TempDir::new().unwrap();
        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        b.replace(&sample_event("bb22", "p1", 0, None, 1)).unwrap();
        b.replace(&sample_event("cc33", "p1", 0, None, 2)).unwrap();
        let text = fs::read_to_string(dir.path().join(FILE_NAME)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(r#""replaces":"bb22""#));
    }

    #[test]
    fn replace_decides_from_the_index() {
        let dir = TempDir::new().unwrap();
        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        b.replace(&sample_event("bb22", "p1", 0, None, 5)).unwrap();
        // the holder's record is unreadable from here on
        let len = log_len(&dir) as usize - 1;
        let file = OpenOptions::new()
            .write(true)
            .open(dir.path().join(FILE_NAME))
            .unwrap();
        file.write_all_at(&vec![b'x'; len], 0).unwrap();

        b.replace(&sample_event("aa11", "p1", 0, None, 4)).unwrap();
        b.replace(&sample_event("cc33", "p1", 0, None, 6)).unwrap();
        let guard = b.lock();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.index.replaceable.get("p1:0").unwrap(), "cc33");
        assert_eq!(state.index.slots.len(), 1);
    }

    #[test]
    fn failed_rollback_stops_writes() {
        let dir = TempDir::new().unwrap();
        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        b.save(&sample_event("aa11", "p1", 1, None, 1)).unwrap();
        {
            let mut guard = b.lock();
            let state = guard.as_mut().unwrap();
            let end = state.end;
            state.roll_back(end, Err(io::Error::other("device gone")));
        }
        assert!(matches!(
            b.save(&sample_event("bb22", "p1", 1, None, 2)),
            Err(StorageError::Write(_))
        ));
        assert_eq!(b.count(&Filter::default()).unwrap(), 1);
        b.close();

        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        b.save(&sample_event("bb22", "p1", 1, None, 2)).unwrap();
        assert_eq!(b.count(&Filter::default()).unwrap(), 2);
    }

    #[tokio::test]
    async fn churn_compacts_while_running() {
        let dir = TempDir::new().unwrap();
        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        b.save(&sample_event("note", "p2", 1, None, 1)).unwrap();
        let rounds = COMPACT_MIN_DEAD + 8;
        for ts in 0..rounds {
            b.replace(&sample_event(&format!("{ts:06}"), "p1", 0, None, ts))
                .unwrap();
        }
        {
            let guard = b.lock();
            let state = guard.as_ref().unwrap();
            assert!(state.records < rounds / 2, "{} records", state.records);
            assert!(state.dead() < COMPACT_MIN_DEAD);
        }
        let stored = collect(b.query(Filter::default())).await.unwrap();
        let ids: Vec<&str> = stored.iter().map(|e| e.id.as_str()).collect();
        let latest = format!("{:06}", rounds - 1);
        assert_eq!(ids, vec![latest.as_str(), "note"]);

        b.close();
        let b = LogBackend::new(dir.path().to_path_buf());
        b.init().unwrap();
        assert_eq!(b.count(&Filter::default()).unwrap(), 2);
    }

    #[test]
    fn upper_bound_handles_max_timestamp() {
        assert_eq!(upper_bound(Some(u64::MAX)), Bound::Unbounded);
        assert_eq!(upper_bound(None), Bound::Unbounded);
        assert_eq!(
            upper_bound(Some(5)),
            Bound::Excluded((6, String::new()))
        );
    }
}
