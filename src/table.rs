//! The group store: a bucketed table of fixed-width accumulator tuples keyed
//! by caller-supplied 64-bit hashes.
//!
//! The store does no hashing and no key comparison of its own. The engine
//! hashes the composite group key, probes every tuple filed under that hash,
//! and decides collision questions by comparing key bytes through the arena.
//! That split exists because the key spans several columns, any of which may
//! be absent, and only the engine knows how to compare them.
//!
//! Tuples live in 256 buckets selected by the top byte of the hash. When a
//! scratch directory is configured and the resident tuple count passes the
//! budget, the least recently touched bucket is encoded into a spill file
//! under a process-unique subdirectory; touching that bucket again reads the
//! file back in and deletes it. Spill files carry a little magic/version
//! header so a stale or foreign file fails loudly instead of decoding into
//! garbage. The spill directory is removed when the store is dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use indexmap::IndexSet;

use crate::aggfunc::Cell;
use crate::arena::KeyRef;
use crate::errors::{CsvCliError, CsvCliResult};

const BUCKETS: usize = 256;
const SPILL_MAGIC: u32 = 0x4347_4741;
const SPILL_VERSION: u16 = 1;

/// Default resident-tuple budget when spilling is armed.
pub const DEFAULT_RESIDENT_GROUPS: usize = 1 << 20;

const TAG_EMPTY: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;
const TAG_LIST: u8 = 3;
const TAG_KEY: u8 = 4;

/// A stable reference to one tuple in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId {
    bucket: usize,
    index: usize,
}

struct GroupEntry {
    hash: u64,
    cells: Box<[Cell]>,
}

enum BucketState {
    Resident(Vec<GroupEntry>),
    Spilled,
}

struct Bucket {
    state: BucketState,
    /// Tuple count, kept accurate while the bucket sits on disk.
    len: usize,
    last_touch: u64,
}

struct SpillConfig {
    dir: PathBuf,
    max_resident: usize,
}

/// Hash-indexed storage of fixed-width `Cell` tuples.
pub struct PageStore {
    width: usize,
    buckets: Vec<Bucket>,
    resident: usize,
    tick: u64,
    spill: Option<SpillConfig>,
}

impl PageStore {
    /// A fully resident store; nothing ever touches disk.
    pub fn new(width: usize) -> PageStore {
        PageStore {
            width,
            buckets: (0..BUCKETS)
                .map(|_| Bucket {
                    state: BucketState::Resident(Vec::new()),
                    len: 0,
                    last_touch: 0,
                })
                .collect(),
            resident: 0,
            tick: 0,
            spill: None,
        }
    }

    /// A store that spills cold buckets under `scratch` once more than
    /// `max_resident` tuples are live in memory.
    pub fn with_spill(
        width: usize,
        scratch: &Path,
        max_resident: usize,
    ) -> CsvCliResult<PageStore> {
        let dir = scratch.join(format!("cliagg-{}", process::id()));
        fs::create_dir_all(&dir)
            .map_err(|e| CsvCliError::Scratch(format!("{}: {}", dir.display(), e)))?;
        let mut store = PageStore::new(width);
        store.spill = Some(SpillConfig { dir, max_resident });
        Ok(store)
    }

    /// Total tuples stored, resident or spilled.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_of(hash: u64) -> usize {
        (hash >> 56) as usize
    }

    fn spill_path(dir: &Path, bucket: usize) -> PathBuf {
        dir.join(format!("bucket-{:03}.spill", bucket))
    }

    /// Loads the bucket back from its spill file if needed and marks it
    /// recently used.
    fn ensure_resident(&mut self, bucket: usize) -> CsvCliResult<()> {
        self.tick += 1;
        self.buckets[bucket].last_touch = self.tick;
        if let BucketState::Resident(_) = self.buckets[bucket].state {
            return Ok(());
        }
        let dir = match self.spill.as_ref() {
            Some(cfg) => cfg.dir.clone(),
            None => unreachable!("bucket spilled without a scratch directory"),
        };
        let path = PageStore::spill_path(&dir, bucket);
        let bytes = fs::read(&path)
            .map_err(|e| CsvCliError::Scratch(format!("{}: {}", path.display(), e)))?;
        let entries = decode_bucket(self.width, &bytes)
            .map_err(|e| CsvCliError::Scratch(format!("{}: {}", path.display(), e)))?;
        fs::remove_file(&path)
            .map_err(|e| CsvCliError::Scratch(format!("{}: {}", path.display(), e)))?;
        self.resident += entries.len();
        self.buckets[bucket].len = entries.len();
        self.buckets[bucket].state = BucketState::Resident(entries);
        Ok(())
    }

    /// Writes cold buckets out until the resident count is back under
    /// budget. The bucket in `keep` is never a victim; it is the one the
    /// caller is working in.
    fn enforce_budget(&mut self, keep: usize) -> CsvCliResult<()> {
        let (dir, max_resident) = match self.spill.as_ref() {
            Some(cfg) => (cfg.dir.clone(), cfg.max_resident),
            None => return Ok(()),
        };
        while self.resident > max_resident {
            let victim = self
                .buckets
                .iter()
                .enumerate()
                .filter(|(i, b)| {
                    *i != keep && b.len > 0 && matches!(b.state, BucketState::Resident(_))
                })
                .min_by_key(|(_, b)| b.last_touch)
                .map(|(i, _)| i);
            let victim = match victim {
                Some(v) => v,
                None => return Ok(()),
            };
            let entries = match std::mem::replace(
                &mut self.buckets[victim].state,
                BucketState::Spilled,
            ) {
                BucketState::Resident(entries) => entries,
                BucketState::Spilled => unreachable!(),
            };
            let path = PageStore::spill_path(&dir, victim);
            fs::write(&path, encode_bucket(self.width, &entries))
                .map_err(|e| CsvCliError::Scratch(format!("{}: {}", path.display(), e)))?;
            self.resident -= entries.len();
        }
        Ok(())
    }

    /// Probes every tuple filed under `hash`, in unspecified order, and
    /// returns the first for which `matches` says the keys agree.
    pub fn find<F>(&mut self, hash: u64, mut matches: F) -> CsvCliResult<Option<SlotId>>
    where
        F: FnMut(&[Cell]) -> bool,
    {
        let bucket = PageStore::bucket_of(hash);
        self.ensure_resident(bucket)?;
        if let BucketState::Resident(ref entries) = self.buckets[bucket].state {
            for (index, entry) in entries.iter().enumerate() {
                if entry.hash == hash && matches(&entry.cells) {
                    return Ok(Some(SlotId { bucket, index }));
                }
            }
        }
        Ok(None)
    }

    /// Appends a fresh zero-initialized tuple under `hash`. Duplicate hashes
    /// are allowed; disambiguation is the caller's problem.
    pub fn insert(&mut self, hash: u64) -> CsvCliResult<SlotId> {
        let bucket = PageStore::bucket_of(hash);
        self.ensure_resident(bucket)?;
        let width = self.width;
        let index = match self.buckets[bucket].state {
            BucketState::Resident(ref mut entries) => {
                entries.push(GroupEntry {
                    hash,
                    cells: vec![Cell::Empty; width].into_boxed_slice(),
                });
                entries.len() - 1
            }
            BucketState::Spilled => unreachable!(),
        };
        self.buckets[bucket].len += 1;
        self.resident += 1;
        self.enforce_budget(bucket)?;
        Ok(SlotId { bucket, index })
    }

    /// The tuple behind `id`, loaded back in if its bucket was spilled.
    pub fn cells_mut(&mut self, id: SlotId) -> CsvCliResult<&mut [Cell]> {
        self.ensure_resident(id.bucket)?;
        match self.buckets[id.bucket].state {
            BucketState::Resident(ref mut entries) => Ok(&mut entries[id.index].cells),
            BucketState::Spilled => unreachable!(),
        }
    }

    /// Consumes the store and yields every tuple exactly once, in
    /// unspecified order, reading spilled buckets back as it reaches them.
    pub fn into_groups(self) -> Groups {
        Groups {
            store: self,
            next_bucket: 0,
            pending: Vec::new().into_iter(),
        }
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if let Some(cfg) = self.spill.take() {
            let _ = fs::remove_dir_all(&cfg.dir);
        }
    }
}

/// Draining iterator over every tuple in a [`PageStore`].
pub struct Groups {
    store: PageStore,
    next_bucket: usize,
    pending: std::vec::IntoIter<GroupEntry>,
}

impl Iterator for Groups {
    type Item = CsvCliResult<Box<[Cell]>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.next() {
                return Some(Ok(entry.cells));
            }
            if self.next_bucket >= BUCKETS {
                return None;
            }
            let bucket = self.next_bucket;
            self.next_bucket += 1;
            if let Err(err) = self.store.ensure_resident(bucket) {
                return Some(Err(err));
            }
            let state = std::mem::replace(
                &mut self.store.buckets[bucket].state,
                BucketState::Resident(Vec::new()),
            );
            self.store.buckets[bucket].len = 0;
            if let BucketState::Resident(entries) = state {
                self.store.resident -= entries.len();
                self.pending = entries.into_iter();
            }
        }
    }
}

fn encode_bucket(width: usize, entries: &[GroupEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SPILL_MAGIC.to_le_bytes());
    out.extend_from_slice(&SPILL_VERSION.to_le_bytes());
    out.extend_from_slice(&(width as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.hash.to_le_bytes());
        for cell in entry.cells.iter() {
            encode_cell(cell, &mut out);
        }
    }
    out
}

fn encode_cell(cell: &Cell, out: &mut Vec<u8>) {
    match cell {
        Cell::Empty => out.push(TAG_EMPTY),
        Cell::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Cell::Str(s) => {
            out.push(TAG_STR);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s);
        }
        Cell::List(vals) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(vals.len() as u32).to_le_bytes());
            for val in vals {
                out.extend_from_slice(&(val.len() as u32).to_le_bytes());
                out.extend_from_slice(val);
            }
        }
        Cell::Key(key) => {
            out.push(TAG_KEY);
            let (page, off, len) = key.to_parts();
            out.extend_from_slice(&page.to_le_bytes());
            out.extend_from_slice(&off.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
        }
    }
}

struct SpillReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SpillReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.buf.len() {
            return Err("truncated spill file".to_string());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, String> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, String> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn decode_bucket(width: usize, bytes: &[u8]) -> Result<Vec<GroupEntry>, String> {
    let mut rdr = SpillReader { buf: bytes, pos: 0 };
    if rdr.read_u32()? != SPILL_MAGIC {
        return Err("bad spill file magic".to_string());
    }
    if rdr.read_u16()? != SPILL_VERSION {
        return Err("unsupported spill file version".to_string());
    }
    if rdr.read_u16()? as usize != width {
        return Err("spill file width does not match the plan".to_string());
    }
    let count = rdr.read_u64()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = rdr.read_u64()?;
        let mut cells = Vec::with_capacity(width);
        for _ in 0..width {
            cells.push(decode_cell(&mut rdr)?);
        }
        entries.push(GroupEntry {
            hash,
            cells: cells.into_boxed_slice(),
        });
    }
    Ok(entries)
}

fn decode_cell(rdr: &mut SpillReader) -> Result<Cell, String> {
    match rdr.read_u8()? {
        TAG_EMPTY => Ok(Cell::Empty),
        TAG_INT => {
            let b = rdr.take(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(Cell::Int(i64::from_le_bytes(raw)))
        }
        TAG_STR => Ok(Cell::Str(rdr.read_bytes()?)),
        TAG_LIST => {
            let count = rdr.read_u32()? as usize;
            let mut vals = IndexSet::with_capacity(count);
            for _ in 0..count {
                vals.insert(rdr.read_bytes()?);
            }
            Ok(Cell::List(vals))
        }
        TAG_KEY => {
            let page = rdr.read_u32()?;
            let off = rdr.read_u32()?;
            let len = rdr.read_u32()?;
            Ok(Cell::Key(KeyRef::from_parts(page, off, len)))
        }
        tag => Err(format!("unknown cell tag {} in spill file", tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread_hash(i: u64) -> u64 {
        // Distinct hashes spread across buckets.
        (i << 56) | i
    }

    #[test]
    fn test_insert_and_find_resident() {
        let mut store = PageStore::new(2);
        let id = store.insert(42).unwrap();
        {
            let cells = store.cells_mut(id).unwrap();
            cells[0] = Cell::Int(7);
        }
        let found = store.find(42, |cells| cells[0] == Cell::Int(7)).unwrap();
        assert_eq!(found, Some(id));
        assert_eq!(store.find(43, |_| true).unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_hashes_probe_all_slots() {
        let mut store = PageStore::new(1);
        let a = store.insert(99).unwrap();
        let b = store.insert(99).unwrap();
        store.cells_mut(a).unwrap()[0] = Cell::Int(1);
        store.cells_mut(b).unwrap()[0] = Cell::Int(2);
        let hit = store.find(99, |cells| cells[0] == Cell::Int(2)).unwrap();
        assert_eq!(hit, Some(b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_into_groups_yields_everything_once() {
        let mut store = PageStore::new(1);
        for i in 0..50 {
            let id = store.insert(spread_hash(i)).unwrap();
            store.cells_mut(id).unwrap()[0] = Cell::Int(i as i64);
        }
        let mut seen: Vec<i64> = store
            .into_groups()
            .map(|g| match g.unwrap()[0] {
                Cell::Int(v) => v,
                _ => panic!("unexpected cell"),
            })
            .collect();
        seen.sort();
        assert_eq!(seen, (0..50).collect::<Vec<i64>>());
    }

    #[test]
    fn test_spill_and_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = PageStore::with_spill(2, tmp.path(), 8).unwrap();
        for i in 0..64 {
            let id = store.insert(spread_hash(i)).unwrap();
            let cells = store.cells_mut(id).unwrap();
            cells[0] = Cell::Int(i as i64);
            cells[1] = Cell::Str(format!("val-{}", i).into_bytes());
        }
        // Something must have gone to disk with a budget of 8.
        let spill_dir = tmp.path().join(format!("cliagg-{}", process::id()));
        assert!(fs::read_dir(&spill_dir).unwrap().next().is_some());

        for i in 0..64 {
            let want = Cell::Str(format!("val-{}", i).into_bytes());
            let hit = store
                .find(spread_hash(i), |cells| cells[1] == want)
                .unwrap();
            assert!(hit.is_some(), "group {} lost after spill", i);
        }
        assert_eq!(store.len(), 64);

        let mut total = 0;
        for group in store.into_groups() {
            let cells = group.unwrap();
            assert_eq!(cells.len(), 2);
            total += 1;
        }
        assert_eq!(total, 64);
    }

    #[test]
    fn test_drop_removes_spill_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let spill_dir = tmp.path().join(format!("cliagg-{}", process::id()));
        {
            let mut store = PageStore::with_spill(1, tmp.path(), 2).unwrap();
            for i in 0..32 {
                store.insert(spread_hash(i)).unwrap();
            }
            assert!(spill_dir.exists());
        }
        assert!(!spill_dir.exists());
    }

    #[test]
    fn test_codec_round_trips_every_cell_kind() {
        let mut list = IndexSet::new();
        list.insert(b"a".to_vec());
        list.insert(b"b,with,commas".to_vec());
        let entries = vec![GroupEntry {
            hash: 0xdead_beef,
            cells: vec![
                Cell::Empty,
                Cell::Int(-12),
                Cell::Str(b"raw \xff bytes".to_vec()),
                Cell::List(list.clone()),
                Cell::Key(KeyRef::from_parts(1, 2, 3)),
            ]
            .into_boxed_slice(),
        }];
        let bytes = encode_bucket(5, &entries);
        let back = decode_bucket(5, &bytes).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].hash, 0xdead_beef);
        assert_eq!(back[0].cells[0], Cell::Empty);
        assert_eq!(back[0].cells[1], Cell::Int(-12));
        assert_eq!(back[0].cells[2], Cell::Str(b"raw \xff bytes".to_vec()));
        assert_eq!(back[0].cells[3], Cell::List(list));
        assert_eq!(back[0].cells[4], Cell::Key(KeyRef::from_parts(1, 2, 3)));
    }

    #[test]
    fn test_decode_rejects_foreign_bytes() {
        assert!(decode_bucket(1, b"not a spill file").is_err());
        let mut bytes = encode_bucket(1, &[]);
        bytes[0] ^= 0xff;
        assert!(decode_bucket(1, &bytes).is_err());
        // Width mismatch fails too.
        let good = encode_bucket(2, &[]);
        assert!(decode_bucket(3, &good).is_err());
    }
}
