use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use rayon::prelude::*;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::{
    cluster::cosine_similarity,
    embedding::check_dimension,
    error::{Error, Result},
    record::SearchHit,
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const NEXT_ID_KEY: &str = "next_id";

/// Header size: 4 bytes dimension + 4 bytes path length.
const HEADER_SIZE: usize = 8;

struct Entry {
    path: String,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Arena {
    entries: BTreeMap<u64, Entry>,
    by_path: HashMap<String, u64>,
    next_id: u64,
}

/// Embedding vectors keyed by stable id, with a path lookup on the side.
///
/// Ids are allocated monotonically and never reused, including across
/// restarts. Re-inserting a known path overwrites the vector under its
/// existing id.
///
/// Binary format per persisted entry:
/// - 4 bytes: dimension D (u32 LE)
/// - 4 bytes: path length P (u32 LE)
/// - P bytes: UTF-8 path
/// - D * 4 bytes: f32 values in native byte order
pub struct VectorIndex {
    dimension: usize,
    db: Option<Database>,
    arena: RwLock<Arena>,
}

impl VectorIndex {
    /// Open or create a vector index at `path` and load every stored entry.
    ///
    /// Entries with a different dimension or an unreadable encoding are
    /// deleted with a warning; re-indexing the file stores a fresh vector.
    pub fn open(path: &Path, dimension: usize) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(META)?;
        txn.commit()?;

        let mut arena = Arena::default();
        let mut stale = Vec::new();
        {
            let txn = db.begin_read()?;
            let table = txn.open_table(VECTORS)?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                let id = k.value();
                match decode(v.value(), dimension) {
                    Some((path, vector)) => {
                        arena.by_path.insert(path.clone(), id);
                        arena.entries.insert(id, Entry { path, vector });
                    }
                    None => {
                        warn!(id, "dropping unreadable vector entry");
                        stale.push(id);
                    }
                }
                arena.next_id = arena.next_id.max(id + 1);
            }

            let meta = txn.open_table(META)?;
            if let Some(next) = meta.get(NEXT_ID_KEY)? {
                arena.next_id = arena.next_id.max(next.value());
            }
        }

        if !stale.is_empty() {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(VECTORS)?;
                for &id in &stale {
                    table.remove(id)?;
                }
            }
            txn.commit()?;
        }
        debug!(
            entries = arena.entries.len(),
            dropped = stale.len(),
            "vector index loaded"
        );

        Ok(Self {
            dimension,
            db: Some(db),
            arena: RwLock::new(arena),
        })
    }

    /// Create a vector index that is never persisted.
    pub fn in_memory(dimension: usize) -> Self {
        Self {
            dimension,
            db: None,
            arena: RwLock::new(Arena::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Arena>> {
        self.arena.read().map_err(|_| Error::poisoned("vector index"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Arena>> {
        self.arena.write().map_err(|_| Error::poisoned("vector index"))
    }

    /// Insert or replace the vector for `path`, returning its stable id.
    ///
    /// The database write happens before the in-memory arena is touched, so
    /// a failed write leaves both unchanged.
    pub fn upsert(&self, path: &str, vector: Vec<f32>) -> Result<u64> {
        check_dimension(&vector, self.dimension)?;

        let mut arena = self.write()?;
        let (id, is_new) = match arena.by_path.get(path) {
            Some(&id) => (id, false),
            None => (arena.next_id, true),
        };

        if let Some(db) = &self.db {
            let bytes = encode(path, &vector);
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(VECTORS)?;
                table.insert(id, bytes.as_slice())?;
                if is_new {
                    let mut meta = txn.open_table(META)?;
                    meta.insert(NEXT_ID_KEY, id + 1)?;
                }
            }
            txn.commit()?;
        }

        if is_new {
            arena.next_id = id + 1;
            arena.by_path.insert(path.to_string(), id);
        }
        arena.entries.insert(
            id,
            Entry {
                path: path.to_string(),
                vector,
            },
        );
        Ok(id)
    }

    /// Remove the vector stored for `path`. Returns whether one existed.
    pub fn remove(&self, path: &str) -> Result<bool> {
        let mut arena = self.write()?;
        let Some(&id) = arena.by_path.get(path) else {
            return Ok(false);
        };

        if let Some(db) = &self.db {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(VECTORS)?;
                table.remove(id)?;
            }
            txn.commit()?;
        }

        arena.by_path.remove(path);
        arena.entries.remove(&id);
        Ok(true)
    }

    pub fn get(&self, path: &str) -> Result<Option<Vec<f32>>> {
        let arena = self.read()?;
        Ok(arena
            .by_path
            .get(path)
            .and_then(|id| arena.entries.get(id))
            .map(|e| e.vector.clone()))
    }

    /// All indexed paths, sorted.
    pub fn paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> =
            self.read()?.by_path.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The `k` entries most similar to `query` by cosine similarity, best
    /// first. Ties are broken by path.
    ///
    /// This is an exhaustive scan parallelized with rayon.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dimension(query, self.dimension)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let arena = self.read()?;
        let mut hits: Vec<SearchHit> = arena
            .entries
            .par_iter()
            .map(|(_, e)| {
                let score = cosine_similarity(query, &e.vector);
                SearchHit::new(e.path.as_str(), score)
            })
            .collect();
        drop(arena);

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

fn encode(path: &str, vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(
        HEADER_SIZE + path.len() + std::mem::size_of_val(vector),
    );
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(path.len() as u32).to_le_bytes());
    bytes.extend_from_slice(path.as_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(vector));
    bytes
}

/// Inverse of [`encode`]. Returns `None` for truncated entries, invalid
/// paths, or a dimension other than `expected_dimension`.
fn decode(
    bytes: &[u8],
    expected_dimension: usize,
) -> Option<(String, Vec<f32>)> {
    let header = bytes.get(..HEADER_SIZE)?;
    let dimension = u32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
    let path_len = u32::from_le_bytes(header[4..8].try_into().ok()?) as usize;
    if dimension != expected_dimension {
        return None;
    }

    let body = &bytes[HEADER_SIZE..];
    if body.len() != path_len + dimension * 4 {
        return None;
    }
    let path = std::str::from_utf8(&body[..path_len]).ok()?.to_string();
    // Values are copied out byte-wise; redb gives no alignment guarantee.
    let vector = body[path_len..]
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some((path, vector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(i: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn upsert_and_search() {
        let idx = VectorIndex::in_memory(3);
        idx.upsert("/x", vec![1.0, 0.0, 0.0]).unwrap();
        idx.upsert("/y", vec![0.0, 1.0, 0.0]).unwrap();
        idx.upsert("/xy", vec![0.7, 0.7, 0.0]).unwrap();

        let hits = idx.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "/x");
        assert_eq!(hits[1].path, "/xy");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn reinserting_path_keeps_id() {
        let idx = VectorIndex::in_memory(2);
        let first = idx.upsert("/a", vec![1.0, 0.0]).unwrap();
        let second = idx.upsert("/a", vec![0.0, 1.0]).unwrap();
        assert_eq!(first, second);
        assert_eq!(idx.len().unwrap(), 1);
        assert_eq!(idx.get("/a").unwrap(), Some(vec![0.0, 1.0]));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let idx = VectorIndex::in_memory(3);
        assert!(idx.upsert("/a", vec![1.0]).is_err());
        assert!(idx.search(&[1.0], 1).is_err());
        assert!(idx.is_empty().unwrap());
    }

    #[test]
    fn remove_entry() {
        let idx = VectorIndex::in_memory(2);
        idx.upsert("/a", vec![1.0, 0.0]).unwrap();
        assert!(idx.remove("/a").unwrap());
        assert!(!idx.remove("/a").unwrap());
        assert!(idx.get("/a").unwrap().is_none());
        assert!(idx.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_entries_and_never_reuses_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");

        let removed_id = {
            let idx = VectorIndex::open(&path, 4).unwrap();
            idx.upsert("/keep", unit(0, 4)).unwrap();
            let id = idx.upsert("/drop", unit(1, 4)).unwrap();
            idx.remove("/drop").unwrap();
            id
        };

        let idx = VectorIndex::open(&path, 4).unwrap();
        assert_eq!(idx.paths().unwrap(), vec!["/keep".to_string()]);
        assert_eq!(idx.get("/keep").unwrap(), Some(unit(0, 4)));

        let fresh = idx.upsert("/new", unit(2, 4)).unwrap();
        assert!(fresh > removed_id);
    }

    #[test]
    fn reopen_with_other_dimension_drops_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");
        let old_id = {
            let idx = VectorIndex::open(&path, 4).unwrap();
            idx.upsert("/a", unit(0, 4)).unwrap()
        };

        {
            let idx = VectorIndex::open(&path, 8).unwrap();
            assert!(idx.is_empty().unwrap());
        }

        // The mismatched row was deleted, not just hidden.
        let idx = VectorIndex::open(&path, 4).unwrap();
        assert!(idx.is_empty().unwrap());
        assert!(idx.upsert("/a", unit(1, 4)).unwrap() > old_id);
    }

    #[test]
    fn decode_rejects_truncated_entry() {
        let bytes = encode("/a", &[1.0, 2.0]);
        assert_eq!(
            decode(&bytes, 2),
            Some(("/a".to_string(), vec![1.0, 2.0]))
        );
        assert_eq!(decode(&bytes[..bytes.len() - 1], 2), None);
        assert_eq!(decode(&bytes[..4], 2), None);
    }
}
