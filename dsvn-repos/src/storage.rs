//! Storage abstraction layer
//!
//! A [`Storage`] keeps published revisions, the repository UUID and the lock
//! table. Revision numbers are handed out by an atomic reserve step so that
//! at most one commit can be publishing at a time; a reservation is either
//! written or released.
//!
//! Two backends are provided: [`MemoryStore`] for in-process repositories
//! and tests, and [`SledStore`], which keeps every revision as a
//! zstd-compressed bincode record in sled with an LRU cache of decoded
//! revisions in front of it.

use crate::error::{ReposError, Result};
use crate::path;
use crate::props::{PropertySet, format_svn_date, svn_props};
use crate::tree::{ChangedPath, Tree};
use crate::types::Revnum;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// An immutable published revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub rev: Revnum,
    pub root: Tree,
    pub props: PropertySet,
    /// Folded changed paths, sorted by path
    pub changes: Vec<ChangedPath>,
}

impl Revision {
    /// Revision 0: an empty root directory and a date
    pub fn initial() -> Self {
        let mut props = PropertySet::new();
        props.set(svn_props::REVISION_DATE, format_svn_date(&chrono::Utc::now()));
        Self {
            rev: 0,
            root: Tree::empty(0),
            props,
            changes: Vec::new(),
        }
    }
}

/// A path lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub created: chrono::DateTime<chrono::Utc>,
}

/// Backend for published revisions, repository identity and locks
pub trait Storage: Send + Sync {
    fn uuid(&self) -> Result<String>;

    fn set_uuid(&self, uuid: &str) -> Result<()>;

    fn youngest(&self) -> Result<Revnum>;

    fn read_revision(&self, rev: Revnum) -> Result<Arc<Revision>>;

    /// Reserve the next revision number. Fails while another reservation is
    /// outstanding.
    fn allocate_next_revision(&self) -> Result<Revnum>;

    /// Publish the reserved revision and make it the youngest.
    fn write_revision(&self, revision: Revision) -> Result<()>;

    /// Drop a reservation without publishing.
    fn release_revision(&self, rev: Revnum);

    /// Replace the properties of a published revision.
    fn set_revision_props(&self, rev: Revnum, props: PropertySet) -> Result<()>;

    fn get_lock(&self, path: &str) -> Result<Option<Lock>>;

    fn put_lock(&self, lock: Lock) -> Result<()>;

    fn remove_lock(&self, path: &str) -> Result<()>;

    /// Locks on `path` and everything beneath it
    fn locks_under(&self, path: &str) -> Result<Vec<Lock>>;
}

fn poisoned<T>(_: T) -> ReposError {
    ReposError::Storage("storage lock poisoned".to_string())
}

fn check_reservation(reserved: Option<Revnum>, youngest: Revnum, rev: Revnum) -> Result<()> {
    if reserved != Some(rev) || rev != youngest + 1 {
        return Err(ReposError::Storage(format!(
            "r{} was not reserved (youngest r{}, reserved {:?})",
            rev, youngest, reserved
        )));
    }
    Ok(())
}

struct MemoryInner {
    uuid: String,
    revisions: Vec<Arc<Revision>>,
    reserved: Option<Revnum>,
    locks: BTreeMap<String, Lock>,
}

/// In-process storage
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                uuid: uuid::Uuid::new_v4().to_string(),
                revisions: vec![Arc::new(Revision::initial())],
                reserved: None,
                locks: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn uuid(&self) -> Result<String> {
        Ok(self.inner.read().map_err(poisoned)?.uuid.clone())
    }

    fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.inner.write().map_err(poisoned)?.uuid = uuid.to_string();
        Ok(())
    }

    fn youngest(&self) -> Result<Revnum> {
        Ok(self.inner.read().map_err(poisoned)?.revisions.len() as Revnum - 1)
    }

    fn read_revision(&self, rev: Revnum) -> Result<Arc<Revision>> {
        let inner = self.inner.read().map_err(poisoned)?;
        inner
            .revisions
            .get(rev as usize)
            .cloned()
            .ok_or(ReposError::NoSuchRevision(rev))
    }

    fn allocate_next_revision(&self) -> Result<Revnum> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if let Some(rev) = inner.reserved {
            return Err(ReposError::Storage(format!("r{} is already reserved", rev)));
        }
        let next = inner.revisions.len() as Revnum;
        inner.reserved = Some(next);
        Ok(next)
    }

    fn write_revision(&self, revision: Revision) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let youngest = inner.revisions.len() as Revnum - 1;
        check_reservation(inner.reserved, youngest, revision.rev)?;
        inner.revisions.push(Arc::new(revision));
        inner.reserved = None;
        Ok(())
    }

    fn release_revision(&self, rev: Revnum) {
        if let Ok(mut inner) = self.inner.write() {
            if inner.reserved == Some(rev) {
                inner.reserved = None;
            }
        }
    }

    fn set_revision_props(&self, rev: Revnum, props: PropertySet) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let slot = inner
            .revisions
            .get_mut(rev as usize)
            .ok_or(ReposError::NoSuchRevision(rev))?;
        let mut revision = Revision::clone(slot);
        revision.props = props;
        *slot = Arc::new(revision);
        Ok(())
    }

    fn get_lock(&self, path: &str) -> Result<Option<Lock>> {
        Ok(self.inner.read().map_err(poisoned)?.locks.get(path).cloned())
    }

    fn put_lock(&self, lock: Lock) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.locks.insert(lock.path.clone(), lock);
        Ok(())
    }

    fn remove_lock(&self, path: &str) -> Result<()> {
        self.inner.write().map_err(poisoned)?.locks.remove(path);
        Ok(())
    }

    fn locks_under(&self, at: &str) -> Result<Vec<Lock>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .locks
            .values()
            .filter(|l| path::is_ancestor(at, &l.path))
            .cloned()
            .collect())
    }
}

const KEY_UUID: &[u8] = b"meta/uuid";
const KEY_YOUNGEST: &[u8] = b"meta/youngest";
const REV_PREFIX: &[u8] = b"rev/";
const ZSTD_LEVEL: i32 = 3;

fn rev_key(rev: Revnum) -> Vec<u8> {
    let mut key = REV_PREFIX.to_vec();
    key.extend_from_slice(&rev.to_be_bytes());
    key
}

/// Sled-backed storage
///
/// Layout of the default tree:
///
/// ```text
/// meta/uuid         repository UUID
/// meta/youngest     u64 big-endian
/// rev/<u64 BE>      zstd(bincode(Revision))
/// ```
///
/// Locks live in a separate `locks` tree keyed by path. A revision and the
/// new youngest number are written in one batch.
pub struct SledStore {
    db: sled::Db,
    locks: sled::Tree,
    cache: Mutex<LruCache<Revnum, Arc<Revision>>>,
    reserved: Mutex<Option<Revnum>>,
}

impl SledStore {
    /// Open or create a store; a new store gets revision 0 and a fresh UUID.
    pub fn open<P: AsRef<Path>>(path: P, cache_size: usize) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let locks = db.open_tree("locks")?;
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let store = Self {
            db,
            locks,
            cache: Mutex::new(LruCache::new(capacity)),
            reserved: Mutex::new(None),
        };

        if store.db.get(KEY_YOUNGEST)?.is_none() {
            let mut batch = sled::Batch::default();
            batch.insert(KEY_UUID, uuid::Uuid::new_v4().to_string().as_bytes());
            batch.insert(rev_key(0), Self::encode(&Revision::initial())?);
            batch.insert(KEY_YOUNGEST, &0u64.to_be_bytes()[..]);
            store.db.apply_batch(batch)?;
            store.db.flush()?;
            tracing::info!("Created sled repository store at {}", path.as_ref().display());
        }
        Ok(store)
    }

    fn encode(revision: &Revision) -> Result<Vec<u8>> {
        let raw = bincode::serialize(revision)?;
        Ok(zstd::stream::encode_all(&raw[..], ZSTD_LEVEL)?)
    }

    fn decode(data: &[u8]) -> Result<Revision> {
        let raw = zstd::stream::decode_all(data)?;
        Ok(bincode::deserialize(&raw)?)
    }

    fn stored_youngest(&self) -> Result<Revnum> {
        let value = self
            .db
            .get(KEY_YOUNGEST)?
            .ok_or_else(|| ReposError::Storage("missing youngest revision".to_string()))?;
        let bytes: [u8; 8] = value
            .as_ref()
            .try_into()
            .map_err(|_| ReposError::Storage("corrupt youngest revision".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl Storage for SledStore {
    fn uuid(&self) -> Result<String> {
        let value = self
            .db
            .get(KEY_UUID)?
            .ok_or_else(|| ReposError::Storage("missing repository uuid".to_string()))?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.db.insert(KEY_UUID, uuid.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn youngest(&self) -> Result<Revnum> {
        self.stored_youngest()
    }

    fn read_revision(&self, rev: Revnum) -> Result<Arc<Revision>> {
        if let Some(hit) = self.cache.lock().map_err(poisoned)?.get(&rev) {
            return Ok(hit.clone());
        }
        let data = self.db.get(rev_key(rev))?.ok_or(ReposError::NoSuchRevision(rev))?;
        let revision = Arc::new(Self::decode(&data)?);
        self.cache.lock().map_err(poisoned)?.put(rev, revision.clone());
        Ok(revision)
    }

    fn allocate_next_revision(&self) -> Result<Revnum> {
        let mut reserved = self.reserved.lock().map_err(poisoned)?;
        if let Some(rev) = *reserved {
            return Err(ReposError::Storage(format!("r{} is already reserved", rev)));
        }
        let next = self.stored_youngest()? + 1;
        *reserved = Some(next);
        Ok(next)
    }

    fn write_revision(&self, revision: Revision) -> Result<()> {
        let mut reserved = self.reserved.lock().map_err(poisoned)?;
        let rev = revision.rev;
        check_reservation(*reserved, self.stored_youngest()?, rev)?;

        let mut batch = sled::Batch::default();
        batch.insert(rev_key(rev), Self::encode(&revision)?);
        batch.insert(KEY_YOUNGEST, &rev.to_be_bytes()[..]);
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        self.cache.lock().map_err(poisoned)?.put(rev, Arc::new(revision));
        *reserved = None;
        tracing::debug!("Stored r{}", rev);
        Ok(())
    }

    fn release_revision(&self, rev: Revnum) {
        if let Ok(mut reserved) = self.reserved.lock() {
            if *reserved == Some(rev) {
                *reserved = None;
            }
        }
    }

    fn set_revision_props(&self, rev: Revnum, props: PropertySet) -> Result<()> {
        let mut revision = Revision::clone(&*self.read_revision(rev)?);
        revision.props = props;
        self.db.insert(rev_key(rev), Self::encode(&revision)?)?;
        self.db.flush()?;
        self.cache.lock().map_err(poisoned)?.put(rev, Arc::new(revision));
        Ok(())
    }

    fn get_lock(&self, path: &str) -> Result<Option<Lock>> {
        match self.locks.get(path.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn put_lock(&self, lock: Lock) -> Result<()> {
        self.locks.insert(lock.path.as_bytes(), bincode::serialize(&lock)?)?;
        self.locks.flush()?;
        Ok(())
    }

    fn remove_lock(&self, path: &str) -> Result<()> {
        self.locks.remove(path.as_bytes())?;
        self.locks.flush()?;
        Ok(())
    }

    fn locks_under(&self, at: &str) -> Result<Vec<Lock>> {
        let mut out = Vec::new();
        for item in self.locks.scan_prefix(at.as_bytes()) {
            let (_, data) = item?;
            let lock: Lock = bincode::deserialize(&data)?;
            if path::is_ancestor(at, &lock.path) {
                out.push(lock);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn next_revision(store: &dyn Storage) -> Revision {
        let rev = store.allocate_next_revision().unwrap();
        let mut props = PropertySet::new();
        props.set(svn_props::REVISION_LOG, format!("r{}", rev));
        Revision {
            rev,
            root: Tree::empty(rev),
            props,
            changes: Vec::new(),
        }
    }

    fn exercise(store: &dyn Storage) {
        assert_eq!(store.youngest().unwrap(), 0);
        assert!(store.read_revision(0).unwrap().props.contains(svn_props::REVISION_DATE));
        assert!(matches!(store.read_revision(1), Err(ReposError::NoSuchRevision(1))));

        let r1 = next_revision(store);
        assert!(store.allocate_next_revision().is_err());
        store.write_revision(r1).unwrap();
        assert_eq!(store.youngest().unwrap(), 1);

        let rev = store.allocate_next_revision().unwrap();
        assert_eq!(rev, 2);
        store.release_revision(rev);
        assert_eq!(store.youngest().unwrap(), 1);
        assert_eq!(store.allocate_next_revision().unwrap(), 2);
        store.release_revision(2);

        let mut props = store.read_revision(1).unwrap().props.clone();
        props.set(svn_props::REVISION_LOG, "edited");
        store.set_revision_props(1, props).unwrap();
        assert_eq!(
            store.read_revision(1).unwrap().props.get(svn_props::REVISION_LOG).unwrap(),
            "edited"
        );

        let lock = Lock {
            path: "/a/b.txt".into(),
            token: "opaquelocktoken:1".into(),
            owner: "alice".into(),
            comment: None,
            created: chrono::Utc::now(),
        };
        store.put_lock(lock.clone()).unwrap();
        assert_eq!(store.get_lock("/a/b.txt").unwrap(), Some(lock));
        assert_eq!(store.locks_under("/a").unwrap().len(), 1);
        assert!(store.locks_under("/ab").unwrap().is_empty());
        store.remove_lock("/a/b.txt").unwrap();
        assert!(store.get_lock("/a/b.txt").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store() {
        let tmp = TempDir::new().unwrap();
        exercise(&SledStore::open(tmp.path().join("db"), 4).unwrap());
    }

    #[test]
    fn test_write_without_reservation_fails() {
        let store = MemoryStore::new();
        let revision = Revision {
            rev: 1,
            root: Tree::empty(1),
            props: PropertySet::new(),
            changes: Vec::new(),
        };
        assert!(store.write_revision(revision).is_err());
    }

    #[test]
    fn test_sled_store_reopen() {
        let tmp = TempDir::new().unwrap();
        let uuid;
        {
            let store = SledStore::open(tmp.path().join("db"), 2).unwrap();
            uuid = store.uuid().unwrap();
            let r1 = next_revision(&store);
            store.write_revision(r1).unwrap();
        }
        let store = SledStore::open(tmp.path().join("db"), 2).unwrap();
        assert_eq!(store.uuid().unwrap(), uuid);
        assert_eq!(store.youngest().unwrap(), 1);
        assert_eq!(store.read_revision(1).unwrap().props.get(svn_props::REVISION_LOG).unwrap(), "r1");
    }
}
