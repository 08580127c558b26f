use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::data_store::object::{DistObject, ObjectCell, ObjectImage, Oid};
use crate::data_store::read_map::ReadMap;

/// Worker-wide cache of object handles, one per [`Oid`].
///
/// Handles are held weakly; an object nobody references any more is simply
/// fetched again the next time it is needed. Dead handles are swept every
/// `cleanup_threshold` insertions.
pub struct ObjectCache {
    objects: RwLock<HashMap<Oid, Weak<ObjectCell>>>,
    read_map: Arc<ReadMap>,
    local_store: String,
    cleanup_counter: AtomicU64,
    cleanup_threshold: u64,
}

impl ObjectCache {
    pub fn new(read_map: Arc<ReadMap>, local_store: impl Into<String>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            read_map,
            local_store: local_store.into(),
            cleanup_counter: AtomicU64::new(0),
            cleanup_threshold: 1000,
        }
    }

    pub fn read_map(&self) -> &Arc<ReadMap> {
        &self.read_map
    }

    /// Retrieves the cached handle for `oid`, if any.
    pub fn get(&self, oid: &Oid) -> Option<DistObject> {
        self.objects
            .read()
            .get(oid)
            .and_then(Weak::upgrade)
            .map(DistObject::from_cell)
    }

    /// Returns the cached handle for `image.oid`, inserting the image if the
    /// object is not cached yet.
    pub fn intern(&self, image: ObjectImage) -> DistObject {
        if let Some(existing) = self.get(&image.oid) {
            return existing;
        }
        let mut objects = self.objects.write();
        if let Some(cell) = objects.get(&image.oid).and_then(Weak::upgrade) {
            return DistObject::from_cell(cell);
        }
        let entry = self.read_map.get_or_insert(&image.oid, image.version);
        let local = image.oid.store == self.local_store;
        let object = DistObject::new(image.oid.clone(), local, image.payload, entry);
        objects.insert(image.oid, object.downgrade());
        drop(objects);
        self.maybe_trigger_cleanup();
        object
    }

    fn maybe_trigger_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count >= self.cleanup_threshold {
            self.cleanup_counter.store(0, Ordering::Relaxed);
            let mut objects = self.objects.write();
            let initial = objects.len();
            objects.retain(|_, cell| cell.strong_count() > 0);
            let removed = initial - objects.len();
            if removed > 0 {
                debug!("Swept {} dead object-cache entries", removed);
            }
        }
    }

    /// Replaces the cached copy with a newer image reported by a store or
    /// worker. Objects whose write lock is held are left alone; the image is
    /// only applied if it is newer than what the cache has.
    pub fn apply_image(&self, image: &ObjectImage) -> bool {
        let Some(object) = self.get(&image.oid) else {
            return false;
        };
        let mut record = object.lock();
        if record.holder.is_some() || image.version < object.version() {
            return false;
        }
        record.payload = image.payload.clone();
        record.reader = None;
        record.writer = None;
        object.read_entry().set_version(image.version);
        drop(record);
        object.monitor().notify_all();
        debug!(
            "Refreshed cached copy of {} to version {}",
            image.oid, image.version
        );
        true
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .values()
            .filter(|cell| cell.strong_count() > 0)
            .count()
    }

    /// Entries in the table, including dead ones not yet swept.
    pub fn tracked(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
