use ahash::AHashMap as HashMap;

use crate::data_store::object::Oid;

/// Which worker currently owns each object a transaction touched.
///
/// A child log starts from a copy of its parent's map and hands its entries
/// back when it commits.
#[derive(Debug, Clone, Default)]
pub struct WriterMap {
    owners: HashMap<Oid, String>,
    version: u64,
}

impl WriterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, oid: &Oid) -> Option<&str> {
        self.owners.get(oid).map(String::as_str)
    }

    pub fn put(&mut self, oid: Oid, worker: impl Into<String>) {
        self.owners.insert(oid, worker.into());
        self.version += 1;
    }

    pub fn remove(&mut self, oid: &Oid) {
        if self.owners.remove(oid).is_some() {
            self.version += 1;
        }
    }

    /// Bumped on every change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Takes over a committed child's map. The child started from a copy of
    /// this one, so its view is the newer one.
    pub(crate) fn merge_from(&mut self, child: WriterMap) {
        if child.version != self.version {
            self.owners = child.owners;
            self.version = self.version.max(child.version) + 1;
        }
    }
}
