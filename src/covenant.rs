use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

use crate::config::CovenantConfig;
use crate::data_store::object::{DistObject, ObjectImage, Oid};
use crate::data_store::object_cache::ObjectCache;
use crate::data_store::read_map::ReadMap;
use crate::deadlock::DeadlockDetector;
use crate::errors::{CovenantError, Result};
use crate::log::{LabelCache, Log, RetryCause};
use crate::manager::TransactionManager;
use crate::storage::LocalStore;
use crate::tid::TransactionId;
use crate::twopc::{RemoteWorker, Store};

/// Hook told about the first write to an object inside a transaction, so that
/// results derived from the object can be invalidated.
pub trait WriteObserver: Send + Sync {
    fn object_written(&self, tid: &TransactionId, oid: &Oid);
}

/// Worker-wide runtime shared by every [`TransactionManager`].
///
/// Holds the configuration, the known stores and remote workers, the object
/// cache, the deadlock detector and the registry of live top-level
/// transactions. Each thread obtains its own manager through
/// [`Covenant::transaction_manager`].
pub struct Covenant {
    config: CovenantConfig,
    stores: RwLock<HashMap<String, Arc<dyn Store>>>,
    workers: RwLock<HashMap<String, Arc<dyn RemoteWorker>>>,
    local_store: Arc<LocalStore>,
    cache: ObjectCache,
    detector: DeadlockDetector,
    transactions: RwLock<HashMap<u64, Weak<Log>>>,
    labels: Mutex<LabelCache>,
    observers: RwLock<Vec<Arc<dyn WriteObserver>>>,
}

impl Covenant {
    /// Creates a new runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Worker name, local store name, lock-wait and backoff settings.
    ///
    /// # Returns
    ///
    /// The shared runtime. The in-process store named by
    /// `config.local_store_name` is registered already.
    pub fn new(config: CovenantConfig) -> Arc<Self> {
        let read_map = Arc::new(ReadMap::new());
        let local_store = Arc::new(LocalStore::new(config.local_store_name.clone()));
        let mut stores: HashMap<String, Arc<dyn Store>> = HashMap::new();
        stores.insert(
            config.local_store_name.clone(),
            local_store.clone() as Arc<dyn Store>,
        );
        let cache = ObjectCache::new(read_map, config.local_store_name.clone());
        Arc::new(Self {
            config,
            stores: RwLock::new(stores),
            workers: RwLock::new(HashMap::new()),
            local_store,
            cache,
            detector: DeadlockDetector::new(),
            transactions: RwLock::new(HashMap::new()),
            labels: Mutex::new(LabelCache::new()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CovenantConfig {
        &self.config
    }

    /// A fresh manager for the calling thread.
    pub fn transaction_manager(self: &Arc<Self>) -> TransactionManager {
        TransactionManager::new(self.clone())
    }

    pub fn add_store(&self, store: Arc<dyn Store>) {
        debug!("Registered store {}", store.name());
        self.stores.write().insert(store.name().to_string(), store);
    }

    pub fn add_worker(&self, worker: Arc<dyn RemoteWorker>) {
        debug!("Registered worker {}", worker.name());
        self.workers.write().insert(worker.name().to_string(), worker);
    }

    pub fn store(&self, name: &str) -> Option<Arc<dyn Store>> {
        self.stores.read().get(name).cloned()
    }

    pub fn worker(&self, name: &str) -> Option<Arc<dyn RemoteWorker>> {
        self.workers.read().get(name).cloned()
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub(crate) fn is_local_store(&self, name: &str) -> bool {
        self.store(name).is_some_and(|store| store.is_local())
    }

    pub fn object_cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn read_map(&self) -> &Arc<ReadMap> {
        self.cache.read_map()
    }

    pub(crate) fn detector(&self) -> &DeadlockDetector {
        &self.detector
    }

    pub fn add_write_observer(&self, observer: Arc<dyn WriteObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn notify_first_write(&self, tid: &TransactionId, oid: &Oid) {
        for observer in self.observers.read().iter() {
            observer.object_written(tid, oid);
        }
    }

    /// Creates a new object on `store` inside the manager's current transaction.
    pub fn new_object(
        &self,
        tm: &mut TransactionManager,
        store: &str,
        payload: Vec<u8>,
    ) -> Result<DistObject> {
        if !tm.in_transaction() {
            return Err(CovenantError::NoActiveTransaction);
        }
        let target = self
            .store(store)
            .ok_or_else(|| CovenantError::Internal(format!("unknown store {}", store)))?;
        let onum = target.new_onum()?;
        let object = self.cache.intern(ObjectImage {
            oid: Oid::new(store, onum),
            version: 0,
            payload,
        });
        tm.register_create(&object)?;
        Ok(object)
    }

    /// Interns an object image fetched from a store, returning the cached
    /// handle if the object is already known.
    pub fn cached_object(&self, image: ObjectImage) -> DistObject {
        self.cache.intern(image)
    }

    /// The live top-level transaction with the given top-level id.
    pub fn lookup_transaction(&self, top_tid: u64) -> Option<Arc<Log>> {
        self.transactions.read().get(&top_tid).and_then(Weak::upgrade)
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions
            .read()
            .values()
            .filter(|log| log.strong_count() > 0)
            .count()
    }

    pub(crate) fn register_transaction(&self, log: &Arc<Log>) {
        self.transactions
            .write()
            .insert(log.tid().top_tid(), Arc::downgrade(log));
    }

    pub(crate) fn unregister_transaction(&self, tid: &TransactionId) {
        self.transactions.write().remove(&tid.top_tid());
    }

    /// Asks the (sub)transaction `tid` to restart, e.g. on behalf of a remote
    /// worker. Returns `false` if no live log on this worker matches.
    pub fn signal_retry(&self, tid: &TransactionId) -> Result<bool> {
        let Some(root) = self.lookup_transaction(tid.top_tid()) else {
            return Ok(false);
        };
        let mut cursor = Some(root);
        while let Some(log) = cursor {
            if tid.is_ancestor_of(log.tid()) {
                log.flag_retry(RetryCause::Requested)?;
                return Ok(true);
            }
            cursor = log.child();
        }
        Ok(false)
    }

    pub fn label_flow(&self, from: &str, to: &str) -> Option<bool> {
        self.labels.lock().lookup(from, to)
    }

    pub(crate) fn record_label_flow(&self, from: &str, to: &str, allowed: bool) {
        self.labels.lock().record(from, to, allowed);
    }

    pub(crate) fn merge_labels(&self, labels: LabelCache) {
        if !labels.is_empty() {
            self.labels.lock().merge(labels);
        }
    }
}
