use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of process-unique serial numbers for transaction ids.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct TidNode {
    top_tid: u64,
    serial: u64,
    depth: u32,
    parent: Option<TransactionId>,
}

/// Hierarchical identifier of a (sub)transaction.
///
/// A top-level transaction has depth 0 and no parent; every nested transaction
/// points at its parent and sits exactly one level deeper. Two ids are equal only
/// if they name the same (sub)transaction: sequential siblings at the same depth
/// get distinct serials, so a stale stamp left by a finished sibling never matches
/// a later one.
#[derive(Clone)]
pub struct TransactionId(Arc<TidNode>);

impl TransactionId {
    /// Creates the id of a new top-level transaction.
    pub fn new_top_level() -> Self {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::SeqCst);
        Self(Arc::new(TidNode {
            top_tid: serial,
            serial,
            depth: 0,
            parent: None,
        }))
    }

    /// Creates the id of a new child of `self`.
    pub fn child(&self) -> Self {
        Self(Arc::new(TidNode {
            top_tid: self.0.top_tid,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::SeqCst),
            depth: self.0.depth + 1,
            parent: Some(self.clone()),
        }))
    }

    pub fn parent(&self) -> Option<&TransactionId> {
        self.0.parent.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.0.depth
    }

    /// Identity of the top-level transaction this id belongs to.
    pub fn top_tid(&self) -> u64 {
        self.0.top_tid
    }

    pub fn is_top_level(&self) -> bool {
        self.0.parent.is_none()
    }

    /// Returns `true` if `self` equals `other` or is nested (transitively) inside it.
    pub fn is_descendant_of(&self, other: &TransactionId) -> bool {
        if self.0.top_tid != other.0.top_tid || self.0.depth < other.0.depth {
            return false;
        }
        let mut cursor = self;
        while cursor.0.depth > other.0.depth {
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
        cursor == other
    }

    /// Returns `true` if `self` equals `other` or encloses it.
    pub fn is_ancestor_of(&self, other: &TransactionId) -> bool {
        other.is_descendant_of(self)
    }

    /// The deepest id that both `self` and `other` descend from, if they share a
    /// top-level transaction.
    pub fn lowest_common_ancestor(&self, other: &TransactionId) -> Option<TransactionId> {
        if self.0.top_tid != other.0.top_tid {
            return None;
        }
        let mut a = self;
        let mut b = other;
        while a.0.depth > b.0.depth {
            a = a.parent()?;
        }
        while b.0.depth > a.0.depth {
            b = b.parent()?;
        }
        while a != b {
            a = a.parent()?;
            b = b.parent()?;
        }
        Some(a.clone())
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.0.serial == other.0.serial
    }
}

impl Eq for TransactionId {}

impl Hash for TransactionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.serial.hash(state);
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.0.top_tid, self.0.depth)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({:x}:{}#{})", self.0.top_tid, self.0.depth, self.0.serial)
    }
}
