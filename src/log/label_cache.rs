use ahash::AHashMap as HashMap;

/// Memoized label-flow decisions (`from` may flow to `to`).
///
/// A transaction starts from a copy of its parent's cache. Decisions made
/// inside a transaction only become visible to the parent, and finally to the
/// worker-wide cache, when the transaction commits.
#[derive(Debug, Clone, Default)]
pub struct LabelCache {
    decisions: HashMap<(String, String), bool>,
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, from: &str, to: &str) -> Option<bool> {
        self.decisions
            .get(&(from.to_string(), to.to_string()))
            .copied()
    }

    pub fn record(&mut self, from: impl Into<String>, to: impl Into<String>, allowed: bool) {
        self.decisions.insert((from.into(), to.into()), allowed);
    }

    pub fn merge(&mut self, other: LabelCache) {
        self.decisions.extend(other.decisions);
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}
