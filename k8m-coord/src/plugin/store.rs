use super::Status;
use parking_lot::Mutex;
use std::collections::HashMap;

/// The persisted state of a module
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// The module's status when it was last saved.
    pub status: Status,

    /// The module version that was installed.
    pub version: String,
}

/// Persists module state across process restarts
///
/// Implementations are expected to be backed by the platform's database; the
/// manager treats the store as an opaque key/value table keyed by module name
/// and never calls it while holding its registry lock.
pub trait StateStore: Send + Sync + 'static {
    /// Loads the record for the named module, if one was saved.
    fn load(&self, name: &str) -> Option<Record>;

    /// Saves the record for the named module.
    fn save(&self, name: &str, record: Record);

    /// Forgets the named module.
    fn remove(&self, name: &str);
}

/// A [`StateStore`] that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore(Mutex<HashMap<String, Record>>);

// === impl MemoryStore ===

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with pre-existing records
    pub fn with_records(records: impl IntoIterator<Item = (String, Record)>) -> Self {
        Self(Mutex::new(records.into_iter().collect()))
    }
}

impl StateStore for MemoryStore {
    fn load(&self, name: &str) -> Option<Record> {
        self.0.lock().get(name).cloned()
    }

    fn save(&self, name: &str, record: Record) {
        self.0.lock().insert(name.to_string(), record);
    }

    fn remove(&self, name: &str) {
        self.0.lock().remove(name);
    }
}
