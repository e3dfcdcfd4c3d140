//! Per-neuron, per-stimulation context storage.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// An opaque, per-neuron value carried for the lifetime of one stimulation.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Mapping `neuronName -> opaqueValue`, created at stimulation start and
/// mutated only through [`crate::neuron::LocalContext`] from inside that
/// stimulation.
#[derive(Default)]
pub struct ContextStore {
    values: RwLock<HashMap<String, ContextValue>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store from caller-supplied values (the `contextValues`
    /// stimulation option).
    pub fn seeded(values: HashMap<String, ContextValue>) -> Self {
        Self { values: RwLock::new(values) }
    }

    pub fn get(&self, neuron: &str) -> Option<ContextValue> {
        self.values.read().get(neuron).cloned()
    }

    pub fn set(&self, neuron: &str, value: ContextValue) {
        self.values.write().insert(neuron.to_string(), value);
    }

    pub fn delete(&self, neuron: &str) {
        self.values.write().remove(neuron);
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Snapshot every entry — used both for `getAll`/`setAll` style bulk
    /// access and for the `contextSnapshot` field of a [`crate::stimulation::ResponseRecord`].
    pub fn snapshot(&self) -> HashMap<String, ContextValue> {
        self.values.read().clone()
    }

    pub fn set_all(&self, values: HashMap<String, ContextValue>) {
        *self.values.write() = values;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_delete_roundtrip() {
        let store = ContextStore::new();
        assert!(store.get("a").is_none());
        store.set("a", Arc::new(7u32));
        assert_eq!(store.len(), 1);
        let v = store.get("a").unwrap();
        assert_eq!(*v.downcast_ref::<u32>().unwrap(), 7);
        store.delete("a");
        assert!(store.get("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn seeded_store_starts_populated() {
        let mut values = HashMap::new();
        values.insert("n".to_string(), Arc::new(1u32) as ContextValue);
        let store = ContextStore::seeded(values);
        assert_eq!(store.len(), 1);
    }
}
