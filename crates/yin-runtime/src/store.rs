//! The global store (§3): a process-wide mapping from key to value,
//! mutated only by applying a `vm/store-put` effect (§4.11).

use std::collections::HashMap;

use yin_core::Value;

#[derive(Debug, Clone, Default)]
pub struct Store {
    bindings: HashMap<String, Value>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Membership-based lookup — a binding to `false`/`nil` is a hit, not
    /// a miss (§3, "Resolution must use membership test, not truthiness").
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bindings.contains_key(key)
    }

    pub fn put(&mut self, key: String, value: Value) {
        self.bindings.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsy_store_binding_is_found() {
        let mut store = Store::new();
        store.put("flag".into(), Value::bool(false));
        assert!(store.contains("flag"));
        assert_eq!(store.get("flag"), Some(&Value::bool(false)));
        assert_eq!(store.get("missing"), None);
    }
}
