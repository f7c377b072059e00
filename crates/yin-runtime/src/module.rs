//! The module/effect layer (§4.11) and the four-tier variable resolution
//! chain every VM backend must use (§3, §4.4, §4.5, §4.6).

use std::collections::HashMap;

use yin_core::{Env, PrimitiveOutcome, Value, VmError, VmErrorKind};

use crate::builtins;
use crate::store::Store;

/// A primitive is a plain function — primitives run to completion
/// (§5, "Suspension points ... no other operation may suspend").
pub type Primitive = fn(&[Value]) -> Result<PrimitiveOutcome, VmError>;

/// Process-wide in spirit, but modeled as an explicit context struct a
/// caller constructs and passes to the VM (§9, "Global registries ...
/// model as explicit context structs") — so unit tests can build
/// isolated registries instead of mutating a global.
#[derive(Default)]
pub struct ModuleRegistry {
    /// The unnamespaced core primitive tier (arithmetic, comparison, ...).
    primitives: HashMap<String, Primitive>,
    /// Namespaced modules, e.g. `stream` -> `{ "put!": ... }`.
    modules: HashMap<String, HashMap<String, Primitive>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    /// A registry pre-populated with the built-in arithmetic/comparison/
    /// boolean primitive tier (§2 "Primitives & value tags").
    pub fn with_core_primitives() -> Self {
        let mut reg = ModuleRegistry::new();
        reg.register_primitive("+", builtins::add);
        reg.register_primitive("-", builtins::sub);
        reg.register_primitive("*", builtins::mul);
        reg.register_primitive("/", builtins::div);
        reg.register_primitive("<", builtins::lt);
        reg.register_primitive(">", builtins::gt);
        reg.register_primitive("<=", builtins::lte);
        reg.register_primitive(">=", builtins::gte);
        reg.register_primitive("=", builtins::eq);
        reg.register_primitive("!=", builtins::neq);
        reg.register_primitive("and", builtins::and);
        reg.register_primitive("or", builtins::or);
        reg.register_primitive("not", builtins::not);
        reg.register_primitive("str-concat", builtins::str_concat);
        reg.register_module("vm", "store-put!", builtins::store_put);
        reg
    }

    pub fn register_primitive(&mut self, name: impl Into<String>, f: Primitive) {
        self.primitives.insert(name.into(), f);
    }

    pub fn register_module(&mut self, module: impl Into<String>, member: impl Into<String>, f: Primitive) {
        self.modules.entry(module.into()).or_default().insert(member.into(), f);
    }

    /// Namespaced symbols (`module/member`) resolve by looking up the
    /// module, then the member (§4.11).
    fn lookup_module_member(&self, name: &str) -> Option<Primitive> {
        let (module, member) = name.split_once('/')?;
        self.modules.get(module)?.get(member).copied()
    }

    pub fn has_primitive(&self, name: &str) -> bool {
        self.primitives.contains_key(name) || self.lookup_module_member(name).is_some()
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
        if let Some(f) = self.primitives.get(name) {
            return f(args);
        }
        if let Some(f) = self.lookup_module_member(name) {
            return f(args);
        }
        Err(VmError::new(VmErrorKind::MalformedProgram, format!("unknown primitive `{name}`")))
    }
}

/// The four-tier variable resolution chain (§3, §4.5, §4.6): local env,
/// then global store, then the core primitive tier, then registered
/// modules. Every tier uses membership-based lookup so a binding to
/// `false`/`nil` is found rather than treated as absent (§9).
///
/// Returns `None` only when every tier misses — the caller (not this
/// function) decides whether that's a resolution-miss `nil` or an error
/// (§4.13: "resolves to nil for get-style paths").
pub fn resolve(name: &str, env: &Env, store: &Store, registry: &ModuleRegistry) -> Option<Value> {
    if let Some(v) = env.get(name) {
        return Some(v.clone());
    }
    if let Some(v) = store.get(name) {
        return Some(v.clone());
    }
    if registry.has_primitive(name) {
        return Some(Value::Primitive(name.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::rc::Rc;

    #[test]
    fn env_tier_wins_over_store_and_primitives() {
        let registry = ModuleRegistry::with_core_primitives();
        let mut store = Store::new();
        store.put("+".into(), Value::string("shadowed-in-store"));

        let mut bindings = StdHashMap::new();
        bindings.insert("+".to_string(), Value::string("shadowed-in-env"));
        let env = Env::extend(&Env::empty(), bindings);

        assert_eq!(resolve("+", &env, &store, &registry), Some(Value::string("shadowed-in-env")));
    }

    #[test]
    fn store_tier_wins_over_primitives() {
        let registry = ModuleRegistry::with_core_primitives();
        let mut store = Store::new();
        store.put("+".into(), Value::int(99));
        let env = Env::empty();
        assert_eq!(resolve("+", &env, &store, &registry), Some(Value::int(99)));
    }

    #[test]
    fn falls_through_to_primitive_tier() {
        let registry = ModuleRegistry::with_core_primitives();
        let store = Store::new();
        let env = Env::empty();
        assert_eq!(resolve("+", &env, &store, &registry), Some(Value::Primitive("+".into())));
    }

    #[test]
    fn namespaced_module_member_resolves() {
        let registry = ModuleRegistry::with_core_primitives();
        let store = Store::new();
        let env = Env::empty();
        assert_eq!(
            resolve("vm/store-put!", &env, &store, &registry),
            Some(Value::Primitive("vm/store-put!".into()))
        );
    }

    #[test]
    fn unresolved_falls_through_every_tier() {
        let registry = ModuleRegistry::with_core_primitives();
        let store = Store::new();
        let env = Env::empty();
        assert_eq!(resolve("no-such-binding", &env, &store, &registry), None);
    }

    #[test]
    fn falsy_env_binding_beats_primitive_fallthrough() {
        let registry = ModuleRegistry::with_core_primitives();
        let store = Store::new();
        let mut bindings = StdHashMap::new();
        bindings.insert("x".to_string(), Value::bool(false));
        let env = Env::extend(&Env::empty(), bindings);
        assert_eq!(resolve("x", &env, &store, &registry), Some(Value::bool(false)));
        let _ = Rc::strong_count(&env);
    }
}
