//! Bundle export/import (§4.10): publish an AST (or a parked
//! continuation) as content-addressed, self-contained JSON that another
//! process can re-import without sharing entity-id gauges.
//!
//! An exported bundle is a map from content hash to that entity's
//! canonical `av-pairs`, with every reference already resolved to a
//! hash — the same canonical form [`crate::hash`] hashes, just kept
//! instead of discarded after hashing. Import walks the bundle in
//! reference order (every referenced hash before its referrer),
//! allocating a fresh tempid per entity exactly once.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use yin_core::{Attribute, Datom, DatomValue, EntityId, TempidAllocator, VmError, VmErrorKind};

use crate::hash::{canonicalize, CanonEntry, ContentHasher};
use crate::project::DatomIndex;

/// One entity's canonical form, plus the set of hashes it refers to — the
/// latter drives import's topological order without re-deriving it from
/// `av_pairs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub av_pairs: std::collections::BTreeMap<String, CanonEntry>,
    pub refs: Vec<String>,
}

/// A self-contained, content-addressed export of an AST (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub bundle: HashMap<String, BundleEntry>,
    pub root_hash: String,
}

fn refs_of(entry: &std::collections::BTreeMap<String, CanonEntry>) -> Vec<String> {
    let mut refs = Vec::new();
    for v in entry.values() {
        match v {
            CanonEntry::Hash(h) => refs.push(h.clone()),
            CanonEntry::HashList(hs) => refs.extend(hs.iter().cloned()),
            CanonEntry::Scalar(_) => {}
        }
    }
    refs
}

/// Export every entity `idx` describes as a content-addressed bundle.
pub fn export_ast(idx: &DatomIndex, hasher: &dyn ContentHasher) -> Result<Bundle, VmError> {
    let hashes = crate::hash::content_hashes(idx, hasher)?;
    let root = idx
        .find_root()
        .ok_or_else(|| VmError::new(VmErrorKind::MalformedProgram, "no root entity to export"))?;
    let root_hash = hashes
        .get(&root)
        .cloned()
        .ok_or_else(|| VmError::new(VmErrorKind::MalformedProgram, "root has no content hash"))?;

    let mut bundle = HashMap::with_capacity(hashes.len());
    for e in idx.entities() {
        let av_pairs = canonicalize(e, idx, &hashes)?;
        let refs = refs_of(&av_pairs);
        let hash = hashes.get(&e).cloned().ok_or_else(|| {
            VmError::new(VmErrorKind::MalformedProgram, "entity missing from hash table").with_entity(e)
        })?;
        bundle.insert(hash, BundleEntry { av_pairs, refs });
    }
    Ok(Bundle { bundle, root_hash })
}

fn datom_value_of(entry: &CanonEntry, resolved: &HashMap<String, EntityId>) -> Result<DatomValue, VmError> {
    let lookup = |h: &str| {
        resolved.get(h).copied().ok_or_else(|| {
            VmError::new(VmErrorKind::MalformedProgram, format!("bundle refers to unresolved hash {h}"))
        })
    };
    Ok(match entry {
        CanonEntry::Scalar(s) => DatomValue::Scalar(s.clone()),
        CanonEntry::Hash(h) => DatomValue::Ref(lookup(h)?),
        CanonEntry::HashList(hs) => {
            let mut out = Vec::with_capacity(hs.len());
            for h in hs {
                out.push(lookup(h)?);
            }
            DatomValue::RefList(out)
        }
    })
}

/// Import `bundle`, allocating fresh tempids from `alloc` for every entity
/// not already present in `known` (a caller-supplied map of previously
/// imported hashes, for importing several related bundles into one
/// datom set without re-creating shared subtrees).
///
/// Entities are created in an order where every hash an entity refers to
/// is already resolved before it — the reference graph's topological
/// order, derived from `refs` rather than re-walked through `av_pairs`.
/// A bundle whose reference graph has no such order is rejected with
/// [`VmErrorKind::CyclicDependencyInBundle`].
pub fn import_ast(
    bundle: &Bundle,
    alloc: &mut TempidAllocator,
    known: &HashMap<String, EntityId>,
    t: i64,
) -> Result<(Vec<Datom>, EntityId, HashMap<String, EntityId>), VmError> {
    let mut resolved = known.clone();
    let mut datoms = Vec::new();
    let mut remaining: HashSet<&String> =
        bundle.bundle.keys().filter(|h| !resolved.contains_key(*h)).collect();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|h| {
                bundle.bundle[*h].refs.iter().all(|r| resolved.contains_key(r))
            })
            .map(|h| (*h).clone())
            .collect();
        if ready.is_empty() {
            return Err(VmError::new(
                VmErrorKind::CyclicDependencyInBundle,
                "bundle reference graph has a cycle or a dangling reference",
            ));
        }
        // Stable order among this round's ready entries so import is
        // deterministic given a deterministic `BTreeMap` iteration.
        let mut ready = ready;
        ready.sort();
        for hash in ready {
            let entry = &bundle.bundle[&hash];
            let id = alloc.fresh();
            for (attr_kw, value) in &entry.av_pairs {
                let attr = Attribute::from_keyword(attr_kw).ok_or_else(|| {
                    VmError::new(VmErrorKind::MalformedProgram, format!("unknown attribute {attr_kw}"))
                })?;
                datoms.push(Datom::new(id, attr, datom_value_of(value, &resolved)?, t));
            }
            resolved.insert(hash.clone(), id);
            remaining.remove(&hash);
        }
    }

    let root = resolved.get(&bundle.root_hash).copied().ok_or_else(|| {
        VmError::new(VmErrorKind::MalformedProgram, "bundle root hash not present in bundle")
    })?;
    Ok((datoms, root, resolved))
}

/// A value as it appears inside an exported continuation's frames/env
/// (§4.10): structurally like [`yin_core::Value`], except a closure's
/// body is replaced by the content hash of the AST entity it points to,
/// so the whole bundle is meaningful without the exporting process's
/// entity-id gauge. Only [`yin_core::Body::Node`] closures — the
/// tree-walking and datom-graph backends — can be exported this way; a
/// closure over a bytecode address has no content hash to export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExportedValue {
    Nil,
    Scalar(yin_core::Scalar),
    StreamRef { id: u64 },
    CursorRef { stream: u64, position: usize },
    Closure {
        params: Vec<String>,
        body_hash: String,
        env: std::collections::BTreeMap<String, ExportedValue>,
    },
}

/// Export a single [`yin_core::Value`], resolving any closure's body
/// entity to its content hash via `hash_of`. Fails with
/// [`VmErrorKind::UnknownClosureBodyHash`] if a captured closure's body
/// isn't a node reference, or `hash_of` doesn't know its hash.
pub fn export_value(
    value: &yin_core::Value,
    hash_of: &impl Fn(EntityId) -> Option<String>,
) -> Result<ExportedValue, VmError> {
    use yin_core::{Body, Value};
    Ok(match value {
        Value::Nil => ExportedValue::Nil,
        Value::Scalar(s) => ExportedValue::Scalar(s.clone()),
        Value::StreamRef(id) => ExportedValue::StreamRef { id: id.0 },
        Value::CursorRef(c) => ExportedValue::CursorRef { stream: c.stream.0, position: c.position },
        Value::Closure(c) => {
            let Body::Node(entity) = c.body else {
                return Err(VmError::new(
                    VmErrorKind::UnknownClosureBodyHash,
                    "closure body is a bytecode address, not an exportable entity",
                ));
            };
            let body_hash = hash_of(entity).ok_or_else(|| {
                VmError::new(VmErrorKind::UnknownClosureBodyHash, "no content hash for closure body")
                    .with_entity(entity)
            })?;
            let mut env = std::collections::BTreeMap::new();
            export_env_bindings(c.env.as_ref(), &mut env, hash_of)?;
            ExportedValue::Closure { params: c.params.clone(), body_hash, env }
        }
        Value::Continuation(_) | Value::Parked(_) | Value::Primitive(_) => {
            return Err(VmError::new(
                VmErrorKind::UnknownClosureBodyHash,
                format!("{} has no transportable representation", value.type_tag()),
            ));
        }
    })
}

fn export_env_bindings(
    env: &yin_core::Env,
    out: &mut std::collections::BTreeMap<String, ExportedValue>,
    hash_of: &impl Fn(EntityId) -> Option<String>,
) -> Result<(), VmError> {
    for (name, v) in env.own_bindings() {
        out.entry(name.clone()).or_insert(export_value(v, hash_of)?);
    }
    if let Some(parent) = env.parent_ref() {
        export_env_bindings(parent, out, hash_of)?;
    }
    Ok(())
}

/// Flatten an environment's whole parent chain into one hash-addressed
/// map (child bindings shadow parent ones, matching lookup order), for a
/// continuation export that needs each frame's captured environment
/// alongside the frame itself (§4.10 "export continuation"). Exposed
/// publicly so a backend's own frame-stack exporter can reuse it rather
/// than re-walk the parent chain.
pub fn export_env(
    env: &yin_core::Env,
    hash_of: &impl Fn(EntityId) -> Option<String>,
) -> Result<std::collections::BTreeMap<String, ExportedValue>, VmError> {
    let mut out = std::collections::BTreeMap::new();
    export_env_bindings(env, &mut out, hash_of)?;
    Ok(out)
}

/// Inverse of [`export_env`]: rebuild a flat (single-frame) environment
/// from its exported bindings.
pub fn import_env(
    env: &std::collections::BTreeMap<String, ExportedValue>,
    body_of: &impl Fn(&str) -> Option<EntityId>,
) -> Result<std::rc::Rc<yin_core::Env>, VmError> {
    let mut bindings = HashMap::new();
    for (name, v) in env {
        bindings.insert(name.clone(), import_value(v, body_of)?);
    }
    Ok(yin_core::Env::extend(&yin_core::Env::empty(), bindings))
}

/// Import a single [`ExportedValue`] back into a live [`yin_core::Value`].
/// `body_of` resolves a previously-imported closure body's content hash
/// to the local entity id import gave it (typically the `resolved` map
/// [`import_ast`] returns).
pub fn import_value(
    value: &ExportedValue,
    body_of: &impl Fn(&str) -> Option<EntityId>,
) -> Result<yin_core::Value, VmError> {
    use yin_core::{Body, Closure, Env, Value};
    Ok(match value {
        ExportedValue::Nil => Value::Nil,
        ExportedValue::Scalar(s) => Value::Scalar(s.clone()),
        ExportedValue::StreamRef { id } => Value::StreamRef(yin_core::StreamId(*id)),
        ExportedValue::CursorRef { stream, position } => {
            Value::CursorRef(yin_core::CursorRef::new(yin_core::StreamId(*stream)).seek(*position))
        }
        ExportedValue::Closure { params, body_hash, env } => {
            let entity = body_of(body_hash).ok_or_else(|| {
                VmError::new(
                    VmErrorKind::UnknownClosureBodyHash,
                    format!("no imported entity for closure body hash {body_hash}"),
                )
            })?;
            let mut bindings = HashMap::new();
            for (name, v) in env {
                bindings.insert(name.clone(), import_value(v, body_of)?);
            }
            Value::Closure(std::rc::Rc::new(Closure {
                params: params.clone(),
                body: Body::Node(entity),
                env: Env::extend(&Env::empty(), bindings),
            }))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Hasher;
    use crate::project::project;
    use yin_core::{AstNode, Scalar};

    #[test]
    fn round_trips_through_bundle_with_a_fresh_gauge() {
        let ast = AstNode::If {
            test: Box::new(AstNode::Literal { value: Scalar::Bool(true) }),
            consequent: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
            alternate: Box::new(AstNode::Literal { value: Scalar::Int(0) }),
        };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let bundle = export_ast(&idx, &Sha256Hasher).unwrap();

        let mut alloc = TempidAllocator::new();
        let (datoms, root, resolved) = import_ast(&bundle, &mut alloc, &HashMap::new(), 0).unwrap();
        assert_eq!(resolved.len(), bundle.bundle.len());

        let idx2 = DatomIndex::build(&datoms);
        assert_eq!(idx2.type_name(root), Some("if"));
        let hashes2 = crate::hash::content_hashes(&idx2, &Sha256Hasher).unwrap();
        assert_eq!(hashes2.get(&root), Some(&bundle.root_hash));
    }

    #[test]
    fn known_hashes_are_not_recreated() {
        let ast = AstNode::Literal { value: Scalar::Int(42) };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let bundle = export_ast(&idx, &Sha256Hasher).unwrap();

        let mut alloc = TempidAllocator::new();
        let (datoms1, root1, resolved1) = import_ast(&bundle, &mut alloc, &HashMap::new(), 0).unwrap();
        assert_eq!(datoms1.len(), 2);

        // Re-importing with the same bundle already in `known` creates
        // nothing new.
        let (datoms2, root2, _resolved2) = import_ast(&bundle, &mut alloc, &resolved1, 0).unwrap();
        assert!(datoms2.is_empty());
        assert_eq!(root1, root2);
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let mut bundle_map = HashMap::new();
        let mut pairs = std::collections::BTreeMap::new();
        pairs.insert("yin/type".to_string(), CanonEntry::Scalar(Scalar::Keyword("literal".into())));
        pairs.insert("yin/value".to_string(), CanonEntry::Hash("sha256:does-not-exist".into()));
        bundle_map.insert(
            "sha256:root".to_string(),
            BundleEntry { av_pairs: pairs, refs: vec!["sha256:does-not-exist".into()] },
        );
        let bundle = Bundle { bundle: bundle_map, root_hash: "sha256:root".into() };

        let mut alloc = TempidAllocator::new();
        let err = import_ast(&bundle, &mut alloc, &HashMap::new(), 0).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::CyclicDependencyInBundle);
    }
}
