//! Content addressing (§4.2): a gauge-invariant Merkle hash per entity.
//!
//! Canonicalisation drops derived datoms, merges cardinality-many values
//! into an ordered vector, sorts `(attribute, value)` pairs by attribute,
//! and replaces every reference with the content hash of the referenced
//! entity — computed bottom-up over a topological (leaves-first) order.
//! Because references are substituted with hashes before hashing, any
//! bijective relabelling of entity ids yields identical hashes (the
//! "gauge invariance" property, §8 law 3).

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use sha2::{Digest, Sha256};
use yin_core::{Attribute, DatomValue, EntityId, Scalar, VmError, VmErrorKind};

use crate::project::DatomIndex;

/// The content-hash algorithm is a parameter of this module (§9): swap
/// implementations without touching canonicalisation. Any test asserting
/// a literal hash value must be regenerated if the algorithm changes.
pub trait ContentHasher {
    /// Hash canonical bytes, returning a tagged digest such as
    /// `"sha256:<hex>"`.
    fn hash_bytes(&self, bytes: &[u8]) -> String;
}

/// The default algorithm (§4.2 step 5: "SHA-256 suffices").
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash_bytes(&self, bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        format!("sha256:{}", hex::encode(digest))
    }
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(untagged)]
pub(crate) enum CanonEntry {
    Scalar(Scalar),
    Hash(String),
    HashList(Vec<String>),
}

/// Leaves-first (post-order) topological order over the entities `idx`
/// describes, following reference edges. Fails with
/// [`VmErrorKind::CyclicDependency`] if the reference graph has a cycle.
fn topo_order(idx: &DatomIndex) -> Result<Vec<EntityId>, VmError> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();

    fn visit(
        e: EntityId,
        idx: &DatomIndex,
        visited: &mut HashSet<EntityId>,
        in_stack: &mut HashSet<EntityId>,
        order: &mut Vec<EntityId>,
    ) -> Result<(), VmError> {
        if visited.contains(&e) {
            return Ok(());
        }
        if in_stack.contains(&e) {
            return Err(VmError::new(VmErrorKind::CyclicDependency, "entity graph has a cycle")
                .with_entity(e));
        }
        in_stack.insert(e);
        for datom in idx.datoms_for(e) {
            if datom.is_derived() {
                continue;
            }
            for r in datom.v.refs() {
                visit(r, idx, visited, in_stack, order)?;
            }
        }
        in_stack.remove(&e);
        visited.insert(e);
        order.push(e);
        Ok(())
    }

    for e in idx.entities() {
        visit(e, idx, &mut visited, &mut in_stack, &mut order)?;
    }
    Ok(order)
}

pub(crate) fn canonicalize(
    e: EntityId,
    idx: &DatomIndex,
    hashes: &HashMap<EntityId, String>,
) -> Result<BTreeMap<String, CanonEntry>, VmError> {
    let mut pairs: BTreeMap<String, CanonEntry> = BTreeMap::new();
    // Group non-derived datoms by attribute, preserving assertion order —
    // needed for cardinality-many attributes represented as several
    // single-valued datoms rather than one pre-merged `RefList`.
    let mut by_attr: BTreeMap<Attribute, Vec<&DatomValue>> = BTreeMap::new();
    for d in idx.datoms_for(e) {
        if d.is_derived() {
            continue;
        }
        by_attr.entry(d.a).or_default().push(&d.v);
    }

    let hash_of = |r: EntityId| -> Result<String, VmError> {
        hashes.get(&r).cloned().ok_or_else(|| {
            VmError::new(VmErrorKind::MalformedProgram, "reference to unhashed entity")
                .with_entity(r)
        })
    };

    for (attr, values) in by_attr {
        let entry = if attr.is_cardinality_many() {
            let mut refs = Vec::new();
            for v in values {
                refs.extend(v.refs());
            }
            let mut hashed = Vec::with_capacity(refs.len());
            for r in refs {
                hashed.push(hash_of(r)?);
            }
            CanonEntry::HashList(hashed)
        } else {
            match values[0] {
                DatomValue::Scalar(s) => CanonEntry::Scalar(s.clone()),
                DatomValue::Ref(r) => CanonEntry::Hash(hash_of(*r)?),
                DatomValue::RefList(rs) => {
                    let mut hashed = Vec::with_capacity(rs.len());
                    for r in rs {
                        hashed.push(hash_of(*r)?);
                    }
                    CanonEntry::HashList(hashed)
                }
            }
        };
        pairs.insert(attr.keyword().to_string(), entry);
    }
    Ok(pairs)
}

/// Compute `{eid -> "sha256:<hex>"}` for every entity `idx` describes.
pub fn content_hashes(
    idx: &DatomIndex,
    hasher: &dyn ContentHasher,
) -> Result<HashMap<EntityId, String>, VmError> {
    let order = topo_order(idx)?;
    let mut hashes = HashMap::with_capacity(order.len());
    for e in order {
        let pairs = canonicalize(e, idx, &hashes)?;
        let bytes = serde_json::to_vec(&pairs)
            .expect("canonical pairs are always representable as JSON");
        hashes.insert(e, hasher.hash_bytes(&bytes));
    }
    Ok(hashes)
}

/// Append derived `(e, :yin/content-hash, hash, t, 1)` datoms for every
/// entry in `hashes` (§4.2, "append derived datoms ... on request").
pub fn content_hash_datoms(
    hashes: &HashMap<EntityId, String>,
    t: i64,
) -> Vec<yin_core::Datom> {
    hashes
        .iter()
        .map(|(e, h)| {
            yin_core::Datom::derived(
                *e,
                Attribute::ContentHash,
                DatomValue::Scalar(Scalar::String(h.clone())),
                t,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::project;
    use yin_core::AstNode;

    fn literal_42() -> AstNode {
        AstNode::Literal { value: Scalar::Int(42) }
    }

    #[test]
    fn gauge_invariance_under_relabelling() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Variable { name: "+".into() }),
            operands: vec![literal_42(), AstNode::Literal { value: Scalar::Int(1) }],
        };

        let p1 = project(&ast, 0);
        let idx1 = DatomIndex::build(&p1.datoms);
        let hashes1 = content_hashes(&idx1, &Sha256Hasher).unwrap();

        // Relabel into a disjoint, strictly positive range — a different
        // gauge for the exact same structure.
        let offset = 1000;
        let relabelled: Vec<yin_core::Datom> = p1
            .datoms
            .iter()
            .map(|d| {
                let mut d = d.clone();
                d.e = EntityId(d.e.0 + offset);
                d.v = match &d.v {
                    DatomValue::Ref(r) => DatomValue::Ref(EntityId(r.0 + offset)),
                    DatomValue::RefList(rs) => {
                        DatomValue::RefList(rs.iter().map(|r| EntityId(r.0 + offset)).collect())
                    }
                    other => other.clone(),
                };
                d
            })
            .collect();
        let idx2 = DatomIndex::build(&relabelled);
        let hashes2 = content_hashes(&idx2, &Sha256Hasher).unwrap();

        let root1 = hashes1.get(&p1.root).unwrap();
        let root2 = hashes2.get(&EntityId(p1.root.0 + offset)).unwrap();
        assert_eq!(root1, root2);
    }

    #[test]
    fn cyclic_dependency_is_fatal() {
        // Hand-build two entities that reference each other — projection
        // can't produce this (it's strictly acyclic), but an externally
        // supplied datom set could.
        use yin_core::Datom;
        let a = EntityId(-1);
        let b = EntityId(-2);
        let datoms = vec![
            Datom::new(a, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("if".into())), 0),
            Datom::new(a, Attribute::Test, DatomValue::Ref(b), 0),
            Datom::new(a, Attribute::Consequent, DatomValue::Ref(b), 0),
            Datom::new(a, Attribute::Alternate, DatomValue::Ref(b), 0),
            Datom::new(b, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("if".into())), 0),
            Datom::new(b, Attribute::Test, DatomValue::Ref(a), 0),
            Datom::new(b, Attribute::Consequent, DatomValue::Ref(a), 0),
            Datom::new(b, Attribute::Alternate, DatomValue::Ref(a), 0),
        ];
        let idx = DatomIndex::build(&datoms);
        let err = content_hashes(&idx, &Sha256Hasher).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::CyclicDependency);
    }

    #[test]
    fn derived_datoms_are_excluded_from_hash_input() {
        let ast = literal_42();
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let hashes = content_hashes(&idx, &Sha256Hasher).unwrap();
        let appended = content_hash_datoms(&hashes, 1);

        let mut with_derived = p.datoms.clone();
        with_derived.extend(appended);
        let idx2 = DatomIndex::build(&with_derived);
        let hashes2 = content_hashes(&idx2, &Sha256Hasher).unwrap();
        assert_eq!(hashes.get(&p.root), hashes2.get(&p.root));
    }
}
