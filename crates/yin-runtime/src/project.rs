//! AST → datom projection (§4.1).
//!
//! Walks a nested [`AstNode`] and emits, for each node, one `yin/type`
//! datom plus one datom per structural attribute. Sub-nodes are projected
//! recursively and referenced by the id their own `yin/type` datom carries.
//! Tempids are drawn from a strictly-decreasing counter (see
//! [`yin_core::TempidAllocator`]) so the root always receives the largest
//! id and every dependency a smaller one.

use std::collections::HashMap;

use yin_core::{Attribute, AstNode, Datom, DatomValue, EntityId, Scalar, TempidAllocator};

/// The result of projecting one AST into a datom set.
#[derive(Debug, Clone)]
pub struct Projection {
    pub datoms: Vec<Datom>,
    pub root: EntityId,
}

/// Project `ast` into datoms at transaction `t`, using a fresh allocator.
///
/// Projection is deterministic given an id allocator: calling this twice
/// on structurally identical ASTs (each with its own fresh allocator)
/// yields identical id assignments (§4.1).
pub fn project(ast: &AstNode, t: i64) -> Projection {
    let mut alloc = TempidAllocator::new();
    let mut datoms = Vec::new();
    let root = project_node(ast, t, &mut alloc, &mut datoms);
    Projection { datoms, root }
}

fn scalar_value(s: &Scalar) -> DatomValue {
    DatomValue::Scalar(s.clone())
}

fn project_node(
    node: &AstNode,
    t: i64,
    alloc: &mut TempidAllocator,
    out: &mut Vec<Datom>,
) -> EntityId {
    // Project children first so the current node's id — allocated last —
    // is numerically larger than every id it references, preserving the
    // "largest id = root" topological property across the whole tree.
    match node {
        AstNode::Literal { value } => {
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("literal".into())), t));
            out.push(Datom::new(id, Attribute::Value, scalar_value(value), t));
            id
        }
        AstNode::Variable { name } => {
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("variable".into())), t));
            out.push(Datom::new(id, Attribute::Name, DatomValue::Scalar(Scalar::String(name.clone())), t));
            id
        }
        AstNode::Lambda { params, body } => {
            let body_id = project_node(body, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("lambda".into())), t));
            out.push(Datom::new(
                id,
                Attribute::Params,
                DatomValue::Scalar(Scalar::String(params.join(","))),
                t,
            ));
            out.push(Datom::new(id, Attribute::Body, DatomValue::Ref(body_id), t));
            id
        }
        AstNode::Application { operator, operands } => {
            let op_id = project_node(operator, t, alloc, out);
            let operand_ids: Vec<EntityId> =
                operands.iter().map(|o| project_node(o, t, alloc, out)).collect();
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("application".into())), t));
            out.push(Datom::new(id, Attribute::Operator, DatomValue::Ref(op_id), t));
            out.push(Datom::new(id, Attribute::Operands, DatomValue::RefList(operand_ids), t));
            id
        }
        AstNode::If { test, consequent, alternate } => {
            let test_id = project_node(test, t, alloc, out);
            let cons_id = project_node(consequent, t, alloc, out);
            let alt_id = project_node(alternate, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("if".into())), t));
            out.push(Datom::new(id, Attribute::Test, DatomValue::Ref(test_id), t));
            out.push(Datom::new(id, Attribute::Consequent, DatomValue::Ref(cons_id), t));
            out.push(Datom::new(id, Attribute::Alternate, DatomValue::Ref(alt_id), t));
            id
        }
        AstNode::Gensym { prefix } => {
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("vm/gensym".into())), t));
            out.push(Datom::new(id, Attribute::Prefix, DatomValue::Scalar(Scalar::String(prefix.clone())), t));
            id
        }
        AstNode::StoreGet { key } => {
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("vm/store-get".into())), t));
            out.push(Datom::new(id, Attribute::Key, DatomValue::Scalar(Scalar::String(key.clone())), t));
            id
        }
        AstNode::StorePut { key, val } => {
            let val_id = project_node(val, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("vm/store-put".into())), t));
            out.push(Datom::new(id, Attribute::Key, DatomValue::Scalar(Scalar::String(key.clone())), t));
            out.push(Datom::new(id, Attribute::Val, DatomValue::Ref(val_id), t));
            id
        }
        AstNode::StreamMake { buffer } => {
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("stream/make".into())), t));
            if let Some(cap) = buffer {
                out.push(Datom::new(id, Attribute::Buffer, DatomValue::Scalar(Scalar::Int(*cap as i64)), t));
            }
            id
        }
        AstNode::StreamPut { target, val } => {
            let target_id = project_node(target, t, alloc, out);
            let val_id = project_node(val, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("stream/put".into())), t));
            out.push(Datom::new(id, Attribute::Target, DatomValue::Ref(target_id), t));
            out.push(Datom::new(id, Attribute::Val, DatomValue::Ref(val_id), t));
            id
        }
        AstNode::StreamCursor { source } => {
            let source_id = project_node(source, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("stream/cursor".into())), t));
            out.push(Datom::new(id, Attribute::Source, DatomValue::Ref(source_id), t));
            id
        }
        AstNode::StreamNext { source } => {
            let source_id = project_node(source, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("stream/next".into())), t));
            out.push(Datom::new(id, Attribute::Source, DatomValue::Ref(source_id), t));
            id
        }
        AstNode::StreamClose { source } => {
            let source_id = project_node(source, t, alloc, out);
            let id = alloc.fresh();
            out.push(Datom::new(id, Attribute::Type, DatomValue::Scalar(Scalar::Keyword("stream/close".into())), t));
            out.push(Datom::new(id, Attribute::Source, DatomValue::Ref(source_id), t));
            id
        }
    }
}

/// Index a flat datom set by entity id — built once at VM load time for
/// O(1) lookup plus O(k) over the small per-entity attribute set (§4.5).
#[derive(Debug, Clone, Default)]
pub struct DatomIndex {
    by_entity: HashMap<EntityId, Vec<Datom>>,
}

impl DatomIndex {
    pub fn build(datoms: &[Datom]) -> Self {
        let mut by_entity: HashMap<EntityId, Vec<Datom>> = HashMap::new();
        for d in datoms {
            by_entity.entry(d.e).or_default().push(d.clone());
        }
        DatomIndex { by_entity }
    }

    pub fn datoms_for(&self, e: EntityId) -> &[Datom] {
        self.by_entity.get(&e).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn attr(&self, e: EntityId, a: Attribute) -> Option<&DatomValue> {
        self.datoms_for(e).iter().find(|d| d.a == a).map(|d| &d.v)
    }

    pub fn type_name(&self, e: EntityId) -> Option<&str> {
        match self.attr(e, Attribute::Type) {
            Some(DatomValue::Scalar(Scalar::Keyword(k))) => Some(k.as_str()),
            _ => None,
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.by_entity.keys().copied()
    }

    /// Invariant 3 (§3): the root is the one entity referenced by no
    /// other entity in the set.
    pub fn find_root(&self) -> Option<EntityId> {
        let mut referenced: std::collections::HashSet<EntityId> = std::collections::HashSet::new();
        for datoms in self.by_entity.values() {
            for d in datoms {
                for r in d.v.refs() {
                    referenced.insert(r);
                }
            }
        }
        self.entities().find(|e| !referenced.contains(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yin_core::Scalar;

    #[test]
    fn projects_literal() {
        let ast = AstNode::Literal { value: Scalar::Int(42) };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        assert_eq!(idx.type_name(p.root), Some("literal"));
        assert_eq!(idx.attr(p.root, Attribute::Value), Some(&DatomValue::Scalar(Scalar::Int(42))));
    }

    #[test]
    fn root_has_the_largest_id() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Variable { name: "+".into() }),
            operands: vec![
                AstNode::Literal { value: Scalar::Int(10) },
                AstNode::Literal { value: Scalar::Int(20) },
            ],
        };
        let p = project(&ast, 0);
        let max_id = p.datoms.iter().map(|d| d.e.0).max().unwrap();
        assert_eq!(p.root.0, max_id);
    }

    #[test]
    fn find_root_matches_projection_root() {
        let ast = AstNode::If {
            test: Box::new(AstNode::Literal { value: Scalar::Bool(true) }),
            consequent: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
            alternate: Box::new(AstNode::Literal { value: Scalar::Int(0) }),
        };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        assert_eq!(idx.find_root(), Some(p.root));
    }

    #[test]
    fn every_referenced_entity_has_datoms() {
        let ast = AstNode::Lambda {
            params: vec!["x".into()],
            body: Box::new(AstNode::Variable { name: "x".into() }),
        };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        for d in &p.datoms {
            for r in d.v.refs() {
                assert!(!idx.datoms_for(r).is_empty(), "dangling ref to {r}");
            }
        }
    }
}
