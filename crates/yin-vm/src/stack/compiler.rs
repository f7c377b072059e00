//! Phase 1 (§4.7): AST datoms → symbolic stack assembly.
//!
//! Unlike the register backend, a lambda's body is compiled inline, right
//! after its `lambda` instruction, and jumped over by the lambda's own
//! `skip-label` — `call`/`apply` is what actually enters it, never
//! straight-line fallthrough.

use yin_core::{Attribute, DatomValue, EntityId, Scalar, VmError, VmErrorKind};
use yin_runtime::DatomIndex;

pub type Label = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Scalar(Scalar),
}

/// Symbolic stack instructions (§4.7), plus the store/stream/gensym node
/// types every backend must support — the stack discipline makes them
/// push-operands-then-call-shaped, same as any other application, so
/// they get instructions analogous to the register VM's `sget`/`sput`/
/// `stream-*` rather than a generic primitive call (no closure needed).
#[derive(Debug, Clone)]
pub enum Instr {
    Push(Const),
    Load(String),
    Call(usize),
    Lambda { params: Vec<String>, skip_label: Label },
    JumpFalse(Label),
    Jump(Label),
    Return,
    Gensym(String),
    StoreGet(String),
    StorePut(String),
    StreamMake(Option<usize>),
    StreamPut,
    StreamCursor,
    StreamNext,
    StreamClose,
    LabelMark(Label),
}

#[derive(Debug, Clone)]
pub struct Program {
    pub instrs: Vec<Instr>,
}

struct Compiler<'a> {
    idx: &'a DatomIndex,
    next_label: Label,
    instrs: Vec<Instr>,
}

impl<'a> Compiler<'a> {
    fn fresh_label(&mut self) -> Label {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn ref_attr(&self, id: EntityId, a: Attribute) -> Result<EntityId, VmError> {
        match self.idx.attr(id, a) {
            Some(DatomValue::Ref(r)) => Ok(*r),
            _ => Err(VmError::new(VmErrorKind::MalformedProgram, format!("missing required ref attribute {a}")).with_entity(id)),
        }
    }

    fn compile_node(&mut self, id: EntityId) -> Result<(), VmError> {
        let type_name = self
            .idx
            .type_name(id)
            .ok_or_else(|| VmError::new(VmErrorKind::MalformedProgram, "entity has no yin/type datom").with_entity(id))?;

        match type_name {
            "literal" => {
                let Some(DatomValue::Scalar(s)) = self.idx.attr(id, Attribute::Value) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "literal missing yin/value").with_entity(id));
                };
                self.instrs.push(Instr::Push(Const::Scalar(s.clone())));
            }
            "variable" => {
                let Some(DatomValue::Scalar(Scalar::String(name))) = self.idx.attr(id, Attribute::Name) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "variable missing yin/name").with_entity(id));
                };
                self.instrs.push(Instr::Load(name.clone()));
            }
            "lambda" => {
                let params = match self.idx.attr(id, Attribute::Params) {
                    Some(DatomValue::Scalar(Scalar::String(s))) if s.is_empty() => Vec::new(),
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.split(',').map(String::from).collect(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "lambda missing yin/params").with_entity(id)),
                };
                let body_id = self.ref_attr(id, Attribute::Body)?;
                let skip_label = self.fresh_label();
                self.instrs.push(Instr::Lambda { params, skip_label });
                self.compile_node(body_id)?;
                self.instrs.push(Instr::Return);
                self.instrs.push(Instr::LabelMark(skip_label));
            }
            "application" => {
                let op_id = self.ref_attr(id, Attribute::Operator)?;
                let operand_ids = match self.idx.attr(id, Attribute::Operands) {
                    Some(DatomValue::RefList(rs)) => rs.clone(),
                    None => Vec::new(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "application operands not a ref list").with_entity(id)),
                };
                self.compile_node(op_id)?;
                for oid in &operand_ids {
                    self.compile_node(*oid)?;
                }
                self.instrs.push(Instr::Call(operand_ids.len()));
            }
            "if" => {
                let test_id = self.ref_attr(id, Attribute::Test)?;
                let cons_id = self.ref_attr(id, Attribute::Consequent)?;
                let alt_id = self.ref_attr(id, Attribute::Alternate)?;
                let else_label = self.fresh_label();
                let join_label = self.fresh_label();
                self.compile_node(test_id)?;
                self.instrs.push(Instr::JumpFalse(else_label));
                self.compile_node(cons_id)?;
                self.instrs.push(Instr::Jump(join_label));
                self.instrs.push(Instr::LabelMark(else_label));
                self.compile_node(alt_id)?;
                self.instrs.push(Instr::LabelMark(join_label));
            }
            "vm/gensym" => {
                let prefix = match self.idx.attr(id, Attribute::Prefix) {
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.clone(),
                    _ => String::new(),
                };
                self.instrs.push(Instr::Gensym(prefix));
            }
            "vm/store-get" => {
                let Some(DatomValue::Scalar(Scalar::String(key))) = self.idx.attr(id, Attribute::Key) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "vm/store-get missing yin/key").with_entity(id));
                };
                self.instrs.push(Instr::StoreGet(key.clone()));
            }
            "vm/store-put" => {
                let Some(DatomValue::Scalar(Scalar::String(key))) = self.idx.attr(id, Attribute::Key) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "vm/store-put missing yin/key").with_entity(id));
                };
                let val_id = self.ref_attr(id, Attribute::Val)?;
                self.compile_node(val_id)?;
                self.instrs.push(Instr::StorePut(key.clone()));
            }
            "stream/make" => {
                let capacity = match self.idx.attr(id, Attribute::Buffer) {
                    Some(DatomValue::Scalar(Scalar::Int(n))) => Some(*n as usize),
                    _ => None,
                };
                self.instrs.push(Instr::StreamMake(capacity));
            }
            "stream/put" => {
                let target_id = self.ref_attr(id, Attribute::Target)?;
                let val_id = self.ref_attr(id, Attribute::Val)?;
                self.compile_node(target_id)?;
                self.compile_node(val_id)?;
                self.instrs.push(Instr::StreamPut);
            }
            "stream/cursor" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.compile_node(source_id)?;
                self.instrs.push(Instr::StreamCursor);
            }
            "stream/next" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.compile_node(source_id)?;
                self.instrs.push(Instr::StreamNext);
            }
            "stream/close" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.compile_node(source_id)?;
                self.instrs.push(Instr::StreamClose);
            }
            other => return Err(VmError::new(VmErrorKind::UnknownNode, format!("unknown node type {other}")).with_entity(id)),
        }
        Ok(())
    }
}

/// Compile the datom graph rooted at `root` into symbolic stack assembly,
/// topologically driven from the root the same way the register
/// compiler is. Fatal on the same conditions the other backends surface
/// as `VmError` rather than panicking on them (§4.13, §7).
pub fn compile(idx: &DatomIndex, root: EntityId) -> Result<Program, VmError> {
    let mut c = Compiler { idx, next_label: 0, instrs: Vec::new() };
    c.compile_node(root)?;
    c.instrs.push(Instr::Return);
    Ok(Program { instrs: c.instrs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use yin_runtime::project;

    #[test]
    fn compiles_a_literal() {
        let ast = yin_core::AstNode::Literal { value: Scalar::Int(42) };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root).unwrap();
        assert!(matches!(prog.instrs[0], Instr::Push(_)));
        assert!(matches!(prog.instrs.last(), Some(Instr::Return)));
    }

    #[test]
    fn lambda_body_is_skipped_over_by_the_outer_flow() {
        let ast = yin_core::AstNode::Lambda {
            params: vec!["x".into()],
            body: Box::new(yin_core::AstNode::Variable { name: "x".into() }),
        };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root).unwrap();
        assert!(matches!(prog.instrs[0], Instr::Lambda { .. }));
    }

    #[test]
    fn unknown_node_type_is_a_malformed_program_error_not_a_panic() {
        use yin_core::{Attribute, Datom, DatomValue, EntityId};
        let bogus = EntityId(-1);
        let datoms = vec![Datom::new(
            bogus,
            Attribute::Type,
            DatomValue::Scalar(Scalar::Keyword("not-a-real-node".into())),
            0,
        )];
        let idx = DatomIndex::build(&datoms);
        let err = compile(&idx, bogus).unwrap_err();
        assert_eq!(err.kind, yin_core::VmErrorKind::UnknownNode);
    }
}
