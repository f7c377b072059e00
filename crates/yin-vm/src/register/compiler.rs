//! Phase 1 (§4.6): AST datoms → symbolic register assembly.
//!
//! Register allocation is linear stack discipline: a body's allocator is a
//! bump counter that never reuses a register, reset fresh for every
//! closure body (including the program's own top-level body) so each
//! carries its own `reg_count` rather than sharing one global file.

use yin_core::{Attribute, DatomValue, EntityId, Scalar, VmError, VmErrorKind};
use yin_runtime::DatomIndex;

pub type Reg = u32;
pub type Label = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Scalar(Scalar),
}

/// One symbolic instruction. `Label` markers are pseudo-instructions:
/// they occupy no bytecode slot themselves, just record a byte-offset
/// target for phase 2 (§4.6).
#[derive(Debug, Clone)]
pub enum Instr {
    LoadK { rd: Reg, k: Const },
    LoadV { rd: Reg, name: String },
    Move { rd: Reg, rs: Reg },
    Closure { rd: Reg, params: Vec<String>, body: Label, reg_count: u32 },
    Call { rd: Reg, rf: Reg, args: Vec<Reg> },
    Return { rs: Reg },
    Branch { rt: Reg, then_label: Label, else_label: Label },
    Jump { label: Label },
    Gensym { rd: Reg, prefix: String },
    SGet { rd: Reg, key: String },
    SPut { rd: Reg, key: String, rv: Reg },
    StreamMake { rd: Reg, capacity: Option<usize> },
    StreamPut { rd: Reg, target: Reg, val: Reg },
    StreamCursor { rd: Reg, source: Reg },
    StreamNext { rd: Reg, source: Reg },
    StreamClose { rd: Reg, target: Reg },
    LabelMark(Label),
}

#[derive(Debug, Clone)]
pub struct Body {
    pub label: Label,
    pub reg_count: u32,
    pub instrs: Vec<Instr>,
}

/// The symbolic program: every compiled body (the entry point plus one per
/// lambda encountered), and which label is the entry.
#[derive(Debug, Clone)]
pub struct Program {
    pub bodies: Vec<Body>,
    pub entry: Label,
}

struct Compiler<'a> {
    idx: &'a DatomIndex,
    next_label: Label,
    bodies: Vec<Body>,
}

struct BodyBuilder {
    instrs: Vec<Instr>,
    next_reg: Reg,
}

impl BodyBuilder {
    fn new() -> Self {
        BodyBuilder { instrs: Vec::new(), next_reg: 0 }
    }

    fn fresh_reg(&mut self) -> Reg {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }
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

    /// Compile `id` as a fresh closure/program body, returning its label.
    fn compile_body(&mut self, id: EntityId) -> Result<Label, VmError> {
        let label = self.fresh_label();
        let mut b = BodyBuilder::new();
        let result = self.compile_node(id, &mut b)?;
        b.push(Instr::Return { rs: result });
        self.bodies.push(Body { label, reg_count: b.next_reg, instrs: b.instrs });
        Ok(label)
    }

    fn compile_node(&mut self, id: EntityId, b: &mut BodyBuilder) -> Result<Reg, VmError> {
        let type_name = self
            .idx
            .type_name(id)
            .ok_or_else(|| VmError::new(VmErrorKind::MalformedProgram, "entity has no yin/type datom").with_entity(id))?;

        Ok(match type_name {
            "literal" => {
                let Some(DatomValue::Scalar(s)) = self.idx.attr(id, Attribute::Value) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "literal missing yin/value").with_entity(id));
                };
                let rd = b.fresh_reg();
                b.push(Instr::LoadK { rd, k: Const::Scalar(s.clone()) });
                rd
            }
            "variable" => {
                let Some(DatomValue::Scalar(Scalar::String(name))) = self.idx.attr(id, Attribute::Name) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "variable missing yin/name").with_entity(id));
                };
                let rd = b.fresh_reg();
                b.push(Instr::LoadV { rd, name: name.clone() });
                rd
            }
            "lambda" => {
                let params = match self.idx.attr(id, Attribute::Params) {
                    Some(DatomValue::Scalar(Scalar::String(s))) if s.is_empty() => Vec::new(),
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.split(',').map(String::from).collect(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "lambda missing yin/params").with_entity(id)),
                };
                let body_id = self.ref_attr(id, Attribute::Body)?;
                let body_label = self.compile_body(body_id)?;
                let reg_count = self.bodies.iter().find(|bd| bd.label == body_label).unwrap().reg_count;
                let rd = b.fresh_reg();
                b.push(Instr::Closure { rd, params, body: body_label, reg_count });
                rd
            }
            "application" => {
                let op_id = self.ref_attr(id, Attribute::Operator)?;
                let operand_ids = match self.idx.attr(id, Attribute::Operands) {
                    Some(DatomValue::RefList(rs)) => rs.clone(),
                    None => Vec::new(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "application operands not a ref list").with_entity(id)),
                };
                let rf = self.compile_node(op_id, b)?;
                let mut args = Vec::with_capacity(operand_ids.len());
                for oid in &operand_ids {
                    args.push(self.compile_node(*oid, b)?);
                }
                let rd = b.fresh_reg();
                b.push(Instr::Call { rd, rf, args });
                rd
            }
            "if" => {
                let test_id = self.ref_attr(id, Attribute::Test)?;
                let cons_id = self.ref_attr(id, Attribute::Consequent)?;
                let alt_id = self.ref_attr(id, Attribute::Alternate)?;
                let rt = self.compile_node(test_id, b)?;
                let then_label = self.fresh_label();
                let else_label = self.fresh_label();
                let join_label = self.fresh_label();
                b.push(Instr::Branch { rt, then_label, else_label });

                let rd = b.fresh_reg();
                b.push(Instr::LabelMark(then_label));
                let rc = self.compile_node(cons_id, b)?;
                b.push(Instr::Move { rd, rs: rc });
                b.push(Instr::Jump { label: join_label });

                b.push(Instr::LabelMark(else_label));
                let ra = self.compile_node(alt_id, b)?;
                b.push(Instr::Move { rd, rs: ra });
                b.push(Instr::Jump { label: join_label });

                b.push(Instr::LabelMark(join_label));
                rd
            }
            "vm/gensym" => {
                let prefix = match self.idx.attr(id, Attribute::Prefix) {
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.clone(),
                    _ => String::new(),
                };
                let rd = b.fresh_reg();
                b.push(Instr::Gensym { rd, prefix });
                rd
            }
            "vm/store-get" => {
                let Some(DatomValue::Scalar(Scalar::String(key))) = self.idx.attr(id, Attribute::Key) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "vm/store-get missing yin/key").with_entity(id));
                };
                let rd = b.fresh_reg();
                b.push(Instr::SGet { rd, key: key.clone() });
                rd
            }
            "vm/store-put" => {
                let Some(DatomValue::Scalar(Scalar::String(key))) = self.idx.attr(id, Attribute::Key) else {
                    return Err(VmError::new(VmErrorKind::MalformedProgram, "vm/store-put missing yin/key").with_entity(id));
                };
                let val_id = self.ref_attr(id, Attribute::Val)?;
                let rv = self.compile_node(val_id, b)?;
                let rd = b.fresh_reg();
                b.push(Instr::SPut { rd, key: key.clone(), rv });
                rd
            }
            "stream/make" => {
                let capacity = match self.idx.attr(id, Attribute::Buffer) {
                    Some(DatomValue::Scalar(Scalar::Int(n))) => Some(*n as usize),
                    _ => None,
                };
                let rd = b.fresh_reg();
                b.push(Instr::StreamMake { rd, capacity });
                rd
            }
            "stream/put" => {
                let target_id = self.ref_attr(id, Attribute::Target)?;
                let val_id = self.ref_attr(id, Attribute::Val)?;
                let target = self.compile_node(target_id, b)?;
                let val = self.compile_node(val_id, b)?;
                let rd = b.fresh_reg();
                b.push(Instr::StreamPut { rd, target, val });
                rd
            }
            "stream/cursor" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                let source = self.compile_node(source_id, b)?;
                let rd = b.fresh_reg();
                b.push(Instr::StreamCursor { rd, source });
                rd
            }
            "stream/next" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                let source = self.compile_node(source_id, b)?;
                let rd = b.fresh_reg();
                b.push(Instr::StreamNext { rd, source });
                rd
            }
            "stream/close" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                let target = self.compile_node(source_id, b)?;
                let rd = b.fresh_reg();
                b.push(Instr::StreamClose { rd, target });
                rd
            }
            other => return Err(VmError::new(VmErrorKind::UnknownNode, format!("unknown node type {other}")).with_entity(id)),
        })
    }
}

/// Compile the datom graph rooted at `root` into symbolic register
/// assembly. Emission is topologically driven from the root, recursing
/// into child nodes before the instruction that references their result
/// register — the root is always the entry body. Fatal on the same
/// conditions the other backends surface as `VmError` rather than
/// panicking on them (§4.13, §7): a missing attribute, a dangling ref, or
/// an unrecognised `yin/type`.
pub fn compile(idx: &DatomIndex, root: EntityId) -> Result<Program, VmError> {
    let mut c = Compiler { idx, next_label: 0, bodies: Vec::new() };
    let entry = c.compile_body(root)?;
    Ok(Program { bodies: c.bodies, entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use yin_runtime::project;

    #[test]
    fn compiles_a_literal_to_one_body() {
        let ast = yin_core::AstNode::Literal { value: Scalar::Int(42) };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root).unwrap();
        assert_eq!(prog.bodies.len(), 1);
        let entry = prog.bodies.iter().find(|b| b.label == prog.entry).unwrap();
        assert!(matches!(entry.instrs.last(), Some(Instr::Return { .. })));
    }

    #[test]
    fn a_lambda_produces_a_second_body() {
        let ast = yin_core::AstNode::Lambda {
            params: vec!["x".into()],
            body: Box::new(yin_core::AstNode::Variable { name: "x".into() }),
        };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root).unwrap();
        assert_eq!(prog.bodies.len(), 2);
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
