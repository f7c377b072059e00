//! Phase 2 (§4.6): symbolic register assembly → numeric bytecode.
//!
//! A single flat `i64` vector holds every instruction across every body,
//! one word per opcode/operand; constants, names, and parameter lists
//! live in side pools referenced by index. Two passes: the first walks
//! the symbolic form to compute each label's offset into the flat array
//! (instructions have variable width, e.g. `call`'s arg count, so offsets
//! can't be assumed fixed-width), the second emits the real words with
//! every label substituted for its offset.

use std::collections::BTreeMap;

use yin_core::Scalar;

use super::compiler::{Body, Const, Instr, Label, Program};

pub const OP_LOADK: i64 = 0;
pub const OP_LOADV: i64 = 1;
pub const OP_MOVE: i64 = 2;
pub const OP_CLOSURE: i64 = 3;
pub const OP_CALL: i64 = 4;
pub const OP_RETURN: i64 = 5;
pub const OP_BRANCH: i64 = 6;
pub const OP_JUMP: i64 = 7;
pub const OP_GENSYM: i64 = 8;
pub const OP_SGET: i64 = 9;
pub const OP_SPUT: i64 = 10;
pub const OP_STREAM_MAKE: i64 = 11;
pub const OP_STREAM_PUT: i64 = 12;
pub const OP_STREAM_TAKE: i64 = 13;
/// Not in spec.md's literal fixed-opcode enumeration (which stops at 13)
/// but needed for `stream/cursor`/`stream/close`, which the symbolic
/// instruction set's `stream-*` wildcard already covers — extending the
/// numeric table the same way the tree-walking/datom-graph backends
/// extend their frame-kind sets.
pub const OP_STREAM_CURSOR: i64 = 14;
pub const OP_STREAM_CLOSE: i64 = 15;

#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub code: Vec<i64>,
    pub consts: Vec<Scalar>,
    pub strings: Vec<String>,
    pub param_lists: Vec<Vec<String>>,
    pub entry_addr: usize,
    /// Reg-count for the body at a given entry address, recorded by the
    /// compiler and trusted by the VM rather than recomputed (§4.6).
    pub reg_counts: BTreeMap<usize, u32>,
    /// Byte(word)-offset → symbolic instruction index, for diagnostics.
    pub source_map: BTreeMap<usize, usize>,
}

struct Pools {
    consts: Vec<Scalar>,
    strings: Vec<String>,
    param_lists: Vec<Vec<String>>,
}

impl Pools {
    fn const_idx(&mut self, k: &Const) -> usize {
        let Const::Scalar(s) = k;
        if let Some(i) = self.consts.iter().position(|existing| existing == s) {
            return i;
        }
        self.consts.push(s.clone());
        self.consts.len() - 1
    }

    fn string_idx(&mut self, s: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|existing| existing == s) {
            return i;
        }
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    fn params_idx(&mut self, params: &[String]) -> usize {
        self.param_lists.push(params.to_vec());
        self.param_lists.len() - 1
    }
}

/// Width, in words, that `instr` occupies once encoded (`LabelMark`
/// occupies zero — it never reaches the flat array).
fn width(instr: &Instr) -> usize {
    match instr {
        Instr::LoadK { .. } => 3,
        Instr::LoadV { .. } => 3,
        Instr::Move { .. } => 3,
        Instr::Closure { .. } => 5,
        Instr::Call { args, .. } => 4 + args.len(),
        Instr::Return { .. } => 2,
        Instr::Branch { .. } => 4,
        Instr::Jump { .. } => 2,
        Instr::Gensym { .. } => 3,
        Instr::SGet { .. } => 3,
        Instr::SPut { .. } => 4,
        Instr::StreamMake { .. } => 4,
        Instr::StreamPut { .. } => 4,
        Instr::StreamCursor { .. } => 3,
        Instr::StreamNext { .. } => 3,
        Instr::StreamClose { .. } => 3,
        Instr::LabelMark(_) => 0,
    }
}

/// Assemble a symbolic [`Program`] into flat numeric [`Bytecode`].
pub fn assemble(program: &Program) -> Bytecode {
    let mut labels: BTreeMap<Label, usize> = BTreeMap::new();
    let mut body_order: Vec<&Body> = program.bodies.iter().collect();
    body_order.sort_by_key(|b| b.label);

    // Pass 1: compute every label's offset (body entry labels and
    // in-body branch/jump labels share one namespace, so both are
    // resolved here).
    let mut offset = 0usize;
    for body in &body_order {
        labels.insert(body.label, offset);
        for instr in &body.instrs {
            if let Instr::LabelMark(l) = instr {
                labels.insert(*l, offset);
            } else {
                offset += width(instr);
            }
        }
    }

    // Pass 2: emit, substituting every label for its resolved offset.
    let mut pools = Pools { consts: Vec::new(), strings: Vec::new(), param_lists: Vec::new() };
    let mut code = Vec::new();
    let mut reg_counts = BTreeMap::new();
    let mut source_map = BTreeMap::new();
    let mut instr_index = 0usize;

    for body in &body_order {
        reg_counts.insert(labels[&body.label], body.reg_count);
        for instr in &body.instrs {
            if matches!(instr, Instr::LabelMark(_)) {
                continue;
            }
            source_map.insert(code.len(), instr_index);
            instr_index += 1;
            match instr {
                Instr::LoadK { rd, k } => {
                    let ki = pools.const_idx(k);
                    code.extend([OP_LOADK, *rd as i64, ki as i64]);
                }
                Instr::LoadV { rd, name } => {
                    let ni = pools.string_idx(name);
                    code.extend([OP_LOADV, *rd as i64, ni as i64]);
                }
                Instr::Move { rd, rs } => code.extend([OP_MOVE, *rd as i64, *rs as i64]),
                Instr::Closure { rd, params, body: body_label, reg_count } => {
                    let pi = pools.params_idx(params);
                    code.extend([
                        OP_CLOSURE,
                        *rd as i64,
                        pi as i64,
                        labels[body_label] as i64,
                        *reg_count as i64,
                    ]);
                }
                Instr::Call { rd, rf, args } => {
                    code.extend([OP_CALL, *rd as i64, *rf as i64, args.len() as i64]);
                    code.extend(args.iter().map(|a| *a as i64));
                }
                Instr::Return { rs } => code.extend([OP_RETURN, *rs as i64]),
                Instr::Branch { rt, then_label, else_label } => {
                    code.extend([OP_BRANCH, *rt as i64, labels[then_label] as i64, labels[else_label] as i64]);
                }
                Instr::Jump { label } => code.extend([OP_JUMP, labels[label] as i64]),
                Instr::Gensym { rd, prefix } => {
                    let pi = pools.string_idx(prefix);
                    code.extend([OP_GENSYM, *rd as i64, pi as i64]);
                }
                Instr::SGet { rd, key } => {
                    let ki = pools.string_idx(key);
                    code.extend([OP_SGET, *rd as i64, ki as i64]);
                }
                Instr::SPut { rd, key, rv } => {
                    let ki = pools.string_idx(key);
                    code.extend([OP_SPUT, *rd as i64, ki as i64, *rv as i64]);
                }
                Instr::StreamMake { rd, capacity } => {
                    let (has, val) = match capacity {
                        Some(c) => (1, *c as i64),
                        None => (0, 0),
                    };
                    code.extend([OP_STREAM_MAKE, *rd as i64, has, val]);
                }
                Instr::StreamPut { rd, target, val } => code.extend([OP_STREAM_PUT, *rd as i64, *target as i64, *val as i64]),
                Instr::StreamCursor { rd, source } => code.extend([OP_STREAM_CURSOR, *rd as i64, *source as i64]),
                Instr::StreamNext { rd, source } => code.extend([OP_STREAM_TAKE, *rd as i64, *source as i64]),
                Instr::StreamClose { rd, target } => code.extend([OP_STREAM_CLOSE, *rd as i64, *target as i64]),
                Instr::LabelMark(_) => unreachable!(),
            }
        }
    }

    Bytecode {
        code,
        consts: pools.consts,
        strings: pools.strings,
        param_lists: pools.param_lists,
        entry_addr: labels[&program.entry],
        reg_counts,
        source_map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::compiler::compile;
    use yin_core::AstNode;
    use yin_runtime::{project, DatomIndex};

    #[test]
    fn literal_assembles_to_loadk_then_return() {
        let ast = AstNode::Literal { value: Scalar::Int(42) };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root).unwrap();
        let bc = assemble(&prog);
        assert_eq!(bc.code[0], OP_LOADK);
        assert_eq!(bc.consts[bc.code[2] as usize], Scalar::Int(42));
        assert_eq!(bc.code[3], OP_RETURN);
    }

    #[test]
    fn branch_targets_resolve_to_real_offsets() {
        let ast = AstNode::If {
            test: Box::new(AstNode::Literal { value: Scalar::Bool(true) }),
            consequent: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
            alternate: Box::new(AstNode::Literal { value: Scalar::Int(0) }),
        };
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root).unwrap();
        let bc = assemble(&prog);
        let branch_pos = bc.code.iter().position(|&w| w == OP_BRANCH).unwrap();
        let then_addr = bc.code[branch_pos + 2] as usize;
        let else_addr = bc.code[branch_pos + 3] as usize;
        assert!(then_addr < bc.code.len());
        assert!(else_addr < bc.code.len());
        assert_ne!(then_addr, else_addr);
    }
}
