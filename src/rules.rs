/// デフォルトルールライブラリ
///
/// 教師コードの`optimizer.rs`にあった`OptimizationRule`群を、action::Ruleとして
/// 一般化し直したもの。定数畳み込み・恒等式・比較簡略化など、p-code単位の
/// 書き換え規則を実装する。

use crate::action::{Regions, Rule};
use crate::error::CoreResult;
use crate::funcdata::Funcdata;
use crate::pcodeop::{OpCode, PcodeOpId};
use crate::varnode::VarnodeId;

fn calc_mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn const_value(fd: &Funcdata, vn: VarnodeId) -> Option<u64> {
    fd.varnodes.get(vn).const_value()
}

/// V op 0 => V / V * 0 => 0 のような恒等式
#[derive(Clone)]
pub struct RuleZeroOp;

impl Rule for RuleZeroOp {
    fn name(&self) -> &str {
        "RuleZeroOp"
    }
    fn op_list(&self) -> &[OpCode] {
        &[OpCode::IntAdd, OpCode::IntSub, OpCode::IntOr, OpCode::IntXor, OpCode::IntMult]
    }
    fn reads(&self) -> Regions {
        Regions::PCODE_OPS | Regions::CONSTANTS
    }
    fn writes(&self) -> Regions {
        Regions::PCODE_OPS
    }
    fn apply(&self, fd: &mut Funcdata, op_id: PcodeOpId) -> CoreResult<u32> {
        let op = fd.op(op_id).clone();
        if op.inputs.len() < 2 {
            return Ok(0);
        }
        let Some(rhs) = const_value(fd, op.inputs[1]) else { return Ok(0) };
        if rhs != 0 {
            return Ok(0);
        }
        match op.opcode {
            OpCode::IntAdd | OpCode::IntSub | OpCode::IntOr | OpCode::IntXor => {
                rewrite_as_copy(fd, op_id, op.inputs[0]);
                Ok(1)
            }
            OpCode::IntMult => {
                let size = op.output.map(|o| fd.varnodes.get(o).size).unwrap_or(8);
                let zero = fd.varnodes.create_constant(fd.spaces.const_space(), 0, size);
                rewrite_as_copy(fd, op_id, zero);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
    fn clone_box(&self) -> Box<dyn Rule> {
        Box::new(self.clone())
    }
}

/// const op const => const の定数畳み込み
#[derive(Clone)]
pub struct RuleConstantFold;

impl Rule for RuleConstantFold {
    fn name(&self) -> &str {
        "RuleConstantFold"
    }
    fn op_list(&self) -> &[OpCode] {
        &[
            OpCode::IntAdd,
            OpCode::IntSub,
            OpCode::IntMult,
            OpCode::IntAnd,
            OpCode::IntOr,
            OpCode::IntXor,
            OpCode::IntLeft,
            OpCode::IntRight,
        ]
    }
    fn reads(&self) -> Regions {
        Regions::PCODE_OPS | Regions::CONSTANTS
    }
    fn writes(&self) -> Regions {
        Regions::PCODE_OPS | Regions::CONSTANTS
    }
    fn apply(&self, fd: &mut Funcdata, op_id: PcodeOpId) -> CoreResult<u32> {
        let op = fd.op(op_id).clone();
        if op.inputs.len() < 2 {
            return Ok(0);
        }
        let (Some(v1), Some(v2)) = (const_value(fd, op.inputs[0]), const_value(fd, op.inputs[1])) else {
            return Ok(0);
        };
        let size = op.output.map(|o| fd.varnodes.get(o).size).unwrap_or(8);
        let mask = calc_mask(size);
        let result = match op.opcode {
            OpCode::IntAdd => v1.wrapping_add(v2) & mask,
            OpCode::IntSub => v1.wrapping_sub(v2) & mask,
            OpCode::IntMult => v1.wrapping_mul(v2) & mask,
            OpCode::IntAnd => v1 & v2,
            OpCode::IntOr => v1 | v2,
            OpCode::IntXor => v1 ^ v2,
            OpCode::IntLeft => v1.wrapping_shl(v2 as u32) & mask,
            OpCode::IntRight => v1.wrapping_shr(v2 as u32),
            _ => return Ok(0),
        };
        let folded = fd.varnodes.create_constant(fd.spaces.const_space(), result, size);
        rewrite_as_copy(fd, op_id, folded);
        Ok(1)
    }
    fn clone_box(&self) -> Box<dyn Rule> {
        Box::new(self.clone())
    }
}

/// V == V => true, V != V => false
#[derive(Clone)]
pub struct RuleEquality;

impl Rule for RuleEquality {
    fn name(&self) -> &str {
        "RuleEquality"
    }
    fn op_list(&self) -> &[OpCode] {
        &[OpCode::IntEqual, OpCode::IntNotEqual]
    }
    fn reads(&self) -> Regions {
        Regions::PCODE_OPS
    }
    fn writes(&self) -> Regions {
        Regions::PCODE_OPS | Regions::CONSTANTS
    }
    fn apply(&self, fd: &mut Funcdata, op_id: PcodeOpId) -> CoreResult<u32> {
        let op = fd.op(op_id).clone();
        if op.inputs.len() < 2 || op.inputs[0] != op.inputs[1] {
            return Ok(0);
        }
        let result = if op.opcode == OpCode::IntEqual { 1 } else { 0 };
        let c = fd.varnodes.create_constant(fd.spaces.const_space(), result, 1);
        rewrite_as_copy(fd, op_id, c);
        Ok(1)
    }
    fn clone_box(&self) -> Box<dyn Rule> {
        Box::new(self.clone())
    }
}

/// 可換演算の項順序正規化: c + V => V + c （定数を右側に寄せる）
#[derive(Clone)]
pub struct RuleTermOrder;

impl Rule for RuleTermOrder {
    fn name(&self) -> &str {
        "RuleTermOrder"
    }
    fn op_list(&self) -> &[OpCode] {
        &[
            OpCode::IntEqual,
            OpCode::IntNotEqual,
            OpCode::IntAdd,
            OpCode::IntXor,
            OpCode::IntAnd,
            OpCode::IntOr,
            OpCode::IntMult,
        ]
    }
    fn reads(&self) -> Regions {
        Regions::PCODE_OPS
    }
    fn writes(&self) -> Regions {
        Regions::PCODE_OPS
    }
    fn apply(&self, fd: &mut Funcdata, op_id: PcodeOpId) -> CoreResult<u32> {
        let op = fd.op(op_id).clone();
        if op.inputs.len() < 2 {
            return Ok(0);
        }
        let lhs_const = fd.varnodes.get(op.inputs[0]).is_constant();
        let rhs_const = fd.varnodes.get(op.inputs[1]).is_constant();
        if lhs_const && !rhs_const {
            fd.op_mut(op_id).inputs.swap(0, 1);
            Ok(1)
        } else {
            Ok(0)
        }
    }
    fn clone_box(&self) -> Box<dyn Rule> {
        Box::new(self.clone())
    }
}

/// V < 1 => V == 0 (符号なし)
#[derive(Clone)]
pub struct RuleLessOne;

impl Rule for RuleLessOne {
    fn name(&self) -> &str {
        "RuleLessOne"
    }
    fn op_list(&self) -> &[OpCode] {
        &[OpCode::IntLess]
    }
    fn reads(&self) -> Regions {
        Regions::PCODE_OPS
    }
    fn writes(&self) -> Regions {
        Regions::PCODE_OPS | Regions::CONSTANTS
    }
    fn apply(&self, fd: &mut Funcdata, op_id: PcodeOpId) -> CoreResult<u32> {
        let op = fd.op(op_id).clone();
        if op.inputs.len() < 2 {
            return Ok(0);
        }
        if const_value(fd, op.inputs[1]) != Some(1) {
            return Ok(0);
        }
        let size = fd.varnodes.get(op.inputs[0]).size;
        let zero = fd.varnodes.create_constant(fd.spaces.const_space(), 0, size);
        let lhs = op.inputs[0];
        let out = op.output;
        let parent = op.parent;
        let addr = op.seq.address;
        fd.mark_dead(op_id);
        let new_out = out.unwrap_or_else(|| fd.varnodes.create(addr, 1));
        fd.append_op(OpCode::IntEqual, addr, parent, Some(new_out), vec![lhs, zero]);
        Ok(1)
    }
    fn clone_box(&self) -> Box<dyn Rule> {
        Box::new(self.clone())
    }
}

/// ~(~V) => V の二重否定の恒等式
#[derive(Clone)]
pub struct RuleNegateIdentity;

impl Rule for RuleNegateIdentity {
    fn name(&self) -> &str {
        "RuleNegateIdentity"
    }
    fn op_list(&self) -> &[OpCode] {
        &[OpCode::IntNegate]
    }
    fn reads(&self) -> Regions {
        Regions::PCODE_OPS | Regions::SSA
    }
    fn writes(&self) -> Regions {
        Regions::PCODE_OPS
    }
    fn apply(&self, fd: &mut Funcdata, op_id: PcodeOpId) -> CoreResult<u32> {
        let op = fd.op(op_id).clone();
        let Some(&input) = op.inputs.first() else { return Ok(0) };
        let Some(def_id) = fd.varnodes.get(input).definition else { return Ok(0) };
        let def_op = fd.op(def_id);
        if def_op.opcode != OpCode::IntNegate || def_op.is_dead() {
            return Ok(0);
        }
        let inner = def_op.inputs[0];
        rewrite_as_copy(fd, op_id, inner);
        Ok(1)
    }
    fn clone_box(&self) -> Box<dyn Rule> {
        Box::new(self.clone())
    }
}

/// opをCOPYに書き換えて単一の入力を渡す（変更箇所のdescendants簿記を正しく更新する）
fn rewrite_as_copy(fd: &mut Funcdata, op_id: PcodeOpId, new_input: VarnodeId) {
    let old_inputs = fd.op(op_id).inputs.clone();
    for (slot, input) in old_inputs.iter().enumerate() {
        fd.varnodes.get_mut(*input).remove_descendant(op_id, slot as u32);
    }
    let op = fd.op_mut(op_id);
    op.opcode = OpCode::Copy;
    op.inputs = vec![new_input];
    fd.varnodes.get_mut(new_input).add_descendant(op_id, 0);
}

/// デフォルトの規則セット: 項順序正規化をまず適用し、その後に畳み込み系を適用する
pub fn default_rule_group() -> crate::action::Group {
    use crate::action::{Action, ActionState};
    crate::action::Group::new(
        "simplify",
        vec![
            Action::Rule(Box::new(RuleTermOrder), ActionState::default()),
            Action::Rule(Box::new(RuleConstantFold), ActionState::default()),
            Action::Rule(Box::new(RuleZeroOp), ActionState::default()),
            Action::Rule(Box::new(RuleEquality), ActionState::default()),
            Action::Rule(Box::new(RuleLessOne), ActionState::default()),
            Action::Rule(Box::new(RuleNegateIdentity), ActionState::default()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, SpaceIndex, SpaceManager};

    fn setup() -> Funcdata {
        let spaces = SpaceManager::new();
        Funcdata::new("f", Address::new(SpaceIndex(1), 0), spaces)
    }

    #[test]
    fn constant_fold_int_add() {
        let mut fd = setup();
        let entry = fd.blocks.entry;
        let a = fd.varnodes.create_constant(fd.spaces.const_space(), 3, 4);
        let b = fd.varnodes.create_constant(fd.spaces.const_space(), 4, 4);
        let out = fd.varnodes.create(Address::new(SpaceIndex(1), 0x10), 4);
        let op = fd.append_op(OpCode::IntAdd, Address::new(SpaceIndex(1), 0x1000), entry, Some(out), vec![a, b]);

        let rule = RuleConstantFold;
        let n = rule.apply(&mut fd, op).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fd.op(op).opcode, OpCode::Copy);
        let new_in = fd.op(op).inputs[0];
        assert_eq!(fd.varnodes.get(new_in).const_value(), Some(7));
    }

    #[test]
    fn term_order_swaps_const_to_rhs() {
        let mut fd = setup();
        let entry = fd.blocks.entry;
        let c = fd.varnodes.create_constant(fd.spaces.const_space(), 10, 4);
        let v = fd.varnodes.create(Address::new(SpaceIndex(1), 0x30), 4);
        fd.varnodes.get_mut(v).set_input();
        let out = fd.varnodes.create(Address::new(SpaceIndex(1), 0x10), 4);
        let op = fd.append_op(OpCode::IntAdd, Address::new(SpaceIndex(1), 0x1000), entry, Some(out), vec![c, v]);

        let rule = RuleTermOrder;
        assert_eq!(rule.apply(&mut fd, op).unwrap(), 1);
        assert_eq!(fd.op(op).inputs[0], v);
        assert_eq!(fd.op(op).inputs[1], c);
    }
}
