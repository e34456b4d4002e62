/// PcodeOp: 三番地形式の単一命令
///
/// シーケンス番号 (address, order, time) が関数内の全順序を与える。
/// parentの命令列はこのopをちょうど1回だけ、順序どおりに含むことが不変条件。

use crate::address::Address;
use crate::block::BlockId;
use crate::varnode::VarnodeId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// PcodeOpの一意id（アリーナ内インデックス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PcodeOpId(pub u32);

/// P-code命令の種類（Ghidraのpcoderef.hdocに準拠した74種）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    Copy = 1,
    Load = 2,
    Store = 3,
    Branch = 4,
    CBranch = 5,
    BranchInd = 6,
    Call = 7,
    CallInd = 8,
    CallOther = 9,
    Return = 10,
    IntEqual = 11,
    IntNotEqual = 12,
    IntSLess = 13,
    IntSLessEqual = 14,
    IntLess = 15,
    IntLessEqual = 16,
    IntZExt = 17,
    IntSExt = 18,
    IntAdd = 19,
    IntSub = 20,
    IntCarry = 21,
    IntSCarry = 22,
    IntSBorrow = 23,
    Int2Comp = 24,
    IntNegate = 25,
    IntXor = 26,
    IntAnd = 27,
    IntOr = 28,
    IntLeft = 29,
    IntRight = 30,
    IntSRight = 31,
    IntMult = 32,
    IntDiv = 33,
    IntSDiv = 34,
    IntRem = 35,
    IntSRem = 36,
    BoolNegate = 37,
    BoolXor = 38,
    BoolAnd = 39,
    BoolOr = 40,
    FloatEqual = 41,
    FloatNotEqual = 42,
    FloatLess = 43,
    FloatLessEqual = 44,
    FloatNan = 46,
    FloatAdd = 47,
    FloatDiv = 48,
    FloatMult = 49,
    FloatSub = 50,
    FloatNeg = 51,
    FloatAbs = 52,
    FloatSqrt = 53,
    FloatInt2Float = 54,
    FloatFloat2Float = 55,
    FloatTrunc = 56,
    FloatCeil = 57,
    FloatFloor = 58,
    FloatRound = 59,
    MultiEqual = 60,
    Indirect = 61,
    Piece = 62,
    SubPiece = 63,
    Cast = 64,
    PtrAdd = 65,
    PtrSub = 66,
    SegmentOp = 67,
    CPoolRef = 68,
    New = 69,
    Insert = 70,
    Extract = 71,
    PopCount = 72,
    LzCount = 73,
}

impl OpCode {
    pub fn is_call(&self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallInd | OpCode::CallOther)
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            OpCode::IntAdd
                | OpCode::IntMult
                | OpCode::IntXor
                | OpCode::IntAnd
                | OpCode::IntOr
                | OpCode::BoolXor
                | OpCode::BoolAnd
                | OpCode::BoolOr
                | OpCode::IntEqual
                | OpCode::IntNotEqual
                | OpCode::FloatAdd
                | OpCode::FloatMult
        )
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, OpCode::Branch | OpCode::CBranch | OpCode::BranchInd)
    }
}

/// シーケンス番号: 関数内の命令の全順序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum {
    pub address: Address,
    pub order: u32,
    pub time: u32,
}

impl SeqNum {
    pub fn new(address: Address, order: u32, time: u32) -> Self {
        Self { address, order, time }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcodeOpFlags: u32 {
        const MARKER               = 1 << 0;
        const CALL                 = 1 << 1;
        const RETURN               = 1 << 2;
        const INCIDENTAL_COPY      = 1 << 3;
        const COMMUTATIVE          = 1 << 4;
        const BOOLEAN_OUTPUT       = 1 << 5;
        const BOOLEAN_FLIP         = 1 << 6;
        const SPECIAL_PROPAGATION  = 1 << 7;
        const DEAD                 = 1 << 8;
    }
}

#[derive(Debug, Clone)]
pub struct PcodeOp {
    pub id: PcodeOpId,
    pub opcode: OpCode,
    pub seq: SeqNum,
    pub parent: BlockId,
    pub output: Option<VarnodeId>,
    pub inputs: Vec<VarnodeId>,
    pub flags: PcodeOpFlags,
}

impl PcodeOp {
    pub fn new(
        id: PcodeOpId,
        opcode: OpCode,
        seq: SeqNum,
        parent: BlockId,
        output: Option<VarnodeId>,
        inputs: Vec<VarnodeId>,
    ) -> Self {
        let mut flags = PcodeOpFlags::empty();
        if opcode.is_call() {
            flags.insert(PcodeOpFlags::CALL);
        }
        if opcode == OpCode::Return {
            flags.insert(PcodeOpFlags::RETURN);
        }
        if opcode.is_commutative() {
            flags.insert(PcodeOpFlags::COMMUTATIVE);
        }
        if matches!(opcode, OpCode::MultiEqual | OpCode::Indirect) {
            flags.insert(PcodeOpFlags::MARKER);
        }
        Self { id, opcode, seq, parent, output, inputs, flags }
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(PcodeOpFlags::DEAD)
    }

    pub fn mark_dead(&mut self) {
        self.flags.insert(PcodeOpFlags::DEAD);
    }

    pub fn is_marker(&self) -> bool {
        self.flags.contains(PcodeOpFlags::MARKER)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PcodeOpStore {
    arena: Vec<PcodeOp>,
}

impl PcodeOpStore {
    pub fn new() -> Self {
        Self { arena: Vec::new() }
    }

    pub fn insert(
        &mut self,
        opcode: OpCode,
        seq: SeqNum,
        parent: BlockId,
        output: Option<VarnodeId>,
        inputs: Vec<VarnodeId>,
    ) -> PcodeOpId {
        let id = PcodeOpId(self.arena.len() as u32);
        self.arena.push(PcodeOp::new(id, opcode, seq, parent, output, inputs));
        id
    }

    pub fn get(&self, id: PcodeOpId) -> &PcodeOp {
        &self.arena[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: PcodeOpId) -> &mut PcodeOp {
        &mut self.arena[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PcodeOp> {
        self.arena.iter()
    }

    pub fn live(&self) -> impl Iterator<Item = &PcodeOp> {
        self.arena.iter().filter(|op| !op.is_dead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, SpaceIndex};

    #[test]
    fn seqnum_total_order() {
        let a1 = SeqNum::new(Address::new(SpaceIndex(1), 0x100), 0, 0);
        let a2 = SeqNum::new(Address::new(SpaceIndex(1), 0x100), 1, 0);
        assert!(a1 < a2);
    }

    #[test]
    fn multiequal_and_indirect_are_markers() {
        let seq = SeqNum::new(Address::new(SpaceIndex(1), 0), 0, 0);
        let op = PcodeOp::new(PcodeOpId(0), OpCode::MultiEqual, seq, BlockId(0), None, vec![]);
        assert!(op.is_marker());
    }
}
