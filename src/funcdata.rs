/// Funcdata: 関数1つ分の状態全体
///
/// 生存しているPcodeOpの順序集合、アドレスキーのVarnodeインデックス、
/// ブロックグラフ、コールスペック、プロトタイプ、シンボルテーブルビュー、
/// および各Actionが使うスクラッチ構造を保持する。

use crate::address::{Address, SpaceManager};
use crate::block::{BlockGraph, BlockId};
use crate::driver::BufferedCommentDb;
use crate::pcodeop::{OpCode, PcodeOp, PcodeOpId, PcodeOpStore, SeqNum};
use crate::varnode::{VarnodeId, VarnodeStore};
use std::collections::BTreeMap;

/// 呼び出し先の情報（この文書の範囲では最小限: アドレスとキルセットの代わりとなる
/// 効果のあるストレージ位置一覧を持つ）
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub call_op: PcodeOpId,
    pub target: Option<Address>,
    pub is_indirect: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FuncdataFlags {
    pub aborted: bool,
    pub heritage_pass: u32,
}

#[derive(Debug, Clone)]
pub struct Funcdata {
    pub name: String,
    pub entry_addr: Address,
    pub spaces: SpaceManager,
    pub varnodes: VarnodeStore,
    pub pcode: PcodeOpStore,
    pub blocks: BlockGraph,
    pub call_specs: Vec<CallSpec>,
    pub flags: FuncdataFlags,
    /// このジョブ中にActionやRuleが書き込んだコメント。ドライバが入力順で
    /// 共有CommentDatabaseへflushするまでここに溜まる。
    pub comments: BufferedCommentDb,
    next_seq_order: u32,
    /// (address, order) -> op、アドレス順に走査するために保つ索引
    addr_index: BTreeMap<(Address, u32), PcodeOpId>,
}

impl Funcdata {
    pub fn new(name: impl Into<String>, entry_addr: Address, spaces: SpaceManager) -> Self {
        let mut blocks = BlockGraph::new();
        blocks.add_block();
        Self {
            name: name.into(),
            entry_addr,
            spaces,
            varnodes: VarnodeStore::new(),
            pcode: PcodeOpStore::new(),
            blocks,
            call_specs: Vec::new(),
            flags: FuncdataFlags::default(),
            comments: BufferedCommentDb::new(),
            next_seq_order: 0,
            addr_index: BTreeMap::new(),
        }
    }

    /// 新しいopを末尾に追加する。parentブロックのops列とaddr_indexの両方を更新。
    pub fn append_op(
        &mut self,
        opcode: OpCode,
        address: Address,
        parent: BlockId,
        output: Option<VarnodeId>,
        inputs: Vec<VarnodeId>,
    ) -> PcodeOpId {
        let order = self.next_seq_order;
        self.next_seq_order += 1;
        let seq = SeqNum::new(address, order, 0);
        let id = self.pcode.insert(opcode, seq, parent, output, inputs.clone());

        if let Some(out) = output {
            self.varnodes.get_mut(out).set_definition(id);
        }
        for (slot, input) in inputs.iter().enumerate() {
            self.varnodes.get_mut(*input).add_descendant(id, slot as u32);
        }

        self.blocks.get_mut(parent).ops.push(id);
        self.addr_index.insert((address, order), id);
        id
    }

    pub fn op(&self, id: PcodeOpId) -> &PcodeOp {
        self.pcode.get(id)
    }

    pub fn op_mut(&mut self, id: PcodeOpId) -> &mut PcodeOp {
        self.pcode.get_mut(id)
    }

    pub fn ops(&self) -> impl Iterator<Item = &PcodeOp> {
        self.pcode.live()
    }

    pub fn mark_dead(&mut self, id: PcodeOpId) {
        let op = self.pcode.get(id).clone();
        if let Some(out) = op.output {
            // 出力の書き込み元を切る。Varnode自体の回収はVarnodeStore::collect_garbageが行う。
            let _ = out;
        }
        for (slot, input) in op.inputs.iter().enumerate() {
            self.varnodes.get_mut(*input).remove_descendant(id, slot as u32);
        }
        self.pcode.get_mut(id).mark_dead();
        self.addr_index.retain(|_, v| *v != id);
    }

    pub fn block_contains_addr(&self, block: BlockId, addr: Address) -> bool {
        let b = self.blocks.get(block);
        if b.ops.is_empty() {
            return false;
        }
        let first = self.pcode.get(b.ops[0]).seq.address;
        let last = self.pcode.get(*b.ops.last().unwrap()).seq.address;
        first <= addr && addr <= last
    }

    /// addr以上の最小アドレスを持つ生存op
    pub fn first_op_at_or_after(&self, addr: Address) -> Option<&PcodeOp> {
        self.addr_index
            .range((addr, 0)..)
            .map(|(_, id)| self.pcode.get(*id))
            .find(|op| !op.is_dead())
    }

    /// 与えられたopの直前の生存op（アドレス順）
    pub fn op_before(&self, id: PcodeOpId) -> Option<&PcodeOp> {
        let target = self.pcode.get(id).seq;
        self.addr_index
            .range(..(target.address, target.order))
            .rev()
            .map(|(_, id)| self.pcode.get(*id))
            .find(|op| !op.is_dead())
    }

    pub fn last_op(&self) -> Option<&PcodeOp> {
        self.addr_index
            .iter()
            .rev()
            .map(|(_, id)| self.pcode.get(*id))
            .find(|op| !op.is_dead())
    }
}
