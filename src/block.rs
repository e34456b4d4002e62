/// BasicBlock / FlowBlock: 直線的なopの並びと制御フロー上の前後関係
///
/// 各ブロックは実行を通じて安定な整数indexを持つ。支配木・支配境界の計算は
/// petgraphのグラフ上で行う（heritageモジュールから呼ばれる）。

use crate::pcodeop::PcodeOpId;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub id: BlockId,
    pub ops: Vec<PcodeOpId>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
    /// predecessors と同じ長さ。各入辺がループの戻り辺かどうか。
    pub loop_entry: Vec<bool>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self { id, ..Default::default() }
    }
}

/// 関数のブロックグラフ。ブロックindexは生成後も安定。
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    blocks: Vec<BasicBlock>,
    pub entry: BlockId,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self { blocks: Vec::new(), entry: BlockId(0) }
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id));
        id
    }

    pub fn get(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId, is_loop_back: bool) {
        self.blocks[from.0 as usize].successors.push(to);
        let to_block = &mut self.blocks[to.0 as usize];
        to_block.predecessors.push(from);
        to_block.loop_entry.push(is_loop_back);
    }

    /// petgraphの有向グラフに変換する（支配木計算用）。NodeIndexはBlockId.0と一致させる。
    pub fn to_petgraph(&self) -> DiGraph<BlockId, ()> {
        let mut g = DiGraph::new();
        let mut idx_of: HashMap<BlockId, NodeIndex> = HashMap::new();
        for b in &self.blocks {
            let idx = g.add_node(b.id);
            idx_of.insert(b.id, idx);
        }
        for b in &self.blocks {
            for &succ in &b.successors {
                g.add_edge(idx_of[&b.id], idx_of[&succ], ());
            }
        }
        g
    }

    pub fn node_index_of(&self, id: BlockId) -> NodeIndex {
        NodeIndex::new(id.0 as usize)
    }
}
