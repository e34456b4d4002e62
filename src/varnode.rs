/// Varnode: IRが使う記憶場所
///
/// 生成はオン・デマンドで (address, size, definition) によってキーされ、どの
/// opからも到達できなくなった時点で解放される。定数Varnodeは定数空間に存在し、
/// offsetがそのまま値になる。{input, written, free} のいずれか一つだけが立つ。

use crate::address::{Address, SpaceIndex};
use crate::pcodeop::PcodeOpId;
use bitflags::bitflags;
use std::collections::BTreeSet;

/// Varnodeの一意id（アリーナ内インデックス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarnodeId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarnodeFlags: u32 {
        const INPUT            = 1 << 0;
        const CONSTANT         = 1 << 1;
        const WRITTEN          = 1 << 2;
        const ADDRTIED         = 1 << 3;
        const PERSIST          = 1 << 4;
        const FREE             = 1 << 5;
        const MARK             = 1 << 6;
        const INCIDENTAL       = 1 << 7;
        const HERITAGE_KNOWN   = 1 << 8;
        const ACTIVE_HERITAGE  = 1 << 9;
        const WRITEMASK        = 1 << 10;
    }
}

/// 被演算子としての使用箇所: (opのid, そのopにおける入力スロット番号)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Descendant {
    pub op: PcodeOpId,
    pub slot: u32,
}

#[derive(Debug, Clone)]
pub struct Varnode {
    pub id: VarnodeId,
    pub address: Address,
    pub size: u32,
    /// この Varnode を定義する op。written フラグが立つならSome。
    pub definition: Option<PcodeOpId>,
    /// このVarnodeを使用するop+スロットの多重集合（昇順で安定）
    pub descendants: BTreeSet<Descendant>,
    pub high: Option<crate::merge::HighVariableId>,
    pub flags: VarnodeFlags,
}

impl Varnode {
    pub fn new_free(id: VarnodeId, address: Address, size: u32) -> Self {
        Self {
            id,
            address,
            size,
            definition: None,
            descendants: BTreeSet::new(),
            high: None,
            flags: VarnodeFlags::FREE,
        }
    }

    pub fn new_constant(id: VarnodeId, const_space: SpaceIndex, value: u64, size: u32) -> Self {
        Self {
            id,
            address: Address::new(const_space, value),
            size,
            definition: None,
            descendants: BTreeSet::new(),
            high: None,
            flags: VarnodeFlags::CONSTANT | VarnodeFlags::FREE,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(VarnodeFlags::CONSTANT)
    }

    pub fn is_input(&self) -> bool {
        self.flags.contains(VarnodeFlags::INPUT)
    }

    pub fn is_written(&self) -> bool {
        self.flags.contains(VarnodeFlags::WRITTEN)
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(VarnodeFlags::FREE)
    }

    pub fn const_value(&self) -> Option<u64> {
        self.is_constant().then(|| self.address.offset())
    }

    /// 定義opを設定する。written/input/freeは排他なので同時に付け替える。
    pub fn set_definition(&mut self, op: PcodeOpId) {
        self.definition = Some(op);
        self.flags.remove(VarnodeFlags::FREE | VarnodeFlags::INPUT);
        self.flags.insert(VarnodeFlags::WRITTEN);
    }

    pub fn set_input(&mut self) {
        self.definition = None;
        self.flags.remove(VarnodeFlags::FREE | VarnodeFlags::WRITTEN);
        self.flags.insert(VarnodeFlags::INPUT);
    }

    pub fn add_descendant(&mut self, op: PcodeOpId, slot: u32) {
        self.descendants.insert(Descendant { op, slot });
    }

    pub fn remove_descendant(&mut self, op: PcodeOpId, slot: u32) {
        self.descendants.remove(&Descendant { op, slot });
    }

    /// このVarnodeがどのopからも参照されていないか（定義opそのものは除く）
    pub fn is_unreferenced(&self) -> bool {
        self.descendants.is_empty()
    }

    /// 定義済み(written)と入力(input)と未定(free)のうち、厳密に一つだけが立つこと
    pub fn invariant_holds(&self) -> bool {
        let written = self.flags.contains(VarnodeFlags::WRITTEN);
        let input = self.flags.contains(VarnodeFlags::INPUT);
        let free = self.flags.contains(VarnodeFlags::FREE);
        (written as u8 + input as u8 + free as u8) == 1
    }
}

/// Varnodeアリーナ。(address, size, definition) キーで検索可能。
///
/// idは安定であることが前提（op側がVarnodeIdを非所有参照として持つ）。回収は
/// Vecの圧縮ではなくtombstone化+free-listで行い、既存の参照先indexを動かさない。
#[derive(Debug, Clone, Default)]
pub struct VarnodeStore {
    arena: Vec<Varnode>,
    tombstoned: BTreeSet<VarnodeId>,
    free_list: Vec<VarnodeId>,
}

impl VarnodeStore {
    pub fn new() -> Self {
        Self { arena: Vec::new(), tombstoned: BTreeSet::new(), free_list: Vec::new() }
    }

    fn alloc_slot(&mut self) -> VarnodeId {
        if let Some(id) = self.free_list.pop() {
            self.tombstoned.remove(&id);
            id
        } else {
            let id = VarnodeId(self.arena.len() as u32);
            self.arena.push(Varnode::new_free(id, Address::invalid(), 0));
            id
        }
    }

    pub fn create(&mut self, address: Address, size: u32) -> VarnodeId {
        let id = self.alloc_slot();
        self.arena[id.0 as usize] = Varnode::new_free(id, address, size);
        id
    }

    pub fn create_constant(&mut self, const_space: SpaceIndex, value: u64, size: u32) -> VarnodeId {
        let id = self.alloc_slot();
        self.arena[id.0 as usize] = Varnode::new_constant(id, const_space, value, size);
        id
    }

    pub fn get(&self, id: VarnodeId) -> &Varnode {
        &self.arena[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        &mut self.arena[id.0 as usize]
    }

    pub fn is_tombstoned(&self, id: VarnodeId) -> bool {
        self.tombstoned.contains(&id)
    }

    /// 生存中（tombstone化されていない）Varnodeのみを列挙する
    pub fn iter(&self) -> impl Iterator<Item = &Varnode> {
        self.arena.iter().filter(|vn| !self.tombstoned.contains(&vn.id))
    }

    /// どのopからも到達できなくなった（free かつ descendantsが空で定義もない）Varnodeを
    /// tombstone化する。indexは動かさないのでVarnodeIdは回収後も引き続き安定。
    pub fn collect_garbage(&mut self) -> usize {
        let mut reclaimed = Vec::new();
        for vn in &self.arena {
            if vn.is_free() && vn.is_unreferenced() && !vn.is_constant() && !self.tombstoned.contains(&vn.id) {
                reclaimed.push(vn.id);
            }
        }
        for id in &reclaimed {
            self.tombstoned.insert(*id);
            self.free_list.push(*id);
        }
        reclaimed.len()
    }
}
