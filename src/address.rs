/// アドレス空間とアドレス
///
/// Addressは (space, offset) のペアで、spaceはアーキテクチャ側のテーブルへの
/// インデックス。spaceがnullならそのAddressは不正（invalid）とみなす。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// アドレス空間の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceKind {
    Register,
    Ram,
    Stack,
    Constant,
    Unique,
}

/// アドレス空間テーブルの1エントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceDef {
    pub index: u32,
    pub name: String,
    pub kind: SpaceKind,
    pub word_size: u32,
    pub address_size: u32,
}

/// アーキテクチャ全体のアドレス空間テーブル
///
/// index 0 は常に constant 空間として予約する。
#[derive(Debug, Clone, Default)]
pub struct SpaceManager {
    spaces: Vec<AddressSpaceDef>,
}

pub const CONST_SPACE: SpaceIndex = SpaceIndex(0);

impl SpaceManager {
    /// 定数空間・unique空間を含む標準テーブルを作成
    pub fn new() -> Self {
        let mut mgr = Self { spaces: Vec::new() };
        mgr.add_space("const", SpaceKind::Constant, 1, 8);
        mgr.add_space("unique", SpaceKind::Unique, 1, 8);
        mgr
    }

    pub fn add_space(&mut self, name: &str, kind: SpaceKind, word_size: u32, address_size: u32) -> SpaceIndex {
        let index = self.spaces.len() as u32;
        self.spaces.push(AddressSpaceDef {
            index,
            name: name.to_string(),
            kind,
            word_size,
            address_size,
        });
        SpaceIndex(index)
    }

    pub fn get(&self, idx: SpaceIndex) -> Option<&AddressSpaceDef> {
        self.spaces.get(idx.0 as usize)
    }

    pub fn find_by_name(&self, name: &str) -> Option<SpaceIndex> {
        self.spaces.iter().find(|s| s.name == name).map(|s| SpaceIndex(s.index))
    }

    pub fn const_space(&self) -> SpaceIndex {
        CONST_SPACE
    }
}

/// アドレス空間テーブルへのインデックス。0番は定数空間として予約されている。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpaceIndex(pub u32);

/// MachExtreme: 空間内の正負の番兵値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachExtreme {
    Minimal,
    Maximal,
}

/// アドレス: (space, offset) のペア。space が None なら不正なアドレス。
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
pub struct Address {
    space: Option<SpaceIndex>,
    offset: u64,
    #[serde(skip)]
    extreme: Option<MachExtreme>,
}

impl Address {
    pub fn new(space: SpaceIndex, offset: u64) -> Self {
        Self { space: Some(space), offset, extreme: None }
    }

    /// 不正アドレス（spaceがnull）
    pub fn invalid() -> Self {
        Self { space: None, offset: 0, extreme: None }
    }

    /// 指定空間内の最小番兵アドレス
    pub fn minimal(space: SpaceIndex) -> Self {
        Self { space: Some(space), offset: 0, extreme: Some(MachExtreme::Minimal) }
    }

    /// 指定空間内の最大番兵アドレス
    pub fn maximal(space: SpaceIndex) -> Self {
        Self { space: Some(space), offset: u64::MAX, extreme: Some(MachExtreme::Maximal) }
    }

    pub fn is_invalid(&self) -> bool {
        self.space.is_none()
    }

    pub fn space(&self) -> Option<SpaceIndex> {
        self.space
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.space == other.space && self.offset == other.offset && self.extreme == other.extreme
    }
}

/// space-then-offset の全順序。番兵は自身の空間内で極値として振る舞う。
impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Address {
    /// -1 for the minimal sentinel, 0 for an ordinary offset, 1 for the maximal sentinel.
    fn extreme_rank(&self) -> i8 {
        match self.extreme {
            Some(MachExtreme::Minimal) => -1,
            None => 0,
            Some(MachExtreme::Maximal) => 1,
        }
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.space, other.space) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(s1), Some(s2)) => s1
                .cmp(&s2)
                .then_with(|| self.extreme_rank().cmp(&other.extreme_rank()))
                .then_with(|| self.offset.cmp(&other.offset)),
        }
    }
}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.space.hash(state);
        self.offset.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_iff_null_space() {
        assert!(Address::invalid().is_invalid());
        assert!(!Address::new(SpaceIndex(1), 0).is_invalid());
    }

    #[test]
    fn ordering_is_space_then_offset() {
        let a = Address::new(SpaceIndex(1), 10);
        let b = Address::new(SpaceIndex(1), 20);
        let c = Address::new(SpaceIndex(2), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn sentinels_are_extreme_within_space() {
        let min = Address::minimal(SpaceIndex(1));
        let max = Address::maximal(SpaceIndex(1));
        let mid = Address::new(SpaceIndex(1), 0x1000);
        assert!(min < mid);
        assert!(mid < max);
    }

    #[test]
    fn sentinels_beat_same_offset_real_address() {
        let min = Address::minimal(SpaceIndex(1));
        let max = Address::maximal(SpaceIndex(1));
        let zero = Address::new(SpaceIndex(1), 0);
        let top = Address::new(SpaceIndex(1), u64::MAX);
        assert!(min < zero);
        assert!(top < max);
    }

    #[test]
    fn space_manager_reserves_const_at_zero() {
        let mgr = SpaceManager::new();
        assert_eq!(mgr.const_space(), CONST_SPACE);
        assert_eq!(mgr.get(CONST_SPACE).unwrap().kind, SpaceKind::Constant);
    }
}
