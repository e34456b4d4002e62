/// コメントデータベースとソート
///
/// CommentDatabase は (function, address, uniq) で順序付けられたコメント集合。
/// CommentSorter はFuncdataの中に実在するop/ブロックに対してコメントを配置する
/// ための Subsort key {index, order, pos} を計算する。

use crate::address::Address;
use crate::block::BlockId;
use crate::funcdata::Funcdata;
use bitflags::bitflags;
use std::collections::BTreeSet;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommentType: u32 {
        const USER          = 1 << 0;
        const HEADER        = 1 << 1;
        const WARNING       = 1 << 2;
        const WARNINGHEADER = 1 << 3;
        const NORETURN      = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CommentKey {
    function_addr: Address,
    addr: Address,
    uniq: u32,
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub comment_type: CommentType,
    pub function_addr: Address,
    pub addr: Address,
    pub uniq: u32,
    pub text: String,
    pub emitted: bool,
}

/// (function, address, uniq) の昇順で保持される集合
#[derive(Debug, Clone, Default)]
pub struct CommentDatabase {
    comments: BTreeSet<CommentKey>,
    text: std::collections::BTreeMap<CommentKey, (CommentType, String, bool)>,
}

impl CommentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同じ(function,address)内の最大uniqの次を自動採番する（既存が無ければ0）
    fn next_uniq(&self, function_addr: Address, addr: Address) -> u32 {
        self.comments
            .range(
                CommentKey { function_addr, addr, uniq: 0 }
                    ..CommentKey { function_addr, addr, uniq: u32::MAX },
            )
            .map(|k| k.uniq)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0)
    }

    pub fn add_comment(
        &mut self,
        comment_type: CommentType,
        function_addr: Address,
        addr: Address,
        text: impl Into<String>,
    ) -> u32 {
        let uniq = self.next_uniq(function_addr, addr);
        let key = CommentKey { function_addr, addr, uniq };
        self.comments.insert(key.clone());
        self.text.insert(key, (comment_type, text.into(), false));
        uniq
    }

    /// 同じ(function,address)内を後方走査し、完全一致するテキストがあれば追加をやめる。
    /// 前方の重複（挿入順でこのコメントより後に追加されるもの）は検出対象外。
    pub fn add_comment_no_duplicate(
        &mut self,
        comment_type: CommentType,
        function_addr: Address,
        addr: Address,
        text: impl Into<String>,
    ) -> bool {
        let text = text.into();
        let exists = self
            .comments
            .range(
                CommentKey { function_addr, addr, uniq: 0 }
                    ..CommentKey { function_addr, addr, uniq: u32::MAX },
            )
            .rev()
            .any(|k| self.text.get(k).map(|(_, t, _)| t == &text).unwrap_or(false));

        if exists {
            return false;
        }
        self.add_comment(comment_type, function_addr, addr, text);
        true
    }

    /// 関数内で comment_type が mask と交差するコメントをすべて削除
    pub fn clear_type(&mut self, function_addr: Address, mask: CommentType) {
        let to_remove: Vec<CommentKey> = self
            .begin_end_range(function_addr)
            .filter(|k| {
                self.text
                    .get(k)
                    .map(|(t, _, _)| t.intersects(mask))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for k in to_remove {
            self.comments.remove(&k);
            self.text.remove(&k);
        }
    }

    /// データベース全体を空にする
    pub fn clear_all(&mut self) {
        self.comments.clear();
        self.text.clear();
    }

    pub fn delete_comment(&mut self, function_addr: Address, addr: Address, uniq: u32) {
        let key = CommentKey { function_addr, addr, uniq };
        self.comments.remove(&key);
        self.text.remove(&key);
    }

    fn begin_end_range(&self, function_addr: Address) -> impl Iterator<Item = &CommentKey> {
        self.comments.range(
            CommentKey { function_addr, addr: Address::minimal_any_space(), uniq: 0 }
                ..=CommentKey { function_addr, addr: Address::maximal_any_space(), uniq: u32::MAX },
        )
    }

    /// 関数全体を (addr, uniq) 昇順で走査する
    pub fn iter_function(&self, function_addr: Address) -> impl Iterator<Item = Comment> + '_ {
        self.begin_end_range(function_addr).map(move |k| {
            let (ctype, text, emitted) = self.text.get(k).cloned().unwrap();
            Comment {
                comment_type: ctype,
                function_addr: k.function_addr,
                addr: k.addr,
                uniq: k.uniq,
                text,
                emitted,
            }
        })
    }

    /// 指定(function, address)内のコメントを(addr固定, uniq昇順)で走査
    pub fn iter_at(&self, function_addr: Address, addr: Address) -> impl Iterator<Item = Comment> + '_ {
        self.comments
            .range(
                CommentKey { function_addr, addr, uniq: 0 }
                    ..CommentKey { function_addr, addr, uniq: u32::MAX },
            )
            .map(move |k| {
                let (ctype, text, emitted) = self.text.get(k).cloned().unwrap();
                Comment {
                    comment_type: ctype,
                    function_addr: k.function_addr,
                    addr: k.addr,
                    uniq: k.uniq,
                    text,
                    emitted,
                }
            })
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

// Addressに無効空間番兵を追加するヘルパ（CommentDBの走査専用、architectureに依存しない）
impl Address {
    fn minimal_any_space() -> Address {
        Address::new(crate::address::SpaceIndex(0), 0)
    }
    fn maximal_any_space() -> Address {
        Address::new(crate::address::SpaceIndex(u32::MAX), u64::MAX)
    }
}

/// コメントの配置先を指すSubsortキー: ヘッダは index=-1、それ以外はブロックindex
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subsort {
    pub index: i64,
    pub order: u32,
    pub pos: u32,
}

/// ヘッダ系コメントのSubsort.index。header_basicとheader_unplacedはどちらも
/// index=-1で、orderだけがどちらの種類かを選ぶ（spec §4.4）。
pub const HEADER_INDEX: i64 = -1;
pub const HEADER_BASIC_ORDER: u32 = 0;
pub const HEADER_UNPLACED_ORDER: u32 = 1;

#[derive(Debug, Clone)]
pub struct PlacedComment {
    pub comment: Comment,
    pub subsort: Subsort,
}

/// Funcdataの中の実在するブロック/opへコメントを配置する
pub struct CommentSorter {
    display_unplaced: bool,
}

impl CommentSorter {
    pub fn new(display_unplaced: bool) -> Self {
        Self { display_unplaced }
    }

    /// 与えられた関数エントリアドレスと mask に一致するコメント列を配置する
    pub fn sort(
        &self,
        fd: &Funcdata,
        db: &CommentDatabase,
        function_addr: Address,
        entry_addr: Address,
        mask: CommentType,
    ) -> Vec<PlacedComment> {
        let mut pos_counter: u32 = 0;
        let mut out = Vec::new();

        for comment in db.iter_function(function_addr) {
            if !comment.comment_type.intersects(mask) {
                continue;
            }

            let subsort = match self.place_one(fd, &comment, entry_addr) {
                Some(mut s) => {
                    s.pos = pos_counter;
                    pos_counter += 1;
                    s
                }
                None => continue,
            };
            out.push(PlacedComment { comment, subsort });
        }

        out.sort_by_key(|p| p.subsort);
        out
    }

    fn place_one(&self, fd: &Funcdata, comment: &Comment, entry_addr: Address) -> Option<Subsort> {
        // 1. header型でエントリアドレスに一致 -> header_basic
        if comment.comment_type.contains(CommentType::HEADER) && comment.addr == entry_addr {
            return Some(Subsort { index: HEADER_INDEX, order: HEADER_BASIC_ORDER, pos: 0 });
        }

        if fd.ops().next().is_none() {
            // 5. 関数にopが無ければブロック0の先頭
            return Some(Subsort { index: 0, order: 0, pos: 0 });
        }

        // 2. comment.addr 以上で最小アドレスを持つopを探す
        if let Some(op) = fd.first_op_at_or_after(comment.addr) {
            if fd.block_contains_addr(op.parent, comment.addr) {
                return Some(Subsort { index: op.parent.0 as i64, order: op.seq.order, pos: 0 });
            }

            // 3. 直前のopを試す -> ブロック末尾に添付
            if let Some(prev) = fd.op_before(op.id) {
                if fd.block_contains_addr(prev.parent, comment.addr) {
                    return Some(Subsort { index: prev.parent.0 as i64, order: u32::MAX, pos: 0 });
                }
            }

            // 4. アドレスが厳密一致するopがあれば、ブロックが移動していても添付
            if op.seq.address == comment.addr {
                return Some(Subsort { index: op.parent.0 as i64, order: op.seq.order, pos: 0 });
            }
        } else if let Some(last) = fd.last_op() {
            if last.seq.address == comment.addr {
                return Some(Subsort { index: last.parent.0 as i64, order: last.seq.order, pos: 0 });
            }
            if fd.block_contains_addr(last.parent, comment.addr) {
                return Some(Subsort { index: last.parent.0 as i64, order: u32::MAX, pos: 0 });
            }
        }

        // 6. displayUnplacedならheader_unplaced、そうでなければ捨てる
        if self.display_unplaced {
            Some(Subsort { index: HEADER_INDEX, order: HEADER_UNPLACED_ORDER, pos: 0 })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceIndex;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(1), off)
    }

    #[test]
    fn ordering_is_funcaddr_addr_uniq_ascending() {
        let mut db = CommentDatabase::new();
        let f = addr(0x1000);
        db.add_comment(CommentType::USER, f, addr(0x2000), "b");
        db.add_comment(CommentType::USER, f, addr(0x1000), "a");
        db.add_comment(CommentType::USER, f, addr(0x1000), "a2");

        let texts: Vec<String> = db.iter_function(f).map(|c| c.text).collect();
        assert_eq!(texts, vec!["a", "a2", "b"]);
    }

    #[test]
    fn no_duplicate_suppresses_exact_text_match() {
        let mut db = CommentDatabase::new();
        let f = addr(0x1000);
        let a = addr(0x1010);
        assert!(db.add_comment_no_duplicate(CommentType::USER, f, a, "hello"));
        assert!(!db.add_comment_no_duplicate(CommentType::USER, f, a, "hello"));

        let matching: Vec<_> = db.iter_at(f, a).filter(|c| c.text == "hello").collect();
        assert_eq!(matching.len(), 1);
    }

    #[test]
    fn concrete_scenario_two_from_spec() {
        let mut db = CommentDatabase::new();
        let f = addr(0x1000);
        let a = addr(0x1010);
        db.add_comment(CommentType::USER, f, a, "hello");
        db.add_comment(CommentType::USER, f, a, "hello2");

        let texts: Vec<(String, u32)> = db.iter_function(f).map(|c| (c.text, c.uniq)).collect();
        assert_eq!(texts, vec![("hello".to_string(), 0), ("hello2".to_string(), 1)]);
    }

    #[test]
    fn clear_type_removes_only_matching_types() {
        let mut db = CommentDatabase::new();
        let f = addr(0x1000);
        db.add_comment(CommentType::USER, f, addr(0x10), "u");
        db.add_comment(CommentType::WARNING, f, addr(0x10), "w");
        db.clear_type(f, CommentType::WARNING);
        let texts: Vec<String> = db.iter_function(f).map(|c| c.text).collect();
        assert_eq!(texts, vec!["u"]);
    }

    /// concrete scenario 3 from spec.md §8: a header comment at the function
    /// entry sorts as {-1, 0, 0}. header_unplaced must share index=-1 with
    /// header_basic (spec §4.4), differing only in order.
    #[test]
    fn concrete_scenario_three_header_basic_subsort() {
        let spaces = crate::address::SpaceManager::new();
        let entry = addr(0x1000);
        let fd = crate::funcdata::Funcdata::new("f", entry, spaces);

        let mut db = CommentDatabase::new();
        db.add_comment(CommentType::HEADER, entry, entry, "banner");

        let sorter = CommentSorter::new(true);
        let placed = sorter.sort(&fd, &db, entry, entry, CommentType::HEADER);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].subsort, Subsort { index: -1, order: 0, pos: 0 });
    }

    #[test]
    fn header_basic_and_header_unplaced_share_index_minus_one() {
        let spaces = crate::address::SpaceManager::new();
        let entry = addr(0x1000);
        let mut fd = crate::funcdata::Funcdata::new("f", entry, spaces);
        let block = fd.blocks.entry;
        let out = fd.varnodes.create(addr(0x2000), 4);
        fd.append_op(crate::pcodeop::OpCode::Copy, entry, block, Some(out), vec![]);

        let mut db = CommentDatabase::new();
        db.add_comment(CommentType::HEADER, entry, entry, "banner");
        // Far past the only op's address and outside its block's range, so
        // placement falls through every step to header_unplaced.
        db.add_comment(CommentType::USER, entry, addr(0xffff), "stray");

        let sorter = CommentSorter::new(true);
        let placed = sorter.sort(&fd, &db, entry, entry, CommentType::HEADER | CommentType::USER);

        let basic = placed.iter().find(|p| p.comment.text == "banner").unwrap();
        assert_eq!(basic.subsort.index, HEADER_INDEX);
        assert_eq!(basic.subsort.order, HEADER_BASIC_ORDER);

        let stray = placed.iter().find(|p| p.comment.text == "stray").unwrap();
        assert_eq!(stray.subsort.index, HEADER_INDEX, "header_unplaced must share index -1 with header_basic");
        assert_eq!(stray.subsort.order, HEADER_UNPLACED_ORDER);
    }
}
