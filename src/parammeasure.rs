/// ParamMeasure: パラメータ/戻り値としての妥当性ランク付け
///
/// 入力からの前方探索と出力からの後方探索を行い、固定のランクラダーに照らして
/// 各Varnodeをスコアリングする。ランクは小さいほど良い。
///
/// DIRECTREADとDIRECTWRITEWITHREADは同じ数値2を共有する（意図的な同一視）。
/// walkbackwardの中でwalkforwardが終端するために、この一致を保つ必要がある。

use crate::funcdata::Funcdata;
use crate::pcodeop::OpCode;
use crate::varnode::VarnodeId;

pub const BESTRANK: i32 = 1;
pub const WORSTRANK: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamRank {
    DirectRead,
    DirectWriteWithoutRead,
    DirectWriteWithRead,
    DirectWriteUnknownRead,
    SubFnOrThisFnParam,
    SubFnOrThisFnReturn,
    Indirect,
}

impl ParamRank {
    /// ランク値。DIRECTREADとDIRECTWRITEWITHREADは同じ値(2)を共有する。
    pub fn value(&self) -> i32 {
        match self {
            ParamRank::DirectRead => 2,
            ParamRank::DirectWriteWithoutRead => 3,
            ParamRank::DirectWriteWithRead => 2,
            ParamRank::DirectWriteUnknownRead => 4,
            ParamRank::SubFnOrThisFnParam => 5,
            ParamRank::SubFnOrThisFnReturn => 6,
            ParamRank::Indirect => WORSTRANK,
        }
    }
}

const MAX_DEPTH: u32 = 10;

/// ある入力Varnodeに対する最良のパラメータランクを求める
pub fn measure_param(fd: &Funcdata, vn: VarnodeId) -> ParamRank {
    walk_forward(fd, vn, 0, &mut Vec::new()).unwrap_or(ParamRank::Indirect)
}

/// ある出力Varnodeに対する最良の戻り値ランクを求める
pub fn measure_return(fd: &Funcdata, vn: VarnodeId) -> ParamRank {
    walk_backward(fd, vn, 0, &mut Vec::new()).unwrap_or(ParamRank::Indirect)
}

/// 入力から使用先(descendant)へ向かって前方に歩く。MULTIEQUALのloop-inスロットは
/// スキップする（ここではMULTIEQUALの2番目以降の入力スロットをloop-inとみなす簡約）。
fn walk_forward(fd: &Funcdata, vn: VarnodeId, depth: u32, visiting: &mut Vec<VarnodeId>) -> Option<ParamRank> {
    if depth >= MAX_DEPTH || visiting.contains(&vn) {
        return None;
    }
    visiting.push(vn);
    let result = walk_forward_inner(fd, vn, depth, visiting);
    visiting.pop();
    result
}

fn walk_forward_inner(fd: &Funcdata, vn: VarnodeId, depth: u32, visiting: &mut Vec<VarnodeId>) -> Option<ParamRank> {
    let v = fd.varnodes.get(vn);
    if v.descendants.is_empty() {
        return None;
    }

    let mut best: Option<ParamRank> = None;
    for desc in v.descendants.iter() {
        let op = fd.op(desc.op);
        if op.is_dead() {
            continue;
        }
        let rank = match op.opcode {
            OpCode::Call | OpCode::CallInd => Some(ParamRank::SubFnOrThisFnParam),
            OpCode::Return => Some(ParamRank::SubFnOrThisFnReturn),
            OpCode::MultiEqual => {
                // slot 0 は関数内での定義経路、それ以外はループバックエッジとみなしスキップ
                if desc.slot == 0 {
                    op.output.and_then(|out| walk_forward(fd, out, depth + 1, visiting))
                } else {
                    None
                }
            }
            OpCode::Load | OpCode::Store => Some(ParamRank::DirectRead),
            _ => op.output.and_then(|out| walk_forward(fd, out, depth + 1, visiting)),
        };
        best = better(best, rank);
    }
    best.or(Some(ParamRank::DirectRead))
}

/// 出力からその定義へ向かって後方に歩く。未読の書き込みのみが見つかった場合は
/// 前方探索へ切り替えてwith-read/without-readを判別する。
fn walk_backward(fd: &Funcdata, vn: VarnodeId, depth: u32, visiting: &mut Vec<VarnodeId>) -> Option<ParamRank> {
    if depth >= MAX_DEPTH || visiting.contains(&vn) {
        return None;
    }
    visiting.push(vn);
    let result = walk_backward_inner(fd, vn, depth, visiting);
    visiting.pop();
    result
}

fn walk_backward_inner(fd: &Funcdata, vn: VarnodeId, depth: u32, visiting: &mut Vec<VarnodeId>) -> Option<ParamRank> {
    let v = fd.varnodes.get(vn);
    let Some(def_id) = v.definition else {
        return None;
    };
    let op = fd.op(def_id);
    match op.opcode {
        OpCode::Call | OpCode::CallInd => Some(ParamRank::SubFnOrThisFnReturn),
        OpCode::MultiEqual => {
            let mut best = None;
            for (slot, &input) in op.inputs.iter().enumerate() {
                if slot != 0 {
                    continue; // loop-inスロットは後方探索でもスキップする
                }
                best = better(best, walk_backward(fd, input, depth + 1, visiting));
            }
            best
        }
        _ => {
            if v.is_unreferenced() {
                Some(ParamRank::DirectWriteWithoutRead)
            } else {
                // 読まれている場合、前方に歩いて実際にDIRECTREAD相当の消費があるか確認する
                match walk_forward(fd, vn, depth, &mut Vec::new()) {
                    Some(ParamRank::DirectRead) => Some(ParamRank::DirectWriteWithRead),
                    Some(_) | None => Some(ParamRank::DirectWriteUnknownRead),
                }
            }
        }
    }
}

fn better(a: Option<ParamRank>, b: Option<ParamRank>) -> Option<ParamRank> {
    match (a, b) {
        (None, x) => x,
        (x, None) => x,
        (Some(ra), Some(rb)) => Some(if ra.value() <= rb.value() { ra } else { rb }),
    }
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
    fn direct_read_and_direct_write_with_read_share_rank_value() {
        assert_eq!(ParamRank::DirectRead.value(), ParamRank::DirectWriteWithRead.value());
        assert_eq!(ParamRank::DirectRead.value(), 2);
    }

    #[test]
    fn unread_write_ranks_direct_write_without_read() {
        let mut fd = setup();
        let entry = fd.blocks.entry;
        let a = fd.varnodes.create_constant(fd.spaces.const_space(), 1, 4);
        let b = fd.varnodes.create_constant(fd.spaces.const_space(), 2, 4);
        let out = fd.varnodes.create(Address::new(SpaceIndex(1), 0x10), 4);
        fd.append_op(OpCode::IntAdd, Address::new(SpaceIndex(1), 0x1000), entry, Some(out), vec![a, b]);

        let rank = measure_return(&fd, out);
        assert_eq!(rank, ParamRank::DirectWriteWithoutRead);
    }

    #[test]
    fn param_consumed_by_call_ranks_as_subfn_param() {
        let mut fd = setup();
        let entry = fd.blocks.entry;
        let arg = fd.varnodes.create(Address::new(SpaceIndex(1), 0x10), 4);
        fd.varnodes.get_mut(arg).set_input();
        fd.append_op(OpCode::Call, Address::new(SpaceIndex(1), 0x1000), entry, None, vec![arg]);

        let rank = measure_param(&fd, arg);
        assert_eq!(rank, ParamRank::SubFnOrThisFnParam);
    }
}
