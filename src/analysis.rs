/// 式解析の補助群
///
/// 真偽値相関、加法正規化(TermOrder)、AddExpression同値、関数的等価性の
/// 4つの補助アルゴリズムを提供する。いずれもFuncdataを読むだけで書き換えない。

use crate::funcdata::Funcdata;
use crate::pcodeop::{OpCode, PcodeOpId};
use crate::varnode::VarnodeId;
use std::cmp::Ordering;

/// 真偽値式同士の相関
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Same,
    Complementary,
    Uncorrelated,
}

/// 与えられた2つのVarnodeが根とする真偽値式を、深さdepthまで再帰的に比較する
pub fn boolean_correlation(fd: &Funcdata, a: VarnodeId, b: VarnodeId, depth: u32) -> Correlation {
    if a == b {
        return Correlation::Same;
    }
    if depth == 0 {
        return Correlation::Uncorrelated;
    }

    let def_a = fd.varnodes.get(a).definition.map(|id| fd.op(id));
    let def_b = fd.varnodes.get(b).definition.map(|id| fd.op(id));

    match (def_a, def_b) {
        (Some(oa), Some(ob)) => correlate_ops(fd, oa.id, ob.id, depth),
        _ => Correlation::Uncorrelated,
    }
}

fn flip(c: Correlation) -> Correlation {
    match c {
        Correlation::Same => Correlation::Complementary,
        Correlation::Complementary => Correlation::Same,
        Correlation::Uncorrelated => Correlation::Uncorrelated,
    }
}

fn correlate_ops(fd: &Funcdata, a: PcodeOpId, b: PcodeOpId, depth: u32) -> Correlation {
    let op_a = fd.op(a);
    let op_b = fd.op(b);

    match (op_a.opcode, op_b.opcode) {
        (OpCode::BoolNegate, _) if op_a.inputs.len() == 1 => {
            let out_b = op_b.output.unwrap_or(op_a.inputs[0]);
            flip(boolean_correlation(fd, op_a.inputs[0], out_b, depth - 1))
        }
        (_, OpCode::BoolNegate) if op_b.inputs.len() == 1 => {
            let out_a = op_a.output.unwrap_or(op_b.inputs[0]);
            flip(boolean_correlation(fd, out_a, op_b.inputs[0], depth - 1))
        }
        (OpCode::BoolAnd, OpCode::BoolAnd)
        | (OpCode::BoolOr, OpCode::BoolOr)
        | (OpCode::BoolXor, OpCode::BoolXor) => compose_commutative(fd, op_a.inputs.clone(), op_b.inputs.clone(), depth),
        (OpCode::BoolAnd, OpCode::BoolOr) | (OpCode::BoolOr, OpCode::BoolAnd) => {
            de_morgan_complement(fd, op_a.inputs.clone(), op_b.inputs.clone(), depth)
        }
        (OpCode::IntLess, OpCode::IntLess) | (OpCode::IntSLess, OpCode::IntSLess) => {
            complementary_less_pair(fd, a, b)
        }
        _ if op_a.opcode == op_b.opcode && op_a.inputs == op_b.inputs => Correlation::Same,
        _ => Correlation::Uncorrelated,
    }
}

/// 可換演算の入力を両方の対応付けで試し、どちらかが一致すれば採用する
fn compose_commutative(fd: &Funcdata, ia: Vec<VarnodeId>, ib: Vec<VarnodeId>, depth: u32) -> Correlation {
    if ia.len() != 2 || ib.len() != 2 {
        return Correlation::Uncorrelated;
    }
    let direct = (
        boolean_correlation(fd, ia[0], ib[0], depth - 1),
        boolean_correlation(fd, ia[1], ib[1], depth - 1),
    );
    if direct.0 == Correlation::Same && direct.1 == Correlation::Same {
        return Correlation::Same;
    }
    let swapped = (
        boolean_correlation(fd, ia[0], ib[1], depth - 1),
        boolean_correlation(fd, ia[1], ib[0], depth - 1),
    );
    if swapped.0 == Correlation::Same && swapped.1 == Correlation::Same {
        return Correlation::Same;
    }
    Correlation::Uncorrelated
}

/// aの定義がBOOL_NEGATE(b)であるか、bの定義がBOOL_NEGATE(a)であるかを調べる。
/// BOOL_NEGATEの展開はdepth予算を消費しない（符号反転は構造として自明なため）。
fn is_negation_of(fd: &Funcdata, a: VarnodeId, b: VarnodeId) -> bool {
    let negates = |outer: VarnodeId, inner: VarnodeId| -> bool {
        fd.varnodes.get(outer).definition.is_some_and(|def_id| {
            let op = fd.op(def_id);
            op.opcode == OpCode::BoolNegate && op.inputs.first() == Some(&inner)
        })
    };
    negates(a, b) || negates(b, a)
}

/// De Morgan双対: `x AND y` と `!x OR !y` は常に相補（いずれかのペアリングで両方の
/// 入力が相補なら成立する）
fn de_morgan_complement(fd: &Funcdata, ia: Vec<VarnodeId>, ib: Vec<VarnodeId>, _depth: u32) -> Correlation {
    if ia.len() != 2 || ib.len() != 2 {
        return Correlation::Uncorrelated;
    }
    let direct = is_negation_of(fd, ia[0], ib[0]) && is_negation_of(fd, ia[1], ib[1]);
    let swapped = is_negation_of(fd, ia[0], ib[1]) && is_negation_of(fd, ia[1], ib[0]);
    if direct || swapped {
        Correlation::Complementary
    } else {
        Correlation::Uncorrelated
    }
}

/// "x < k <-> k-1 < x" の恒等式による相補ペア判定。0でのラップと符号ビット反転を保護する。
/// evaluate(a,b) == evaluate(b,a) を保つため、どちらが "x op k" でどちらが "k op x"
/// かを固定せず、両方の割り当てを試す。
fn complementary_less_pair(fd: &Funcdata, a: PcodeOpId, b: PcodeOpId) -> Correlation {
    let op_a = fd.op(a);
    let op_b = fd.op(b);
    if op_a.inputs.len() != 2 || op_b.inputs.len() != 2 {
        return Correlation::Uncorrelated;
    }
    let (a_lhs, a_rhs) = (op_a.inputs[0], op_a.inputs[1]);
    let (b_lhs, b_rhs) = (op_b.inputs[0], op_b.inputs[1]);

    let try_pair = |x_k: (VarnodeId, VarnodeId), k_x: (VarnodeId, VarnodeId)| -> Option<Correlation> {
        let (x1, k1) = x_k;
        let (k2, x2) = k_x;
        if x1 != x2 {
            return None;
        }
        let kv1 = fd.varnodes.get(k1).const_value()?;
        let kv2 = fd.varnodes.get(k2).const_value()?;
        if kv1 == 0 {
            // x < 0 は符号なしでは常に偽になるため恒等式が成り立たない
            return Some(Correlation::Uncorrelated);
        }
        Some(if kv2 == kv1.wrapping_sub(1) {
            Correlation::Complementary
        } else {
            Correlation::Uncorrelated
        })
    };

    // a が "x < k"、b が "k < x" の形
    if let Some(c) = try_pair((a_lhs, a_rhs), (b_lhs, b_rhs)) {
        if c == Correlation::Complementary {
            return c;
        }
    }
    // a が "k < x"、b が "x < k" の形（呼び出し順を入れ替えても同じ結果になるように）
    if let Some(c) = try_pair((b_lhs, b_rhs), (a_lhs, a_rhs)) {
        if c == Correlation::Complementary {
            return c;
        }
    }
    Correlation::Uncorrelated
}

/// INT_ADD木の1項: 係数付きの被演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Term {
    pub varnode: VarnodeId,
    pub coefficient: i64,
}

/// INT_ADD木（INT_MULTによる定数係数を辿る）を多重集合として正規化する
pub fn term_order_collect(fd: &Funcdata, root: VarnodeId) -> (Vec<Term>, i64) {
    let mut terms = Vec::new();
    let mut constant_sum = 0i64;
    collect_add_tree(fd, root, 1, &mut terms, &mut constant_sum);
    terms.sort_by(term_order_relation);
    (terms, constant_sum)
}

fn collect_add_tree(fd: &Funcdata, vn: VarnodeId, coeff: i64, terms: &mut Vec<Term>, constant_sum: &mut i64) {
    let v = fd.varnodes.get(vn);
    if let Some(c) = v.const_value() {
        *constant_sum += (c as i64).wrapping_mul(coeff);
        return;
    }
    if let Some(def) = v.definition {
        let op = fd.op(def).clone();
        match op.opcode {
            OpCode::IntAdd if op.inputs.len() == 2 => {
                collect_add_tree(fd, op.inputs[0], coeff, terms, constant_sum);
                collect_add_tree(fd, op.inputs[1], coeff, terms, constant_sum);
                return;
            }
            OpCode::IntMult if op.inputs.len() == 2 => {
                if let Some(c) = fd.varnodes.get(op.inputs[1]).const_value() {
                    collect_add_tree(fd, op.inputs[0], coeff.wrapping_mul(c as i64), terms, constant_sum);
                    return;
                }
                if let Some(c) = fd.varnodes.get(op.inputs[0]).const_value() {
                    collect_add_tree(fd, op.inputs[1], coeff.wrapping_mul(c as i64), terms, constant_sum);
                    return;
                }
            }
            _ => {}
        }
    }
    terms.push(Term { varnode: vn, coefficient: coeff });
}

/// 定数項を末尾にまとめ、係数は無視して項を順序付ける（この関数に来る時点で定数は
/// 既に分離されているので、残るのはVarnodeIdによる安定順序のみ）
fn term_order_relation(a: &Term, b: &Term) -> Ordering {
    a.varnode.0.cmp(&b.varnode.0)
}

/// 非定数項を最大2つと定数の合計を持つ加法式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddExpression {
    pub terms: Vec<Term>,
    pub constant: i64,
}

impl AddExpression {
    pub fn from_root(fd: &Funcdata, root: VarnodeId) -> Self {
        let (terms, constant) = term_order_collect(fd, root);
        AddExpression { terms, constant }
    }

    /// 定数が一致し、項が順不同で一致するなら同値
    pub fn equivalent(&self, other: &AddExpression) -> bool {
        if self.constant != other.constant || self.terms.len() != other.terms.len() {
            return false;
        }
        let mut a: Vec<Term> = self.terms.clone();
        let mut b: Vec<Term> = other.terms.clone();
        a.sort_by(term_order_relation);
        b.sort_by(term_order_relation);
        a == b
    }
}

/// functionalEqualityLevelの戻り値: 0=等価, -1=証明上不一致, k>0=k組の入力対に依存
pub type EqualityLevel = i32;

/// 2つのopの出力が構造的に等価かどうかを判定する。可換演算の入れ替えを考慮し、
/// LOADは同一アドレス・同一定義命令の場合のみ等価とみなす（近似）。
pub fn functional_equality_level(
    fd: &Funcdata,
    a: PcodeOpId,
    b: PcodeOpId,
    out1: &mut Vec<(VarnodeId, VarnodeId)>,
) -> EqualityLevel {
    let op_a = fd.op(a);
    let op_b = fd.op(b);

    if op_a.opcode != op_b.opcode {
        return -1;
    }
    if op_a.opcode == OpCode::Load {
        return if op_a.inputs == op_b.inputs && a == b { 0 } else { -1 };
    }
    if op_a.inputs.len() != op_b.inputs.len() {
        return -1;
    }

    let mut contingent = 0i32;
    let direct_ok = op_a
        .inputs
        .iter()
        .zip(op_b.inputs.iter())
        .all(|(&ia, &ib)| compare_input(fd, ia, ib, out1, &mut contingent));

    if direct_ok {
        return contingent;
    }

    if op_a.opcode.is_commutative() && op_a.inputs.len() == 2 {
        let mut swapped_out = Vec::new();
        let mut swapped_contingent = 0i32;
        let ok = compare_input(fd, op_a.inputs[0], op_b.inputs[1], &mut swapped_out, &mut swapped_contingent)
            && compare_input(fd, op_a.inputs[1], op_b.inputs[0], &mut swapped_out, &mut swapped_contingent);
        if ok {
            out1.extend(swapped_out);
            return swapped_contingent;
        }
    }
    -1
}

fn compare_input(
    fd: &Funcdata,
    a: VarnodeId,
    b: VarnodeId,
    out: &mut Vec<(VarnodeId, VarnodeId)>,
    contingent: &mut i32,
) -> bool {
    if a == b {
        return true;
    }
    let va = fd.varnodes.get(a);
    let vb = fd.varnodes.get(b);
    if let (Some(ca), Some(cb)) = (va.const_value(), vb.const_value()) {
        return ca == cb;
    }
    // 構造的には不明だが、実行時にa==bであれば全体が等価になるため、入力対依存として記録する
    out.push((a, b));
    *contingent += 1;
    true
}
