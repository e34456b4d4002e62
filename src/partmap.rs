/// PartMap: 分割点によって値を持つ、線形順序キー空間からの永続的マッピング
///
/// あるキー space 上の点 P は、P以下の最大の分割点の値を継承する（なければ
/// デフォルト値）。split は冪等、clear_range は区間内の分割点を取り除きつつ
/// 両端点だけは継承値で残す。

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct PartMap<K: Ord + Clone, V: Clone> {
    default: V,
    splits: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> PartMap<K, V> {
    pub fn new(default: V) -> Self {
        Self { default, splits: BTreeMap::new() }
    }

    /// pに到達する値: p以下の最大split、無ければデフォルト
    pub fn get_value(&self, p: &K) -> V {
        match self.splits.range(..=p.clone()).next_back() {
            Some((_, v)) => v.clone(),
            None => self.default.clone(),
        }
    }

    /// pにおける分割点を作る（なければ現在の継承値をコピーして作る）。冪等。
    pub fn split(&mut self, p: K) {
        if self.splits.contains_key(&p) {
            return;
        }
        let inherited = self.get_value(&p);
        self.splits.insert(p, inherited);
    }

    /// pに分割点を作り、その値をvalに設定する
    pub fn split_and_set(&mut self, p: K, val: V) {
        self.splits.insert(p, val);
    }

    /// [a, b) 内の分割点を取り除く。bは取り除かれる直前の継承値で新たな分割点
    /// として導入され、それより前の区間はaを新たに分割点化せずそのまま上流の
    /// 値を継承し続ける（クエリ結果は変わらない）。
    pub fn clear_range(&mut self, a: K, b: K)
    where
        K: std::fmt::Debug,
    {
        debug_assert!(a <= b, "clear_range requires a <= b, got {:?} .. {:?}", a, b);
        let value_at_b = self.get_value(&b);

        let to_remove: Vec<K> = self
            .splits
            .range(a..b.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for k in to_remove {
            self.splits.remove(&k);
        }

        self.splits.insert(b, value_at_b);
    }

    /// pの値と、隣接する下限/上限split点（あれば）を返す
    pub fn bounds(&self, p: &K) -> (V, Option<&K>, Option<&K>) {
        let value = self.get_value(p);
        let lower = self.splits.range(..=p.clone()).next_back().map(|(k, _)| k);
        let upper = self.splits.range(p.clone()..).find(|(k, _)| *k != p).map(|(k, _)| k);
        (value, lower, upper)
    }

    pub fn split_points(&self) -> impl Iterator<Item = &K> {
        self.splits.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// split(p); split(p) leaves the map indistinguishable from split(p) alone,
        /// for any sequence of prior splits/sets, generalized over arbitrary
        /// existing split points.
        #[test]
        fn split_is_idempotent_after_arbitrary_prior_splits(
            prior in prop::collection::vec((-50i32..50, 0i32..50), 0..10),
            p in -50i32..50,
        ) {
            let mut m: PartMap<i32, i32> = PartMap::new(0);
            for (point, value) in prior {
                m.split_and_set(point, value);
            }
            m.split(p);
            let once = m.splits.clone();
            m.split(p);
            prop_assert_eq!(m.splits, once);
        }

        /// clear_range(a, b) removes exactly the split points in [a, b) and leaves
        /// the value the range inherited at its right edge reachable at b.
        #[test]
        fn clear_range_removes_only_the_interior(
            mut points in prop::collection::vec((-50i32..50, 0i32..50), 1..8),
            gap in (0i32..100, 0i32..100),
        ) {
            points.sort_by_key(|&(p, _)| p);
            points.dedup_by_key(|&mut (p, _)| p);
            let (a, span) = gap;
            let b = a + span;

            let mut m: PartMap<i32, i32> = PartMap::new(-1);
            for &(point, value) in &points {
                m.split_and_set(point, value);
            }
            let value_at_b = m.get_value(&b);
            m.clear_range(a, b);

            for &(point, _) in &points {
                if point >= a && point < b {
                    prop_assert!(!m.splits.contains_key(&point));
                }
            }
            prop_assert_eq!(m.get_value(&b), value_at_b);
        }
    }

    #[test]
    fn split_idempotence() {
        let mut m: PartMap<i32, &str> = PartMap::new("D");
        m.split(10);
        let after_one = m.splits.clone();
        m.split(10);
        assert_eq!(m.splits, after_one);
    }

    #[test]
    fn concrete_scenario_from_spec() {
        let mut m: PartMap<i32, &str> = PartMap::new("D");
        m.split(10);
        m.split_and_set(20, "X");

        assert_eq!(m.get_value(&5), "D");
        assert_eq!(m.get_value(&10), "D");
        assert_eq!(m.get_value(&20), "X");
        assert_eq!(m.get_value(&25), "X");

        m.clear_range(12, 22);
        let points: Vec<i32> = m.split_points().copied().collect();
        assert_eq!(points, vec![10, 22]);
        assert_eq!(m.get_value(&15), "D");
        assert_eq!(m.get_value(&22), "X");
    }

    #[test]
    fn clear_range_removes_exactly_interior_keys() {
        let mut m: PartMap<i32, i32> = PartMap::new(0);
        m.split_and_set(1, 1);
        m.split_and_set(5, 5);
        m.split_and_set(10, 10);
        m.clear_range(2, 8);
        let points: Vec<i32> = m.split_points().copied().collect();
        assert_eq!(points, vec![1, 8, 10]);
        assert_eq!(m.get_value(&8), 5);
    }
}
