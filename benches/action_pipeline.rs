//! Fixed-point rewrite pipeline benchmarks: how long a sweep-to-stability run
//! takes as the number of foldable ops in a function grows.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use decompiler_core::action::{Action, ActionTree, Group};
use decompiler_core::address::{Address, SpaceKind, SpaceManager};
use decompiler_core::funcdata::Funcdata;
use decompiler_core::pcodeop::OpCode;
use decompiler_core::rules::default_rule_group;

/// Builds a function with `n` independent `(c1 + c2) * 0` chains, all of which
/// the default rule group should fold away to constants.
fn make_foldable_function(n: u32) -> Funcdata {
    let mut spaces = SpaceManager::new();
    let code_space = spaces.add_space("ram", SpaceKind::Ram, 1, 8);
    let register_space = spaces.add_space("register", SpaceKind::Register, 1, 4);

    let mut fd = Funcdata::new("bench_fn", Address::new(code_space, 0), spaces);
    let entry = fd.blocks.entry;

    for i in 0..n {
        let base = (i as u64) * 0x10;
        let c1 = fd.varnodes.create_constant(fd.spaces.const_space(), 3, 4);
        let c2 = fd.varnodes.create_constant(fd.spaces.const_space(), 5, 4);
        let sum = fd.varnodes.create(Address::new(register_space, base), 4);
        fd.append_op(OpCode::IntAdd, Address::new(code_space, base), entry, Some(sum), vec![c1, c2]);

        let zero = fd.varnodes.create_constant(fd.spaces.const_space(), 0, 4);
        let product = fd.varnodes.create(Address::new(register_space, base + 4), 4);
        fd.append_op(
            OpCode::IntMult,
            Address::new(code_space, base + 4),
            entry,
            Some(product),
            vec![sum, zero],
        );
    }
    fd
}

fn bench_fixed_point_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("action_pipeline_fixed_point");
    for &n in &[10u32, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut fd = make_foldable_function(n);
                let mut tree = ActionTree::new(Action::Group(Group::new(
                    "root",
                    vec![Action::Group(default_rule_group())],
                )));
                tree.reset(&fd);
                tree.perform(&mut fd).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fixed_point_sweep);
criterion_main!(benches);
