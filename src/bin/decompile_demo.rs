/// decompile-demo: 手組みのp-codeを指定数の関数に組み立て、既定のルール群を安定
/// するまで走らせて結果を表示する最小デモ。
///
/// Usage:
///   decompile-demo --functions 4

use anyhow::Result;
use clap::Parser;
use decompiler_core::action::{Action, ActionTree, Group};
use decompiler_core::address::{Address, SpaceKind, SpaceManager};
use decompiler_core::comment::CommentDatabase;
use decompiler_core::driver::{decompile_all, Job};
use decompiler_core::funcdata::Funcdata;
use decompiler_core::pcodeop::OpCode;
use decompiler_core::rules::default_rule_group;
use tracing::info;

#[derive(Parser)]
#[command(name = "decompile-demo")]
#[command(about = "Runs the default simplification rule group to fixed point over synthetic functions")]
struct Cli {
    /// Number of synthetic "0 + x" functions to decompile
    #[arg(short, long, default_value = "1")]
    functions: u32,
}

/// 0 + x を1つ組み込んだ小さな合成関数を作る。RuleZeroOpで x へ単純化されるはず。
fn build_sample_function(index: u32) -> Funcdata {
    let mut spaces = SpaceManager::new();
    let code_space = spaces.add_space("ram", SpaceKind::Ram, 1, 8);
    let register_space = spaces.add_space("register", SpaceKind::Register, 1, 4);

    let entry_addr = Address::new(code_space, 0x1000 + (index as u64) * 0x100);
    let mut fd = Funcdata::new(format!("sample_add_zero_{index}"), entry_addr, spaces);
    let entry = fd.blocks.entry;

    let zero = fd.varnodes.create_constant(fd.spaces.const_space(), 0, 4);
    let x = fd.varnodes.create(Address::new(register_space, 0x10), 4);
    fd.varnodes.get_mut(x).set_input();
    let out = fd.varnodes.create(Address::new(register_space, 0x20), 4);

    fd.append_op(OpCode::IntAdd, entry_addr, entry, Some(out), vec![zero, x]);
    fd
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let cli = Cli::parse();
    info!(functions = cli.functions, "decompile-demo starting");

    let tree = ActionTree::new(Action::Group(Group::new("root", vec![Action::Group(default_rule_group())])));
    let mut comments = CommentDatabase::new();

    let jobs: Vec<Job> = (0..cli.functions)
        .map(|i| Job { funcdata: build_sample_function(i), deadline: None })
        .collect();
    let results = decompile_all(&tree, jobs, &mut comments, 1);

    for result in &results {
        println!("function {}: aborted={} changes={}", result.name, result.aborted, result.change_count);
        if let Some(err) = &result.error {
            println!("  error: {err}");
        }
    }

    Ok(())
}
