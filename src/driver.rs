/// 並列ドライバ: 決定的な出力を保ちながら束縛された並行度で多数の関数を分解する
///
/// 関数ごとに: (1) Actionツリーを複製し、(2) 並行度>1ならプロセス全体の
/// CommentDatabaseをBufferedCommentDbで包み、(3) クローンしたツリーに対して
/// reset; perform を呼び、(4) 完了時にバッファされたコメント書き込みを
/// 入力順でフラッシュする。

use crate::action::{Action, ActionTree};
use crate::comment::{CommentDatabase, CommentType};
use crate::address::Address;
use crate::error::{CoreError, CoreResult};
use crate::funcdata::Funcdata;
use std::time::Instant;
use xxhash_rust::xxh3::Xxh3;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Content hash of a function's live p-code, stable across runs given the same
/// input (op order, opcode, operand addresses/sizes). Intended as a
/// memoization key for callers that want to skip re-decompiling an unchanged
/// function across `decompile_all` invocations; this driver does not itself
/// cache across calls, only within one.
pub fn function_content_hash(fd: &Funcdata) -> u64 {
    let mut hasher = Xxh3::new();
    for op in fd.ops() {
        hasher.update(&(op.opcode as u8).to_le_bytes());
        hasher.update(&op.seq.address.offset().to_le_bytes());
        hasher.update(&op.seq.order.to_le_bytes());
        for input in &op.inputs {
            let vn = fd.varnodes.get(*input);
            hasher.update(&vn.address.offset().to_le_bytes());
            hasher.update(&vn.size.to_le_bytes());
        }
    }
    hasher.digest()
}

/// コメントDBへの書き込みを種類ごとに順序保持したまま記録するバッファ。
/// 読み取りは下位のDBにそのまま委譲する。
#[derive(Debug, Default)]
pub struct BufferedCommentDb {
    clears: Vec<ClearOp>,
    deletes: Vec<DeleteOp>,
    adds: Vec<AddOp>,
    adds_no_dup: Vec<AddOp>,
}

#[derive(Debug, Clone)]
enum ClearOp {
    All,
    Type(Address, CommentType),
}

#[derive(Debug, Clone)]
struct DeleteOp {
    function_addr: Address,
    addr: Address,
    uniq: u32,
}

#[derive(Debug, Clone)]
struct AddOp {
    comment_type: CommentType,
    function_addr: Address,
    addr: Address,
    text: String,
}

impl BufferedCommentDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_comment(&mut self, comment_type: CommentType, function_addr: Address, addr: Address, text: impl Into<String>) {
        self.adds.push(AddOp { comment_type, function_addr, addr, text: text.into() });
    }

    /// 楽観的に常にtrueを返す。実際の重複排除はflush時に行う。
    pub fn add_comment_no_duplicate(&mut self, comment_type: CommentType, function_addr: Address, addr: Address, text: impl Into<String>) -> bool {
        self.adds_no_dup.push(AddOp { comment_type, function_addr, addr, text: text.into() });
        true
    }

    pub fn delete_comment(&mut self, function_addr: Address, addr: Address, uniq: u32) {
        self.deletes.push(DeleteOp { function_addr, addr, uniq });
    }

    pub fn clear_type(&mut self, function_addr: Address, mask: CommentType) {
        self.clears.push(ClearOp::Type(function_addr, mask));
    }

    pub fn clear_all(&mut self) {
        self.clears.push(ClearOp::All);
    }

    /// clears → deletes → adds → adds-no-dup の順にtargetへ適用する。各カテゴリ内は
    /// 挿入順を保つ。
    pub fn flush(self, target: &mut CommentDatabase) {
        for op in self.clears {
            match op {
                ClearOp::All => target.clear_all(),
                ClearOp::Type(f, mask) => target.clear_type(f, mask),
            }
        }
        for op in self.deletes {
            target.delete_comment(op.function_addr, op.addr, op.uniq);
        }
        for op in self.adds {
            target.add_comment(op.comment_type, op.function_addr, op.addr, op.text);
        }
        for op in self.adds_no_dup {
            target.add_comment_no_duplicate(op.comment_type, op.function_addr, op.addr, op.text);
        }
    }
}

fn check_deadline(deadline: Option<Instant>) -> CoreResult<()> {
    if let Some(dl) = deadline {
        if Instant::now() >= dl {
            return Err(CoreError::low_level("function decompilation deadline exceeded"));
        }
    }
    Ok(())
}

/// Action間でdeadlineを確認しながらActionツリーを安定化させる
fn run_with_deadline(action: &mut Action, fd: &mut Funcdata, deadline: Option<Instant>) -> CoreResult<u32> {
    match action {
        Action::Group(g) => {
            let mut total = 0u32;
            let mut consecutive_zero = 0u32;
            let mut sweep = 0u32;
            loop {
                let mut sweep_total = 0u32;
                for child in &mut g.children {
                    sweep_total += run_with_deadline(child, fd, deadline)?;
                }
                total += sweep_total;
                sweep += 1;
                if sweep_total == 0 {
                    consecutive_zero += 1;
                } else {
                    consecutive_zero = 0;
                }
                if consecutive_zero >= 2 {
                    break;
                }
                if let Some(budget) = g.budget {
                    if sweep >= budget {
                        break;
                    }
                }
            }
            Ok(total)
        }
        other => {
            check_deadline(deadline)?;
            other.perform(fd)
        }
    }
}

/// 1関数分の入力: 名前付きのFuncdataと任意のdeadline
pub struct Job {
    pub funcdata: Funcdata,
    pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct JobResult {
    pub name: String,
    pub aborted: bool,
    pub change_count: u32,
    pub error: Option<String>,
    /// Content hash of the function's p-code *before* this pass ran, usable by
    /// a caller as a memoization key across separate `decompile_all` calls.
    pub content_hash: u64,
}

/// 単一ジョブを分解する。abortFunctionフックはLowLevel失敗時にabortedを立てることで表す。
fn decompile_one(tree_template: &ActionTree, mut job: Job) -> (Funcdata, JobResult) {
    let mut tree = tree_template.clone_current_action();
    tree.reset(&job.funcdata);
    let content_hash = function_content_hash(&job.funcdata);

    let name = job.funcdata.name.clone();
    match run_with_deadline(&mut tree.root, &mut job.funcdata, job.deadline) {
        Ok(n) => {
            let aborted = job.funcdata.flags.aborted;
            (job.funcdata, JobResult { name, aborted, change_count: n, error: None, content_hash })
        }
        Err(e) => {
            job.funcdata.flags.aborted = true;
            let msg = e.to_string();
            (job.funcdata, JobResult { name, aborted: true, change_count: 0, error: Some(msg), content_hash })
        }
    }
}

/// 複数の関数を決定的な順序で分解する。concurrency<=1なら直列に実行する。
/// concurrency>1かつ"parallel"featureが有効ならrayonのスコープ付きプールで実行する。
/// いずれの経路でも結果は入力順に並ぶ。
pub fn decompile_all(
    tree_template: &ActionTree,
    jobs: Vec<Job>,
    comments: &mut CommentDatabase,
    concurrency: usize,
) -> Vec<JobResult> {
    if concurrency <= 1 {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (fd, result) = decompile_one(tree_template, job);
            fd.comments.flush(comments);
            results.push(result);
        }
        return results;
    }

    #[cfg(feature = "parallel")]
    {
        let outputs: Vec<(Funcdata, JobResult)> = jobs
            .into_par_iter()
            .with_max_len(1)
            .map(|job| decompile_one(tree_template, job))
            .collect();
        let mut results = Vec::with_capacity(outputs.len());
        for (fd, result) in outputs {
            // 並列経路でもflushは収集後にここで入力順に行う。
            fd.comments.flush(comments);
            results.push(result);
        }
        return results;
    }

    #[cfg(not(feature = "parallel"))]
    {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (fd, result) = decompile_one(tree_template, job);
            fd.comments.flush(comments);
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionState, Group};
    use crate::address::{Address, SpaceIndex, SpaceManager};
    use crate::comment::CommentType;

    #[test]
    fn content_hash_is_stable_and_distinguishes_functions() {
        use crate::pcodeop::OpCode;

        let spaces = SpaceManager::new();
        let mut fd_a = Funcdata::new("a", Address::new(SpaceIndex(1), 0), spaces.clone());
        let entry_a = fd_a.blocks.entry;
        let c1 = fd_a.varnodes.create_constant(fd_a.spaces.const_space(), 1, 4);
        let c2 = fd_a.varnodes.create_constant(fd_a.spaces.const_space(), 2, 4);
        let out_a = fd_a.varnodes.create(Address::new(SpaceIndex(1), 0x10), 4);
        fd_a.append_op(OpCode::IntAdd, Address::new(SpaceIndex(1), 0x1000), entry_a, Some(out_a), vec![c1, c2]);

        let mut fd_b = Funcdata::new("b", Address::new(SpaceIndex(1), 0), spaces);
        let entry_b = fd_b.blocks.entry;
        let c3 = fd_b.varnodes.create_constant(fd_b.spaces.const_space(), 1, 4);
        let c4 = fd_b.varnodes.create_constant(fd_b.spaces.const_space(), 3, 4);
        let out_b = fd_b.varnodes.create(Address::new(SpaceIndex(1), 0x10), 4);
        fd_b.append_op(OpCode::IntAdd, Address::new(SpaceIndex(1), 0x1000), entry_b, Some(out_b), vec![c3, c4]);

        assert_eq!(function_content_hash(&fd_a), function_content_hash(&fd_a));
        assert_ne!(function_content_hash(&fd_a), function_content_hash(&fd_b));
    }

    #[test]
    fn buffered_flush_applies_in_clears_deletes_adds_order() {
        let mut db = CommentDatabase::new();
        let f = Address::new(SpaceIndex(1), 0x1000);
        let a = Address::new(SpaceIndex(1), 0x10);
        db.add_comment(CommentType::USER, f, a, "stale");

        let mut buf = BufferedCommentDb::new();
        buf.clear_type(f, CommentType::USER);
        buf.add_comment(CommentType::USER, f, a, "fresh");
        buf.flush(&mut db);

        let texts: Vec<String> = db.iter_function(f).map(|c| c.text).collect();
        assert_eq!(texts, vec!["fresh"]);
    }

    #[test]
    fn decompile_all_preserves_input_order() {
        let tree = ActionTree::new(Action::Group(Group::new("root", vec![])));
        let mut comments = CommentDatabase::new();
        let jobs: Vec<Job> = (0..4)
            .map(|i| {
                let spaces = SpaceManager::new();
                let fd = Funcdata::new(format!("f{i}"), Address::new(SpaceIndex(1), i as u64), spaces);
                Job { funcdata: fd, deadline: None }
            })
            .collect();

        let results = decompile_all(&tree, jobs, &mut comments, 1);
        let names: Vec<String> = results.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["f0", "f1", "f2", "f3"]);
    }

    #[test]
    fn decompile_all_flushes_comments_written_during_the_run() {
        let tree = ActionTree::new(Action::Group(Group::new(
            "root",
            vec![Action::Primitive(Box::new(CommentingPrimitive), ActionState::default())],
        )));
        let mut comments = CommentDatabase::new();
        let spaces = SpaceManager::new();
        let entry = Address::new(SpaceIndex(1), 0);
        let fd = Funcdata::new("f", entry, spaces);
        let job = Job { funcdata: fd, deadline: None };

        decompile_all(&tree, vec![job], &mut comments, 1);

        let texts: Vec<String> = comments.iter_function(entry).map(|c| c.text).collect();
        assert_eq!(texts, vec!["visited"]);
    }

    #[derive(Clone)]
    struct CommentingPrimitive;
    impl crate::action::Primitive for CommentingPrimitive {
        fn name(&self) -> &str {
            "commenting"
        }
        fn reads(&self) -> crate::action::Regions {
            crate::action::Regions::empty()
        }
        fn writes(&self) -> crate::action::Regions {
            crate::action::Regions::empty()
        }
        fn apply(&self, fd: &mut Funcdata) -> CoreResult<u32> {
            let entry = fd.entry_addr;
            fd.comments.add_comment(CommentType::USER, entry, entry, "visited");
            Ok(0)
        }
        fn clone_box(&self) -> Box<dyn crate::action::Primitive> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn deadline_in_the_past_aborts_function() {
        let tree = ActionTree::new(Action::Group(Group::new(
            "root",
            vec![Action::Primitive(Box::new(NoopPrimitive), ActionState::default())],
        )));
        let spaces = SpaceManager::new();
        let fd = Funcdata::new("slow", Address::new(SpaceIndex(1), 0), spaces);
        let job = Job { funcdata: fd, deadline: Some(Instant::now() - std::time::Duration::from_secs(1)) };
        let (_, result) = decompile_one(&tree, job);
        assert!(result.aborted);
        assert!(result.error.is_some());
    }

    #[derive(Clone)]
    struct NoopPrimitive;
    impl crate::action::Primitive for NoopPrimitive {
        fn name(&self) -> &str {
            "noop"
        }
        fn reads(&self) -> crate::action::Regions {
            crate::action::Regions::empty()
        }
        fn writes(&self) -> crate::action::Regions {
            crate::action::Regions::empty()
        }
        fn apply(&self, _fd: &mut Funcdata) -> CoreResult<u32> {
            Ok(0)
        }
        fn clone_box(&self) -> Box<dyn crate::action::Primitive> {
            Box::new(self.clone())
        }
    }
}
