/// Actionツリー: Funcdataに対する規則駆動の書き換えパイプライン
///
/// Actionは (a) Group（子Actionの順序付きコンテナ）、(b) Rule（宣言されたopcode
/// 集合に対して個々のopへ適用される）、(c) Primitive（関数全体変換）のいずれか。
/// 各Actionは読み書きするFuncdataの領域（クローズドな列挙）を宣言し、
/// 依存関係に基づくスケジューリング（並列ドライバ用）に使われる。

use crate::error::CoreResult;
use crate::funcdata::Funcdata;
use crate::pcodeop::OpCode;
use bitflags::bitflags;
use tracing::{debug, trace};

bitflags! {
    /// Actionが読み書きするFuncdataの領域。クローズドな列挙。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Regions: u32 {
        const TYPES          = 1 << 0;
        const SYMBOLS        = 1 << 1;
        const PCODE_OPS      = 1 << 2;
        const VARNODES       = 1 << 3;
        const SSA            = 1 << 4;
        const BLOCKS         = 1 << 5;
        const CASTS          = 1 << 6;
        const CONSTANTS      = 1 << 7;
        const CALLS          = 1 << 8;
        const FLOW           = 1 << 9;
        const HIGH_VARIABLES = 1 << 10;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ActionState {
    pub status_done: bool,
    pub count: u32,
    pub state_index: u32,
}

/// 全Rule実装が満たすトレイト: opcode1つへの適用
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;
    fn op_list(&self) -> &[OpCode];
    fn reads(&self) -> Regions;
    fn writes(&self) -> Regions;
    /// 適用して変更数を返す。負値は構造エラーを意味する（実装上はErrで表現する）。
    fn apply(&self, fd: &mut Funcdata, op: crate::pcodeop::PcodeOpId) -> CoreResult<u32>;
    fn clone_box(&self) -> Box<dyn Rule>;
}

/// 関数全体に対して一度だけ走る変換（ヘリテージ・マージなど）
pub trait Primitive: Send + Sync {
    fn name(&self) -> &str;
    fn reads(&self) -> Regions;
    fn writes(&self) -> Regions;
    fn apply(&self, fd: &mut Funcdata) -> CoreResult<u32>;
    fn clone_box(&self) -> Box<dyn Primitive>;
}

pub enum Action {
    Group(Group),
    Rule(Box<dyn Rule>, ActionState),
    Primitive(Box<dyn Primitive>, ActionState),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Group(g) => &g.name,
            Action::Rule(r, _) => r.name(),
            Action::Primitive(p, _) => p.name(),
        }
    }

    pub fn reads(&self) -> Regions {
        match self {
            Action::Group(g) => g.children.iter().fold(Regions::empty(), |acc, c| acc | c.reads()),
            Action::Rule(r, _) => r.reads(),
            Action::Primitive(p, _) => p.reads(),
        }
    }

    pub fn writes(&self) -> Regions {
        match self {
            Action::Group(g) => g.children.iter().fold(Regions::empty(), |acc, c| acc | c.writes()),
            Action::Rule(r, _) => r.writes(),
            Action::Primitive(p, _) => p.writes(),
        }
    }

    /// 再帰的にstatus/count/state-indexをクリアする
    pub fn reset(&mut self) {
        match self {
            Action::Group(g) => {
                g.budget_exhausted = false;
                for c in &mut g.children {
                    c.reset();
                }
            }
            Action::Rule(_, state) | Action::Primitive(_, state) => {
                *state = ActionState::default();
            }
        }
    }

    /// 構造を独立複製する: opListと領域宣言は不変なので参照を共有する（ここでは
    /// トレイトオブジェクトをclone_boxで複製するが、中身は共有された規則記述であり、
    /// 可変な実行状態だけが新規に作られる）
    pub fn clone_tree(&self) -> Action {
        match self {
            Action::Group(g) => Action::Group(Group {
                name: g.name.clone(),
                children: g.children.iter().map(|c| c.clone_tree()).collect(),
                budget: g.budget,
                budget_exhausted: false,
            }),
            Action::Rule(r, _) => Action::Rule(r.clone_box(), ActionState::default()),
            Action::Primitive(p, _) => Action::Primitive(p.clone_box(), ActionState::default()),
        }
    }

    /// このActionを1スイープ実行し、変更数を返す
    pub fn perform(&mut self, fd: &mut Funcdata) -> CoreResult<u32> {
        match self {
            Action::Group(g) => g.perform(fd),
            Action::Rule(r, state) => {
                let mut total = 0u32;
                let live_ops: Vec<_> = fd
                    .ops()
                    .filter(|op| r.op_list().contains(&op.opcode))
                    .map(|op| op.id)
                    .collect();
                for op_id in live_ops {
                    let n = r.apply(fd, op_id)?;
                    total += n;
                }
                state.count += total;
                state.status_done = true;
                Ok(total)
            }
            Action::Primitive(p, state) => {
                let n = p.apply(fd)?;
                state.count += n;
                state.status_done = true;
                Ok(n)
            }
        }
    }
}

/// Actionの順序付きコンテナ。安定するまで（2回連続で変更数0になるまで）子を繰り返す。
pub struct Group {
    pub name: String,
    pub children: Vec<Action>,
    /// 1回の安定化あたりの最大スイープ回数。Noneなら無制限。
    pub budget: Option<u32>,
    budget_exhausted: bool,
}

impl Group {
    pub fn new(name: impl Into<String>, children: Vec<Action>) -> Self {
        Self { name: name.into(), children, budget: Some(1000), budget_exhausted: false }
    }

    pub fn perform(&mut self, fd: &mut Funcdata) -> CoreResult<u32> {
        let mut total = 0u32;
        let mut consecutive_zero = 0u32;
        let mut sweep = 0u32;

        loop {
            let mut sweep_total = 0u32;
            for child in &mut self.children {
                sweep_total += child.perform(fd)?;
            }
            total += sweep_total;
            sweep += 1;
            trace!(group = %self.name, sweep, sweep_total, "group sweep complete");

            if sweep_total == 0 {
                consecutive_zero += 1;
            } else {
                consecutive_zero = 0;
            }
            if consecutive_zero >= 2 {
                break;
            }
            if let Some(budget) = self.budget {
                if sweep >= budget {
                    self.budget_exhausted = true;
                    debug!(group = %self.name, budget, "group budget exhausted");
                    break;
                }
            }
        }
        Ok(total)
    }
}

/// 実行の単位であるActionツリー全体
pub struct ActionTree {
    pub root: Action,
}

impl ActionTree {
    pub fn new(root: Action) -> Self {
        Self { root }
    }

    pub fn reset(&mut self, _fd: &Funcdata) {
        self.root.reset();
    }

    pub fn perform(&mut self, fd: &mut Funcdata) -> CoreResult<u32> {
        self.root.perform(fd)
    }

    /// 構造的に独立したクローンを作る。ステータス/カウントは共有しない。
    pub fn clone_current_action(&self) -> ActionTree {
        ActionTree { root: self.root.clone_tree() }
    }
}
