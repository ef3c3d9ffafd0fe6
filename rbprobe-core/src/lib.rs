//! rbprobe のコア機能
//!
//! ターゲット（生きたプロセスまたはコアダンプ）をセッションとして開き、
//! REPL のコマンドを解析処理に振り分けて、結果をレポートに整形します。

pub mod breakpoint;
pub mod command;
pub mod disasm;
pub mod errors;
pub mod parse;
pub mod probe;
pub mod report;
pub mod runner;
pub mod session;

pub use breakpoint::BreakpointManager;
pub use command::{Command, CommandError, ObjectsReport, ThreadsMode};
pub use runner::{execute, Flow};
pub use session::{Session, SessionOptions};

// 他のクレートから使用するために再エクスポート
pub use rbprobe_dwarf::Symbol;
pub use rbprobe_target::{request_stop, StopReason};

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
