//! rbprobe ターゲットプロセス制御
//!
//! このクレートは、調査対象のRubyプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、ブレークポイント/ウォッチポイント設定、
//! ターゲット内での関数呼び出し、コアダンプの読み取りなどを行います。

pub mod process;
pub mod memory;
pub mod registers;
pub mod breakpoint;
pub mod call;
pub mod core_image;

pub use process::{request_stop, Process, StopReason};
pub use memory::{Memory, MemoryMapping};
pub use registers::Registers;
pub use breakpoint::{SoftwareBreakpoint, HardwareWatchpoint};
pub use call::{CallError, InferiorCall};
pub use core_image::CoreImage;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
