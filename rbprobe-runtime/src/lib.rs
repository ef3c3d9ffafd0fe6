//! rbprobe Rubyインタプリタ解析
//!
//! 停止中（またはコアダンプ）のRuby 1.8 / 1.9 / REE プロセスのメモリを読み、
//! ヒープ・スレッド・フレームを復元します。
//! ターゲットへのアクセスは [`MemoryAccessor`] / [`FunctionCaller`] / [`Inferior`]
//! の3つのトレイト越しに行うので、ptrace に依存せず合成メモリでテストできます。

pub mod accessor;
pub mod census;
pub mod error;
pub mod eval;
pub mod frame;
pub mod heap;
pub mod node;
pub mod profile;
pub mod tags;
pub mod thread;
pub mod trampoline;
pub mod value;

pub use accessor::{FunctionCaller, Inferior, MemoryAccessor, NameLookup, StopEvent};
pub use census::{
    ClassCount, CollectionKind, ObjectCensus, PopulationSummary, SizeBucket, SizeHistogram,
    StringHistogram,
};
pub use error::RuntimeError;
pub use eval::evaluate;
pub use frame::{FrameRecord, FrameUnwinder};
pub use heap::{Arena, HeapSlot, HeapWalker};
pub use node::{NodeFields, SourceNode};
pub use profile::{LayoutProfile, RuntimeFamily, TypeCatalog};
pub use tags::TypeTagTable;
pub use thread::{trace_switches, LiveExecutionContext, ThreadHandle, ThreadWalker};
pub use trampoline::{sample_calls, CallSample, EventTrampoline, TrampolineState, DEFAULT_SAMPLES};
pub use value::{decode_value, ValueKind};

/// ランタイム解析の結果型
pub type Result<T> = anyhow::Result<T>;
