//! ランタイム解析のエラー分類

use thiserror::Error;

/// 呼び出し側で区別して扱う必要のある失敗
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// どのプロファイルのシグネチャにも一致しなかった
    #[error("unrecognized Ruby runtime (version: {version})")]
    UnrecognizedRuntime { version: String },

    /// ヒープにスロットが1つもない（割合を計算できない）
    #[error("heap has no slots")]
    EmptyHeap,

    /// このランタイムでは扱えないレポート
    #[error("{report} is not supported on {runtime}")]
    UnsupportedReport { report: &'static str, runtime: String },

    /// 必要なシンボルがターゲットにない
    #[error("symbol not found: {0}")]
    MissingSymbol(String),

    /// トランポリンの状態遷移が不正
    #[error("event trampoline is {actual}, expected {expected}")]
    TrampolineState {
        expected: &'static str,
        actual: &'static str,
    },
}
