//! エラーメッセージ定数

/// Ruby VM が起動していない（main スレッドがない）場合のメッセージ
pub const ERR_VM_NOT_RUNNING: &str = "Ruby VM is not running!";

/// コアダンプでは実行できないコマンドのメッセージ
pub const ERR_LIVE_PROCESS_REQUIRED: &str = "This command needs a live process (not a core file)";

/// プロセスが既に終了している場合のメッセージ
pub const ERR_PROCESS_GONE: &str = "The target process is no longer running";
