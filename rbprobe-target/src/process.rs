//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// SIGTRAP の si_code: TRAP_BRKPT
const TRAP_BRKPT: i32 = 1;
/// SIGTRAP の si_code: TRAP_TRACE（シングルステップ）
const TRAP_TRACE: i32 = 2;
/// SIGTRAP の si_code: TRAP_HWBKPT（デバッグレジスタ）
const TRAP_HWBKPT: i32 = 4;
/// SIGTRAP の si_code: SI_KERNEL（INT3）
const SI_KERNEL: i32 = 0x80;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ソフトウェアブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ハードウェアウォッチポイントヒット（SIGTRAP）
    Watchpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナル受信
    Signal(Signal),
    /// シグナルによる終了
    Killed(Signal),
    /// プロセス終了
    Exited(i32),
    /// その他の停止
    Other,
}

impl StopReason {
    /// プロセスがもう存在しない停止理由かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

/// 調査対象のプロセス
pub struct Process {
    pid: Pid,
}

impl Process {
    /// 既存のプロセスにアタッチする
    ///
    /// PTRACE_ATTACH 後、最初の SIGSTOP を待ってから返します。
    /// 返った時点でターゲットは停止しており、メモリ読み取りが安全に行えます。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)
            .map_err(|e| anyhow::anyhow!("Failed to attach to process {}: {}", pid, e))?;

        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, _) => Ok(Self { pid }),
            status => Err(anyhow::anyhow!(
                "Unexpected wait status after attach: {:?}",
                status
            )),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// プロセスを実行継続して停止イベントを待機する
    ///
    /// `signal` が指定された場合は、そのシグナルをターゲットに配送しながら再開します。
    pub fn continue_and_wait(&self, signal: Option<Signal>) -> Result<StopReason> {
        ptrace::cont(self.pid, signal)?;
        self.wait()
    }

    /// 1命令だけ実行して停止する（ステップ実行）
    pub fn step(&self) -> Result<StopReason> {
        ptrace::step(self.pid, None)?;
        self.wait()
    }

    /// 次の停止イベントを待機して分類する
    pub fn wait(&self) -> Result<StopReason> {
        let status = waitpid(self.pid, None)?;

        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => self.classify_sigtrap(),
            WaitStatus::Stopped(_, signal) => Ok(StopReason::Signal(signal)),
            WaitStatus::Exited(_, code) => Ok(StopReason::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Ok(StopReason::Killed(signal)),
            _ => Ok(StopReason::Other),
        }
    }

    /// SIGTRAP を si_code でブレークポイント/ウォッチポイント/ステップに分類する
    fn classify_sigtrap(&self) -> Result<StopReason> {
        let siginfo = ptrace::getsiginfo(self.pid)?;

        match siginfo.si_code {
            SI_KERNEL | TRAP_BRKPT => Ok(StopReason::Breakpoint),
            TRAP_HWBKPT => Ok(StopReason::Watchpoint),
            TRAP_TRACE => Ok(StopReason::Step),
            _ => Ok(StopReason::Other),
        }
    }

    /// プロセスを停止する（シグナルを送信）
    pub fn stop(&self) -> Result<()> {
        request_stop(self.pid())
    }

    /// プロセスがまだ存在するかどうか
    pub fn is_alive(&self) -> bool {
        nix::sys::signal::kill(self.pid, None).is_ok()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = ptrace::detach(self.pid, None);
    }
}

/// `pid` に SIGSTOP を送る
///
/// シグナルハンドラなど [`Process`] を持たない場所から実行中のターゲットを止めるために使います。
pub fn request_stop(pid: i32) -> Result<()> {
    nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGSTOP)
        .map_err(|e| anyhow::anyhow!("Failed to stop process {}: {}", pid, e))
}
