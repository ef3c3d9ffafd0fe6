//! 調査セッション
//!
//! 生きたプロセス（ptrace）またはコアダンプを、`rbprobe_runtime` のアクセス境界
//! （[`MemoryAccessor`] / [`FunctionCaller`] / [`Inferior`]）に結び付けます。
//! プロファイルの選択と補正はセッション作成時に一度だけ行い、以後は変更しません。

use crate::breakpoint::BreakpointManager;
use crate::errors::{ERR_LIVE_PROCESS_REQUIRED, ERR_PROCESS_GONE};
use crate::{disasm, probe, Result};
use nix::sys::signal::Signal;
use rbprobe_dwarf::{DwarfLoader, Symbol, SymbolResolver};
use rbprobe_runtime::{FunctionCaller, Inferior, LayoutProfile, MemoryAccessor, RuntimeError, StopEvent};
use rbprobe_target::{CoreImage, HardwareWatchpoint, InferiorCall, Memory, Process, Registers, StopReason};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// x86-64 の `ret`
const RETURN_INSTRUCTION: &[u8] = &[0xc3];

/// ウォッチポイントに使うデバッグレジスタ
const WATCHPOINT_SLOT: usize = 0;

/// セッション作成時の設定
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Ruby インタプリタの実行ファイル（省略時は /proc/<pid>/exe）
    pub binary: Option<PathBuf>,
    /// バージョン文字列（省略時は `binary -v` を実行して得る）
    pub ruby_version: Option<String>,
}

/// ptrace で制御している生きたプロセス
struct LiveTarget {
    process: Process,
    memory: Memory,
    registers: Registers,
    breakpoints: BreakpointManager,
    watchpoint: Option<HardwareWatchpoint>,
    /// 次の再開時にターゲットへ渡すシグナル
    pending_signal: Option<Signal>,
    alive: bool,
}

impl LiveTarget {
    fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// ブレークポイント上で止まっていれば、それを踏み越える
    fn step_over_breakpoint(&mut self) -> Result<Option<StopReason>> {
        let pc = self.registers.get_pc()?;
        self.breakpoints.step_over(pc, &self.process, &self.memory)
    }
}

enum Backend {
    Live(LiveTarget),
    Core(CoreImage),
}

/// 調査セッション
pub struct Session {
    backend: Backend,
    binary: PathBuf,
    symbols: SymbolResolver,
    /// シンボルのファイル内アドレスに加える値（PIEのロードアドレス）
    load_bias: u64,
    profile: LayoutProfile,
    unwind_on_signal: bool,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    /// 実行中のプロセスにアタッチする
    ///
    /// ランタイムの判定はアタッチ前に行うので、対象外のプロセスは止めません。
    pub fn attach(pid: i32, options: &SessionOptions, interrupt: Arc<AtomicBool>) -> Result<Self> {
        let binary = options
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/proc/{}/exe", pid)));
        let (symbols, profile) = load_runtime(&binary, options)?;

        if !disasm::is_bare_return(RETURN_INSTRUCTION)? {
            return Err(anyhow::anyhow!("Trampoline body is not a single ret instruction"));
        }

        let process = Process::attach(pid)?;
        let memory = Memory::new(pid);
        let load_bias = if symbols.is_pie() {
            memory.get_base_address()? as u64
        } else {
            0
        };
        info!("attached to {} (load bias 0x{:x})", pid, load_bias);

        Ok(Self {
            backend: Backend::Live(LiveTarget {
                process,
                memory,
                registers: Registers::new(pid),
                breakpoints: BreakpointManager::new(),
                watchpoint: None,
                pending_signal: None,
                alive: true,
            }),
            binary,
            symbols,
            load_bias,
            profile,
            unwind_on_signal: false,
            interrupt,
        })
    }

    /// コアダンプを開く
    ///
    /// 実行ファイルは非PIEである前提で、シンボルのアドレスをそのまま使います。
    pub fn open_core(core: &Path, options: &SessionOptions) -> Result<Self> {
        let binary = options
            .binary
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--binary is required with a core file"))?;
        let (symbols, profile) = load_runtime(&binary, options)?;
        if symbols.is_pie() {
            warn!("{} is position independent; symbol addresses may not match the core", binary.display());
        }
        let image = CoreImage::load(core)?;
        info!("opened core {} ({} segments)", core.display(), image.segment_count());

        Ok(Self {
            backend: Backend::Core(image),
            binary,
            symbols,
            load_bias: 0,
            profile,
            unwind_on_signal: false,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn profile(&self) -> &LayoutProfile {
        &self.profile
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// 生きたプロセスに対するセッションか
    pub fn is_live(&self) -> bool {
        matches!(self.backend, Backend::Live(_))
    }

    /// 対象のプロセスID（コアダンプでは None）
    pub fn pid(&self) -> Option<i32> {
        match &self.backend {
            Backend::Live(live) => Some(live.pid()),
            Backend::Core(_) => None,
        }
    }

    /// 中断要求を取り下げる（コマンドの開始時に呼ぶ）
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    /// アドレスを含むシンボルと、その先頭からのオフセット
    pub fn symbol_at(&self, addr: u64) -> Option<(Symbol, u64)> {
        let file_addr = addr.checked_sub(self.load_bias)?;
        let symbol = self.symbols.reverse_resolve(file_addr)?;
        let offset = file_addr - symbol.address;
        Some((symbol, offset))
    }

    /// ターゲットへの変更をすべて元に戻す
    ///
    /// ブレークポイントとウォッチポイントを外します。デタッチは [`Process`] の破棄で行われます。
    pub fn detach(&mut self) -> Result<()> {
        let Backend::Live(live) = &mut self.backend else {
            return Ok(());
        };
        if !live.alive {
            return Ok(());
        }
        let breakpoints = live.breakpoints.clear_all(&live.memory);
        let watchpoint = match live.watchpoint.take() {
            Some(wp) => wp.clear(live.pid()),
            None => Ok(()),
        };
        breakpoints.and(watchpoint)
    }

    fn live(&self) -> Result<&LiveTarget> {
        match &self.backend {
            Backend::Live(live) if live.alive => Ok(live),
            Backend::Live(_) => Err(anyhow::anyhow!(ERR_PROCESS_GONE)),
            Backend::Core(_) => Err(anyhow::anyhow!(ERR_LIVE_PROCESS_REQUIRED)),
        }
    }

    fn live_mut(&mut self) -> Result<&mut LiveTarget> {
        match &mut self.backend {
            Backend::Live(live) if live.alive => Ok(live),
            Backend::Live(_) => Err(anyhow::anyhow!(ERR_PROCESS_GONE)),
            Backend::Core(_) => Err(anyhow::anyhow!(ERR_LIVE_PROCESS_REQUIRED)),
        }
    }

    /// 停止理由を解析側のイベントに変換する
    fn translate(&mut self, reason: StopReason) -> Result<StopEvent> {
        let interrupted = self.interrupt.load(Ordering::SeqCst);
        let live = self.live_mut()?;
        match reason {
            StopReason::Breakpoint => {
                // INT3 実行後の pc は命令の次を指している
                let pc = live.registers.get_pc()?;
                let addr = pc.wrapping_sub(1);
                if live.breakpoints.contains(addr) {
                    live.registers.set_pc(addr)?;
                    Ok(StopEvent::Breakpoint(addr))
                } else {
                    debug!("SIGTRAP at 0x{:x} without a breakpoint", pc);
                    Ok(StopEvent::Signal(Signal::SIGTRAP.as_str().to_string()))
                }
            }
            StopReason::Watchpoint => Ok(StopEvent::Watchpoint),
            StopReason::Step | StopReason::Other => Ok(StopEvent::Signal(Signal::SIGTRAP.as_str().to_string())),
            StopReason::Signal(Signal::SIGSTOP) if interrupted => Ok(StopEvent::Interrupted),
            StopReason::Signal(Signal::SIGSTOP) => {
                // 中断要求の取り下げ後に届いた SIGSTOP は配送しない
                Ok(StopEvent::Signal(Signal::SIGSTOP.as_str().to_string()))
            }
            StopReason::Signal(signal) => {
                live.pending_signal = Some(signal);
                Ok(StopEvent::Signal(signal.as_str().to_string()))
            }
            StopReason::Exited(code) => {
                live.alive = false;
                Ok(StopEvent::Exited(code))
            }
            StopReason::Killed(signal) => {
                live.alive = false;
                info!("target killed by {}", signal.as_str());
                Ok(StopEvent::Exited(128 + signal as i32))
            }
        }
    }
}

/// シンボルを読み、ランタイムを判定してプロファイルを作る
fn load_runtime(binary: &Path, options: &SessionOptions) -> Result<(SymbolResolver, LayoutProfile)> {
    let loader = DwarfLoader::load(binary)?;
    let symbols = SymbolResolver::new(&loader)?;
    let version = match &options.ruby_version {
        Some(version) => Some(version.clone()),
        None => probe::ruby_version(binary),
    };
    let profile = probe::select_profile(&loader, &symbols, version.as_deref())?;
    Ok((symbols, profile))
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("failed to restore target before detaching: {}", e);
        }
    }
}

impl MemoryAccessor for Session {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        match &self.backend {
            Backend::Live(live) => live.memory.read(addr as usize, len),
            Backend::Core(image) => image.read(addr, len),
        }
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.resolve(name).map(|addr| addr + self.load_bias)
    }
}

impl FunctionCaller for Session {
    fn call_function(&self, name: &str, args: &[u64]) -> Result<u64> {
        let live = self.live()?;
        let address = self
            .symbol(name)
            .ok_or_else(|| RuntimeError::MissingSymbol(name.to_string()))?;
        InferiorCall::new(&live.process, &live.registers, &live.memory)
            .unwind_on_signal(self.unwind_on_signal)
            .call(name, address, args)
    }
}

impl Inferior for Session {
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.live()?.memory.write(addr as usize, data)
    }

    fn set_breakpoint(&mut self, addr: u64) -> Result<()> {
        let live = self.live_mut()?;
        live.breakpoints.insert(addr, &live.memory)
    }

    fn clear_breakpoint(&mut self, addr: u64) -> Result<()> {
        let live = self.live_mut()?;
        live.breakpoints.remove(addr, &live.memory)
    }

    fn set_write_watchpoint(&mut self, addr: u64, len: usize) -> Result<()> {
        let live = self.live_mut()?;
        if live.watchpoint.is_some() {
            return Err(anyhow::anyhow!("A watchpoint is already set"));
        }
        live.watchpoint = Some(HardwareWatchpoint::set_write(live.pid(), WATCHPOINT_SLOT, addr, len)?);
        Ok(())
    }

    fn clear_watchpoint(&mut self) -> Result<()> {
        let live = self.live_mut()?;
        match live.watchpoint.take() {
            Some(wp) => wp.clear(live.pid()),
            None => Ok(()),
        }
    }

    fn resume(&mut self) -> Result<StopEvent> {
        let live = self.live_mut()?;
        if let Some(reason) = live.step_over_breakpoint()? {
            if reason.is_terminal() {
                return self.translate(reason);
            }
        }
        let live = self.live_mut()?;
        let signal = live.pending_signal.take();
        let reason = live.process.continue_and_wait(signal)?;
        self.translate(reason)
    }

    fn single_step(&mut self) -> Result<()> {
        let live = self.live_mut()?;
        let reason = match live.step_over_breakpoint()? {
            Some(reason) => reason,
            None => live.process.step()?,
        };
        if reason.is_terminal() {
            self.translate(reason)?;
        }
        Ok(())
    }

    fn program_counter(&self) -> Result<u64> {
        self.live()?.registers.get_pc()
    }

    fn call_argument(&self, index: usize) -> Result<u64> {
        self.live()?.registers.argument(index)
    }

    fn return_instruction(&self) -> &'static [u8] {
        RETURN_INSTRUCTION
    }

    fn unwind_on_signal(&self) -> bool {
        self.unwind_on_signal
    }

    fn set_unwind_on_signal(&mut self, on: bool) {
        self.unwind_on_signal = on;
    }

    fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        match &self.backend {
            Backend::Live(live) => live.alive && live.process.is_alive(),
            Backend::Core(_) => false,
        }
    }
}
