//! 呼び出しイベントのトランポリン
//!
//! ターゲット内に `ret` だけの関数を作ってイベントフックとして登録し、
//! その先頭にブレークポイントを置きます。フックが呼ばれるたびに停止するので、
//! 引数レジスタから呼び出し位置のノードとメソッドIDを読み取ります。
//!
//! 状態は Uninstalled → Armed → Sampling → Uninstalled と遷移します。
//! インストールで確保したものは、どの経路で抜けても [`EventTrampoline::uninstall`]
//! で一度だけ解放します。

use crate::accessor::{Inferior, NameLookup, StopEvent};
use crate::error::RuntimeError;
use crate::frame::UNKNOWN_METHOD;
use crate::node::SourceNode;
use crate::profile::{EventHookLayout, LayoutProfile};
use crate::Result;
use rbprobe_target::CallError;
use std::fmt;
use tracing::{debug, warn};

/// mprotect に渡すページ境界
const PAGE_MASK: u64 = !0xfff;
const PROT_READ_WRITE: u64 = 0x3;
const PROT_READ_WRITE_EXEC: u64 = 0x7;

/// 既定のサンプル数
pub const DEFAULT_SAMPLES: usize = 100;

/// トランポリンの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineState {
    Uninstalled,
    Armed,
    Sampling,
}

impl TrampolineState {
    fn name(self) -> &'static str {
        match self {
            TrampolineState::Uninstalled => "uninstalled",
            TrampolineState::Armed => "armed",
            TrampolineState::Sampling => "sampling",
        }
    }
}

/// 1回分の呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSample {
    pub method: String,
    pub file: String,
    pub line: u64,
}

impl fmt::Display for CallSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}:{}", self.method, self.file, self.line)
    }
}

/// イベントフックのトランポリン
#[derive(Debug)]
pub struct EventTrampoline {
    hook: EventHookLayout,
    state: TrampolineState,
    address: Option<u64>,
    page_executable: bool,
    hook_registered: bool,
    breakpoint_set: bool,
    saved_unwind: Option<bool>,
}

impl EventTrampoline {
    pub fn new(profile: &LayoutProfile) -> Result<Self> {
        let hook = profile.event_hook.ok_or_else(|| RuntimeError::UnsupportedReport {
            report: "call tracing",
            runtime: profile.family.to_string(),
        })?;
        Ok(Self {
            hook,
            state: TrampolineState::Uninstalled,
            address: None,
            page_executable: false,
            hook_registered: false,
            breakpoint_set: false,
            saved_unwind: None,
        })
    }

    pub fn state(&self) -> TrampolineState {
        self.state
    }

    /// トランポリンのアドレス（インストール済みのとき）
    pub fn address(&self) -> Option<u64> {
        self.address
    }

    /// トランポリンをインストールする
    ///
    /// 途中で失敗した場合は、それまでに確保したものを解放してからエラーを返します。
    pub fn install<I: Inferior + ?Sized>(&mut self, inferior: &mut I) -> Result<()> {
        if self.state != TrampolineState::Uninstalled {
            return Err(RuntimeError::TrampolineState {
                expected: TrampolineState::Uninstalled.name(),
                actual: self.state.name(),
            }
            .into());
        }

        self.saved_unwind = Some(inferior.unwind_on_signal());
        inferior.set_unwind_on_signal(true);

        if let Err(e) = self.acquire(inferior) {
            if let Err(cleanup) = self.release(inferior) {
                warn!("cleanup after failed install also failed: {}", cleanup);
            }
            return Err(e);
        }

        self.state = TrampolineState::Armed;
        debug!("trampoline armed at 0x{:x}", self.address.unwrap_or(0));
        Ok(())
    }

    fn acquire<I: Inferior + ?Sized>(&mut self, inferior: &mut I) -> Result<()> {
        let code = inferior.return_instruction();
        let address = inferior.call_function("malloc", &[code.len() as u64])?;
        if address == 0 {
            return Err(anyhow::anyhow!("malloc({}) returned NULL", code.len()));
        }
        self.address = Some(address);

        inferior.write(address, code)?;

        let status = inferior.call_function("mprotect", &[address & PAGE_MASK, 1, PROT_READ_WRITE_EXEC])?;
        if status as i32 != 0 {
            return Err(anyhow::anyhow!("mprotect(0x{:x}) failed", address & PAGE_MASK));
        }
        self.page_executable = true;

        inferior.call_function(self.hook.add_hook, &[address, self.hook.events])?;
        self.hook_registered = true;

        inferior.set_breakpoint(address)?;
        self.breakpoint_set = true;
        Ok(())
    }

    /// 次にトランポリンが呼ばれるまで実行を進める
    ///
    /// 中断要求、プロセス終了、トランポリン以外での停止では None を返します。
    pub fn next_sample<I: Inferior + ?Sized>(
        &mut self,
        inferior: &mut I,
        profile: &LayoutProfile,
    ) -> Result<Option<CallSample>> {
        let Some(address) = self.address.filter(|_| self.state != TrampolineState::Uninstalled) else {
            return Err(RuntimeError::TrampolineState {
                expected: TrampolineState::Armed.name(),
                actual: self.state.name(),
            }
            .into());
        };

        loop {
            if inferior.interrupt_requested() {
                return Ok(None);
            }
            match inferior.resume()? {
                StopEvent::Breakpoint(pc) if pc == address => break,
                StopEvent::Signal(signal) => {
                    debug!("passing {} while sampling", signal);
                }
                other => {
                    debug!("sampling stopped by {:?}", other);
                    return Ok(None);
                }
            }
        }
        self.state = TrampolineState::Sampling;

        let node = inferior.call_argument(self.hook.node_argument)?;
        let method_id = inferior.call_argument(self.hook.method_argument)?;

        let (file, line) = match SourceNode::read(&*inferior, profile, node) {
            Ok(source) => (source.file, source.line),
            Err(e) => {
                debug!("call site node 0x{:x} unreadable: {}", node, e);
                ("(unknown)".to_string(), 0)
            }
        };
        let method = if method_id == 0 {
            UNKNOWN_METHOD.to_string()
        } else {
            NameLookup::new(&*inferior)
                .method_name(method_id)
                .unwrap_or_else(|_| UNKNOWN_METHOD.to_string())
        };

        Ok(Some(CallSample { method, file, line }))
    }

    /// トランポリンを取り外す
    ///
    /// すべての手順を試みます。呼び出し中のシグナル停止や、プロセスが既に
    /// 操作できない場合の失敗は警告にとどめ、それ以外は最初のエラーを返します。
    pub fn uninstall<I: Inferior + ?Sized>(&mut self, inferior: &mut I) -> Result<()> {
        let result = self.release(inferior);
        self.state = TrampolineState::Uninstalled;
        result
    }

    fn release<I: Inferior + ?Sized>(&mut self, inferior: &mut I) -> Result<()> {
        let mut first_error = None;
        let mut record = |step: &str, result: Result<()>, alive: bool| {
            if let Err(e) = result {
                if CallError::is_interrupted_call(&e) || !alive {
                    warn!("trampoline teardown ({}) failed: {}", step, e);
                } else if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("trampoline teardown ({}) failed: {}", step, e);
                }
            }
        };

        if let Some(address) = self.address {
            if self.breakpoint_set {
                let result = inferior.clear_breakpoint(address);
                record("clear breakpoint", result, inferior.is_alive());
                self.breakpoint_set = false;
            }

            // フックの中で止まっている場合は、ページを実行不可にする前に抜けておく
            if inferior.is_alive() {
                let result = match inferior.program_counter() {
                    Ok(pc) if pc == address => inferior.single_step(),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                };
                record("leave trampoline", result, inferior.is_alive());
            }

            if self.page_executable {
                let result = inferior
                    .call_function("mprotect", &[address & PAGE_MASK, 1, PROT_READ_WRITE])
                    .map(|_| ());
                record("mprotect", result, inferior.is_alive());
                self.page_executable = false;
            }

            if self.hook_registered {
                let result = inferior.call_function(self.hook.remove_hook, &[address]).map(|_| ());
                record("remove event hook", result, inferior.is_alive());
                self.hook_registered = false;
            }

            let result = inferior.call_function("free", &[address]).map(|_| ());
            record("free", result, inferior.is_alive());
            self.address = None;
        }

        if let Some(saved) = self.saved_unwind.take() {
            inferior.set_unwind_on_signal(saved);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 呼び出しを最大 `max_count` 件サンプリングする
///
/// 完了・中断・エラーのいずれでもトランポリンは取り外します。
/// `emit` がエラーを返した場合はそこで止め、取り外した後にそのエラーを返します。
/// 呼び出し中にシグナルで止まった（プロセスが落ちた）場合は中断と同じ扱いです。
pub fn sample_calls<I, F>(
    inferior: &mut I,
    profile: &LayoutProfile,
    max_count: usize,
    mut emit: F,
) -> Result<usize>
where
    I: Inferior + ?Sized,
    F: FnMut(&CallSample) -> Result<()>,
{
    let mut trampoline = EventTrampoline::new(profile)?;
    trampoline.install(inferior)?;

    let mut sampled = 0;
    let outcome = (|| -> Result<()> {
        while sampled < max_count {
            match trampoline.next_sample(inferior, profile)? {
                Some(sample) => {
                    emit(&sample)?;
                    sampled += 1;
                }
                None => break,
            }
        }
        Ok(())
    })();

    let teardown = trampoline.uninstall(inferior);
    match outcome {
        Ok(()) => teardown.map(|_| sampled),
        Err(e) if CallError::is_interrupted_call(&e) => {
            debug!("sampling stopped: {}", e);
            teardown.map(|_| sampled)
        }
        Err(e) => {
            if let Err(t) = teardown {
                warn!("trampoline teardown failed: {}", t);
            }
            Err(e)
        }
    }
}
