//! ターゲット内での関数呼び出し
//!
//! 停止中のターゲットのレジスタを退避し、引数をレジスタに設定して関数を実行させます。
//! 戻りアドレスには実行不可能なアドレス（0）を積んでおき、関数から戻った瞬間の
//! SIGSEGV を「呼び出し完了」として扱います。

use crate::registers::set_argument;
use crate::{Memory, Process, Registers, Result, StopReason};
use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{debug, warn};

/// 関数から戻ったことを検出するための戻りアドレス
const RETURN_SENTINEL: u64 = 0;

/// System V ABI のレッドゾーン（呼び出し中に壊してはいけない領域）
const RED_ZONE: u64 = 128;

/// 呼び出し失敗の分類
#[derive(Debug, Error)]
pub enum CallError {
    /// 呼び出し中にシグナルやトラップで停止した
    #[error("program was signaled ({signal:?}) while in a function called from the debugger: {function}")]
    Signaled {
        function: String,
        signal: Signal,
        /// レジスタを呼び出し前の状態に巻き戻したかどうか
        unwound: bool,
    },
    /// 呼び出し中にプロセスが終了した
    #[error("program exited with status {code} while in a function called from the debugger: {function}")]
    Exited { function: String, code: i32 },
}

impl CallError {
    /// anyhow::Error が「呼び出し中にシグナル停止・終了した」ものかどうか判定する
    pub fn is_interrupted_call(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<CallError>(),
            Some(CallError::Signaled { .. }) | Some(CallError::Exited { .. })
        )
    }
}

/// ターゲット内関数呼び出し
pub struct InferiorCall<'a> {
    process: &'a Process,
    registers: &'a Registers,
    memory: &'a Memory,
    unwind_on_signal: bool,
}

impl<'a> InferiorCall<'a> {
    /// 関数呼び出し器を作成する
    pub fn new(process: &'a Process, registers: &'a Registers, memory: &'a Memory) -> Self {
        Self {
            process,
            registers,
            memory,
            unwind_on_signal: false,
        }
    }

    /// 呼び出し中にシグナルを受けたとき、レジスタを巻き戻すかどうかを設定する
    pub fn unwind_on_signal(mut self, on: bool) -> Self {
        self.unwind_on_signal = on;
        self
    }

    /// `address` にある関数を `args` で呼び出し、戻り値（rax）を返す
    pub fn call(&self, function: &str, address: u64, args: &[u64]) -> Result<u64> {
        let saved = self.registers.read()?;
        let mut regs = saved;

        for (index, value) in args.iter().enumerate() {
            set_argument(&mut regs, index, *value)?;
        }

        // レッドゾーンを避け、関数入口で (rsp + 8) が16バイト境界になるよう戻りアドレスを積む
        let aligned = (saved.rsp - RED_ZONE) & !0xf;
        let sp = aligned - 8;
        self.memory.write_u64(sp as usize, RETURN_SENTINEL)?;

        regs.rsp = sp;
        regs.rip = address;
        regs.rax = 0;
        // システムコール途中で止まっていた場合に再起動処理が rip を書き換えないようにする
        regs.orig_rax = u64::MAX;
        self.registers.write(regs)?;

        debug!("calling {} at 0x{:x} with {:x?}", function, address, args);

        let signal = match self.process.continue_and_wait(None)? {
            StopReason::Signal(Signal::SIGSEGV)
                if self.registers.get_pc()? == RETURN_SENTINEL =>
            {
                let result = self.registers.read()?.rax;
                self.registers.write(saved)?;
                return Ok(result);
            }
            StopReason::Exited(code) => {
                return Err(CallError::Exited {
                    function: function.to_string(),
                    code,
                }
                .into());
            }
            StopReason::Killed(signal) | StopReason::Signal(signal) => signal,
            StopReason::Breakpoint | StopReason::Watchpoint | StopReason::Step | StopReason::Other => {
                Signal::SIGTRAP
            }
        };

        warn!("{} stopped with {:?} before returning", function, signal);
        if self.unwind_on_signal && self.process.is_alive() {
            self.registers.write(saved)?;
        }

        Err(CallError::Signaled {
            function: function.to_string(),
            signal,
            unwound: self.unwind_on_signal,
        }
        .into())
    }
}
