//! スレッド一覧とスレッド切り替えの追跡
//!
//! スレッドは main スレッドを起点とする循環リストです。
//! 走査は main に戻った時点で止め、`next` が NULL になることは前提にしません。
//! 実行中のスレッドの struct thread は古い値を持っているので、
//! フレームとノードは [`LiveExecutionContext`] のグローバル変数から取ります。

use crate::accessor::{field, Inferior, MemoryAccessor};
use crate::error::RuntimeError;
use crate::profile::{LayoutProfile, ThreadLayout};
use crate::Result;
use rbprobe_target::CallError;
use std::collections::HashSet;
use tracing::{debug, warn};

/// VALUE 1つ分のバイト数
pub const WORD: u64 = 8;

/// 実行中スレッドの状態（グローバル変数のスナップショット）
///
/// 再開をまたいで使い回さず、必要になるたびに [`capture`](Self::capture) し直します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveExecutionContext {
    pub main_thread: u64,
    pub current_thread: u64,
    pub frame: u64,
    pub node: u64,
}

impl LiveExecutionContext {
    /// グローバル変数を読み直す
    pub fn capture<M: MemoryAccessor + ?Sized>(memory: &M, layout: &ThreadLayout) -> Result<Self> {
        let anchors = &layout.anchors;
        Ok(Self {
            main_thread: memory.read_global(anchors.main_thread)?,
            current_thread: memory.read_global(anchors.current_thread)?,
            frame: memory.read_global(anchors.current_frame)?,
            node: memory.read_global(anchors.current_node)?,
        })
    }

    /// VMが動いているか（main スレッドが存在するか）
    pub fn is_running(&self) -> bool {
        self.main_thread != 0
    }
}

/// struct thread のビュー
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadHandle {
    pub address: u64,
    pub is_main: bool,
    pub is_current: bool,
    pub status: u64,
    pub wait_mask: u64,
    pub fd: i32,
    /// 待ち合わせ終了時刻（エポック秒）
    pub delay: f64,
    pub join: u64,
    /// 退避されたスタックの長さ（VALUE 単位）
    pub stack_length: u64,
    /// 退避先バッファ
    pub stack_buffer: u64,
    /// 退避元のスタック位置
    pub stack_position: u64,
    pub top_frame: u64,
    pub next: u64,
}

impl ThreadHandle {
    /// 退避されたスタックのバイト数
    ///
    /// 壊れた `stk_len` でも桁あふれせず、上限で飽和します。
    pub fn stack_bytes(&self) -> u64 {
        self.stack_length.saturating_mul(WORD)
    }

    /// アドレスが退避元のスタック範囲 `[stk_pos, stk_pos + stk_len)` にあるか
    ///
    /// 範囲の終端が桁あふれする場合は範囲外とみなします。
    pub fn stack_contains(&self, addr: u64) -> bool {
        let end = self
            .stack_length
            .checked_mul(WORD)
            .and_then(|bytes| self.stack_position.checked_add(bytes));
        match end {
            Some(end) => addr >= self.stack_position && addr < end,
            None => false,
        }
    }

    /// 退避元スタック上のアドレスを退避バッファ上のアドレスに移す
    pub fn remap_to_buffer(&self, addr: u64) -> Option<u64> {
        if !self.stack_contains(addr) {
            return None;
        }
        (addr - self.stack_position).checked_add(self.stack_buffer)
    }
}

/// スレッド走査器
pub struct ThreadWalker<'a, M: MemoryAccessor + ?Sized> {
    memory: &'a M,
    profile: &'a LayoutProfile,
    layout: &'a ThreadLayout,
}

impl<'a, M: MemoryAccessor + ?Sized> ThreadWalker<'a, M> {
    pub fn new(memory: &'a M, profile: &'a LayoutProfile) -> Result<Self> {
        let layout = profile.thread.as_ref().ok_or_else(|| RuntimeError::UnsupportedReport {
            report: "thread report",
            runtime: profile.family.to_string(),
        })?;
        Ok(Self { memory, profile, layout })
    }

    pub fn layout(&self) -> &ThreadLayout {
        self.layout
    }

    /// 実行中スレッドの状態を読み直す
    pub fn context(&self) -> Result<LiveExecutionContext> {
        LiveExecutionContext::capture(self.memory, self.layout)
    }

    /// main スレッドから循環リストをたどってスレッドを列挙する
    ///
    /// main スレッドが0ならVMは動いていないので空を返します。
    pub fn list_threads(&self, context: &LiveExecutionContext) -> Result<Vec<ThreadHandle>> {
        let mut threads = Vec::new();
        if !context.is_running() {
            return Ok(threads);
        }

        let mut visited = HashSet::new();
        let mut address = context.main_thread;
        loop {
            visited.insert(address);
            let thread = self.read_thread(address, context)?;
            let next = thread.next;
            threads.push(thread);

            if next == context.main_thread {
                break;
            }
            if next == 0 || visited.contains(&next) {
                // main に戻らない壊れたリスト
                debug!("thread list broken at 0x{:x} (next 0x{:x})", address, next);
                break;
            }
            address = next;
        }
        Ok(threads)
    }

    /// 1つのスレッドを読み取る
    pub fn read_thread(&self, address: u64, context: &LiveExecutionContext) -> Result<ThreadHandle> {
        let layout = self.layout;
        let m = self.memory;
        Ok(ThreadHandle {
            address,
            is_main: address == context.main_thread,
            is_current: address == context.current_thread,
            status: m.read_u32(field(address, layout.status)?)? as u64,
            wait_mask: m.read_u32(field(address, layout.wait_for)?)? as u64,
            fd: m.read_u32(field(address, layout.fd)?)? as i32,
            delay: m.read_f64(field(address, layout.delay)?)?,
            join: m.read_word(field(address, layout.join)?)?,
            stack_length: m.read_word(field(address, layout.stk_len)?)?,
            stack_buffer: m.read_word(field(address, layout.stk_ptr)?)?,
            stack_position: m.read_word(field(address, layout.stk_pos)?)?,
            top_frame: m.read_word(field(address, layout.frame)?)?,
            next: m.read_word(field(address, layout.next)?)?,
        })
    }

    /// スレッド状態の名前
    pub fn status_name(&self, thread: &ThreadHandle) -> String {
        self.profile.thread_status_name(thread.status)
    }

    /// 待ち状態を文字列にする
    ///
    /// `now` は現在のエポック秒で、時間待ちの残り時間 `delay - now` の計算に使います。
    /// 未知のビットは無視します。
    pub fn wait_state(&self, thread: &ThreadHandle, now: f64) -> String {
        wait_state(self.layout, thread, now)
    }

    /// アンワインドの開始点（フレーム, ノード）
    ///
    /// 実行中のスレッドはグローバル変数から、それ以外は struct thread から取ります。
    pub fn stack_top(&self, thread: &ThreadHandle, context: &LiveExecutionContext) -> Result<(u64, u64)> {
        if thread.is_current {
            return Ok((context.frame, context.node));
        }
        let frame = thread.top_frame;
        // 退避されたフレームはアンワインド時に読み直すので、ここでの失敗は0扱い
        let node = match self.profile.frame {
            Some(frame_layout) if frame != 0 => field(frame, frame_layout.node)
                .and_then(|addr| self.memory.read_word(addr))
                .unwrap_or_else(|e| {
                    debug!("node of frame 0x{:x} unreadable: {}", frame, e);
                    0
                }),
            _ => 0,
        };
        Ok((frame, node))
    }
}

/// 待ち状態の文字列化
pub fn wait_state(layout: &ThreadLayout, thread: &ThreadHandle, now: f64) -> String {
    let bits = &layout.wait_bits;
    let mask = thread.wait_mask;
    if mask == 0 {
        return "none".to_string();
    }

    let mut state = Vec::new();
    if mask & bits.fd != 0 {
        state.push(format!("fd({})", thread.fd));
    }
    if mask & bits.select != 0 {
        state.push("select".to_string());
    }
    if mask & bits.time != 0 {
        state.push(format!("time({:.2})", thread.delay - now));
    }
    if mask & bits.join != 0 {
        state.push(format!("join(0x{:x})", thread.join));
    }
    if mask & bits.pid != 0 {
        state.push("pid".to_string());
    }
    state.join(", ")
}

/// スレッド切り替えを追跡する
///
/// 現在スレッドを指すグローバル変数に書き込みウォッチポイントを置き、
/// 値が変わるたびに新しいスレッドを `emit` に渡します。
/// 値が変わらなかったとき、中断要求、プロセスの終了で止まります。
/// どの経路でもウォッチポイントは外し、unwind-on-signal の設定は元に戻します。
pub fn trace_switches<I, F>(inferior: &mut I, profile: &LayoutProfile, mut emit: F) -> Result<usize>
where
    I: Inferior + ?Sized,
    F: FnMut(&ThreadHandle) -> Result<()>,
{
    let layout = *profile.thread.as_ref().ok_or_else(|| RuntimeError::UnsupportedReport {
        report: "thread trace",
        runtime: profile.family.to_string(),
    })?;
    let anchor = inferior
        .symbol(layout.anchors.current_thread)
        .ok_or_else(|| RuntimeError::MissingSymbol(layout.anchors.current_thread.to_string()))?;

    let saved_unwind = inferior.unwind_on_signal();
    inferior.set_unwind_on_signal(true);
    if let Err(e) = inferior.set_write_watchpoint(anchor, WORD as usize) {
        inferior.set_unwind_on_signal(saved_unwind);
        return Err(e);
    }

    let mut switches = 0;
    let outcome = follow_switches(inferior, profile, &layout, &mut switches, &mut emit);

    let cleared = if inferior.is_alive() {
        inferior.clear_watchpoint()
    } else {
        Ok(())
    };
    inferior.set_unwind_on_signal(saved_unwind);

    match outcome {
        Ok(()) => cleared.map(|_| switches),
        Err(e) if CallError::is_interrupted_call(&e) => {
            debug!("thread trace stopped: {}", e);
            cleared.map(|_| switches)
        }
        Err(e) => {
            if let Err(clear_err) = cleared {
                warn!("failed to remove watchpoint: {}", clear_err);
            }
            Err(e)
        }
    }
}

fn follow_switches<I, F>(
    inferior: &mut I,
    profile: &LayoutProfile,
    layout: &ThreadLayout,
    switches: &mut usize,
    emit: &mut F,
) -> Result<()>
where
    I: Inferior + ?Sized,
    F: FnMut(&ThreadHandle) -> Result<()>,
{
    let mut previous = None;
    loop {
        if inferior.interrupt_requested() {
            return Ok(());
        }
        match inferior.resume()? {
            crate::StopEvent::Watchpoint => {}
            crate::StopEvent::Interrupted | crate::StopEvent::Exited(_) => return Ok(()),
            crate::StopEvent::Signal(signal) => {
                debug!("passing {} while tracing threads", signal);
                continue;
            }
            crate::StopEvent::Breakpoint(addr) => {
                debug!("unexpected breakpoint at 0x{:x} while tracing threads", addr);
                return Ok(());
            }
        }

        let context = LiveExecutionContext::capture(&*inferior, layout)?;
        if previous == Some(context.current_thread) {
            return Ok(());
        }
        let walker = ThreadWalker::new(&*inferior, profile)?;
        let thread = walker.read_thread(context.current_thread, &context)?;
        emit(&thread)?;
        *switches += 1;
        previous = Some(context.current_thread);
    }
}
