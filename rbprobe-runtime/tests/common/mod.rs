//! 合成メモリ上のターゲット
//!
//! バイト単位の疎なアドレス空間、シンボル表、ターゲット内関数の擬似実装、
//! 台本どおりに停止イベントを返す resume を持ちます。

#![allow(dead_code)]

use rbprobe_runtime::{FunctionCaller, Inferior, MemoryAccessor, Result, StopEvent};
use rbprobe_target::CallError;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// malloc が返すアドレスの開始位置
pub const MALLOC_BASE: u64 = 0x7000_0000;
/// ターゲット内関数が返す文字列の置き場
const STRING_POOL: u64 = 0x6000_0000;

/// resume の台本
pub enum Step {
    /// 停止イベントを返す。`args` は停止時の引数レジスタ、`writes` は停止前に起きた書き込み
    Stop {
        event: StopEvent,
        args: Vec<u64>,
        writes: Vec<(u64, u64)>,
    },
    /// 中断要求を立ててから Interrupted を返す
    Interrupt,
    /// 想定外のエラー
    Fail(&'static str),
    /// 呼び出し中のシグナル停止
    Signaled,
}

impl Step {
    pub fn stop(event: StopEvent) -> Self {
        Step::Stop { event, args: Vec::new(), writes: Vec::new() }
    }

    pub fn hit(address: u64, args: Vec<u64>) -> Self {
        Step::Stop { event: StopEvent::Breakpoint(address), args, writes: Vec::new() }
    }

    pub fn write_then(event: StopEvent, addr: u64, value: u64) -> Self {
        Step::Stop { event, args: Vec::new(), writes: vec![(addr, value)] }
    }
}

/// 関数呼び出しの失敗のさせ方
#[derive(Clone, Copy)]
pub enum CallFault {
    Error,
    Signaled,
}

#[derive(Default)]
pub struct FakeTarget {
    memory: RefCell<BTreeMap<u64, u8>>,
    symbols: HashMap<String, u64>,
    ids: HashMap<u64, String>,
    classes: HashMap<u64, String>,
    faults: HashMap<String, CallFault>,
    next_malloc: Cell<u64>,
    next_string: Cell<u64>,
    pub calls: RefCell<Vec<(String, Vec<u64>)>>,
    script: VecDeque<Step>,
    pub breakpoints: HashSet<u64>,
    pub watchpoint: Option<(u64, usize)>,
    pub steps: usize,
    pc: u64,
    args: Vec<u64>,
    unwind: bool,
    interrupt: Cell<bool>,
    alive: bool,
    pub eval_state: u32,
    pub eval_result: String,
    pub evaluated: RefCell<Option<String>>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self {
            next_malloc: Cell::new(MALLOC_BASE),
            next_string: Cell::new(STRING_POOL),
            alive: true,
            ..Default::default()
        }
    }

    /// ゼロ埋めの領域を用意する
    pub fn map(&mut self, base: u64, len: u64) {
        let memory = self.memory.get_mut();
        for addr in base..base + len {
            memory.entry(addr).or_insert(0);
        }
    }

    pub fn poke(&self, addr: u64, bytes: &[u8]) {
        let mut memory = self.memory.borrow_mut();
        for (i, b) in bytes.iter().enumerate() {
            memory.insert(addr + i as u64, *b);
        }
    }

    pub fn poke_word(&self, addr: u64, value: u64) {
        self.poke(addr, &value.to_le_bytes());
    }

    pub fn poke_u32(&self, addr: u64, value: u32) {
        self.poke(addr, &value.to_le_bytes());
    }

    /// NUL終端の文字列を置き、そのアドレスを返す
    pub fn intern(&self, text: &str) -> u64 {
        let addr = self.next_string.get();
        // C文字列の読み取りは64バイト単位なので、境界までゼロで埋める
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        bytes.resize(((bytes.len() + 63) & !63) as usize, 0);
        self.poke(addr, &bytes);
        self.next_string.set(addr + bytes.len() as u64);
        addr
    }

    /// シンボルを定義し、8バイトのゼロ領域を割り当てる
    pub fn define(&mut self, name: &str, addr: u64) {
        self.map(addr, 8);
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn set_global(&mut self, name: &str, value: u64) {
        let addr = self.symbols[name];
        self.poke_word(addr, value);
    }

    pub fn name_id(&mut self, id: u64, name: &str) {
        self.ids.insert(id, name.to_string());
    }

    pub fn name_class(&mut self, klass: u64, name: &str) {
        self.classes.insert(klass, name.to_string());
    }

    pub fn fail_call(&mut self, function: &str, fault: CallFault) {
        self.faults.insert(function.to_string(), fault);
    }

    pub fn script(&mut self, steps: Vec<Step>) {
        self.script.extend(steps);
    }

    pub fn set_unwind(&mut self, on: bool) {
        self.unwind = on;
    }

    /// 呼び出された関数名の列
    pub fn call_names(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn calls_to(&self, function: &str) -> Vec<Vec<u64>> {
        self.calls
            .borrow()
            .iter()
            .filter(|(name, _)| name == function)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        self.read(addr, len).expect("mapped")
    }

    fn malloc(&self, size: u64) -> u64 {
        let addr = self.next_malloc.get();
        let rounded = ((size + 63) & !63).max(64);
        {
            let mut memory = self.memory.borrow_mut();
            for a in addr..addr + rounded {
                memory.insert(a, 0);
            }
        }
        self.next_malloc.set(addr + rounded);
        addr
    }

    fn string_for(&self, table: &HashMap<u64, String>, key: u64) -> u64 {
        match table.get(&key) {
            Some(name) => self.intern(name),
            None => 0,
        }
    }
}

impl MemoryAccessor for FakeTarget {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let memory = self.memory.borrow();
        (addr..addr + len as u64)
            .map(|a| {
                memory
                    .get(&a)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("unmapped address 0x{:x}", a))
            })
            .collect()
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

impl FunctionCaller for FakeTarget {
    fn call_function(&self, name: &str, args: &[u64]) -> Result<u64> {
        self.calls.borrow_mut().push((name.to_string(), args.to_vec()));

        match self.faults.get(name) {
            Some(CallFault::Error) => return Err(anyhow::anyhow!("{} failed", name)),
            Some(CallFault::Signaled) => {
                return Err(CallError::Signaled {
                    function: name.to_string(),
                    signal: nix::sys::signal::Signal::SIGSEGV,
                    unwound: self.unwind,
                }
                .into())
            }
            None => {}
        }

        match name {
            "malloc" => Ok(self.malloc(args[0])),
            "free" | "mprotect" | "rb_add_event_hook" | "rb_remove_event_hook" => Ok(0),
            "rb_id2name" => Ok(self.string_for(&self.ids, args[0])),
            "rb_class2name" => Ok(self.string_for(&self.classes, args[0])),
            "rb_eval_string_protect" => {
                *self.evaluated.borrow_mut() = Some(self.read_c_string(args[0])?);
                self.poke_u32(args[1], self.eval_state);
                Ok(0x4242)
            }
            "rb_string_value_cstr" => {
                let value = self.read_word(args[0])?;
                if value != 0x4242 {
                    return Err(anyhow::anyhow!("not a string: 0x{:x}", value));
                }
                Ok(self.intern(&self.eval_result))
            }
            other => Err(anyhow::anyhow!("no such function: {}", other)),
        }
    }
}

impl Inferior for FakeTarget {
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.read(addr, data.len())?;
        self.poke(addr, data);
        Ok(())
    }

    fn set_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.breakpoints.insert(addr);
        Ok(())
    }

    fn clear_breakpoint(&mut self, addr: u64) -> Result<()> {
        if !self.breakpoints.remove(&addr) {
            return Err(anyhow::anyhow!("no breakpoint at 0x{:x}", addr));
        }
        Ok(())
    }

    fn set_write_watchpoint(&mut self, addr: u64, len: usize) -> Result<()> {
        self.watchpoint = Some((addr, len));
        Ok(())
    }

    fn clear_watchpoint(&mut self) -> Result<()> {
        self.watchpoint = None;
        Ok(())
    }

    fn resume(&mut self) -> Result<StopEvent> {
        match self.script.pop_front() {
            None => {
                self.alive = false;
                Ok(StopEvent::Exited(0))
            }
            Some(Step::Stop { event, args, writes }) => {
                for (addr, value) in writes {
                    self.poke_word(addr, value);
                }
                self.pc = match event {
                    StopEvent::Breakpoint(addr) => addr,
                    _ => 0,
                };
                self.args = args;
                Ok(event)
            }
            Some(Step::Interrupt) => {
                self.interrupt.set(true);
                Ok(StopEvent::Interrupted)
            }
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::Signaled) => Err(CallError::Signaled {
                function: "rb_id2name".to_string(),
                signal: nix::sys::signal::Signal::SIGSEGV,
                unwound: self.unwind,
            }
            .into()),
        }
    }

    fn single_step(&mut self) -> Result<()> {
        self.steps += 1;
        self.pc = 0;
        Ok(())
    }

    fn program_counter(&self) -> Result<u64> {
        Ok(self.pc)
    }

    fn call_argument(&self, index: usize) -> Result<u64> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no argument {}", index))
    }

    fn return_instruction(&self) -> &'static [u8] {
        &[0xc3]
    }

    fn unwind_on_signal(&self) -> bool {
        self.unwind
    }

    fn set_unwind_on_signal(&mut self, on: bool) {
        self.unwind = on;
    }

    fn interrupt_requested(&self) -> bool {
        self.interrupt.get()
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}
