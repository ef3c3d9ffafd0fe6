//! スレッド一覧・フレームのアンワインド・スレッド切り替え追跡のテスト

mod common;

use common::{FakeTarget, Step};
use rbprobe_runtime::{
    trace_switches, FrameUnwinder, LayoutProfile, RuntimeError, RuntimeFamily, StopEvent,
    ThreadHandle, ThreadWalker,
};

const MAIN_THREAD_SYM: u64 = 0x20100;
const CURR_THREAD_SYM: u64 = 0x20108;
const FRAME_SYM: u64 = 0x20110;
const NODE_SYM: u64 = 0x20118;

fn thread_addr(i: u64) -> u64 {
    0x40000 + i * 0x1000
}

fn frame_addr(i: u64) -> u64 {
    0x50000 + i * 0x100
}

fn node_addr(i: u64) -> u64 {
    0x58000 + i * 0x40
}

struct Fixture {
    target: FakeTarget,
    profile: LayoutProfile,
}

impl Fixture {
    /// スレッド3つ、フレーム4つ、ノード4つ分の領域とグローバル変数を用意する
    fn new() -> Self {
        let profile = LayoutProfile::builtin(RuntimeFamily::FamilyA);
        let mut target = FakeTarget::new();
        target.define("rb_main_thread", MAIN_THREAD_SYM);
        target.define("rb_curr_thread", CURR_THREAD_SYM);
        target.define("ruby_frame", FRAME_SYM);
        target.define("ruby_current_node", NODE_SYM);

        for i in 0..3 {
            target.map(thread_addr(i), 0x400);
        }
        let file = target.intern("app.rb");
        for i in 0..4 {
            target.map(frame_addr(i), 0x100);
            target.map(node_addr(i), 0x40);
            // 種別 0x21 + i、行番号 10 * (i + 1)
            let flags = 0x3f | ((0x21 + i) << 12) | ((10 * (i + 1)) << 20);
            target.poke_word(node_addr(i), flags);
            target.poke_word(node_addr(i) + 8, file);
            target.name_id(100 + i, &format!("method_{}", i));
        }
        Self { target, profile }
    }

    /// f0 -> f1 -> ... -> f(n-1) のチェーンを作る
    fn chain(&self, n: u64) {
        let frame = self.profile.frame.unwrap();
        for i in 0..n {
            let prev = if i + 1 < n { frame_addr(i + 1) } else { 0 };
            self.target.poke_word(frame_addr(i) + frame.prev, prev);
            self.target.poke_word(frame_addr(i) + frame.last_func, 100 + i);
            self.target.poke_word(frame_addr(i) + frame.node, node_addr(i));
        }
    }

    fn link_threads(&self, links: &[(u64, u64)]) {
        let layout = self.profile.thread.unwrap();
        for (from, to) in links {
            self.target.poke_word(from + layout.next, *to);
        }
    }

    fn set_globals(&mut self, main: u64, current: u64) {
        self.target.set_global("rb_main_thread", main);
        self.target.set_global("rb_curr_thread", current);
    }
}

fn idle_thread(address: u64) -> ThreadHandle {
    ThreadHandle {
        address,
        is_main: false,
        is_current: false,
        status: 1,
        wait_mask: 0,
        fd: 0,
        delay: 0.0,
        join: 0,
        stack_length: 0,
        stack_buffer: 0,
        stack_position: 0,
        top_frame: 0,
        next: 0,
    }
}

#[test]
fn test_three_thread_ring() {
    let mut fx = Fixture::new();
    let (t0, t1, t2) = (thread_addr(0), thread_addr(1), thread_addr(2));
    fx.link_threads(&[(t0, t1), (t1, t2), (t2, t0)]);
    fx.set_globals(t0, t1);

    let walker = ThreadWalker::new(&fx.target, &fx.profile).unwrap();
    let context = walker.context().unwrap();
    let threads = walker.list_threads(&context).unwrap();

    let addresses: Vec<u64> = threads.iter().map(|t| t.address).collect();
    assert_eq!(addresses, vec![t0, t1, t2]);
    assert_eq!(threads.iter().filter(|t| t.is_main).count(), 1);
    assert!(threads[0].is_main);
    assert!(threads[1].is_current);
    assert!(!threads[2].is_current);
}

#[test]
fn test_single_thread_points_to_itself() {
    let mut fx = Fixture::new();
    let t0 = thread_addr(0);
    fx.link_threads(&[(t0, t0)]);
    fx.set_globals(t0, t0);

    let walker = ThreadWalker::new(&fx.target, &fx.profile).unwrap();
    let threads = walker.list_threads(&walker.context().unwrap()).unwrap();
    assert_eq!(threads.len(), 1);
    assert!(threads[0].is_main && threads[0].is_current);
}

#[test]
fn test_no_main_thread_means_no_threads() {
    let fx = Fixture::new();
    let walker = ThreadWalker::new(&fx.target, &fx.profile).unwrap();
    let context = walker.context().unwrap();
    assert!(!context.is_running());
    assert!(walker.list_threads(&context).unwrap().is_empty());
}

#[test]
fn test_broken_thread_list_terminates() {
    let mut fx = Fixture::new();
    let (t0, t1, t2) = (thread_addr(0), thread_addr(1), thread_addr(2));
    fx.set_globals(t0, t0);
    let walker = ThreadWalker::new(&fx.target, &fx.profile).unwrap();

    // NULL で途切れる
    fx.link_threads(&[(t0, t1), (t1, 0)]);
    let context = walker.context().unwrap();
    assert_eq!(walker.list_threads(&context).unwrap().len(), 2);

    // main 以外で閉じた輪
    fx.link_threads(&[(t1, t2), (t2, t1)]);
    assert_eq!(walker.list_threads(&context).unwrap().len(), 3);
}

#[test]
fn test_thread_fields_and_wait_state() {
    let mut fx = Fixture::new();
    let t0 = thread_addr(0);
    let layout = fx.profile.thread.unwrap();
    fx.link_threads(&[(t0, t0)]);
    fx.set_globals(t0, 0);

    let now = 1_000_000.0_f64;
    fx.target.poke_u32(t0 + layout.status, 2);
    fx.target.poke_u32(t0 + layout.wait_for, (layout.wait_bits.fd | layout.wait_bits.time) as u32);
    fx.target.poke_u32(t0 + layout.fd, 7);
    fx.target.poke(t0 + layout.delay, &(now + 2.5).to_le_bytes());
    fx.target.poke_word(t0 + layout.stk_len, 0x20);

    let walker = ThreadWalker::new(&fx.target, &fx.profile).unwrap();
    let context = walker.context().unwrap();
    let thread = walker.read_thread(t0, &context).unwrap();

    assert_eq!(walker.status_name(&thread), "THREAD_STOPPED");
    assert_eq!(walker.wait_state(&thread, now), "fd(7), time(2.50)");
    assert_eq!(thread.stack_bytes(), 0x100);

    let idle = idle_thread(t0);
    assert_eq!(walker.wait_state(&idle, now), "none");

    let joining = ThreadHandle {
        wait_mask: layout.wait_bits.join | layout.wait_bits.pid,
        join: 0x41000,
        ..idle
    };
    assert_eq!(walker.wait_state(&joining, now), "join(0x41000), pid");
}

#[test]
fn test_unwind_full_chain() {
    let fx = Fixture::new();
    fx.chain(4);
    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();

    let records = unwinder
        .unwind(&idle_thread(thread_addr(0)), frame_addr(0), node_addr(0))
        .unwrap();

    assert_eq!(records.len(), 4);
    for (i, record) in records.iter().enumerate() {
        let i = i as u64;
        assert_eq!(record.frame, frame_addr(i));
        assert_eq!(record.node_type, 0x21 + i);
        assert_eq!(record.type_name, fx.profile.node_type_name(0x21 + i));
        assert_eq!(record.method, format!("method_{}", i));
        assert_eq!(record.file, "app.rb");
        assert_eq!(record.line, 10 * (i + 1));
    }
}

#[test]
fn test_unwind_stops_after_frame_without_method() {
    let fx = Fixture::new();
    fx.chain(4);
    let frame = fx.profile.frame.unwrap();
    fx.target.poke_word(frame_addr(1) + frame.last_func, 0);

    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    let records = unwinder
        .unwind(&idle_thread(thread_addr(0)), frame_addr(0), node_addr(0))
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].method, "(unknown)");
}

#[test]
fn test_unwind_stops_at_null_node() {
    let fx = Fixture::new();
    fx.chain(4);
    let frame = fx.profile.frame.unwrap();
    fx.target.poke_word(frame_addr(2) + frame.node, 0);

    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    let records = unwinder
        .unwind(&idle_thread(thread_addr(0)), frame_addr(0), node_addr(0))
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_unwind_terminates_on_frame_cycle() {
    let fx = Fixture::new();
    fx.chain(2);
    let frame = fx.profile.frame.unwrap();
    fx.target.poke_word(frame_addr(1) + frame.prev, frame_addr(0));

    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    let records = unwinder
        .unwind(&idle_thread(thread_addr(0)), frame_addr(0), node_addr(0))
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_unwind_remaps_saved_stack_of_waiting_thread() {
    let fx = Fixture::new();
    fx.chain(4);
    assert!(!fx.profile.frames_are_heap_allocated);

    // 退避前のスタック [0x7ff000, 0x7ff100) は f0 の 0x10 バイト手前から退避されている
    let thread = ThreadHandle {
        stack_position: 0x7ff000,
        stack_length: 0x20,
        stack_buffer: frame_addr(0) - 0x10,
        top_frame: 0x7ff010,
        ..idle_thread(thread_addr(1))
    };

    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    // 開始ノードは読めないので0で渡し、退避先から読み直させる
    let records = unwinder.unwind(&thread, thread.top_frame, 0).unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(records[0].frame, frame_addr(0));
    assert_eq!(records[0].method, "method_0");
}

/// f2 が退避元スタック [f2 - 0x10, f2 + 0xf0) に入り、退避先にすると f0 を指すスレッド
fn thread_over_f2() -> ThreadHandle {
    ThreadHandle {
        stack_position: frame_addr(2) - 0x10,
        stack_length: 0x20,
        stack_buffer: frame_addr(0) - 0x10,
        top_frame: frame_addr(2),
        ..idle_thread(thread_addr(1))
    }
}

#[test]
fn test_heap_allocated_frames_are_not_remapped() {
    let fx = Fixture::new();
    fx.chain(4);
    let mut profile = fx.profile.clone();
    profile.frames_are_heap_allocated = true;

    let thread = thread_over_f2();
    let unwinder = FrameUnwinder::new(&fx.target, &profile).unwrap();
    let records = unwinder.unwind(&thread, thread.top_frame, node_addr(2)).unwrap();

    let frames: Vec<u64> = records.iter().map(|r| r.frame).collect();
    assert_eq!(frames, vec![frame_addr(2), frame_addr(3)]);
    assert_eq!(records[0].method, "method_2");
}

#[test]
fn test_current_thread_frames_are_not_remapped() {
    let fx = Fixture::new();
    fx.chain(4);

    let thread = ThreadHandle { is_current: true, ..thread_over_f2() };
    assert!(thread.stack_contains(frame_addr(2)));
    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    let records = unwinder.unwind(&thread, thread.top_frame, node_addr(2)).unwrap();

    let frames: Vec<u64> = records.iter().map(|r| r.frame).collect();
    assert_eq!(frames, vec![frame_addr(2), frame_addr(3)]);
    assert_eq!(records[0].line, 30);
}

#[test]
fn test_garbled_stack_length_does_not_overflow() {
    let fx = Fixture::new();
    fx.chain(4);

    let thread = ThreadHandle {
        stack_position: frame_addr(0) - 0x10,
        stack_length: 0x2000_0000_0000_0001,
        stack_buffer: 0x7fff_0000_0000,
        top_frame: frame_addr(0),
        ..idle_thread(thread_addr(1))
    };
    assert_eq!(thread.stack_bytes(), u64::MAX);
    assert!(!thread.stack_contains(frame_addr(0)));
    assert_eq!(thread.remap_to_buffer(frame_addr(0)), None);

    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    let records = unwinder.unwind(&thread, thread.top_frame, node_addr(0)).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].frame, frame_addr(0));
}

#[test]
fn test_remap_past_end_of_address_space() {
    let thread = ThreadHandle {
        stack_position: 0x1000,
        stack_length: 0x10,
        stack_buffer: u64::MAX - 8,
        ..idle_thread(thread_addr(1))
    };
    assert_eq!(thread.remap_to_buffer(0x1000), Some(u64::MAX - 8));
    assert_eq!(thread.remap_to_buffer(0x1010), None);
    assert_eq!(thread.remap_to_buffer(0x1080), None);
}

#[test]
fn test_current_thread_unwinds_from_globals() {
    let mut fx = Fixture::new();
    fx.chain(4);
    let (t0, t1) = (thread_addr(0), thread_addr(1));
    let layout = fx.profile.thread.unwrap();
    fx.link_threads(&[(t0, t1), (t1, t0)]);
    fx.set_globals(t0, t1);
    fx.target.set_global("ruby_frame", frame_addr(2));
    fx.target.set_global("ruby_current_node", node_addr(2));
    // struct thread 側の値は古い
    fx.target.poke_word(t1 + layout.frame, frame_addr(0));

    let walker = ThreadWalker::new(&fx.target, &fx.profile).unwrap();
    let context = walker.context().unwrap();
    let threads = walker.list_threads(&context).unwrap();
    let current = threads.iter().find(|t| t.is_current).unwrap();

    let (frame, node) = walker.stack_top(current, &context).unwrap();
    assert_eq!((frame, node), (frame_addr(2), node_addr(2)));

    let unwinder = FrameUnwinder::new(&fx.target, &fx.profile).unwrap();
    let records = unwinder.unwind(current, frame, node).unwrap();
    let methods: Vec<&str> = records.iter().map(|r| r.method.as_str()).collect();
    assert_eq!(methods, vec!["method_2", "method_3"]);

    // 停止中のスレッドは struct thread のフレームから始める
    let main = threads.iter().find(|t| t.is_main).unwrap();
    fx.target.poke_word(t0 + layout.frame, frame_addr(1));
    let main = walker.read_thread(main.address, &context).unwrap();
    assert_eq!(walker.stack_top(&main, &context).unwrap(), (frame_addr(1), node_addr(1)));
}

#[test]
fn test_reports_unsupported_on_family_b() {
    let fx = Fixture::new();
    let profile = LayoutProfile::builtin(RuntimeFamily::FamilyB);

    let err = ThreadWalker::new(&fx.target, &profile).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<RuntimeError>(),
        Some(RuntimeError::UnsupportedReport { .. })
    ));
    assert!(FrameUnwinder::new(&fx.target, &profile).is_err());
}

#[test]
fn test_trace_switches_until_thread_repeats() {
    let mut fx = Fixture::new();
    let (t0, t1, t2) = (thread_addr(0), thread_addr(1), thread_addr(2));
    fx.link_threads(&[(t0, t1), (t1, t2), (t2, t0)]);
    fx.set_globals(t0, t0);
    fx.target.script(vec![
        Step::write_then(StopEvent::Watchpoint, CURR_THREAD_SYM, t1),
        Step::stop(StopEvent::Signal("SIGALRM".to_string())),
        Step::write_then(StopEvent::Watchpoint, CURR_THREAD_SYM, t2),
        Step::write_then(StopEvent::Watchpoint, CURR_THREAD_SYM, t2),
    ]);

    let mut seen = Vec::new();
    let profile = fx.profile.clone();
    let count = trace_switches(&mut fx.target, &profile, |thread| {
        seen.push(thread.address);
        Ok(())
    })
    .unwrap();

    assert_eq!(count, 2);
    assert_eq!(seen, vec![t1, t2]);
    assert!(fx.target.watchpoint.is_none());
    assert!(!rbprobe_runtime::Inferior::unwind_on_signal(&fx.target));
}

#[test]
fn test_trace_switches_stops_on_interrupt() {
    let mut fx = Fixture::new();
    let t0 = thread_addr(0);
    fx.link_threads(&[(t0, t0)]);
    fx.set_globals(t0, t0);
    fx.target.set_unwind(true);
    fx.target.script(vec![Step::Interrupt]);

    let profile = fx.profile.clone();
    let count = trace_switches(&mut fx.target, &profile, |_| Ok(())).unwrap();

    assert_eq!(count, 0);
    assert!(fx.target.watchpoint.is_none());
    assert!(rbprobe_runtime::Inferior::unwind_on_signal(&fx.target));
}

#[test]
fn test_trace_switches_propagates_callback_errors() {
    let mut fx = Fixture::new();
    let (t0, t1) = (thread_addr(0), thread_addr(1));
    fx.link_threads(&[(t0, t1), (t1, t0)]);
    fx.set_globals(t0, t0);
    fx.target.script(vec![Step::write_then(StopEvent::Watchpoint, CURR_THREAD_SYM, t1)]);

    let profile = fx.profile.clone();
    let result = trace_switches(&mut fx.target, &profile, |_| Err(anyhow::anyhow!("output closed")));

    assert!(result.is_err());
    assert!(fx.target.watchpoint.is_none());
}
