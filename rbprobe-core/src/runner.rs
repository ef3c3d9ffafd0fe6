//! コマンドの実行
//!
//! [`Command`] を解析処理に振り分け、整形済みのレポートを `out` に書きます。
//! ターゲットは [`Inferior`] 越しに扱うので、生きたプロセスでもコアダンプでも同じ経路を通ります。

use crate::command::{Command, ObjectsReport, ThreadsMode, HELP};
use crate::errors::{ERR_LIVE_PROCESS_REQUIRED, ERR_VM_NOT_RUNNING};
use crate::{report, Result};
use rbprobe_runtime::thread::wait_state;
use rbprobe_runtime::{
    decode_value, evaluate, sample_calls, trace_switches, FrameUnwinder, Inferior, LayoutProfile,
    ObjectCensus, ThreadWalker,
};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// コマンド実行後にREPLを続けるか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// コマンドを1つ実行する
pub fn execute<I, W>(target: &mut I, profile: &LayoutProfile, command: &Command, out: &mut W) -> Result<Flow>
where
    I: Inferior + ?Sized,
    W: Write,
{
    match command {
        Command::Threads(ThreadsMode::Trace) => trace_threads(target, profile, out)?,
        Command::Threads(mode) => show_threads(target, profile, *mode == ThreadsMode::Full, out)?,
        Command::Objects(report) => show_objects(target, profile, *report, out)?,
        Command::Trace(count) => {
            if require_live(target, out)? {
                sample_calls(target, profile, *count, |sample| {
                    writeln!(out, "{}", sample)?;
                    Ok(())
                })?;
            }
        }
        Command::Decode(value) => {
            let kind = decode_value(&*target, profile, *value)?;
            writeln!(out, "{}", kind)?;
        }
        Command::Eval(code) => {
            if require_live(target, out)? {
                writeln!(out, "{}", evaluate(target, code)?)?;
            }
        }
        Command::Help => writeln!(out, "{}", HELP)?,
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

/// ターゲット内での実行が必要なコマンドの前に確認する
fn require_live<I: Inferior + ?Sized, W: Write>(target: &I, out: &mut W) -> Result<bool> {
    if target.is_alive() {
        return Ok(true);
    }
    writeln!(out, "{}", ERR_LIVE_PROCESS_REQUIRED)?;
    Ok(false)
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn show_threads<I, W>(target: &mut I, profile: &LayoutProfile, full: bool, out: &mut W) -> Result<()>
where
    I: Inferior + ?Sized,
    W: Write,
{
    let target = &*target;
    let walker = ThreadWalker::new(target, profile)?;
    let context = walker.context()?;
    if !context.is_running() {
        writeln!(out, "{}", ERR_VM_NOT_RUNNING)?;
        return Ok(());
    }

    let now = epoch_seconds();
    let unwinder = if full {
        Some(FrameUnwinder::new(target, profile)?)
    } else {
        None
    };

    for thread in walker.list_threads(&context)? {
        if full {
            writeln!(out)?;
        }
        let line = report::thread_line(&thread, &walker.status_name(&thread), &walker.wait_state(&thread, now));
        writeln!(out, "{}", line)?;

        let Some(unwinder) = &unwinder else { continue };
        let (frame, node) = walker.stack_top(&thread, &context)?;
        match unwinder.unwind(&thread, frame, node) {
            Ok(records) => {
                for record in &records {
                    writeln!(out, "{}", report::frame_line(record))?;
                }
            }
            Err(e) => writeln!(out, "   (stack unreadable: {})", e)?,
        }
    }
    writeln!(out)?;
    Ok(())
}

fn trace_threads<I, W>(target: &mut I, profile: &LayoutProfile, out: &mut W) -> Result<()>
where
    I: Inferior + ?Sized,
    W: Write,
{
    if !require_live(target, out)? {
        return Ok(());
    }
    trace_switches(target, profile, |thread| {
        let status = profile.thread_status_name(thread.status);
        let wait = profile
            .thread
            .as_ref()
            .map(|layout| wait_state(layout, thread, epoch_seconds()))
            .unwrap_or_default();
        writeln!(out, "{}", report::thread_line(thread, &status, &wait))?;
        Ok(())
    })?;
    Ok(())
}

fn show_objects<I, W>(target: &mut I, profile: &LayoutProfile, which: ObjectsReport, out: &mut W) -> Result<()>
where
    I: Inferior + ?Sized,
    W: Write,
{
    if which == ObjectsReport::Classes && !require_live(target, out)? {
        return Ok(());
    }
    let census = ObjectCensus::new(&*target, profile);
    let text = match which {
        ObjectsReport::Stats => report::population(&census.population_summary()?, profile),
        ObjectsReport::Classes => report::classes(&census.class_histogram()?),
        ObjectsReport::Nodes => report::nodes(&census.node_histogram()?, profile),
        ObjectsReport::Strings => report::strings(&census.string_histogram()?),
        ObjectsReport::Sizes(kind) => report::sizes(&census.size_histogram(kind)?),
    };
    write!(out, "{}", text)?;
    Ok(())
}
