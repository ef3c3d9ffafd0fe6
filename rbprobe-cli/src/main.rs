//! rbprobe CLI - コマンドラインインターフェース
//!
//! 停止させたRubyプロセス（またはコアダンプ）を調べるREPL

use anyhow::Result;
use clap::Parser;
use rbprobe_core::{execute, request_stop, Command, Flow, Session, SessionOptions};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const HISTORY_FILE: &str = ".rbprobe_history";

/// rbprobe - Ruby 1.8 / 1.9 / REE process inspector
#[derive(Parser)]
#[command(name = "rbprobe")]
#[command(version)]
#[command(about = "Inspect the heap, threads and calls of a running Ruby interpreter", long_about = None)]
struct Cli {
    /// Process ID to attach to
    #[arg(required_unless_present = "core", conflicts_with = "core")]
    pid: Option<i32>,

    /// Core dump to open instead of a live process (needs --binary)
    #[arg(long, requires = "binary")]
    core: Option<PathBuf>,

    /// Ruby interpreter binary (defaults to /proc/<pid>/exe)
    #[arg(short, long)]
    binary: Option<PathBuf>,

    /// Version string to use instead of running `<binary> -v`
    #[arg(long)]
    ruby_version: Option<String>,

    /// History file (defaults to ~/.rbprobe_history)
    #[arg(long)]
    history: Option<PathBuf>,

    /// Do not read or write the history file
    #[arg(long)]
    no_history: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = SessionOptions {
        binary: cli.binary.clone(),
        ruby_version: cli.ruby_version.clone(),
    };
    let interrupt = Arc::new(AtomicBool::new(false));

    let mut session = match (&cli.core, cli.pid) {
        (Some(core), _) => {
            println!("Opening core dump: {}", core.display());
            Session::open_core(core, &options)?
        }
        (None, Some(pid)) => {
            println!("Attaching to process: {}", pid);
            let session = Session::attach(pid, &options, Arc::clone(&interrupt))?;
            install_interrupt_handler(pid, Arc::clone(&interrupt))?;
            session
        }
        (None, None) => anyhow::bail!("either a pid or --core is required"),
    };

    let profile = session.profile().clone();
    println!("Runtime: {} ({})", profile.family, profile.version);
    println!("Binary: {}", session.binary().display());
    println!();

    let history = if cli.no_history {
        None
    } else {
        cli.history.clone().or_else(|| home::home_dir().map(|home| home.join(HISTORY_FILE)))
    };
    run_repl(&mut session, history)?;

    session.detach()?;
    Ok(())
}

/// Ctrl-C で実行中のコマンドを止める
///
/// フラグを立ててからターゲットに SIGSTOP を送り、待機中の waitpid を起こします。
fn install_interrupt_handler(pid: i32, interrupt: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        interrupt.store(true, Ordering::SeqCst);
        if let Err(e) = request_stop(pid) {
            warn!("could not stop {}: {}", pid, e);
        }
    })?;
    Ok(())
}

/// REPLループを実行する
fn run_repl(session: &mut Session, history: Option<PathBuf>) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    if let Some(path) = &history {
        if let Err(e) = rl.load_history(path) {
            debug!("no history loaded from {}: {}", path.display(), e);
        }
    }

    let profile = session.profile().clone();
    let stdout = std::io::stdout();

    loop {
        match rl.readline("(rbprobe) ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                let command = match Command::parse(line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        println!("Type 'help' for available commands.");
                        continue;
                    }
                };

                session.clear_interrupt();
                let mut out = stdout.lock();
                match execute(session, &profile, &command, &mut out) {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => eprintln!("Error: {}", e),
                }
                if let Command::Decode(value) = command {
                    if let Some((symbol, offset)) = session.symbol_at(value) {
                        writeln!(out, "  <{}+0x{:x}>", symbol.name, offset)?;
                    }
                }
                out.flush()?;
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            warn!("could not save history to {}: {}", path.display(), e);
        }
    }
    Ok(())
}
