//! REPLコマンド
//!
//! 入力行は境界で一度だけ [`Command`] に解決し、以後は文字列を見ません。

use crate::parse::{parse_address, parse_count};
use rbprobe_runtime::{CollectionKind, DEFAULT_SAMPLES};
use thiserror::Error;

/// threads コマンドの表示形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadsMode {
    /// 1スレッド1行
    List,
    /// 各スレッドのフレームも表示
    Full,
    /// スレッド切り替えを追跡
    Trace,
}

/// objects コマンドのレポート
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectsReport {
    Stats,
    Classes,
    Nodes,
    Strings,
    Sizes(CollectionKind),
}

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Threads(ThreadsMode),
    Objects(ObjectsReport),
    /// 呼び出しイベントを指定件数サンプリング
    Trace(usize),
    /// VALUE の種類を判定
    Decode(u64),
    /// ターゲット内で Ruby コードを評価
    Eval(String),
    Help,
    Quit,
}

/// 解釈できない入力
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("unknown {command} report: {argument}")]
    UnknownReport { command: &'static str, argument: String },
    #[error("{command}: {message}")]
    InvalidArgument { command: &'static str, message: String },
    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
}

impl Command {
    /// 入力行をパースする（空行は None）
    pub fn parse(input: &str) -> Result<Option<Self>, CommandError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match input.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (input, ""),
        };

        let command = match word {
            "threads" | "t" => Command::Threads(parse_threads_mode(rest)?),
            "objects" | "o" => Command::Objects(parse_objects_report(rest)?),
            "trace" => {
                let count = if rest.is_empty() {
                    DEFAULT_SAMPLES
                } else {
                    parse_count(rest).map_err(|e| invalid("trace", e))?
                };
                Command::Trace(count)
            }
            "decode" | "d" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument("decode"));
                }
                Command::Decode(parse_address(rest).map_err(|e| invalid("decode", e))?)
            }
            "eval" | "e" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument("eval"));
                }
                Command::Eval(rest.to_string())
            }
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn invalid(command: &'static str, err: anyhow::Error) -> CommandError {
    CommandError::InvalidArgument { command, message: err.to_string() }
}

fn parse_threads_mode(arg: &str) -> Result<ThreadsMode, CommandError> {
    match arg {
        "" | "full" => Ok(ThreadsMode::Full),
        "list" | "ls" => Ok(ThreadsMode::List),
        "trace" => Ok(ThreadsMode::Trace),
        other => Err(CommandError::UnknownReport { command: "threads", argument: other.to_string() }),
    }
}

fn parse_objects_report(arg: &str) -> Result<ObjectsReport, CommandError> {
    match arg {
        "" | "stats" => Ok(ObjectsReport::Stats),
        "classes" => Ok(ObjectsReport::Classes),
        "nodes" => Ok(ObjectsReport::Nodes),
        "strings" => Ok(ObjectsReport::Strings),
        "hashes" => Ok(ObjectsReport::Sizes(CollectionKind::Hash)),
        "arrays" => Ok(ObjectsReport::Sizes(CollectionKind::Array)),
        other => Err(CommandError::UnknownReport { command: "objects", argument: other.to_string() }),
    }
}

/// help コマンドの表示内容
pub const HELP: &str = "\
Thread commands:
  threads [full]        threads with their Ruby stacks
  threads list          one line per thread
  threads trace         follow thread switches until ^C

Heap commands:
  objects [stats]       live/free slots and per-type counts
  objects classes       instances per class
  objects nodes         AST nodes per node type
  objects strings       identical strings (Ruby 1.8 only)
  objects hashes        hashes by size (Ruby 1.8 only)
  objects arrays        arrays by size (Ruby 1.8 only)

Target commands:
  trace [count]         sample method calls (default 100, ^C to stop)
  decode <value>        describe a VALUE or heap address
  eval <code>           evaluate Ruby code in the target

  help                  show this message
  quit                  detach and exit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("threads"), Ok(Some(Command::Threads(ThreadsMode::Full))));
        assert_eq!(Command::parse("t list"), Ok(Some(Command::Threads(ThreadsMode::List))));
        assert_eq!(Command::parse("threads trace"), Ok(Some(Command::Threads(ThreadsMode::Trace))));
        assert_eq!(Command::parse("objects"), Ok(Some(Command::Objects(ObjectsReport::Stats))));
        assert_eq!(
            Command::parse("objects hashes"),
            Ok(Some(Command::Objects(ObjectsReport::Sizes(CollectionKind::Hash))))
        );
        assert_eq!(Command::parse("quit"), Ok(Some(Command::Quit)));
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(Command::parse("trace"), Ok(Some(Command::Trace(DEFAULT_SAMPLES))));
        assert_eq!(Command::parse("trace 20"), Ok(Some(Command::Trace(20))));
        assert_eq!(Command::parse("decode 0x7f00"), Ok(Some(Command::Decode(0x7f00))));
        assert_eq!(
            Command::parse("eval  [1, 2].map { |x|  x * 2 }"),
            Ok(Some(Command::Eval("[1, 2].map { |x|  x * 2 }".to_string())))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("frobnicate"), Err(CommandError::Unknown("frobnicate".to_string())));
        assert!(matches!(Command::parse("objects symbols"), Err(CommandError::UnknownReport { .. })));
        assert!(matches!(Command::parse("trace 0"), Err(CommandError::InvalidArgument { .. })));
        assert_eq!(Command::parse("eval"), Err(CommandError::MissingArgument("eval")));
        assert_eq!(
            Command::parse("frobnicate").unwrap_err().to_string(),
            "unknown command: frobnicate"
        );
    }
}
