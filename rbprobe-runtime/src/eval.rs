//! ターゲット内での式評価
//!
//! コードを例外を捕まえる `inspect` で包み、`rb_eval_string_protect` で評価します。
//! 結果の文字列は `rb_string_value_cstr` で C 文字列に変換して読み取ります。

use crate::accessor::Inferior;
use crate::Result;
use tracing::{debug, warn};

/// 評価結果を文字列にするラッパー
pub fn harness(code: &str) -> String {
    format!(
        "begin; ({}).inspect; rescue Exception => e; \"#<\" + e.class.name + \": \" + e.message + \">\"; end",
        code
    )
}

/// コードを評価し、inspect した結果を返す
///
/// 確保したメモリは成否にかかわらず解放します。
pub fn evaluate<I: Inferior + ?Sized>(inferior: &mut I, code: &str) -> Result<String> {
    let saved_unwind = inferior.unwind_on_signal();
    inferior.set_unwind_on_signal(true);

    let mut allocations = Vec::new();
    let result = run(inferior, code, &mut allocations);

    for address in allocations {
        if let Err(e) = inferior.call_function("free", &[address]) {
            warn!("failed to free 0x{:x}: {}", address, e);
        }
    }
    inferior.set_unwind_on_signal(saved_unwind);
    result
}

fn allocate<I: Inferior + ?Sized>(inferior: &mut I, size: u64, allocations: &mut Vec<u64>) -> Result<u64> {
    let address = inferior.call_function("malloc", &[size])?;
    if address == 0 {
        return Err(anyhow::anyhow!("malloc({}) returned NULL", size));
    }
    allocations.push(address);
    Ok(address)
}

fn run<I: Inferior + ?Sized>(inferior: &mut I, code: &str, allocations: &mut Vec<u64>) -> Result<String> {
    let mut source = harness(code).into_bytes();
    source.push(0);

    let buffer = allocate(inferior, source.len() as u64, allocations)?;
    inferior.write(buffer, &source)?;

    // [0..4) に protect の状態、[8..16) に結果の VALUE を置く
    let scratch = allocate(inferior, 16, allocations)?;
    inferior.write(scratch, &[0u8; 16])?;

    let value = inferior.call_function("rb_eval_string_protect", &[buffer, scratch])?;
    let state = inferior.read_u32(scratch)?;
    if state != 0 {
        return Err(anyhow::anyhow!("evaluation failed (protect state {})", state));
    }
    debug!("eval result VALUE 0x{:x}", value);

    inferior.write(scratch + 8, &value.to_le_bytes())?;
    let text = inferior.call_function("rb_string_value_cstr", &[scratch + 8])?;
    if text == 0 {
        return Err(anyhow::anyhow!("rb_string_value_cstr returned NULL"));
    }
    inferior.read_c_string(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_wraps_code() {
        let wrapped = harness("1 + 1");
        assert!(wrapped.starts_with("begin; (1 + 1).inspect; rescue Exception => e;"));
        assert!(wrapped.ends_with("end"));
    }
}
