//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use rbprobe_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// 正の件数をパース
pub fn parse_count(s: &str) -> Result<usize> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err(anyhow::anyhow!("Count must be positive")),
        Ok(n) => Ok(n),
        Err(e) => Err(anyhow::anyhow!("Invalid count '{}': {}", s.trim(), e)),
    }
}
