//! ターゲットへのアクセス境界
//!
//! 解析ロジックはここで定義するトレイトだけを通してターゲットに触れます。
//! 生きたプロセスとコアダンプの違い、ptrace やレジスタの扱いは実装側に閉じ込めます。

use crate::error::RuntimeError;
use crate::Result;

/// C文字列読み取りのチャンク境界（ページ境界をまたがないよう揃える）
const CSTRING_ALIGN: u64 = 64;

/// C文字列の読み取り上限
pub const MAX_CSTRING: usize = 4096;

/// 構造体のフィールドアドレス `base + offset`
///
/// `base` はターゲットから読んだ値なので、桁あふれは読み取りエラーと同じ扱いにします。
pub fn field(base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset)
        .ok_or_else(|| anyhow::anyhow!("Address overflow: 0x{:x} + 0x{:x}", base, offset))
}

/// ターゲットのアドレス空間とシンボルへの読み取りアクセス
pub trait MemoryAccessor {
    /// `addr` から `len` バイト読み取る
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// シンボルの実行時アドレス（存在しなければ None）
    fn symbol(&self, name: &str) -> Option<u64>;

    /// 8バイトのワードを読み取る（リトルエンディアン）
    fn read_word(&self, addr: u64) -> Result<u64> {
        self.read_sized(addr, 8)
    }

    /// 4バイトの値を読み取る
    fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(self.read_sized(addr, 4)? as u32)
    }

    /// 1/2/4/8バイトの符号なし整数を読み取る
    fn read_sized(&self, addr: u64, width: usize) -> Result<u64> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(anyhow::anyhow!("Unsupported integer width: {}", width));
        }
        let bytes = self.read(addr, width)?;
        if bytes.len() != width {
            return Err(anyhow::anyhow!("Short read at 0x{:x}", addr));
        }
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// 8バイトの浮動小数点数を読み取る
    fn read_f64(&self, addr: u64) -> Result<f64> {
        Ok(f64::from_bits(self.read_word(addr)?))
    }

    /// NUL終端のバイト列を読み取る
    fn read_c_bytes(&self, addr: u64, max_len: usize) -> Result<Vec<u8>> {
        if addr == 0 {
            return Err(anyhow::anyhow!("NULL string pointer"));
        }
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max_len {
            let chunk = ((CSTRING_ALIGN - cursor % CSTRING_ALIGN) as usize).min(max_len - out.len());
            let bytes = self.read(cursor, chunk)?;
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                out.extend_from_slice(&bytes[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&bytes);
            cursor = field(cursor, chunk as u64)?;
        }
        Ok(out)
    }

    /// NUL終端の文字列を読み取る（不正なUTF-8は置換する）
    fn read_c_string(&self, addr: u64) -> Result<String> {
        let bytes = self.read_c_bytes(addr, MAX_CSTRING)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// シンボルの位置に格納されたワードを読み取る
    fn read_global(&self, name: &str) -> Result<u64> {
        let addr = self
            .symbol(name)
            .ok_or_else(|| RuntimeError::MissingSymbol(name.to_string()))?;
        self.read_word(addr)
    }
}

/// ターゲット内の関数呼び出し
pub trait FunctionCaller {
    /// シンボル `name` の関数を整数引数で呼び出し、戻り値を返す
    fn call_function(&self, name: &str, args: &[u64]) -> Result<u64>;
}

/// 実行制御の停止理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// ソフトウェアブレークポイント（アドレスは命令の先頭）
    Breakpoint(u64),
    /// 書き込みウォッチポイント
    Watchpoint,
    /// 外部からの中断要求で止まった
    Interrupted,
    /// その他のシグナル
    Signal(String),
    /// プロセスが終了した
    Exited(i32),
}

/// 実行を制御できるターゲット（生きたプロセス）
pub trait Inferior: MemoryAccessor + FunctionCaller {
    /// メモリに書き込む
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// 実行ブレークポイントを設定する
    fn set_breakpoint(&mut self, addr: u64) -> Result<()>;

    /// 実行ブレークポイントを解除する
    fn clear_breakpoint(&mut self, addr: u64) -> Result<()>;

    /// 書き込みウォッチポイントを設定する（同時に1つ）
    fn set_write_watchpoint(&mut self, addr: u64, len: usize) -> Result<()>;

    /// 書き込みウォッチポイントを解除する
    fn clear_watchpoint(&mut self) -> Result<()>;

    /// 実行を再開し、次に停止するまで待つ
    fn resume(&mut self) -> Result<StopEvent>;

    /// 1命令だけ実行する
    fn single_step(&mut self) -> Result<()>;

    /// 現在のプログラムカウンタ
    fn program_counter(&self) -> Result<u64>;

    /// 関数入口で停止しているときの第 `index` 引数
    fn call_argument(&self, index: usize) -> Result<u64>;

    /// 何もせずに戻る関数本体の機械語
    fn return_instruction(&self) -> &'static [u8];

    /// 関数呼び出し中のシグナルでレジスタを巻き戻すか
    fn unwind_on_signal(&self) -> bool;

    /// 巻き戻し設定を変更する
    fn set_unwind_on_signal(&mut self, on: bool);

    /// 外部から中断が要求されているか
    fn interrupt_requested(&self) -> bool;

    /// ターゲットがまだ操作可能か
    fn is_alive(&self) -> bool;
}

/// ターゲット側の名前解決関数（rb_id2name / rb_class2name）の呼び出し
pub struct NameLookup<'a, T: MemoryAccessor + FunctionCaller + ?Sized> {
    target: &'a T,
}

impl<'a, T: MemoryAccessor + FunctionCaller + ?Sized> NameLookup<'a, T> {
    pub fn new(target: &'a T) -> Self {
        Self { target }
    }

    /// メソッドIDを名前に変換する
    pub fn method_name(&self, id: u64) -> Result<String> {
        self.call_for_string("rb_id2name", id)
    }

    /// クラスポインタをクラス名に変換する
    pub fn class_name(&self, klass: u64) -> Result<String> {
        self.call_for_string("rb_class2name", klass)
    }

    fn call_for_string(&self, function: &str, arg: u64) -> Result<String> {
        let ptr = self.target.call_function(function, &[arg])?;
        if ptr == 0 {
            return Err(anyhow::anyhow!("{}(0x{:x}) returned NULL", function, arg));
        }
        self.target.read_c_string(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// 64バイト境界で区切られた合成メモリ
    struct Pages {
        base: u64,
        bytes: Vec<u8>,
        symbols: HashMap<&'static str, u64>,
    }

    impl MemoryAccessor for Pages {
        fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
            let start = addr
                .checked_sub(self.base)
                .ok_or_else(|| anyhow::anyhow!("unmapped 0x{:x}", addr))? as usize;
            self.bytes
                .get(start..start + len)
                .map(|b| b.to_vec())
                .ok_or_else(|| anyhow::anyhow!("unmapped 0x{:x}", addr))
        }

        fn symbol(&self, name: &str) -> Option<u64> {
            self.symbols.get(name).copied()
        }
    }

    #[test]
    fn test_c_string_stops_at_region_end_without_overread() {
        // 文字列がリージョン末尾ぴったりで終わっても、境界を越えて読まない
        let mut bytes = vec![b'x'; 128];
        bytes[120..128].copy_from_slice(b"abcdefg\0");
        let pages = Pages { base: 0x1000, bytes, symbols: HashMap::new() };
        assert_eq!(pages.read_c_string(0x1000 + 120).unwrap(), "abcdefg");
    }

    #[test]
    fn test_read_global_missing_symbol() {
        let pages = Pages { base: 0x1000, bytes: vec![0; 16], symbols: HashMap::new() };
        let err = pages.read_global("heaps_used").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::MissingSymbol(name)) if name == "heaps_used"
        ));
    }

    #[test]
    fn test_read_sized_widths() {
        let mut symbols = HashMap::new();
        symbols.insert("heaps_used", 0x1000);
        let pages = Pages {
            base: 0x1000,
            bytes: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            symbols,
        };
        assert_eq!(pages.read_u32(0x1000).unwrap(), 0x0403_0201);
        assert_eq!(pages.read_global("heaps_used").unwrap(), 0x0807_0605_0403_0201);
        assert!(pages.read_sized(0x1000, 3).is_err());
    }
}
