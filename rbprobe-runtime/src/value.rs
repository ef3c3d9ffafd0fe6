//! VALUE 1つの構造判定

use crate::accessor::{field, MemoryAccessor};
use crate::heap::HeapWalker;
use crate::profile::LayoutProfile;
use crate::Result;
use std::fmt;

/// VALUE の種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Fixnum(i64),
    Symbol(u64),
    Nil,
    True,
    False,
    Undef,
    /// ヒープの空きスロット
    FreeSlot { address: u64 },
    /// ヒープ上の使用中オブジェクト
    Object {
        address: u64,
        tag: u64,
        type_name: String,
        klass: u64,
        flags: u64,
    },
    /// どのアリーナにも含まれないアドレス
    Foreign { address: u64 },
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Fixnum(n) => write!(f, "fixnum {}", n),
            ValueKind::Symbol(id) => write!(f, "symbol (id {})", id),
            ValueKind::Nil => write!(f, "nil"),
            ValueKind::True => write!(f, "true"),
            ValueKind::False => write!(f, "false"),
            ValueKind::Undef => write!(f, "undef"),
            ValueKind::FreeSlot { address } => write!(f, "0x{:x}: free slot", address),
            ValueKind::Object { address, type_name, klass, flags, .. } => write!(
                f,
                "0x{:x}: {} (klass 0x{:x}, flags 0x{:x})",
                address, type_name, klass, flags
            ),
            ValueKind::Foreign { address } => write!(f, "0x{:x}: not a heap slot", address),
        }
    }
}

/// VALUE を判定する
///
/// 即値を先に調べ、それ以外はヒープスロットとしてフラグワードを読みます。
pub fn decode_value<M: MemoryAccessor + ?Sized>(
    memory: &M,
    profile: &LayoutProfile,
    value: u64,
) -> Result<ValueKind> {
    let imm = &profile.immediates;
    if value & imm.fixnum_flag != 0 {
        return Ok(ValueKind::Fixnum((value as i64) >> 1));
    }
    if value & imm.symbol_mask == imm.symbol_flag {
        return Ok(ValueKind::Symbol(value >> imm.symbol_shift));
    }
    match value {
        v if v == imm.qfalse => return Ok(ValueKind::False),
        v if v == imm.qtrue => return Ok(ValueKind::True),
        v if v == imm.qnil => return Ok(ValueKind::Nil),
        v if v == imm.qundef => return Ok(ValueKind::Undef),
        _ => {}
    }

    // アリーナ一覧が読めない場合（シンボルがない等）は範囲チェックを省く
    let slot_size = profile.heap.slot_size;
    if let Ok(arenas) = HeapWalker::new(memory, profile).arenas() {
        let in_heap = arenas.iter().any(|a| a.holds_slot(value, slot_size));
        if !in_heap {
            return Ok(ValueKind::Foreign { address: value });
        }
    }

    let flags = memory.read_word(field(value, profile.flags.flags_offset)?)?;
    if flags == 0 {
        return Ok(ValueKind::FreeSlot { address: value });
    }
    let tag = profile.type_tag(flags);
    Ok(ValueKind::Object {
        address: value,
        tag,
        type_name: profile.type_name(tag).to_string(),
        klass: memory.read_word(field(value, profile.flags.class_offset)?)?,
        flags,
    })
}
