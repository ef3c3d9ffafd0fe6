//! ヒープアリーナの走査
//!
//! アリーナ数と各アリーナの (先頭, スロット数) は走査開始時に一度だけ読みます。
//! フラグワードはイテレータを進めるたびにチャンク単位で読み直します。
//! ターゲットが停止していることが前提で、走行中のプロセスに対しては結果が揺れます。

use crate::accessor::{field, MemoryAccessor};
use crate::profile::LayoutProfile;
use crate::Result;
use tracing::debug;

/// 一度に読み取るスロット数
const CHUNK_SLOTS: u64 = 512;

/// ヒープスロット1つ分のビュー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSlot {
    pub address: u64,
    pub flags: u64,
}

impl HeapSlot {
    /// フラグが0でなければ使用中
    pub fn is_live(&self) -> bool {
        self.flags != 0
    }

    pub fn type_tag(&self, profile: &LayoutProfile) -> u64 {
        profile.type_tag(self.flags)
    }
}

/// アリーナ1つの範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    pub base: u64,
    pub limit: u64,
}

impl Arena {
    /// `index` 番目のスロットのアドレス（桁あふれすれば None）
    pub fn slot_address(&self, index: u64, slot_size: u64) -> Option<u64> {
        index.checked_mul(slot_size).and_then(|offset| self.base.checked_add(offset))
    }

    /// `addr` がこのアリーナのスロット先頭か
    pub fn holds_slot(&self, addr: u64, slot_size: u64) -> bool {
        match self.slot_address(self.limit, slot_size) {
            Some(end) => addr >= self.base && addr < end && (addr - self.base) % slot_size == 0,
            None => false,
        }
    }
}

/// ヒープ走査器
pub struct HeapWalker<'a, M: MemoryAccessor + ?Sized> {
    memory: &'a M,
    profile: &'a LayoutProfile,
}

impl<'a, M: MemoryAccessor + ?Sized> HeapWalker<'a, M> {
    pub fn new(memory: &'a M, profile: &'a LayoutProfile) -> Self {
        Self { memory, profile }
    }

    /// アリーナの一覧を読み取る
    pub fn arenas(&self) -> Result<Vec<Arena>> {
        let heap = &self.profile.heap;
        let count = read_global_field(self.memory, heap.arena_count.symbol, heap.arena_count.offset, heap.arena_count.width)?;
        let table = read_global_field(self.memory, heap.arena_table.symbol, heap.arena_table.offset, heap.arena_table.width)?;

        let mut arenas = Vec::new();
        for i in 0..count {
            let Some(descriptor) = i
                .checked_mul(heap.arena_stride)
                .and_then(|offset| table.checked_add(offset))
            else {
                debug!("arena table 0x{:x} overflows at entry {} of {}", table, i, count);
                break;
            };
            let base = self.memory.read_word(field(descriptor, heap.slot_offset)?)?;
            let limit = self.memory.read_sized(field(descriptor, heap.limit_offset)?, heap.limit_width)?;
            arenas.push(Arena { base, limit });
        }
        debug!("{} heap arenas", arenas.len());
        Ok(arenas)
    }

    /// すべてのスロットをアリーナ順・アドレス昇順に列挙する
    pub fn walk_all_slots(&self) -> Result<SlotIter<'a, M>> {
        Ok(SlotIter {
            memory: self.memory,
            profile: self.profile,
            arenas: self.arenas()?,
            arena: 0,
            index: 0,
            chunk: Vec::new(),
            chunk_pos: 0,
        })
    }

    /// 使用中のスロットを型タグとともに列挙する
    pub fn walk_live_slots(&self) -> Result<impl Iterator<Item = Result<(HeapSlot, u64)>> + 'a> {
        let profile = self.profile;
        Ok(self.walk_all_slots()?.filter_map(move |slot| match slot {
            Ok(slot) if slot.is_live() => Some(Ok((slot, slot.type_tag(profile)))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }))
    }
}

fn read_global_field<M: MemoryAccessor + ?Sized>(
    memory: &M,
    symbol: &str,
    offset: u64,
    width: usize,
) -> Result<u64> {
    let addr = memory
        .symbol(symbol)
        .ok_or_else(|| crate::RuntimeError::MissingSymbol(symbol.to_string()))?;
    memory.read_sized(field(addr, offset)?, width)
}

/// スロット列挙のイテレータ
pub struct SlotIter<'a, M: MemoryAccessor + ?Sized> {
    memory: &'a M,
    profile: &'a LayoutProfile,
    arenas: Vec<Arena>,
    arena: usize,
    /// 現在のアリーナ内で次に読むチャンクの先頭スロット番号
    index: u64,
    chunk: Vec<HeapSlot>,
    chunk_pos: usize,
}

impl<'a, M: MemoryAccessor + ?Sized> SlotIter<'a, M> {
    /// 読み取り対象のアリーナ一覧
    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    fn fill_chunk(&mut self) -> Option<Result<()>> {
        loop {
            let arena = *self.arenas.get(self.arena)?;
            if self.index >= arena.limit {
                self.arena += 1;
                self.index = 0;
                continue;
            }

            let slot_size = self.profile.heap.slot_size;
            let count = CHUNK_SLOTS.min(arena.limit - self.index);
            let (Some(start), Some(_)) = (
                arena.slot_address(self.index, slot_size),
                arena.slot_address(self.index + count, slot_size),
            ) else {
                debug!("arena 0x{:x} with {} slots overflows the address space", arena.base, arena.limit);
                self.arena += 1;
                self.index = 0;
                continue;
            };
            self.index += count;

            let bytes = match self.memory.read(start, (count * slot_size) as usize) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // このアリーナの残りは読めないものとして次へ進む
                    self.arena += 1;
                    self.index = 0;
                    return Some(Err(e));
                }
            };

            let flags_offset = self.profile.flags.flags_offset as usize;
            self.chunk = bytes
                .chunks_exact(slot_size as usize)
                .enumerate()
                .map(|(i, slot)| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(&slot[flags_offset..flags_offset + 8]);
                    HeapSlot {
                        address: start + i as u64 * slot_size,
                        flags: u64::from_le_bytes(word),
                    }
                })
                .collect();
            self.chunk_pos = 0;
            return Some(Ok(()));
        }
    }
}

impl<'a, M: MemoryAccessor + ?Sized> Iterator for SlotIter<'a, M> {
    type Item = Result<HeapSlot>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.chunk_pos >= self.chunk.len() {
            if let Err(e) = self.fill_chunk()? {
                return Some(Err(e));
            }
        }
        let slot = self.chunk[self.chunk_pos];
        self.chunk_pos += 1;
        Some(Ok(slot))
    }
}
