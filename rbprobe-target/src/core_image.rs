//! ELFコアダンプのメモリイメージ
//!
//! PT_LOAD セグメントをアドレス順に保持し、生きたプロセスと同じ形で読み取れるようにします。

use crate::Result;
use object::{Object, ObjectSegment};
use std::path::Path;

/// コアダンプ内の1セグメント
#[derive(Debug, Clone)]
struct Segment {
    address: u64,
    data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> u64 {
        self.address + self.data.len() as u64
    }
}

/// コアダンプから復元したメモリイメージ
pub struct CoreImage {
    segments: Vec<Segment>,
}

impl CoreImage {
    /// コアファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read core file {:?}: {}", path, e))?;
        let file = object::File::parse(&*data)
            .map_err(|e| anyhow::anyhow!("Failed to parse core file {:?}: {}", path, e))?;

        let mut segments = Vec::new();
        for segment in file.segments() {
            let bytes = segment.data()
                .map_err(|e| anyhow::anyhow!("Failed to read segment at 0x{:x}: {}", segment.address(), e))?;
            // ダンプされなかったセグメント（filesz == 0）は読めない領域として扱う
            if bytes.is_empty() {
                continue;
            }
            segments.push((segment.address(), bytes.to_vec()));
        }

        Ok(Self::from_segments(segments))
    }

    /// アドレスとバイト列の組からイメージを構築する
    pub fn from_segments(segments: Vec<(u64, Vec<u8>)>) -> Self {
        let mut segments: Vec<Segment> = segments
            .into_iter()
            .map(|(address, data)| Segment { address, data })
            .collect();
        segments.sort_by_key(|s| s.address);
        Self { segments }
    }

    /// セグメント数
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// アドレスを含むセグメントのインデックス
    fn segment_index(&self, addr: u64) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.address <= addr);
        let candidate = idx.checked_sub(1)?;
        (addr < self.segments[candidate].end()).then_some(candidate)
    }

    /// メモリを読み取る
    ///
    /// 隣接するセグメントにまたがる読み取りも、隙間がなければ成功します。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut cursor = addr;

        while out.len() < size {
            let idx = self.segment_index(cursor).ok_or_else(|| {
                anyhow::anyhow!("Address 0x{:x} is not present in the core file", cursor)
            })?;
            let segment = &self.segments[idx];
            let start = (cursor - segment.address) as usize;
            let take = (size - out.len()).min(segment.data.len() - start);
            out.extend_from_slice(&segment.data[start..start + take]);
            cursor += take as u64;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> CoreImage {
        CoreImage::from_segments(vec![
            (0x2000, vec![0xbb; 0x10]),
            (0x1000, (0u8..0x10).collect()),
            (0x1010, vec![0xaa; 0x10]),
        ])
    }

    #[test]
    fn test_read_within_segment() {
        let core = image();
        assert_eq!(core.read(0x1004, 4).unwrap(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_read_across_adjacent_segments() {
        let core = image();
        let bytes = core.read(0x100e, 4).unwrap();
        assert_eq!(bytes, vec![0x0e, 0x0f, 0xaa, 0xaa]);
    }

    #[test]
    fn test_read_into_gap_fails() {
        let core = image();
        assert!(core.read(0x101c, 8).is_err());
        assert!(core.read(0x0fff, 1).is_err());
    }
}
