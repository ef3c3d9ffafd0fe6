//! RNode のビットフィールド復号

use crate::accessor::{field, MemoryAccessor};
use crate::profile::{LayoutProfile, NodeLayout};
use crate::Result;

/// フラグワードから取り出したノードのフィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFields {
    pub node_type: u64,
    pub line: u64,
}

/// ノードのフラグワードを復号する
pub fn decode(flags: u64, layout: &NodeLayout) -> NodeFields {
    NodeFields {
        node_type: (flags >> layout.type_shift) & layout.type_mask,
        line: (flags >> layout.line_shift) & layout.line_mask,
    }
}

/// 復号済みのソース位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNode {
    pub address: u64,
    pub file: String,
    pub line: u64,
    pub node_type: u64,
}

impl SourceNode {
    /// `address` のノードを読み取る
    pub fn read<M: MemoryAccessor + ?Sized>(
        memory: &M,
        profile: &LayoutProfile,
        address: u64,
    ) -> Result<Self> {
        if address == 0 {
            return Err(anyhow::anyhow!("NULL node"));
        }
        let flags = memory.read_word(field(address, profile.flags.flags_offset)?)?;
        let fields = decode(flags, &profile.node);
        let file_ptr = memory.read_word(field(address, profile.node.file_offset)?)?;
        let file = if file_ptr == 0 {
            "(unknown)".to_string()
        } else {
            memory.read_c_string(file_ptr)?
        };
        Ok(Self {
            address,
            file,
            line: fields.line,
            node_type: fields.node_type,
        })
    }
}
