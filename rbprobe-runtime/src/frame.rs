//! フレームチェーンのアンワインド

use crate::accessor::{field, FunctionCaller, MemoryAccessor, NameLookup};
use crate::error::RuntimeError;
use crate::node::SourceNode;
use crate::profile::{FrameLayout, LayoutProfile};
use crate::thread::ThreadHandle;
use crate::Result;
use std::collections::HashSet;
use tracing::debug;

/// メソッド名を解決できなかったときの表示
pub const UNKNOWN_METHOD: &str = "(unknown)";

/// 1フレーム分の記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub frame: u64,
    pub node_type: u64,
    pub type_name: String,
    pub method: String,
    pub file: String,
    pub line: u64,
}

/// フレームのアンワインダ
pub struct FrameUnwinder<'a, T: MemoryAccessor + FunctionCaller + ?Sized> {
    target: &'a T,
    profile: &'a LayoutProfile,
    layout: FrameLayout,
}

impl<'a, T: MemoryAccessor + FunctionCaller + ?Sized> FrameUnwinder<'a, T> {
    pub fn new(target: &'a T, profile: &'a LayoutProfile) -> Result<Self> {
        let layout = profile.frame.ok_or_else(|| RuntimeError::UnsupportedReport {
            report: "stack unwinding",
            runtime: profile.family.to_string(),
        })?;
        Ok(Self { target, profile, layout })
    }

    /// `start_frame` / `start_node` から `prev` をたどってフレームを列挙する
    ///
    /// 次のいずれかで止まります: `prev` が0、`last_func` が0、次のノードが0。
    /// `last_func` が0のフレーム自身は出力に含みます。
    pub fn unwind(&self, thread: &ThreadHandle, start_frame: u64, start_node: u64) -> Result<Vec<FrameRecord>> {
        let lookup = NameLookup::new(self.target);
        let mut records = Vec::new();
        let mut visited = HashSet::new();
        let mut frame = start_frame;
        let mut node = start_node;

        while frame != 0 {
            // スタック上のフレームは、停止中のスレッドでは退避バッファに移されている
            if !self.profile.frames_are_heap_allocated && !thread.is_current {
                if let Some(remapped) = thread.remap_to_buffer(frame) {
                    debug!("frame 0x{:x} remapped to 0x{:x}", frame, remapped);
                    frame = remapped;
                    node = self.target.read_word(field(frame, self.layout.node)?)?;
                }
            }
            if node == 0 {
                break;
            }
            if !visited.insert(frame) {
                debug!("frame chain loops at 0x{:x}", frame);
                break;
            }

            let source = SourceNode::read(self.target, self.profile, node)?;
            let last_func = self.target.read_word(field(frame, self.layout.last_func)?)?;
            let method = if last_func == 0 {
                UNKNOWN_METHOD.to_string()
            } else {
                lookup.method_name(last_func).unwrap_or_else(|e| {
                    debug!("rb_id2name(0x{:x}) failed: {}", last_func, e);
                    UNKNOWN_METHOD.to_string()
                })
            };

            records.push(FrameRecord {
                frame,
                node_type: source.node_type,
                type_name: self.profile.node_type_name(source.node_type),
                method,
                file: source.file,
                line: source.line,
            });

            let prev = self.target.read_word(field(frame, self.layout.prev)?)?;
            if prev == 0 || last_func == 0 {
                break;
            }
            frame = prev;
            node = self.target.read_word(field(frame, self.layout.node)?)?;
        }

        Ok(records)
    }
}
