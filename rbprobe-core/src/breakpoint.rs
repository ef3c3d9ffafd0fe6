//! ブレークポイント管理

use crate::Result;
use rbprobe_target::{Memory, Process, SoftwareBreakpoint, StopReason};
use std::collections::BTreeMap;
use tracing::debug;

/// ブレークポイントマネージャ
///
/// 命令アドレスごとにソフトウェアブレークポイント（INT3）を1つ持ちます。
/// 同じアドレスへの二重設定はエラーにします。
#[derive(Default)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<u64, SoftwareBreakpoint>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// ブレークポイントを追加し、有効化する
    pub fn insert(&mut self, address: u64, memory: &Memory) -> Result<()> {
        if self.breakpoints.contains_key(&address) {
            return Err(anyhow::anyhow!("Breakpoint already set at 0x{:x}", address));
        }
        let mut bp = SoftwareBreakpoint::new(address);
        bp.enable(memory)?;
        self.breakpoints.insert(address, bp);
        Ok(())
    }

    /// ブレークポイントを削除し、元の命令を戻す
    pub fn remove(&mut self, address: u64, memory: &Memory) -> Result<()> {
        let mut bp = self
            .breakpoints
            .remove(&address)
            .ok_or_else(|| anyhow::anyhow!("No breakpoint at 0x{:x}", address))?;
        bp.disable(memory)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.breakpoints.contains_key(&address)
    }

    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// `pc` にブレークポイントがあれば、一時的に外して1命令だけ実行する
    ///
    /// ブレークポイントで止まった後に再開するときに使います。
    /// ブレークポイントがなければ何もせず None を返します。
    pub fn step_over(&mut self, pc: u64, process: &Process, memory: &Memory) -> Result<Option<StopReason>> {
        let Some(bp) = self.breakpoints.get_mut(&pc) else {
            return Ok(None);
        };
        bp.disable(memory)?;
        let stepped = process.step();
        // プロセスが終了していれば戻す先がない
        if matches!(stepped, Ok(ref reason) if reason.is_terminal()) {
            self.breakpoints.remove(&pc);
            return stepped.map(Some);
        }
        bp.enable(memory)?;
        debug!("stepped over breakpoint at 0x{:x}", pc);
        stepped.map(Some)
    }

    /// すべてのブレークポイントを外す（デタッチ前の後始末）
    pub fn clear_all(&mut self, memory: &Memory) -> Result<()> {
        if self.count() > 0 {
            debug!("clearing {} breakpoints", self.count());
        }
        let mut first_error = None;
        for (address, mut bp) in std::mem::take(&mut self.breakpoints) {
            if let Err(e) = bp.disable(memory) {
                debug!("failed to restore 0x{:x}: {}", address, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
