//! ブレークポイント・ウォッチポイント機能

use crate::{Memory, Result};
use nix::unistd::Pid;

/// INT3命令のオペコード
const INT3_OPCODE: u8 = 0xCC;

/// DR7 の条件フィールド: 書き込み時にトラップ
const DR7_CONDITION_WRITE: u64 = 0b01;

/// ソフトウェアブレークポイント（INT3命令）
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, memory: &Memory) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        self.original_byte = memory.read_u8(self.address as usize)?;
        memory.write_u8(self.address as usize, INT3_OPCODE)?;

        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, memory: &Memory) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        memory.write_u8(self.address as usize, self.original_byte)?;

        self.enabled = false;
        Ok(())
    }
}

/// ハードウェアウォッチポイント（x86-64 デバッグレジスタ DR0〜DR3）
///
/// 1つのスロットだけを使い、指定アドレスへの書き込みでトラップさせます。
pub struct HardwareWatchpoint {
    address: u64,
    len: usize,
    slot: usize,
}

impl HardwareWatchpoint {
    /// 書き込みウォッチポイントを設定する
    ///
    /// `len` は 1/2/4/8 のいずれかで、アドレスはその長さにアラインされている必要があります。
    pub fn set_write(pid: i32, slot: usize, address: u64, len: usize) -> Result<Self> {
        if slot > 3 {
            return Err(anyhow::anyhow!("Invalid debug register slot: {}", slot));
        }
        let length_bits = match len {
            1 => 0b00,
            2 => 0b01,
            4 => 0b11,
            8 => 0b10,
            _ => return Err(anyhow::anyhow!("Unsupported watchpoint length: {}", len)),
        };
        if address % len as u64 != 0 {
            return Err(anyhow::anyhow!(
                "Watchpoint address 0x{:x} must be aligned to {} bytes",
                address,
                len
            ));
        }

        let pid = Pid::from_raw(pid);
        write_debug_reg(pid, slot, address)?;

        let mut dr7 = read_debug_reg(pid, 7)?;
        dr7 &= !((0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16)));
        dr7 |= 1u64 << (slot * 2);
        dr7 |= DR7_CONDITION_WRITE << (slot * 4 + 16);
        dr7 |= length_bits << (slot * 4 + 18);
        write_debug_reg(pid, 7, dr7)?;

        Ok(Self { address, len, slot })
    }

    /// 監視しているアドレス
    pub fn address(&self) -> u64 {
        self.address
    }

    /// 監視しているバイト数
    pub fn len(&self) -> usize {
        self.len
    }

    /// ウォッチポイントを解除する
    pub fn clear(self, pid: i32) -> Result<()> {
        let pid = Pid::from_raw(pid);
        let mut dr7 = read_debug_reg(pid, 7)?;
        dr7 &= !((0b11u64 << (self.slot * 2)) | (0b1111u64 << (self.slot * 4 + 16)));
        write_debug_reg(pid, 7, dr7)?;
        write_debug_reg(pid, self.slot, 0)?;
        // DR6 のヒット状態もクリアしておく
        write_debug_reg(pid, 6, 0)?;
        Ok(())
    }
}

/// `struct user` 内のデバッグレジスタのオフセット
fn debug_reg_offset(reg: usize) -> usize {
    std::mem::offset_of!(libc::user, u_debugreg) + reg * std::mem::size_of::<u64>()
}

/// デバッグレジスタを読み取る（PTRACE_PEEKUSER）
fn read_debug_reg(pid: Pid, reg: usize) -> Result<u64> {
    nix::errno::Errno::clear();
    let value = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid.as_raw(),
            debug_reg_offset(reg) as *mut libc::c_void,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if value == -1 {
        let errno = nix::errno::Errno::last();
        if errno != nix::errno::Errno::UnknownErrno {
            return Err(anyhow::anyhow!("Failed to read DR{}: {}", reg, errno));
        }
    }
    Ok(value as u64)
}

/// デバッグレジスタに書き込む（PTRACE_POKEUSER）
fn write_debug_reg(pid: Pid, reg: usize, value: u64) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            debug_reg_offset(reg) as *mut libc::c_void,
            value as *mut libc::c_void,
        )
    };
    if ret == -1 {
        return Err(anyhow::anyhow!(
            "Failed to write DR{}: {}",
            reg,
            nix::errno::Errno::last()
        ));
    }
    Ok(())
}
