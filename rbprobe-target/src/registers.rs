//! レジスタアクセス機能
//!
//! x86-64 System V 呼び出し規約に依存する部分はこのモジュールに閉じ込めます。

use crate::Result;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// System V ABI で整数引数を渡すレジスタの数
pub const ARGUMENT_REGISTERS: usize = 6;

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        let regs = self.read()?;
        Ok(regs.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// 関数の第 `index` 引数（0始まり）を取得する
    ///
    /// 関数入口で停止している前提で、rdi, rsi, rdx, rcx, r8, r9 の順に対応します。
    pub fn argument(&self, index: usize) -> Result<u64> {
        let regs = self.read()?;
        argument_of(&regs, index)
    }
}

/// レジスタセットから第 `index` 引数を取り出す
pub fn argument_of(regs: &user_regs_struct, index: usize) -> Result<u64> {
    match index {
        0 => Ok(regs.rdi),
        1 => Ok(regs.rsi),
        2 => Ok(regs.rdx),
        3 => Ok(regs.rcx),
        4 => Ok(regs.r8),
        5 => Ok(regs.r9),
        _ => Err(anyhow::anyhow!(
            "Argument {} is not passed in a register (only {} are)",
            index,
            ARGUMENT_REGISTERS
        )),
    }
}

/// レジスタセットの第 `index` 引数を設定する
pub fn set_argument(regs: &mut user_regs_struct, index: usize, value: u64) -> Result<()> {
    let slot = match index {
        0 => &mut regs.rdi,
        1 => &mut regs.rsi,
        2 => &mut regs.rdx,
        3 => &mut regs.rcx,
        4 => &mut regs.r8,
        5 => &mut regs.r9,
        _ => {
            return Err(anyhow::anyhow!(
                "Cannot pass argument {} in a register (only {} are supported)",
                index,
                ARGUMENT_REGISTERS
            ))
        }
    };
    *slot = value;
    Ok(())
}
