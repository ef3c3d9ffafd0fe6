//! 逆アセンブル機能
//!
//! ターゲットに書き込むトランポリンの機械語が、本当に `ret` 1命令だけかを確かめます。

use crate::Result;
use capstone::prelude::*;

fn x86_64() -> Result<Capstone> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

/// `code` 全体がちょうど1つの ret 命令か
pub fn is_bare_return(code: &[u8]) -> Result<bool> {
    let cs = x86_64()?;
    let insns = cs
        .disasm_all(code, 0)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;
    let insns = insns.as_ref();
    Ok(insns.len() == 1
        && insns[0].bytes().len() == code.len()
        && matches!(insns[0].mnemonic(), Some("ret") | Some("retq")))
}
