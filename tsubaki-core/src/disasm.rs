//! ゲート関数の出口検出
//!
//! 複数出口を持つゲートでは、最初の出口から戻ったあとに残りの出口を
//! 再評価するため、ゲート本体のret命令にもブレークポイントを張ります。
//! そのretのアドレスをここで逆アセンブルして求めます。

use capstone::arch::x86::{ArchMode, ArchSyntax};
use capstone::prelude::*;

use crate::Result;

/// 関数バイト列からret命令の絶対アドレスを列挙する
pub fn scan_returns(code: &[u8], base_addr: u64) -> Result<Vec<u64>> {
    let cs = Capstone::new()
        .x86()
        .mode(ArchMode::Mode64)
        .syntax(ArchSyntax::Intel)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to initialize disassembler: {}", e))?;

    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| anyhow::anyhow!("failed to disassemble at {:#x}: {}", base_addr, e))?;

    let mut returns = Vec::new();
    for insn in insns.as_ref() {
        match insn.mnemonic() {
            Some("ret") | Some("retq") => returns.push(insn.address()),
            _ => {}
        }
    }
    Ok(returns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_ret() {
        // xor eax, eax; ret; nop; ret
        let code = [0x31, 0xc0, 0xc3, 0x90, 0xc3];
        let rets = scan_returns(&code, 0x4000).unwrap();
        assert_eq!(rets, vec![0x4002, 0x4004]);
    }

    #[test]
    fn no_ret_in_straight_line_code() {
        // mov rax, 1
        let code = [0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00];
        assert!(scan_returns(&code, 0x1000).unwrap().is_empty());
    }
}
