//! レジスタアクセス機能
//!
//! ptraceから読んだレジスタは値型の`Registers`スナップショットに詰め替えます。
//! ステップゲートの引数読み取りはこのスナップショット経由で行うため、
//! テストでは実プロセスなしで任意のレジスタ状態を構築できます。

use crate::Result;
use nix::unistd::Pid;

/// x86-64 汎用レジスタのスナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
}

impl Registers {
    /// 停止中のスレッドからレジスタを読み取る
    pub fn read_live(tid: i32) -> Result<Self> {
        let regs = nix::sys::ptrace::getregs(Pid::from_raw(tid))?;
        Ok(Self {
            rip: regs.rip,
            rsp: regs.rsp,
            rbp: regs.rbp,
            rax: regs.rax,
            rdi: regs.rdi,
            rsi: regs.rsi,
            rdx: regs.rdx,
            rcx: regs.rcx,
            r8: regs.r8,
            r9: regs.r9,
        })
    }

    /// スナップショットの内容をスレッドに書き戻す
    ///
    /// スナップショットに含まれるレジスタだけを上書きし、
    /// それ以外は現在の値を保持します。
    pub fn write_live(&self, tid: i32) -> Result<()> {
        let pid = Pid::from_raw(tid);
        let mut regs = nix::sys::ptrace::getregs(pid)?;
        regs.rip = self.rip;
        regs.rsp = self.rsp;
        regs.rbp = self.rbp;
        regs.rax = self.rax;
        regs.rdi = self.rdi;
        regs.rsi = self.rsi;
        regs.rdx = self.rdx;
        regs.rcx = self.rcx;
        regs.r8 = self.r8;
        regs.r9 = self.r9;
        nix::sys::ptrace::setregs(pid, regs)?;
        Ok(())
    }

    /// System V呼び出し規約のn番目の整数引数レジスタを返す
    ///
    /// 7個目以降の引数はレジスタ渡しではないため`None`を返します。
    pub fn call_arg(&self, index: usize) -> Option<u64> {
        match index {
            0 => Some(self.rdi),
            1 => Some(self.rsi),
            2 => Some(self.rdx),
            3 => Some(self.rcx),
            4 => Some(self.r8),
            5 => Some(self.r9),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_args_follow_sysv_order() {
        let regs = Registers {
            rdi: 1,
            rsi: 2,
            rdx: 3,
            rcx: 4,
            r8: 5,
            r9: 6,
            ..Default::default()
        };
        for (i, expect) in (1u64..=6).enumerate() {
            assert_eq!(regs.call_arg(i), Some(expect));
        }
        assert_eq!(regs.call_arg(6), None);
    }
}
