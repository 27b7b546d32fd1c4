//! レジスタアクセス機能

use crate::Result;
use conbreak_core::ThreadId;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// スレッドのレジスタ
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.tid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, regs)?;
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
}

/// DWARFレジスタ番号（x86_64 System V ABI）からレジスタ値を取り出す
pub fn dwarf_register(regs: &user_regs_struct, reg: u16) -> Option<u64> {
    let value = match reg {
        0 => regs.rax,
        1 => regs.rdx,
        2 => regs.rcx,
        3 => regs.rbx,
        4 => regs.rsi,
        5 => regs.rdi,
        6 => regs.rbp,
        7 => regs.rsp,
        8 => regs.r8,
        9 => regs.r9,
        10 => regs.r10,
        11 => regs.r11,
        12 => regs.r12,
        13 => regs.r13,
        14 => regs.r14,
        15 => regs.r15,
        16 => regs.rip,
        _ => return None,
    };
    Some(value)
}
