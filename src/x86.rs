//! Syscall ABI description for x86-64.
//!
//! Maps the roles the engine cares about (syscall number, arguments, return
//! value, instruction and stack pointers) onto the physical register block,
//! and knows how to rewind a stopped tracee so the kernel re-executes a
//! `syscall` instruction.

use nix::unistd::Pid;

use crate::error::Result;

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// Byte width of the `syscall` instruction (`0f 05`).
pub const SYSCALL_INSN_LEN: u64 = 2;

/// Tight self-branch (`jmp .`) parked on the safe-fork trap page. A process
/// executing it makes no progress until its registers are rewritten.
pub const TRAP_CODE: [u8; 2] = [0xeb, 0xfe];

pub fn syscall_nr(regs: &Registers) -> i64 {
    regs.orig_rax as i64
}

pub fn return_value(regs: &Registers) -> i64 {
    regs.rax as i64
}

pub fn set_return_value(regs: &mut Registers, value: i64) {
    regs.rax = value as u64;
}

pub fn ip(regs: &Registers) -> u64 {
    regs.rip
}

pub fn set_ip(regs: &mut Registers, ip: u64) {
    regs.rip = ip;
}

pub fn sp(regs: &Registers) -> u64 {
    regs.rsp
}

pub fn set_sp(regs: &mut Registers, sp: u64) {
    regs.rsp = sp;
}

/// Syscall argument registers, in ABI order.
pub fn arg(regs: &Registers, index: usize) -> u64 {
    match index {
        0 => regs.rdi,
        1 => regs.rsi,
        2 => regs.rdx,
        3 => regs.r10,
        4 => regs.r8,
        5 => regs.r9,
        _ => panic!("syscall argument index out of range: {}", index),
    }
}

pub fn set_arg(regs: &mut Registers, index: usize, value: u64) {
    match index {
        0 => regs.rdi = value,
        1 => regs.rsi = value,
        2 => regs.rdx = value,
        3 => regs.r10 = value,
        4 => regs.r8 = value,
        5 => regs.r9 = value,
        _ => panic!("syscall argument index out of range: {}", index),
    }
}

/// True when the register block looks like a syscall-entry stop: the kernel
/// parks `-ENOSYS` in `rax` from entry until the call completes.
pub fn in_syscall_entry(regs: &Registers) -> bool {
    regs.rax as i64 == -(libc::ENOSYS as i64)
}

/// Best-effort entry/exit classification of a syscall-stop.
///
/// `rax != -ENOSYS` can only be an exit stop. `rax == -ENOSYS` is ambiguous
/// (a genuine entry, or an exit whose result happens to be `-ENOSYS`), so no
/// claim is made.
pub(crate) fn syscall_entry_hint(_pid: Pid, regs: &Registers) -> Option<bool> {
    if in_syscall_entry(regs) {
        None
    } else {
        Some(false)
    }
}

/// Change which syscall a tracee stopped at syscall-entry will run.
///
/// On x86-64 the kernel dispatches on `orig_rax`, which tracers may rewrite
/// freely while the tracee is stopped.
pub fn set_syscall_nr(_pid: Pid, regs: &mut Registers, nr: i64) -> Result<()> {
    regs.orig_rax = nr as u64;
    Ok(())
}

/// Stage `nr` so the *next* syscall-entry dispatches it. Before entry the
/// kernel reads the number from `rax`, not `orig_rax`.
pub fn stage_syscall_nr(regs: &mut Registers, nr: i64) {
    regs.rax = nr as u64;
}

/// Move the instruction pointer back over one `syscall` instruction.
pub fn rewind_ip(regs: &mut Registers) {
    regs.rip -= SYSCALL_INSN_LEN;
}

/// Arrange for a register snapshot taken at a syscall-entry stop to re-execute
/// its syscall when resumed: back up over the instruction and re-stage the
/// latched number (the kernel clobbered `rax` with `-ENOSYS` at entry).
pub fn rewind_to_syscall(regs: &mut Registers) {
    rewind_ip(regs);
    regs.rax = regs.orig_rax;
}
