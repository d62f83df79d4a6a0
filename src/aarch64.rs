//! Syscall ABI description for aarch64.
//!
//! Unlike x86-64, the latched syscall number of a stopped tracee is not part
//! of the general-purpose register block; changing it requires a
//! `PTRACE_SETREGSET` write to the `NT_ARM_SYSTEM_CALL` regset. Entry/exit
//! classification likewise has no in-band marker and is answered with
//! `PTRACE_GET_SYSCALL_INFO`.

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::{Result, ResultExt};

/// Defined in `arch/arm64/include/uapi/asm/ptrace.h`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// Register state of a tracee.
pub type Registers = user_pt_regs;

/// Byte width of the `svc #0` instruction.
pub const SYSCALL_INSN_LEN: u64 = 4;

/// Tight self-branch (`b .`) parked on the safe-fork trap page.
pub const TRAP_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x14];

pub(crate) const PTRACE_GET_SYSCALL_INFO: libc::c_uint = 0x420e;

const PTRACE_SYSCALL_INFO_ENTRY: u8 = 1;
const PTRACE_SYSCALL_INFO_EXIT: u8 = 2;

/// Header of `struct ptrace_syscall_info`; the engine only needs `op`.
#[repr(C)]
#[derive(Clone, Copy)]
struct ptrace_syscall_info_header {
    op: u8,
    pad: [u8; 3],
    arch: u32,
    instruction_pointer: u64,
    stack_pointer: u64,
}

pub fn syscall_nr(regs: &Registers) -> i64 {
    regs.regs[8] as i64
}

pub fn return_value(regs: &Registers) -> i64 {
    regs.regs[0] as i64
}

pub fn set_return_value(regs: &mut Registers, value: i64) {
    regs.regs[0] = value as u64;
}

pub fn ip(regs: &Registers) -> u64 {
    regs.pc
}

pub fn set_ip(regs: &mut Registers, ip: u64) {
    regs.pc = ip;
}

pub fn sp(regs: &Registers) -> u64 {
    regs.sp
}

pub fn set_sp(regs: &mut Registers, sp: u64) {
    regs.sp = sp;
}

/// Syscall argument registers `x0`..`x5`.
pub fn arg(regs: &Registers, index: usize) -> u64 {
    assert!(index < 6, "syscall argument index out of range: {}", index);
    regs.regs[index]
}

pub fn set_arg(regs: &mut Registers, index: usize, value: u64) {
    assert!(index < 6, "syscall argument index out of range: {}", index);
    regs.regs[index] = value;
}

/// True when the kernel reports the current stop as a syscall-entry.
///
/// `x0` is a live argument register at entry, so there is no in-band marker
/// to inspect; ask the kernel instead.
pub fn in_syscall_entry(pid: Pid, _regs: &Registers) -> bool {
    syscall_entry_hint(pid, _regs) == Some(true)
}

pub(crate) fn syscall_entry_hint(pid: Pid, _regs: &Registers) -> Option<bool> {
    let mut info = std::mem::MaybeUninit::<ptrace_syscall_info_header>::uninit();

    let res = unsafe {
        libc::ptrace(
            PTRACE_GET_SYSCALL_INFO,
            pid.as_raw(),
            std::mem::size_of::<ptrace_syscall_info_header>() as *const libc::c_void,
            info.as_mut_ptr(),
        )
    };

    if res < 0 {
        return None;
    }

    let info = unsafe { info.assume_init() };
    match info.op {
        PTRACE_SYSCALL_INFO_ENTRY => Some(true),
        PTRACE_SYSCALL_INFO_EXIT => Some(false),
        _ => None,
    }
}

/// Change which syscall a tracee stopped at syscall-entry will run, via the
/// `NT_ARM_SYSTEM_CALL` regset. Also mirrors the number into `x8` so the
/// local register copy stays coherent.
pub fn set_syscall_nr(pid: Pid, regs: &mut Registers, nr: i64) -> Result<()> {
    let nr32 = nr as i32;
    let mut iov = libc::iovec {
        iov_base: &nr32 as *const _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<i32>(),
    };

    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            libc::NT_ARM_SYSTEM_CALL as *mut libc::c_void,
            &mut iov as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res)
        .map(drop)
        .or_kernel(pid, "PTRACE_SETREGSET (NT_ARM_SYSTEM_CALL)")?;

    regs.regs[8] = nr as u64;

    Ok(())
}

/// Stage `nr` so the *next* syscall-entry dispatches it: the kernel reads
/// `x8` at the `svc` instruction.
pub fn stage_syscall_nr(regs: &mut Registers, nr: i64) {
    regs.regs[8] = nr as u64;
}

/// Move the instruction pointer back over one `svc #0` instruction.
pub fn rewind_ip(regs: &mut Registers) {
    regs.pc -= SYSCALL_INSN_LEN;
}

/// Arrange for a register snapshot taken at a syscall-entry stop to re-execute
/// its syscall when resumed. `x8` still holds the number, so backing up the
/// program counter is enough.
pub fn rewind_to_syscall(regs: &mut Registers) {
    rewind_ip(regs);
}
