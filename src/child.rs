//! The per-tracee record and low-level control of a single tracee.

use std::any::Any;
use std::fs::File;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[cfg(target_arch = "aarch64")]
use nix::errno::Errno;

use crate::arch::Registers;
use crate::error::{Result, ResultExt};
use crate::event::Event;
use crate::inject::Inject;

/// A process under the engine's control.
///
/// Owned by the session's child registry; handed to hooks by mutable
/// reference. All operations require the tracee to be ptrace-stopped, which
/// holds whenever a hook or controller sees it.
pub struct Child {
    pid: Pid,

    /// True if this tracee was acquired with attach rather than spawned.
    ///
    /// Attached tracees only got a tracer to take a peek; they are detached
    /// rather than killed on shutdown. Descendants adopted through an
    /// attached tracee inherit the flag.
    attached: bool,

    /// PRE/POST position in the syscall-stop dance. True while the tracee
    /// sits at (or runs beyond) a syscall-entry the controller has seen.
    pub(crate) pre_syscall: bool,

    /// Admitted to the registry, but its first stop (the attach `SIGSTOP`)
    /// has not been observed yet, so trace options are still unset.
    pub(crate) attach_pending: bool,

    /// Lazily-opened handle on `/proc/<pid>/mem`; closed when the child is
    /// forgotten.
    pub(crate) mem: Option<File>,

    /// Set when opening `/proc/<pid>/mem` was refused; bulk transfers fall
    /// back to word-granularity ptrace from then on.
    pub(crate) mem_unavailable: bool,

    /// Number of the last syscall denied, pending its synthesized POST.
    pub(crate) denied_nr: Option<i64>,

    /// Controller-owned slot. The engine never inspects it.
    pub custom: Option<Box<dyn Any>>,

    pub(crate) inj: Inject,

    /// Last event observed on this tracee.
    pub(crate) event: Event,

    /// Child pid acquired through controlled forking. Written only by the
    /// safe-fork protocol.
    pub(crate) safe_fork_pid: Option<Pid>,
}

impl Child {
    pub(crate) fn new(pid: Pid, attached: bool) -> Self {
        Child {
            pid,
            attached,
            pre_syscall: false,
            attach_pending: false,
            mem: None,
            mem_unavailable: false,
            denied_nr: None,
            custom: None,
            inj: Inject::default(),
            event: Event::default(),
            safe_fork_pid: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    /// True while the last syscall-stop was the PRE half.
    pub fn is_pre_syscall(&self) -> bool {
        self.pre_syscall
    }

    /// The last event observed on this tracee.
    pub fn last_event(&self) -> &Event {
        &self.event
    }

    /// Number of the syscall most recently rejected with `deny_syscall`,
    /// until its synthesized POST has been delivered.
    pub fn denied_syscall(&self) -> Option<i64> {
        self.denied_nr
    }

    /// Pid of the most recent child acquired through the safe-fork protocol.
    pub fn safe_fork_pid(&self) -> Option<Pid> {
        self.safe_fork_pid
    }

    #[cfg(target_arch = "x86_64")]
    pub fn registers(&self) -> Result<Registers> {
        ptrace::getregs(self.pid).or_kernel(self.pid, "PTRACE_GETREGS")
    }

    #[cfg(target_arch = "aarch64")]
    pub fn registers(&self) -> Result<Registers> {
        let mut data = std::mem::MaybeUninit::<Registers>::uninit();
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res)
            .map(drop)
            .or_kernel(self.pid, "PTRACE_GETREGSET")?;

        Ok(unsafe { data.assume_init() })
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        ptrace::setregs(self.pid, regs).or_kernel(self.pid, "PTRACE_SETREGS")
    }

    #[cfg(target_arch = "aarch64")]
    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: &regs as *const _ as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res)
            .map(drop)
            .or_kernel(self.pid, "PTRACE_SETREGSET")
    }

    /// Resume the tracee until its next syscall-stop, delivering `signal`
    /// if given.
    pub(crate) fn restart_syscall(&mut self, signal: Option<Signal>) -> Result<()> {
        ptrace::syscall(self.pid, signal).or_kernel(self.pid, "PTRACE_SYSCALL")
    }

    pub(crate) fn detach(&mut self, signal: Option<Signal>) -> Result<()> {
        ptrace::detach(self.pid, signal).or_kernel(self.pid, "PTRACE_DETACH")
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("pid", &self.pid)
            .field("attached", &self.attached)
            .field("pre_syscall", &self.pre_syscall)
            .field("denied_nr", &self.denied_nr)
            .field("safe_fork_pid", &self.safe_fork_pid)
            .finish_non_exhaustive()
    }
}
