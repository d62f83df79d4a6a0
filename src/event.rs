//! Classified tracee events and the syscall argument snapshot they carry.

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::arch;
use crate::arch::Registers;

/// What a call to `wait_event` observed.
///
/// The numeric values are stable and part of the wire-level contract with
/// controllers that persist or compare event kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum EventKind {
    /// Nothing observed yet; the initial state of a tracee's event slot.
    None = 1,

    /// A PRE or POST syscall-stop. Consult the tracee's `pre_syscall` flag
    /// for which half.
    Syscall = 2,

    /// A signal-delivery-stop. The signal is re-delivered on continue unless
    /// the controller suppresses or replaces it.
    Signal = 3,

    /// A stop the engine does not classify further; pass it through.
    Internal = 4,

    /// A tracee exited, or no tracees remain (`pid` is `None`).
    Quit = 5,
}

/// What a hook asks the engine to do with the event it was shown.
///
/// Numeric values are stable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum HookAction {
    /// Resume the tracee and keep waiting.
    Continue = 0,

    /// Kill the tracee and forget it.
    KillChild = 1,

    /// Kill every tracee and return a quit event.
    Abort = 2,

    /// Behave as if no hook were installed: hand the event to the controller.
    NoHook = 3,
}

/// Snapshot of the syscall argument registers in the architecture's canonical
/// mapping, plus the return register, syscall number, and instruction and
/// stack pointers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyscallArgs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub return_code: i64,
    pub syscall: i64,
    pub ip: u64,
    pub sp: u64,
}

impl SyscallArgs {
    pub(crate) fn from_regs(regs: &Registers) -> Self {
        SyscallArgs {
            a0: arch::arg(regs, 0),
            a1: arch::arg(regs, 1),
            a2: arch::arg(regs, 2),
            a3: arch::arg(regs, 3),
            a4: arch::arg(regs, 4),
            a5: arch::arg(regs, 5),
            return_code: arch::return_value(regs),
            syscall: arch::syscall_nr(regs),
            ip: arch::ip(regs),
            sp: arch::sp(regs),
        }
    }

    /// Write the six argument registers into `regs`. The syscall number,
    /// return register, and pointers are deliberately left alone; those are
    /// staged by the code that owns the stop.
    pub(crate) fn apply_to(&self, regs: &mut Registers) {
        arch::set_arg(regs, 0, self.a0);
        arch::set_arg(regs, 1, self.a1);
        arch::set_arg(regs, 2, self.a2);
        arch::set_arg(regs, 3, self.a3);
        arch::set_arg(regs, 4, self.a4);
        arch::set_arg(regs, 5, self.a5);
    }

    pub fn args(&self) -> [u64; 6] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5]
    }
}

/// One classified observation of a tracee, returned by `wait_event` and
/// recorded as the tracee's last event.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub kind: EventKind,

    /// The tracee this event names. Absent only for the final "no tracees
    /// remain" quit event.
    pub pid: Option<Pid>,

    /// Syscall number for [`EventKind::Syscall`] events.
    pub syscall: i64,

    /// Signal scheduled for delivery when the tracee is continued.
    pub pending: Option<Signal>,

    pub args: SyscallArgs,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            kind: EventKind::None,
            pid: None,
            syscall: 0,
            pending: None,
            args: SyscallArgs::default(),
        }
    }
}

impl Event {
    pub(crate) fn syscall_stop(pid: Pid, args: SyscallArgs) -> Self {
        Event {
            kind: EventKind::Syscall,
            pid: Some(pid),
            syscall: args.syscall,
            pending: None,
            args,
        }
    }

    pub(crate) fn signal(pid: Pid, signal: Signal) -> Self {
        Event {
            kind: EventKind::Signal,
            pid: Some(pid),
            pending: Some(signal),
            ..Event::default()
        }
    }

    pub(crate) fn internal(pid: Pid) -> Self {
        Event {
            kind: EventKind::Internal,
            pid: Some(pid),
            ..Event::default()
        }
    }

    pub(crate) fn quit(pid: impl Into<Option<Pid>>) -> Self {
        Event {
            kind: EventKind::Quit,
            pid: pid.into(),
            ..Event::default()
        }
    }

    /// Remove any signal scheduled for delivery on continue.
    pub fn suppress(&mut self) {
        self.pending = None;
    }

    /// Replace the signal scheduled for delivery on continue.
    pub fn set_pending(&mut self, signal: impl Into<Option<Signal>>) {
        self.pending = signal.into();
    }
}
