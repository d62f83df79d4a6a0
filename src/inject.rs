//! Splicing synthetic system calls into a stopped tracee.
//!
//! A tracee stopped at a syscall-stop can be made to execute a call it never
//! issued. At a PRE stop the pending call's registers are overwritten and,
//! once the injected call completes, the original is re-executed by backing
//! the instruction pointer over the syscall instruction. At a POST stop the
//! rewind happens up front, giving the injected call a fresh entry. Either
//! way the tracee's registers are restored from a snapshot afterwards, so the
//! detour is invisible to it.
//!
//! The synchronous form drives the intermediate stops with a nested wait; the
//! asynchronous form stages the same protocol and lets the event loop consume
//! the stops, invoking a completion callback at the end.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use syscalls::Sysno;
use tracing::debug;

use crate::arch;
use crate::arch::Registers;
use crate::child::Child;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, HookAction, SyscallArgs};
use crate::hooks::HookFn;

/// Where an in-flight injection stands. The states walk the stops the engine
/// must consume before the tracee may be shown to hooks again.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum InjectState {
    /// No injection in flight.
    #[default]
    Idle,

    /// Waiting for the injected call's entry stop (POST-phase injections
    /// rewind first, so an entry comes before the result).
    AwaitingEntry,

    /// Waiting for the injected call's exit stop, which carries the result.
    AwaitingExit,

    /// PRE-phase injections only: waiting for the displaced original syscall
    /// to re-enter after the snapshot was restored rewound.
    AwaitingReentry,
}

/// Bookkeeping for one asynchronous injection.
#[derive(Default)]
pub(crate) struct Inject {
    pub(crate) state: InjectState,

    /// True when the injection was started at a PRE stop.
    pub(crate) started_at_pre: bool,

    /// Syscall number being injected.
    pub(crate) nr: i64,

    /// Register snapshot taken when the injection started.
    pub(crate) saved: Option<Registers>,

    /// Completion callback, invoked once the protocol finishes.
    pub(crate) callback: Option<HookFn>,

    /// Return value of the injected call, once observed.
    pub(crate) result: Option<i64>,

    /// A completed injection's result has not been collected yet.
    pub(crate) injected: bool,
}

impl Inject {
    pub(crate) fn in_flight(&self) -> bool {
        self.state != InjectState::Idle
    }
}

impl Child {
    /// Synchronously execute `nr` in the tracee and return its result.
    ///
    /// Legal only while the tracee sits at a syscall-stop (hook context).
    /// The tracee is left exactly where it was: at a PRE stop the original
    /// syscall is re-staged and will run when the tracee is continued; at a
    /// POST stop the completed syscall's state is restored.
    pub fn inject_syscall(&mut self, nr: i64, args: &SyscallArgs) -> Result<i64> {
        self.ensure_syscall_stop("inject_syscall")?;

        if self.pre_syscall {
            self.inject_at_pre(nr, args)
        } else {
            self.inject_at_post(nr, args)
        }
    }

    /// Begin an asynchronous injection at a PRE stop. The event loop consumes
    /// the intermediate stops; `callback` runs once the protocol finishes,
    /// and should collect the result with [`Child::inject_pre_end`].
    pub fn inject_pre_start(
        &mut self,
        nr: i64,
        args: &SyscallArgs,
        callback: impl FnMut(&mut Child, &Event) -> HookAction + 'static,
    ) -> Result<()> {
        self.ensure_syscall_stop("inject_pre_start")?;
        if !self.pre_syscall {
            return Err(Error::ProtocolViolation {
                op: "inject_pre_start",
                reason: "the tracee is at a POST stop",
            });
        }

        let saved = self.stage_over_entry(nr, args)?;
        self.inj = Inject {
            state: InjectState::AwaitingExit,
            started_at_pre: true,
            nr,
            saved: Some(saved),
            callback: Some(Box::new(callback)),
            result: None,
            injected: false,
        };

        debug!(pid = self.pid().as_raw(), nr, "async injection staged at PRE");

        Ok(())
    }

    /// Collect the result of a completed PRE-phase injection.
    pub fn inject_pre_end(&mut self) -> Result<i64> {
        self.collect_injected("inject_pre_end")
    }

    /// Begin an asynchronous injection at a POST stop.
    pub fn inject_post_start(
        &mut self,
        nr: i64,
        args: &SyscallArgs,
        callback: impl FnMut(&mut Child, &Event) -> HookAction + 'static,
    ) -> Result<()> {
        self.ensure_syscall_stop("inject_post_start")?;
        if self.pre_syscall {
            return Err(Error::ProtocolViolation {
                op: "inject_post_start",
                reason: "the tracee is at a PRE stop",
            });
        }

        let saved = self.stage_fresh_entry(nr, args)?;
        self.inj = Inject {
            state: InjectState::AwaitingEntry,
            started_at_pre: false,
            nr,
            saved: Some(saved),
            callback: Some(Box::new(callback)),
            result: None,
            injected: false,
        };

        debug!(pid = self.pid().as_raw(), nr, "async injection staged at POST");

        Ok(())
    }

    /// Collect the result of a completed POST-phase injection.
    pub fn inject_post_end(&mut self) -> Result<i64> {
        self.collect_injected("inject_post_end")
    }

    /// Rewrite the pending syscall's number and/or arguments in place.
    /// Legal only at a PRE stop. No snapshot is taken; the change sticks.
    pub fn modify_syscall(&mut self, nr: Option<i64>, args: Option<&SyscallArgs>) -> Result<()> {
        self.ensure_syscall_stop("modify_syscall")?;
        if !self.pre_syscall {
            return Err(Error::ProtocolViolation {
                op: "modify_syscall",
                reason: "syscalls can only be modified at a PRE stop",
            });
        }

        let mut regs = self.registers()?;
        if let Some(args) = args {
            args.apply_to(&mut regs);
        }
        if let Some(nr) = nr {
            arch::set_syscall_nr(self.pid(), &mut regs, nr)?;
        }
        self.set_registers(regs)
    }

    /// Replace the pending syscall with one the kernel cannot dispatch, so
    /// the tracee observes an error instead of the call's effect. The
    /// matching POST is synthesized as `-EPERM` by the event loop without
    /// consulting the kernel's result.
    pub fn deny_syscall(&mut self) -> Result<()> {
        self.ensure_syscall_stop("deny_syscall")?;
        if !self.pre_syscall {
            return Err(Error::ProtocolViolation {
                op: "deny_syscall",
                reason: "syscalls can only be denied at a PRE stop",
            });
        }

        let mut regs = self.registers()?;
        let denied = arch::syscall_nr(&regs);
        arch::set_syscall_nr(self.pid(), &mut regs, -1)?;
        self.set_registers(regs)?;
        self.denied_nr = Some(denied);

        debug!(pid = self.pid().as_raw(), nr = denied, "syscall denied");

        Ok(())
    }

    /// Map memory in the tracee by injecting `mmap(2)`.
    pub fn mmap(
        &mut self,
        addr: u64,
        length: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<u64> {
        let args = SyscallArgs {
            a0: addr,
            a1: length,
            a2: prot as i64 as u64,
            a3: flags as i64 as u64,
            a4: fd as i64 as u64,
            a5: offset,
            ..SyscallArgs::default()
        };

        let ret = self.inject_syscall(Sysno::mmap.id() as i64, &args)?;
        if ret < 0 {
            return Err(Error::KernelRefused {
                pid: self.pid(),
                request: "injected mmap(2)",
                source: nix::errno::Errno::from_i32(-ret as i32),
            });
        }

        Ok(ret as u64)
    }

    /// Unmap memory in the tracee by injecting `munmap(2)`.
    pub fn munmap(&mut self, addr: u64, length: u64) -> Result<i64> {
        let args = SyscallArgs {
            a0: addr,
            a1: length,
            ..SyscallArgs::default()
        };

        self.inject_syscall(Sysno::munmap.id() as i64, &args)
    }

    fn ensure_syscall_stop(&self, op: &'static str) -> Result<()> {
        if self.inj.in_flight() {
            return Err(Error::ProtocolViolation {
                op,
                reason: "another injection is in flight on this tracee",
            });
        }

        if self.event.kind != EventKind::Syscall {
            return Err(Error::ProtocolViolation {
                op,
                reason: "the tracee is not at a syscall-stop",
            });
        }

        Ok(())
    }

    /// Overwrite the pending syscall at a PRE stop with `nr`. Returns the
    /// snapshot to restore from.
    fn stage_over_entry(&mut self, nr: i64, args: &SyscallArgs) -> Result<Registers> {
        let saved = self.registers()?;

        let mut regs = saved;
        args.apply_to(&mut regs);
        arch::set_syscall_nr(self.pid(), &mut regs, nr)?;
        self.set_registers(regs)?;

        Ok(saved)
    }

    /// Stage `nr` for a fresh syscall entry from a POST stop: back the
    /// instruction pointer over the syscall instruction and pre-load the
    /// dispatch register. Returns the snapshot to restore from.
    fn stage_fresh_entry(&mut self, nr: i64, args: &SyscallArgs) -> Result<Registers> {
        let saved = self.registers()?;

        let mut regs = saved;
        args.apply_to(&mut regs);
        arch::rewind_ip(&mut regs);
        arch::stage_syscall_nr(&mut regs, nr);
        self.set_registers(regs)?;

        Ok(saved)
    }

    fn inject_at_pre(&mut self, nr: i64, args: &SyscallArgs) -> Result<i64> {
        let saved = self.stage_over_entry(nr, args)?;

        // Run the injected call to its exit stop and take the result.
        self.restart_syscall(None)?;
        self.expect_syscall_stop()?;
        let ret = arch::return_value(&self.registers()?);

        // Re-execute the displaced original: restore the snapshot rewound one
        // syscall instruction, then consume the resulting entry stop.
        let mut reenter = saved;
        arch::rewind_to_syscall(&mut reenter);
        self.set_registers(reenter)?;
        self.restart_syscall(None)?;
        self.expect_syscall_stop()?;

        // Normalize to the exact original PRE state.
        self.set_registers(saved)?;

        debug!(pid = self.pid().as_raw(), nr, ret, "injected syscall at PRE");

        Ok(ret)
    }

    fn inject_at_post(&mut self, nr: i64, args: &SyscallArgs) -> Result<i64> {
        let saved = self.stage_fresh_entry(nr, args)?;

        // Consume the injected call's entry stop, re-asserting the number in
        // case the dispatch register was interpreted differently.
        self.restart_syscall(None)?;
        self.expect_syscall_stop()?;
        let mut entry = self.registers()?;
        arch::set_syscall_nr(self.pid(), &mut entry, nr)?;
        self.set_registers(entry)?;

        // Run to the exit stop and take the result.
        self.restart_syscall(None)?;
        self.expect_syscall_stop()?;
        let ret = arch::return_value(&self.registers()?);

        self.set_registers(saved)?;

        debug!(pid = self.pid().as_raw(), nr, ret, "injected syscall at POST");

        Ok(ret)
    }

    /// Block until this tracee reports a syscall-stop. Signal deliveries
    /// observed along the way are re-queued onto the tracee; a termination
    /// status means the tracee died under us.
    pub(crate) fn expect_syscall_stop(&mut self) -> Result<()> {
        loop {
            let status = waitpid(self.pid(), Some(WaitPidFlag::__WALL)).map_err(|source| {
                if source == nix::errno::Errno::ECHILD {
                    Error::TraceeDied { pid: self.pid() }
                } else {
                    Error::Wait { source }
                }
            })?;

            match status {
                WaitStatus::PtraceSyscall(_) => return Ok(()),
                WaitStatus::Stopped(_, signal) => {
                    // Keep the signal pending for the tracee; it is not ours
                    // to swallow.
                    self.restart_syscall(Some(signal))?;
                }
                WaitStatus::PtraceEvent(..) => {
                    self.restart_syscall(None)?;
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    return Err(Error::TraceeDied { pid: self.pid() });
                }
                _ => internal_error!("unexpected wait status during injection"),
            }
        }
    }

    fn collect_injected(&mut self, op: &'static str) -> Result<i64> {
        if !self.inj.injected {
            return Err(Error::ProtocolViolation {
                op,
                reason: "no completed injection to collect",
            });
        }

        self.inj.injected = false;
        match self.inj.result.take() {
            Some(ret) => Ok(ret),
            None => internal_error!("completed injection lost its result"),
        }
    }
}
