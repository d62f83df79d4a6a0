//! The tracing session: child registry, event loop, adoption of new
//! processes, and the safe-fork protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::arch;
use crate::arch::Registers;
use crate::child::Child;
use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};
use crate::event::{Event, EventKind, HookAction, SyscallArgs};
use crate::hooks::{self, HookRegistry};
use crate::inject::InjectState;

bitflags::bitflags! {
    /// Session options. Bits are combinable.
    pub struct Options: u32 {
        /// Adopt children the tracees create with fork, vfork, or clone.
        const TRACE_CHILDREN = 1 << 0;

        /// Chattier per-event diagnostics from the demonstration loop.
        const VERBOSE = 1 << 1;

        /// Acquire forked children with the safe-fork protocol instead of
        /// trusting the kernel's auto-attach.
        const SAFE_TRACE = 1 << 31;
    }
}

const INITIAL_POLL_DELAY: Duration = Duration::from_micros(50);
const MAX_POLL_DELAY: Duration = Duration::from_millis(5);

/// The set of tracees under control, keyed by pid. `BTreeMap` ordering keeps
/// shutdown iteration deterministic.
#[derive(Default)]
struct Registry {
    tracees: BTreeMap<i32, Child>,
}

impl Registry {
    fn admit(&mut self, child: Child) {
        self.tracees.insert(child.pid().as_raw(), child);
    }

    fn forget(&mut self, pid: Pid) -> Option<Child> {
        // The tracee's memory window closes with the record.
        self.tracees.remove(&pid.as_raw())
    }

    fn get(&self, pid: Pid) -> Option<&Child> {
        self.tracees.get(&pid.as_raw())
    }

    fn get_mut(&mut self, pid: Pid) -> Option<&mut Child> {
        self.tracees.get_mut(&pid.as_raw())
    }

    fn count(&self) -> usize {
        self.tracees.len()
    }

    fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    fn pids(&self) -> Vec<Pid> {
        self.tracees.keys().map(|&raw| Pid::from_raw(raw)).collect()
    }

    fn clear(&mut self) {
        self.tracees.clear();
    }
}

enum Poll {
    Status(WaitStatus),
    Vanished(Pid),
}

/// A tracing session.
///
/// Owns every tracee it acquires. The session is synchronous: the only
/// blocking point is [`Tracer::wait_event`], and hooks run on the caller's
/// thread while the tracee in question is stopped.
pub struct Tracer {
    children: Registry,
    hooks: HookRegistry,
    opts: Options,

    /// Pid of the originally spawned root tracee; every other tracee was
    /// adopted via an event or attached explicitly.
    fpid: Option<Pid>,

    /// Invoked for each newly created tracee record, before any event from
    /// it can be observed.
    child_create: Option<Box<dyn FnMut(&mut Child)>>,
}

impl Tracer {
    pub fn new(opts: Options) -> Self {
        Tracer {
            children: Registry::default(),
            hooks: HookRegistry::default(),
            opts,
            fpid: None,
            child_create: None,
        }
    }

    pub fn options(&self) -> Options {
        self.opts
    }

    /// Pid of the originally spawned root tracee, if any.
    pub fn root_pid(&self) -> Option<Pid> {
        self.fpid
    }

    pub fn children_count(&self) -> usize {
        self.children.count()
    }

    pub fn child(&self, pid: Pid) -> Option<&Child> {
        self.children.get(pid)
    }

    pub fn child_mut(&mut self, pid: Pid) -> Option<&mut Child> {
        self.children.get_mut(pid)
    }

    /// Register a callback invoked whenever a tracee record is created,
    /// before any event from that tracee is observable.
    pub fn on_child_create(&mut self, callback: impl FnMut(&mut Child) + 'static) {
        self.child_create = Some(Box::new(callback));
    }

    /// Install a hook for the named syscall. Re-registering replaces the
    /// previous binding.
    pub fn set_hook(
        &mut self,
        syscall: &str,
        hook: impl FnMut(&mut Child, &Event) -> HookAction + 'static,
    ) -> Result<()> {
        let nr = hooks::syscall_number(syscall).ok_or_else(|| Error::UnknownSyscall {
            name: syscall.into(),
        })?;
        self.hooks.set(nr, Box::new(hook));
        Ok(())
    }

    /// Install the catch-all hook consulted when no specific hook matches.
    pub fn set_default_hook(
        &mut self,
        hook: impl FnMut(&mut Child, &Event) -> HookAction + 'static,
    ) {
        self.hooks.set_default(Box::new(hook));
    }

    /// Run the hook installed for the named syscall against `event`.
    /// Reports [`HookAction::NoHook`] when nothing is installed.
    pub fn execute_hook(&mut self, syscall: &str, event: &Event) -> Result<HookAction> {
        let nr = hooks::syscall_number(syscall).ok_or_else(|| Error::UnknownSyscall {
            name: syscall.into(),
        })?;

        let pid = match event.pid {
            Some(pid) => pid,
            None => {
                return Err(Error::ProtocolViolation {
                    op: "execute_hook",
                    reason: "the event names no tracee",
                })
            }
        };

        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => return Err(Error::UnknownChild { pid }),
        };

        Ok(self.hooks.dispatch(nr, child, event))
    }

    /// Fork and exec `cmd` as the session's root tracee.
    ///
    /// The tracee's pre-exec `SIGSTOP` is consumed here; the first observable
    /// event is the exec syscall itself.
    pub fn spawn(&mut self, cmd: Command) -> Result<Pid> {
        let pid = cmd.fork_exec()?;

        self.wait_initial_stop(pid)?;
        ptrace::setoptions(pid, self.trace_options()).or_kernel(pid, "PTRACE_SETOPTIONS")?;

        let mut child = Child::new(pid, false);
        if let Some(notify) = self.child_create.as_mut() {
            notify(&mut child);
        }
        child.restart_syscall(None)?;
        self.children.admit(child);

        if self.fpid.is_none() {
            self.fpid = Some(pid);
        }

        info!(pid = pid.as_raw(), "spawned tracee");

        Ok(pid)
    }

    /// Attach to a running process. Attached tracees are detached, not
    /// killed, on shutdown.
    pub fn attach(&mut self, pid: Pid) -> Result<Pid> {
        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

        self.wait_initial_stop(pid)?;
        ptrace::setoptions(pid, self.trace_options()).or_kernel(pid, "PTRACE_SETOPTIONS")?;

        let mut child = Child::new(pid, true);
        if let Some(notify) = self.child_create.as_mut() {
            notify(&mut child);
        }
        child.restart_syscall(None)?;
        self.children.admit(child);

        info!(pid = pid.as_raw(), "attached to tracee");

        Ok(pid)
    }

    /// Block until a tracee stops, classify the stop, and return one event.
    ///
    /// `which` restricts the wait to a single tracee; `None` waits on all of
    /// them. Stops the engine consumes itself (adoption, initial stops of
    /// new tracees, injection turns, hook-continued events) are never
    /// surfaced; an `Err` means the session is no longer coherent and the
    /// controller must shut down.
    pub fn wait_event(&mut self, which: Option<Pid>) -> Result<Event> {
        loop {
            if self.children.is_empty() {
                debug!("no tracees remain");
                return Ok(Event::quit(None));
            }

            if let Some(pid) = which {
                if self.children.get(pid).is_none() {
                    return Err(Error::UnknownChild { pid });
                }
            }

            let status = match self.next_status(which)? {
                Poll::Status(status) => status,
                Poll::Vanished(pid) => {
                    info!(pid = pid.as_raw(), "tracee vanished");
                    self.children.forget(pid);
                    return Ok(Event::quit(pid));
                }
            };

            match status {
                WaitStatus::Exited(pid, code) => {
                    debug!(pid = pid.as_raw(), code, "tracee exited");
                    if self.children.forget(pid).is_some() {
                        return Ok(Event::quit(pid));
                    }
                }
                WaitStatus::Signaled(pid, signal, _core_dumped) => {
                    debug!(pid = pid.as_raw(), ?signal, "tracee terminated by signal");
                    if self.children.forget(pid).is_some() {
                        let mut ev = Event::quit(pid);
                        ev.set_pending(signal);
                        return Ok(ev);
                    }
                }
                WaitStatus::PtraceSyscall(pid) => {
                    if let Some(ev) = self.on_syscall_stop(pid)? {
                        return Ok(ev);
                    }
                }
                WaitStatus::PtraceEvent(pid, _signal, code) => match code {
                    libc::PTRACE_EVENT_FORK
                    | libc::PTRACE_EVENT_VFORK
                    | libc::PTRACE_EVENT_CLONE => {
                        self.adopt(pid)?;
                    }
                    _ => {
                        // Exec, and anything else the engine does not
                        // classify; the controller passes these through.
                        let ev = Event::internal(pid);
                        if let Some(child) = self.children.get_mut(pid) {
                            child.event = ev;
                        }
                        return Ok(ev);
                    }
                },
                WaitStatus::Stopped(pid, signal) => {
                    let trace_opts = self.trace_options();
                    let child = match self.children.get_mut(pid) {
                        Some(child) => child,
                        None => internal_error!("signal stop for unregistered tracee"),
                    };

                    if child.attach_pending {
                        // First stop of a newly adopted tracee: set its trace
                        // options and keep the stop invisible.
                        debug!(
                            pid = pid.as_raw(),
                            ?signal,
                            "initial stop of adopted tracee"
                        );
                        ptrace::setoptions(pid, trace_opts)
                            .or_kernel(pid, "PTRACE_SETOPTIONS")?;
                        child.attach_pending = false;
                        child.restart_syscall(None)?;
                    } else {
                        let ev = Event::signal(pid, signal);
                        child.event = ev;
                        return Ok(ev);
                    }
                }
                WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                    internal_error!("unreachable wait status");
                }
            }
        }
    }

    /// Resume the tracee named by `event`, delivering its pending signal.
    /// A no-op for tracees that no longer exist.
    pub fn continue_event(&mut self, event: &Event) -> Result<()> {
        let pid = match event.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };

        match self.children.get_mut(pid) {
            Some(child) => child.restart_syscall(event.pending),
            None => Ok(()),
        }
    }

    /// Kill a tracee, reap it, and forget it.
    pub fn kill_child(&mut self, pid: Pid) -> Result<()> {
        if self.children.get(pid).is_none() {
            return Err(Error::UnknownChild { pid });
        }

        info!(pid = pid.as_raw(), "killing tracee");

        let _ = signal::kill(pid, Signal::SIGKILL);
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => {
                    // Flush intermediate stops so the kill lands.
                    let _ = ptrace::cont(pid, None);
                }
            }
        }

        self.children.forget(pid);
        Ok(())
    }

    /// Forget a tracee without killing it, releasing its memory window.
    pub fn remove_child(&mut self, pid: Pid) -> Result<()> {
        match self.children.forget(pid) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownChild { pid }),
        }
    }

    /// A simple ready-made event loop: waits, lets hooks drive, and passes
    /// everything else through, until no tracees remain.
    pub fn main(&mut self) -> Result<()> {
        loop {
            let event = self.wait_event(None)?;

            if self.opts.contains(Options::VERBOSE) {
                info!(?event, "event");
            } else {
                debug!(?event, "event");
            }

            if event.kind == EventKind::Quit && event.pid.is_none() {
                return Ok(());
            }

            self.continue_event(&event)?;
        }
    }

    /// Tear the session down, killing or detaching every tracee. Equivalent
    /// to dropping it.
    pub fn free(self) {}

    /// Tear the session down and terminate the controlling process.
    pub fn quit(mut self, exit_code: i32) -> ! {
        self.shutdown();
        std::process::exit(exit_code)
    }

    /// Acquire a forked child with full control before it executes a single
    /// instruction of its own.
    ///
    /// Legal while `pid` is stopped at the PRE half of a fork-family
    /// syscall. A trap page is mapped in the parent and both sides of the
    /// fork are pointed at it; the parent never runs there (it stops at the
    /// fork's exit), while the untraced child spins on a self-branch until
    /// it is attached, repaired to look like a normal fork return, and
    /// admitted. The parent is left at an ordinary fork POST with the child
    /// pid in its return register and in its `safe_fork_pid` slot.
    pub fn safe_fork(&mut self, pid: Pid) -> Result<Pid> {
        let page_len = page_size();
        let trace_opts = self.trace_options();

        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => return Err(Error::UnknownChild { pid }),
        };

        if child.event.kind != EventKind::Syscall || !child.is_pre_syscall() {
            return Err(Error::ProtocolViolation {
                op: "safe_fork",
                reason: "the tracee is not at a fork PRE stop",
            });
        }

        let attached = child.attached();
        let saved = child.registers()?;

        let page = child.mmap(
            0,
            page_len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )?;
        child.write_mem(page, &arch::TRAP_CODE)?;

        debug!(pid = pid.as_raw(), page, "trap page staged");

        // Run the fork with the resume address pointed at the trap page.
        // The parent is stopped at the fork's exit before it can get there;
        // the untraced child resumes on the self-branch and makes no
        // progress until repaired.
        let mut regs = child.registers()?;
        strip_vfork(pid, &mut regs)?;
        arch::set_ip(&mut regs, page);
        child.set_registers(regs)?;
        child.restart_syscall(None)?;
        child.expect_syscall_stop()?;
        child.pre_syscall = false;

        let ret = arch::return_value(&child.registers()?);
        if ret < 0 {
            // The fork itself failed; restore the parent and report.
            let mut repair = saved;
            arch::set_return_value(&mut repair, ret);
            child.set_registers(repair)?;
            child.munmap(page, page_len)?;
            return Err(Error::KernelRefused {
                pid,
                request: "safe fork",
                source: Errno::from_i32(-ret as i32),
            });
        }

        let new = Pid::from_raw(ret as i32);

        // Capture the spinning child.
        ptrace::attach(new).map_err(|source| Error::Attach { pid: new, source })?;
        self.wait_initial_stop(new)?;

        let mut adopted = Child::new(new, attached);
        let mut repair = saved;
        arch::set_return_value(&mut repair, 0);
        if arch::syscall_nr(&saved) == libc::SYS_clone {
            // A clone with an explicit stack starts the child on it.
            let stack = arch::arg(&saved, 1);
            if stack != 0 {
                arch::set_sp(&mut repair, stack);
            }
        }
        adopted.set_registers(repair)?;
        ptrace::setoptions(new, trace_opts).or_kernel(new, "PTRACE_SETOPTIONS")?;

        if let Some(notify) = self.child_create.as_mut() {
            notify(&mut adopted);
        }
        adopted.restart_syscall(None)?;
        self.children.admit(adopted);

        info!(
            pid = pid.as_raw(),
            new = new.as_raw(),
            "safe fork adopted child"
        );

        // Make the parent look like it just returned from an ordinary fork,
        // then reclaim the trap page.
        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => internal_error!("parent lost during safe fork"),
        };
        let mut repair = saved;
        arch::set_return_value(&mut repair, ret);
        child.set_registers(repair)?;
        child.munmap(page, page_len)?;
        child.safe_fork_pid = Some(new);

        Ok(new)
    }

    fn trace_options(&self) -> ptrace::Options {
        let mut opts =
            ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_TRACEEXEC;

        if self.opts.contains(Options::TRACE_CHILDREN)
            && !self.opts.contains(Options::SAFE_TRACE)
        {
            opts |= ptrace::Options::PTRACE_O_TRACEFORK
                | ptrace::Options::PTRACE_O_TRACEVFORK
                | ptrace::Options::PTRACE_O_TRACECLONE;
        }

        opts
    }

    /// Wait for the stop that follows acquiring a tracee (the self-raised or
    /// attach-delivered `SIGSTOP`), re-queueing any other signal.
    fn wait_initial_stop(&self, pid: Pid) -> Result<()> {
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
                Ok(WaitStatus::Stopped(_, signal)) => {
                    ptrace::cont(pid, signal).or_kernel(pid, "PTRACE_CONT")?;
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    return Err(Error::TraceeDied { pid });
                }
                Ok(_) => {
                    ptrace::cont(pid, None).or_kernel(pid, "PTRACE_CONT")?;
                }
                Err(source) => return Err(Error::Wait { source }),
            }
        }
    }

    // Obtain the next wait status. A specific pid is waited on directly;
    // otherwise the known tracees are polled without consuming statuses of
    // unrelated children of the controlling process.
    fn next_status(&mut self, which: Option<Pid>) -> Result<Poll> {
        if let Some(pid) = which {
            return match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => Ok(Poll::Status(status)),
                Err(Errno::ECHILD) => Ok(Poll::Vanished(pid)),
                Err(source) => Err(Error::Wait { source }),
            };
        }

        let mut delay = INITIAL_POLL_DELAY;
        loop {
            for pid in self.children.pids() {
                let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;
                match waitpid(pid, Some(flags)) {
                    Ok(WaitStatus::StillAlive) => continue,
                    Ok(status) => return Ok(Poll::Status(status)),
                    Err(Errno::ECHILD) => return Ok(Poll::Vanished(pid)),
                    Err(source) => return Err(Error::Wait { source }),
                }
            }

            trace!(
                tracees = self.children.count(),
                ?delay,
                "no tracee updates, backing off"
            );
            std::thread::sleep(delay);
            delay = std::cmp::min(delay * 2, MAX_POLL_DELAY);
        }
    }

    /// Classify one syscall-stop. Returns `None` when the stop was consumed
    /// by the engine (injection turns, hook-continued events, safe fork).
    fn on_syscall_stop(&mut self, pid: Pid) -> Result<Option<Event>> {
        let opts = self.opts;

        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => internal_error!("syscall-stop for unregistered tracee"),
        };

        // While an injection is in flight, its stops belong to the engine.
        if child.inj.in_flight() {
            return self.advance_injection(pid);
        }

        let mut regs = child.registers()?;

        // Re-synchronize the PRE/POST flag when the kernel can tell us which
        // half this is. A freshly adopted tracee's first stop is the exit
        // half of the syscall that created it, which the flag alone would
        // mislabel.
        if child.denied_nr.is_none() {
            if let Some(entry) = arch::syscall_entry_hint(pid, &regs) {
                let expected_entry = !child.pre_syscall;
                if entry != expected_entry {
                    debug!(pid = pid.as_raw(), entry, "re-syncing syscall phase");
                    child.pre_syscall = !entry;
                }
            }
        }

        let ev = if !child.pre_syscall {
            // PRE half: capture the full argument snapshot.
            child.pre_syscall = true;
            Event::syscall_stop(pid, SyscallArgs::from_regs(&regs))
        } else {
            // POST half: keep the arguments from the PRE snapshot, refresh
            // the result.
            child.pre_syscall = false;

            let mut args = if child.event.kind == EventKind::Syscall {
                child.event.args
            } else {
                SyscallArgs::from_regs(&regs)
            };
            args.return_code = arch::return_value(&regs);
            args.syscall = arch::syscall_nr(&regs);
            args.ip = arch::ip(&regs);
            args.sp = arch::sp(&regs);

            if let Some(denied) = child.denied_nr.take() {
                // The kernel bounced the impossible number; report the
                // denial as the original syscall failing with EPERM.
                let err = -(libc::EPERM as i64);
                arch::set_return_value(&mut regs, err);
                child.set_registers(regs)?;
                args.return_code = err;
                args.syscall = denied;
            }

            Event::syscall_stop(pid, args)
        };

        child.event = ev;

        // Under SAFE_TRACE the engine takes over fork-family PREs and hands
        // back a completed POST instead.
        if child.pre_syscall
            && opts.contains(Options::TRACE_CHILDREN | Options::SAFE_TRACE)
            && is_fork_syscall(ev.syscall)
        {
            let new = self.safe_fork(pid)?;
            debug!(
                pid = pid.as_raw(),
                new = new.as_raw(),
                "fork-family syscall handled by safe fork"
            );

            let child = match self.children.get_mut(pid) {
                Some(child) => child,
                None => internal_error!("parent lost after safe fork"),
            };
            let regs = child.registers()?;
            let mut args = ev.args;
            args.return_code = arch::return_value(&regs);
            let post = Event::syscall_stop(pid, args);
            child.event = post;

            return self.dispatch_hooks(pid, post);
        }

        self.dispatch_hooks(pid, ev)
    }

    fn dispatch_hooks(&mut self, pid: Pid, ev: Event) -> Result<Option<Event>> {
        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => internal_error!("hook dispatch for unregistered tracee"),
        };

        let action = self.hooks.dispatch(ev.syscall, child, &ev);
        self.apply_hook_action(pid, ev, action)
    }

    fn apply_hook_action(
        &mut self,
        pid: Pid,
        ev: Event,
        action: HookAction,
    ) -> Result<Option<Event>> {
        match action {
            HookAction::NoHook => Ok(Some(ev)),
            HookAction::Continue => {
                if let Some(child) = self.children.get_mut(pid) {
                    child.restart_syscall(ev.pending)?;
                }
                Ok(None)
            }
            HookAction::KillChild => {
                self.kill_child(pid)?;
                Ok(None)
            }
            HookAction::Abort => {
                warn!(pid = pid.as_raw(), "hook requested abort");
                self.shutdown();
                Ok(Some(Event::quit(pid)))
            }
        }
    }

    /// Walk an in-flight injection through the stop it was waiting for.
    fn advance_injection(&mut self, pid: Pid) -> Result<Option<Event>> {
        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => internal_error!("injection stop for unregistered tracee"),
        };

        match child.inj.state {
            InjectState::AwaitingEntry => {
                // The injected call's entry; pin the number and run it.
                let nr = child.inj.nr;
                let mut regs = child.registers()?;
                arch::set_syscall_nr(pid, &mut regs, nr)?;
                child.set_registers(regs)?;
                child.inj.state = InjectState::AwaitingExit;
                child.restart_syscall(None)?;
                Ok(None)
            }
            InjectState::AwaitingExit => {
                let regs = child.registers()?;
                child.inj.result = Some(arch::return_value(&regs));

                let saved = match child.inj.saved {
                    Some(saved) => saved,
                    None => internal_error!("in-flight injection lost its snapshot"),
                };

                if child.inj.started_at_pre {
                    // Re-execute the displaced original before handing the
                    // tracee back.
                    let mut reenter = saved;
                    arch::rewind_to_syscall(&mut reenter);
                    child.set_registers(reenter)?;
                    child.inj.state = InjectState::AwaitingReentry;
                    child.restart_syscall(None)?;
                    Ok(None)
                } else {
                    child.set_registers(saved)?;
                    self.finish_injection(pid)
                }
            }
            InjectState::AwaitingReentry => {
                let saved = match child.inj.saved {
                    Some(saved) => saved,
                    None => internal_error!("in-flight injection lost its snapshot"),
                };
                child.set_registers(saved)?;
                self.finish_injection(pid)
            }
            InjectState::Idle => internal_error!("injection advance with nothing in flight"),
        }
    }

    fn finish_injection(&mut self, pid: Pid) -> Result<Option<Event>> {
        let child = match self.children.get_mut(pid) {
            Some(child) => child,
            None => internal_error!("injection finish for unregistered tracee"),
        };

        child.inj.state = InjectState::Idle;
        child.inj.saved = None;
        child.inj.injected = true;

        let callback = child.inj.callback.take();
        let ev = child.event;

        let action = match callback {
            Some(mut callback) => callback(child, &ev),
            None => HookAction::Continue,
        };

        // The injection already owns this turn; there is no event to hand
        // to the controller.
        let action = if action == HookAction::NoHook {
            HookAction::Continue
        } else {
            action
        };

        self.apply_hook_action(pid, ev, action)
    }

    /// Adopt the child a fork/vfork/clone event announced, then resume the
    /// parent.
    fn adopt(&mut self, parent: Pid) -> Result<()> {
        let msg = ptrace::getevent(parent).or_kernel(parent, "PTRACE_GETEVENTMSG")?;
        let new = Pid::from_raw(msg as u32 as i32);

        if !self.opts.contains(Options::TRACE_CHILDREN) {
            debug!(
                parent = parent.as_raw(),
                new = new.as_raw(),
                "ignoring new child"
            );
        } else if self.children.get(new).is_none() {
            let attached = self
                .children
                .get(parent)
                .map(|c| c.attached())
                .unwrap_or(false);

            let mut child = Child::new(new, attached);
            child.attach_pending = true;

            info!(pid = new.as_raw(), parent = parent.as_raw(), "adopting new tracee");

            if let Some(notify) = self.child_create.as_mut() {
                notify(&mut child);
            }
            self.children.admit(child);
        }

        if let Some(parent) = self.children.get_mut(parent) {
            parent.restart_syscall(None)?;
        }

        Ok(())
    }

    /// Kill or detach every remaining tracee, respecting `attached`.
    fn shutdown(&mut self) {
        for pid in self.children.pids() {
            let child = match self.children.get_mut(pid) {
                Some(child) => child,
                None => continue,
            };

            if child.attached() {
                debug!(pid = pid.as_raw(), "detaching tracee");
                if child.detach(None).is_err() {
                    // Not in a ptrace-stop; bring it to one and retry.
                    let _ = signal::kill(pid, Signal::SIGSTOP);
                    let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
                    let _ = child.detach(None);
                }
            } else {
                debug!(pid = pid.as_raw(), "killing tracee");
                let _ = signal::kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
            }
        }

        self.children.clear();
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn page_size() -> u64 {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as u64
    } else {
        4096
    }
}

#[cfg(target_arch = "x86_64")]
fn is_fork_syscall(nr: i64) -> bool {
    matches!(nr, libc::SYS_fork | libc::SYS_vfork | libc::SYS_clone)
}

#[cfg(target_arch = "aarch64")]
fn is_fork_syscall(nr: i64) -> bool {
    nr == libc::SYS_clone
}

/// Rewrite a pending vfork (or vfork-flavored clone) into a plain fork. A
/// suspended vfork parent would deadlock against a child spinning on the
/// trap page.
fn strip_vfork(pid: Pid, regs: &mut Registers) -> Result<()> {
    let nr = arch::syscall_nr(regs);

    #[cfg(target_arch = "x86_64")]
    if nr == libc::SYS_vfork {
        arch::set_syscall_nr(pid, regs, libc::SYS_fork)?;
        return Ok(());
    }

    if nr == libc::SYS_clone {
        let flags = arch::arg(regs, 0);
        if flags & libc::CLONE_VFORK as u64 != 0 {
            let stripped = flags & !((libc::CLONE_VFORK | libc::CLONE_VM) as u64);
            arch::set_arg(regs, 0, stripped);
        }
    }

    let _ = pid;
    Ok(())
}
