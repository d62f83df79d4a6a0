//! A Linux process-tracing engine built on `ptrace(2)`.
//!
//! A [`Tracer`] owns a set of tracee processes and multiplexes their stops
//! through a single event loop. Every system call a tracee makes is
//! intercepted twice, at entry (PRE) and at exit (POST), and handed to
//! controller-supplied [hooks](Tracer::set_hook) that may observe it, rewrite
//! its arguments, [deny](Child::deny_syscall) it outright, or
//! [inject](Child::inject_syscall) entirely new system calls into the tracee
//! and collect their results — with the tracee's register state restored so
//! the detour is invisible to it.
//!
//! New processes created by a tracee can be followed automatically, either
//! through the kernel's fork notifications or, under
//! [`Options::SAFE_TRACE`], through a controlled-fork protocol that
//! guarantees the child is under control before it executes a single
//! instruction of its own program.
//!
//! ```no_run
//! use lariat::{Command, EventKind, HookAction, Options, Tracer};
//!
//! # fn main() -> lariat::Result<()> {
//! let mut tracer = Tracer::new(Options::TRACE_CHILDREN);
//!
//! tracer.set_hook("write", |child, event| {
//!     if child.is_pre_syscall() {
//!         println!("{} writes {} bytes to fd {}", child.pid(), event.args.a2, event.args.a0);
//!     }
//!     HookAction::Continue
//! })?;
//!
//! tracer.spawn(Command::new(vec!["/bin/echo", "hi"]).unwrap())?;
//!
//! loop {
//!     let event = tracer.wait_event(None)?;
//!     if event.kind == EventKind::Quit && event.pid.is_none() {
//!         break;
//!     }
//!     tracer.continue_event(&event)?;
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod error;

pub mod child;
pub mod cmd;
pub mod event;
pub mod hooks;
mod inject;
mod mem;
pub mod tracer;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub(crate) use self::aarch64 as arch;

#[cfg(target_arch = "x86_64")]
pub(crate) use self::x86 as arch;

/// Register state of a tracee.
pub use self::arch::Registers;

#[doc(inline)]
pub use child::Child;

#[doc(inline)]
pub use cmd::Command;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use event::{Event, EventKind, HookAction, SyscallArgs};

#[doc(inline)]
pub use hooks::{signal_name, syscall_name, syscall_number};

#[doc(inline)]
pub use tracer::{Options, Tracer};

/// Process id of a tracee.
pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;
