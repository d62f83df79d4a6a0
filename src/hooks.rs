//! Mapping syscalls to controller-supplied hook functions.

use std::collections::BTreeMap;

use nix::sys::signal::Signal;
use syscalls::Sysno;

use crate::child::Child;
use crate::event::{Event, HookAction};

/// A hook: invoked with the tracee and the classified event, returns what the
/// engine should do next.
pub type HookFn = Box<dyn FnMut(&mut Child, &Event) -> HookAction + 'static>;

/// Per-syscall hooks plus an optional catch-all, keyed by syscall number.
/// Re-registering a number replaces the previous binding.
#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<i64, HookFn>,
    default: Option<HookFn>,
}

impl HookRegistry {
    pub(crate) fn set(&mut self, nr: i64, hook: HookFn) {
        self.hooks.insert(nr, hook);
    }

    pub(crate) fn set_default(&mut self, hook: HookFn) {
        self.default = Some(hook);
    }

    /// The hook installed for `nr`, falling back to the catch-all.
    pub(crate) fn lookup_mut(&mut self, nr: i64) -> Option<&mut HookFn> {
        self.hooks.get_mut(&nr).or(self.default.as_mut())
    }

    /// Run the hook for `nr`, reporting [`HookAction::NoHook`] when neither a
    /// specific nor a default hook is installed.
    pub(crate) fn dispatch(&mut self, nr: i64, child: &mut Child, event: &Event) -> HookAction {
        match self.lookup_mut(nr) {
            Some(hook) => hook(child, event),
            None => HookAction::NoHook,
        }
    }
}

/// Resolve a syscall name to its number on this architecture.
pub fn syscall_number(name: &str) -> Option<i64> {
    // Registration-time table scan; both supported architectures keep their
    // syscall numbers well below this bound.
    (0..=1024usize)
        .filter_map(Sysno::new)
        .find(|sysno| sysno.name() == name)
        .map(|sysno| sysno.id() as i64)
}

/// The name of syscall `nr` on this architecture.
pub fn syscall_name(nr: i64) -> Option<&'static str> {
    if nr < 0 {
        return None;
    }
    Sysno::new(nr as usize).map(|sysno| sysno.name())
}

/// The name of a signal.
pub fn signal_name(signal: Signal) -> &'static str {
    signal.as_str()
}
