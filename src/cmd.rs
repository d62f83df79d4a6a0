//! Building and launching a command as a tracee.

use std::collections::HashMap;
use std::ffi::{CString, NulError, OsString};
use std::os::raw::c_char;

use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::Error;

/// Command to spawn as a tracee.
///
/// The forked child requests `PTRACE_TRACEME` and raises `SIGSTOP` before
/// exec, so the session acquires it without a race: the tracee cannot reach
/// its first instruction until the tracer has seen it stop.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector passed to `execve()`; `argv[0]` is the executable.
    argv: Vec<CString>,

    /// Environment for the tracee. Inherits the tracer's by default.
    env: Env,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, NulError> {
        assert!(!argv.is_empty(), "command requires an executable");

        // Own NUL-terminated strings now; nothing may allocate post-fork.
        let argv = argv
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()?;

        let env = Env::inherited()?;

        Ok(Self { argv, env })
    }

    pub fn env(&mut self) -> &mut Env {
        &mut self.env
    }

    /// Fork, mark the child as a tracee, and exec `argv`.
    ///
    /// Returns the child pid; the caller must wait for the raised `SIGSTOP`
    /// before issuing ptrace requests.
    pub(crate) fn fork_exec(self) -> Result<Pid, Error> {
        // Heap allocations must happen before forking; only async-signal-safe
        // calls are allowed in the child.
        let argv = PointerVec::new(&self.argv);
        let env = self.env.to_vec();
        let env = PointerVec::new(&env);

        match unsafe { fork() }.map_err(|source| Error::KernelRefused {
            pid: Pid::from_raw(0),
            request: "fork(2)",
            source,
        })? {
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    unsafe { libc::_exit(127) };
                }

                if raise(Signal::SIGSTOP).is_err() {
                    unsafe { libc::_exit(127) };
                }

                // `libc::execve` directly: the nix wrapper allocates.
                unsafe {
                    libc::execve(argv.as_ptr_array()[0], argv.as_ptr(), env.as_ptr());
                    libc::_exit(127);
                }
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }
}

/// Environment map for the tracee, stored as NUL-terminated `KEY=VALUE`
/// strings ready for `execve()`.
#[derive(Clone, Debug)]
pub struct Env {
    kvs: HashMap<OsString, CString>,
}

impl Env {
    fn inherited() -> Result<Self, NulError> {
        let mut env = Env {
            kvs: HashMap::new(),
        };

        for (key, val) in std::env::vars_os() {
            env.set(key, val)?;
        }

        Ok(env)
    }

    pub fn set<K, V>(&mut self, key: K, val: V) -> Result<(), NulError>
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        use std::os::unix::ffi::OsStrExt;

        let key = key.into();

        let mut kv = OsString::new();
        kv.push(&key);
        kv.push("=");
        kv.push(val.into());

        self.kvs.insert(key, CString::new(kv.as_bytes())?);

        Ok(())
    }

    pub fn clear(&mut self) {
        self.kvs.clear();
    }

    fn to_vec(&self) -> Vec<CString> {
        self.kvs.values().cloned().collect()
    }
}

// NULL-terminated array of pointers into borrowed `CString` data, for the
// foreign `execve()` call.
struct PointerVec<'a> {
    array: Vec<*const c_char>,
    _data: &'a [CString],
}

impl<'a> PointerVec<'a> {
    fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data.iter().map(|s| s.as_ptr()).collect();
        array.push(std::ptr::null());

        Self { array, _data: data }
    }

    fn as_ptr(&self) -> *const *const c_char {
        self.array.as_ptr()
    }

    fn as_ptr_array(&self) -> &[*const c_char] {
        &self.array
    }
}
