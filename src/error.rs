use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("error waiting on tracees")]
    Wait {
        #[source]
        source: Errno,
    },

    #[error("kernel refused {request} for tracee = {pid}")]
    KernelRefused {
        pid: Pid,
        request: &'static str,
        #[source]
        source: Errno,
    },

    /// The tracee vanished mid-operation. Any wait status it left behind has
    /// already been consumed; the caller should forget the tracee.
    #[error("tracee = {pid} died during a trace operation")]
    TraceeDied { pid: Pid },

    #[error("could not access memory of tracee = {pid} at {addr:#x}")]
    MemoryAccess {
        pid: Pid,
        addr: u64,
        #[source]
        source: io::Error,
    },

    /// An injection, denial, or modification was requested outside a legal
    /// PRE/POST syscall-stop context. Fatal for the operation, not the tracee.
    #[error("{op} is not legal here: {reason}")]
    ProtocolViolation {
        op: &'static str,
        reason: &'static str,
    },

    #[error("no syscall is named {name:?} on this architecture")]
    UnknownSyscall { name: String },

    #[error("no tracee registered with pid = {pid}")]
    UnknownChild { pid: Pid },

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the error means the tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

/// Map raw `Errno` results from ptrace requests onto engine errors. `ESRCH`
/// becomes [`Error::TraceeDied`]; anything else is the kernel refusing the
/// named request.
pub(crate) trait ResultExt<T> {
    fn or_kernel(self, pid: Pid, request: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn or_kernel(self, pid: Pid, request: &'static str) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid },
            source => Error::KernelRefused { pid, request, source },
        })
    }
}

macro_rules! internal_error {
    ($msg:expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
