//! Reading and writing a tracee's address space.
//!
//! Two mechanisms: word-granularity `PTRACE_PEEKDATA`/`PTRACE_POKEDATA`, and
//! bulk transfer through `/proc/<pid>/mem`. The proc handle is opened on
//! first use and cached on the child; if the kernel refuses it, bulk
//! transfers quietly fall back to word loops.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;

use crate::child::Child;
use crate::error::{Error, Result};

const WORD: usize = std::mem::size_of::<libc::c_long>();

impl Child {
    /// Read one machine word at `addr`.
    pub fn peek_word(&self, addr: u64) -> Result<i64> {
        ptrace::read(self.pid(), addr as ptrace::AddressType).map_err(|errno| {
            Error::MemoryAccess {
                pid: self.pid(),
                addr,
                source: io::Error::from_raw_os_error(errno as i32),
            }
        })
    }

    /// Write one machine word at `addr`.
    pub fn poke_word(&mut self, addr: u64, word: i64) -> Result<()> {
        unsafe {
            ptrace::write(
                self.pid(),
                addr as ptrace::AddressType,
                word as *mut libc::c_void,
            )
        }
        .map_err(|errno| Error::MemoryAccess {
            pid: self.pid(),
            addr,
            source: io::Error::from_raw_os_error(errno as i32),
        })
    }

    /// Read `buf.len()` bytes starting at `addr` in the tracee. Returns the
    /// number of bytes read, which may be short at a mapping boundary.
    pub fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let pid = self.pid();

        if let Some(mem) = self.mem_file()? {
            return mem
                .read_at(buf, addr)
                .map_err(|source| Error::MemoryAccess { pid, addr, source });
        }

        self.read_mem_words(addr, buf)
    }

    /// Write `buf` into the tracee starting at `addr`. Returns the number of
    /// bytes written.
    pub fn write_mem(&mut self, addr: u64, buf: &[u8]) -> Result<usize> {
        let pid = self.pid();

        if let Some(mem) = self.mem_file()? {
            return mem
                .write_at(buf, addr)
                .map_err(|source| Error::MemoryAccess { pid, addr, source });
        }

        self.write_mem_words(addr, buf)
    }

    /// The cached `/proc/<pid>/mem` handle, or `None` once the kernel has
    /// refused to hand one out.
    fn mem_file(&mut self) -> Result<Option<&std::fs::File>> {
        if self.mem_unavailable {
            return Ok(None);
        }

        if self.mem.is_none() {
            let path = format!("/proc/{}/mem", self.pid());
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => self.mem = Some(file),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
                    ) =>
                {
                    tracing::debug!(
                        pid = self.pid().as_raw(),
                        %err,
                        "proc mem unavailable, falling back to word transfers"
                    );
                    self.mem_unavailable = true;
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(self.mem.as_ref())
    }

    fn read_mem_words(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;

        while done < buf.len() {
            let word = self.peek_word(addr + done as u64)?;
            let bytes = word.to_ne_bytes();
            let take = usize::min(WORD, buf.len() - done);
            buf[done..done + take].copy_from_slice(&bytes[..take]);
            done += take;
        }

        Ok(done)
    }

    fn write_mem_words(&mut self, addr: u64, buf: &[u8]) -> Result<usize> {
        let mut done = 0;

        while done < buf.len() {
            let at = addr + done as u64;
            let remaining = buf.len() - done;

            let word = if remaining >= WORD {
                let mut bytes = [0u8; WORD];
                bytes.copy_from_slice(&buf[done..done + WORD]);
                i64::from_ne_bytes(bytes)
            } else {
                // Partial tail word: read-modify-write to preserve the bytes
                // beyond the buffer.
                let mut bytes = self.peek_word(at)?.to_ne_bytes();
                bytes[..remaining].copy_from_slice(&buf[done..]);
                i64::from_ne_bytes(bytes)
            };

            self.poke_word(at, word)?;
            done += usize::min(WORD, remaining);
        }

        Ok(done)
    }
}
