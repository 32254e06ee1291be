pub mod fault;
pub mod fork;
pub mod report;

use core::fmt;

/// Prefix for every line the allocator prints on its own behalf.
pub const PREFIX: &str = "guardheap: ";

/// A `fmt::Write` sink that buffers on the stack and writes straight to a
/// file descriptor. Never allocates, so it is usable from the fault handler
/// and while the heap is in an inconsistent state.
pub struct FdWriter {
    fd: libc::c_int,
    buf: [u8; 512],
    len: usize,
}

impl FdWriter {
    pub const fn new(fd: libc::c_int) -> Self {
        FdWriter {
            fd,
            buf: [0; 512],
            len: 0,
        }
    }

    pub const fn stderr() -> Self {
        Self::new(2)
    }

    pub const fn stdout() -> Self {
        Self::new(1)
    }

    pub fn flush(&mut self) {
        let mut written = 0;
        while written < self.len {
            let rc = unsafe {
                libc::write(
                    self.fd,
                    self.buf[written..].as_ptr() as *const libc::c_void,
                    self.len - written,
                )
            };
            if rc <= 0 {
                break;
            }
            written += rc as usize;
        }
        self.len = 0;
    }
}

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            if self.len == self.buf.len() {
                self.flush();
            }
            let n = bytes.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

impl Drop for FdWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Terminate after a diagnostic has been printed. With `debugger_calls` the
/// process first raises SIGTRAP so an attached debugger stops at the scene.
#[cold]
#[inline(never)]
pub fn fatal(debugger_calls: bool) -> ! {
    unsafe {
        if debugger_calls {
            libc::raise(libc::SIGTRAP);
        }
        libc::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn writer_flushes_through_a_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        {
            let mut out = FdWriter::new(fds[1]);
            // Longer than the buffer, so at least one intermediate flush happens.
            for _ in 0..100 {
                write!(out, "0123456789").unwrap();
            }
        }
        let mut buf = [0u8; 2048];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        assert_eq!(n, 1000);
        assert!(buf[..1000].chunks(10).all(|c| c == b"0123456789"));
    }
}
