//! Printing that never touches the heap. Anything that can run inside the
//! allocator (fatal reports, mostly) must go through here instead of
//! `eprintln!()`, which is free to allocate.

use std::fmt;

use libc::{c_void, EINTR, STDERR_FILENO};

/// Longest line [`putln!()`] will emit; the rest is cut off.
pub const MAX_LINE: usize = 512;

/// A fixed-size line buffer implementing [`fmt::Write`]. Writes past the end
/// are silently truncated.
pub struct StackLine {
    buf: [u8; MAX_LINE],
    len: usize,
}

impl StackLine {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_LINE],
            len: 0,
        }
    }

    /// Terminate the line, overwriting the last byte if we are full
    pub fn push_newline(&mut self) {
        if self.len == MAX_LINE {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for StackLine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for StackLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(MAX_LINE - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// `write(2)` the whole of `bytes` to stderr, retrying on `EINTR` and short
/// writes. Errors are dropped, there is nowhere left to report them.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid, initialized slice for its whole length
        let n = unsafe { libc::write(STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(EINTR) {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Basically `eprintln!()`, but formats into a [`StackLine`] so it can be
/// used while the allocator is mid-operation.
#[macro_export]
macro_rules! putln {
    ($($arg:tt)*) => {{
        let mut line = $crate::util::print::StackLine::new();
        _ = ::std::fmt::Write::write_fmt(&mut line, format_args!($($arg)*));
        line.push_newline();
        $crate::util::print::write_stderr(line.as_bytes());
    }};
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::*;

    #[test]
    fn stack_line_formats_without_heap() {
        let mut line = StackLine::new();
        write!(line, "ptr = {:#x}, size = {}", 0x1000usize, 42).unwrap();
        line.push_newline();
        assert_eq!(line.as_bytes(), b"ptr = 0x1000, size = 42\n");
    }

    #[test]
    fn stack_line_truncates_long_lines() {
        let mut line = StackLine::new();
        for _ in 0..MAX_LINE {
            line.write_str("ab").unwrap();
        }
        line.push_newline();
        assert_eq!(line.as_bytes().len(), MAX_LINE);
        assert_eq!(line.as_bytes()[MAX_LINE - 1], b'\n');
    }
}
