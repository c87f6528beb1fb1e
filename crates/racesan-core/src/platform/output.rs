//! Unsynchronized diagnostic output.
//!
//! Messages are formatted into a fixed stack buffer and written to fd 2 with
//! raw `write(2)`: no allocation, no stdio locking, no buffering. Every call
//! runs under [`ScopedInRtl`] so anything it touches is invisible to the
//! engine and `errno` comes back unchanged.

#![allow(unsafe_code)]

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::in_rtl::ScopedInRtl;

/// Longest single diagnostic line; longer messages are truncated.
pub const LINE_CAPACITY: usize = 1024;

static VERBOSITY: AtomicU8 = AtomicU8::new(0);

/// Set the level at which [`dprintf!`](crate::dprintf) messages are printed.
pub fn set_verbosity(level: u8) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

#[must_use]
pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Fixed-capacity formatting target. Silently truncates.
pub(crate) struct LineBuf {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Terminate the line, overwriting the last byte when full.
    fn finish_line(&mut self) {
        if self.len > 0 && self.buf[self.len - 1] == b'\n' {
            return;
        }
        if self.len == LINE_CAPACITY {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice; fd 2 may be closed, which only
        // yields an error return.
        let n = unsafe { libc::write(2, bytes.as_ptr().cast(), bytes.len()) };
        if n > 0 {
            bytes = &bytes[n as usize..];
            continue;
        }
        if n < 0 && crate::in_rtl::errno() == libc::EINTR {
            continue;
        }
        return;
    }
}

/// Write one formatted line to stderr.
pub fn write_line(args: fmt::Arguments<'_>) {
    let _in_rtl = ScopedInRtl::new();
    let mut line = LineBuf::new();
    let _ = line.write_fmt(args);
    line.finish_line();
    write_stderr(line.as_bytes());
}

/// Plain diagnostic output.
#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        $crate::platform::output::write_line(format_args!($($arg)*))
    };
}

/// Report output: race warnings and fatal messages.
#[macro_export]
macro_rules! report {
    ($($arg:tt)*) => {
        $crate::platform::output::write_line(format_args!($($arg)*))
    };
}

/// Debug output, printed only at verbosity 2 and above.
#[macro_export]
macro_rules! dprintf {
    ($($arg:tt)*) => {
        if $crate::platform::output::verbosity() >= 2 {
            $crate::platform::output::write_line(format_args!($($arg)*))
        }
    };
}
