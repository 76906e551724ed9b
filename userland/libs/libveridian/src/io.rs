//! I/O functionality for user-space programs.
//!
//! The exokernel syscall surface exposes a single `cputs` primitive (no
//! file descriptors, no distinct stdout/stderr streams) -- this module
//! is just a `core::fmt::Write` adapter over it so `print!`/`println!`
//! keep working the way callers expect.

use crate::sys;
use core::fmt;

pub struct Writer;

impl Writer {
    pub const fn stdout() -> Self {
        Writer
    }

    pub const fn stderr() -> Self {
        Writer
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        sys::cputs(s);
        Ok(())
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let mut writer = $crate::io::Writer::stdout();
        write!(writer, $($arg)*).unwrap();
    });
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ({
        $crate::print!("{}\n", format_args!($($arg)*));
    });
}
