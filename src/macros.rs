//! Small helper macros shared across the `sys` modules.

/// Run a libc syscall, mapping a `-1` return into `io::Error::last_os_error`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
