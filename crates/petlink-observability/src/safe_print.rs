// Stderr logging that never panics.
//
// Release builds of the desktop shell run under the Windows GUI subsystem with no
// console attached; `eprintln!` panics on write errors there. Write failures are
// ignored instead.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
