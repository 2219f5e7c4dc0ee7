pub mod data_dir;
pub mod panic_log;
pub mod safe_print;
pub mod trace;

pub use trace::{event, Span};
