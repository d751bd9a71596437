//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;

pub use bitmap::Bitmap;
pub use error::{CartwrightError, ErrorKind};
pub use print::{logger_init, set_me, ME};
