#![doc = include_str!("../../README.md")]
#![warn(missing_docs, unreachable_pub)]

#[macro_use]
mod macros;

pub mod exec;
pub mod lb;
pub mod mem;
#[cfg(unix)]
pub mod posix;
mod status;
pub(crate) mod utils;

pub use status::{Code, Status};
