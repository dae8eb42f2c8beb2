#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]

mod clock;
mod system;
mod threading;

pub use self::{clock::*, system::*, threading::*};

/// Re-exported so that applications can initialize logging without adding
/// the dependency themselves
pub extern crate env_logger;
pub extern crate hrt_kernel;
