#![forbid(unsafe_code)]

mod error;
#[cfg(feature = "memory")]
mod memory;

pub use error::*;
#[cfg(feature = "memory")]
pub use memory::*;
