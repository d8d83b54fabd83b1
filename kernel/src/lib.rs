#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for user processes.
//!
//! Pages are described when a process is loaded and only given a frame on
//! first touch. When frames run out, a clock sweep picks a victim that goes
//! back to its file if clean or out to swap otherwise.

pub mod block;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod mem;
pub mod swapping;
pub mod system;
pub mod threading;


extern crate alloc;

pub use error::{Result, VmError};
pub use system::{VirtualMemory, VmConfig};
