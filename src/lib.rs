//! A 32-bit register-based virtual machine.
//!
//! Provides the execution engine, the segmented memory subsystem with its
//! block heap allocator, the instruction decoder, the program image loader,
//! and the host service layer.

pub mod machine;
pub mod types;
pub mod utils;
