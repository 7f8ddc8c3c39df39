//! The barrage load generator.
//!
//! This library supports the barrage binary found elsewhere in this project.
//! A run walks a staged concurrency profile, and each virtual user it keeps
//! alive sends randomized search and transfer requests at a fixed pace,
//! occasionally swapped for a simulated failure.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod dispatch;
pub mod fault;
pub mod scheduler;
pub mod vu;
