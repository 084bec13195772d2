//! guardmalloc: a debugging allocator that puts every block on its own pages,
//! right up against an inaccessible guard page.
//!
//! - Writing past the end of a block faults on the spot (the block is
//!   right-aligned against the guard page).
//! - With recycling on, freed blocks stay mapped but `PROT_NONE`, so
//!   use-after-free faults too, and a later request for the same number of
//!   pages gets the mapping back without an `mmap()`.
//!
//! This is slow and eats address space; it is meant for hunting memory bugs,
//! not for production.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: guardmalloc::GuardAlloc = guardmalloc::GuardAlloc;
//! ```
//!
//! or build with `--features interpose` to get `malloc()` and friends.
//! A [`Context`] can also be used on its own, which is what the tests do.
#![warn(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod config;
pub mod context;
pub mod error;
#[cfg(feature = "interpose")]
pub mod ffi;
pub mod global;
pub mod index;
mod lazy_lock;
pub mod node;
pub mod os;
pub mod pool;
pub mod sync;
pub mod util;

pub use config::Config;
pub use context::{Census, Context, Stats};
pub use error::{Error, Result};
pub use global::{context, GuardAlloc};
pub use node::BlockInfo;
