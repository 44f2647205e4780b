//! Index state management engine for ismd
//!
//! This crate is the heart of ismd, containing:
//! - The managed index runner (one unit of work per tick, under a lease)
//! - Lease locks and metadata history
//! - The template coordinator that attaches policies to new indices
//! - The job scheduler deciding which indices are due
//! - Management operations (policies, attach/detach, change, retry, explain)

mod coordinator;
mod events;
mod history;
mod lock;
mod management;
mod runner;
mod scheduler;

pub use coordinator::*;
pub use events::*;
pub use history::*;
pub use lock::*;
pub use management::*;
pub use runner::*;
pub use scheduler::*;
