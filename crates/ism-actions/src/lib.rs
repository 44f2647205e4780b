//! Action steps for ismd
//!
//! This crate defines the interface between the lifecycle engine and the
//! cluster that holds the indices, and the steps that back every action of
//! the policy vocabulary. It contains no transport code itself.

mod client;
mod mock;
mod step;
mod steps;

pub use client::*;
pub use mock::*;
pub use step::*;
pub use steps::*;
