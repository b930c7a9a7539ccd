#![deny(clippy::as_conversions)]

pub mod clock;
pub mod config;
pub mod engine;
mod node;
pub mod peers;
pub mod raft;
mod task;
pub mod term_store;
pub mod transport;

pub use clusterd_api as api;
pub use clusterd_api::TermId;
pub use node::*;
