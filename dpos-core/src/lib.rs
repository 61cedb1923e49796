//! Core data structures shared by the consensus crates
//!
//! This crate provides:
//! - Basic types (Hash, Pubkey, BlockHeight, Timestamp)
//! - The block header that carries consensus extra data
//! - Core error types

pub mod block;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use block::*;
pub use error::*;
pub use types::*;
