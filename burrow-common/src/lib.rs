//! Common types shared by every Burrow crate.

pub mod config;
pub mod constants;
pub mod error;

pub use error::{Result, TunnelError};
