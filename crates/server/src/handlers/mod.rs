//! HTTP request handlers.

pub mod health;
pub mod maven;

pub use health::*;
pub use maven::*;
