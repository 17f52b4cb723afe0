//! Native star detection, plate solving, and frame stacking core.
//!
//! The three public entry points an embedding host calls into are exposed by
//! [`api`]; everything under [`domain`] and [`model`] is the synchronous,
//! pure-per-call engine those entry points wire together. There is no
//! async runtime and no marshalling layer here — a JNI, C-ABI, or direct
//! Rust caller all see the same plain functions.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod model;
pub mod utils;

pub use error::{Error, Result};
