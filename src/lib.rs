//! Mirror - personal memory layer
//!
//! Turns what a user has written into retrievable memory: classifies each
//! incoming message, pulls a bounded, task-specific slice of entities,
//! facts, notes, patterns and behaviors, and renders it as a context block
//! for a downstream language model. The lifecycle manager decides how
//! newly extracted facts change what is stored.

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod state;
pub mod telemetry;

pub use mirror_models as models;

pub use config::config;
pub use error::{Error, Result};
pub use state::MemoryLayer;
