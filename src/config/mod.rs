//! Configuration Management Module
//!
//! Saved server and identity profiles, and how proxy chains look them up.
//! Engine tuning lives in [`crate::ssh::EngineConfig`].

pub mod profile;

pub use profile::{IdentityProfile, ProfileBook, ProfileSource, ServerProfile};
