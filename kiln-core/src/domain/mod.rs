//! Core domain types
//!
//! This module contains the objects the control plane persists and reasons about.
//! BuildConfigs are templates owned by operators; Builds are the concrete executions
//! derived from them. Both are stored in the versioned object store.

pub mod build;
pub mod build_config;
pub mod image;
pub mod meta;
pub mod strategy;
