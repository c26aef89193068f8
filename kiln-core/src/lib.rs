//! Kiln Core
//!
//! Core types and abstractions for the Kiln build control plane.
//!
//! This crate contains:
//! - Domain types: BuildConfig templates, Build executions, triggers and strategies
//! - DTOs: Webhook payloads and executor messages exchanged with external systems

pub mod domain;
pub mod dto;
pub mod error;

pub use error::ValidationError;
