//! Service Module
//!
//! Business logic layer for the controller.
//! Services work against the typed store and contain the trigger, factory
//! and dispatch rules.

pub mod build;
pub mod build_config;
pub mod dispatcher;
pub mod factory;
pub mod trigger;

// Re-export for convenience
pub use build as build_service;
pub use build_config as build_config_service;
pub use dispatcher::Dispatcher;
pub use trigger as trigger_service;
