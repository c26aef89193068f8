//! Data Transfer Objects for communication with external systems
//!
//! This module contains the payloads Kiln accepts from source-control and
//! image registries, the requests it sends to the build executor and the
//! callbacks the executor sends back.

pub mod build;
pub mod execution;
pub mod webhook;
