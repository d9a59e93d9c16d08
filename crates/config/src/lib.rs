//! config: Configuration for tenant-tls
//!
//! This crate provides configuration parsing and validation, and the
//! immutable tenancy settings consumed by certificate selection.

pub mod config;

pub use config::*;
