//! Common utilities and types shared across Camera Hub crates.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes and shared media enums
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
