//! Domain-aware cache layer for the annotation platform.

pub mod cache;
pub mod config;
pub mod infra;
