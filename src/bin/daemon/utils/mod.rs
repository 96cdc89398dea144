//! Utilities Module
//!
//! This module contains shared utility functionality for the mechd daemon.

pub mod journal;
pub mod tracing;

/// Tests module for utils components
#[cfg(test)]
mod utils_tests;
