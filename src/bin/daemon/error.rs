//! Unified Error Handling System
//!
//! This module defines centralized error types for the mechd daemon, shared by the
//! device registry, both protocol clients and the command router.

use thiserror::Error;

/// Enumeration of all error types in the application
#[derive(Error, Debug)]
pub enum MechError {
    /// No response within the configured window; `stage` is "cannot write" or "cannot read"
    #[error("{device}: timeout, {stage}")]
    TransportTimeout { device: String, stage: &'static str },

    /// The controller rejected a command with the `?` sentinel and reported a non-zero code
    #[error("{device}: error {code}: {message}")]
    DeviceReported {
        device: String,
        code: u32,
        message: String,
    },

    /// The controller rejected a command but reported error code zero
    #[error("{device}: command rejected: {fragment}")]
    CommandRejected { device: String, fragment: String },

    /// Mutually exclusive status bits asserted together
    #[error("{device}: both limit switches asserted")]
    FaultBitCombination { device: String },

    /// The device already has an operation in flight
    #[error("{device}: busy")]
    BusyConflict { device: String },

    /// The device lost and regained power; the flag must be cleared before motion
    #[error("{device}: power failure flag set, reset required")]
    PowerFailureFlag { device: String },

    /// The device is locked out by an operator
    #[error("{device}: locked by operator")]
    LockedOut { device: String },

    /// A register transfer failed outright
    #[error("{device}: fieldbus module unreachable: {reason}")]
    UnreachableFieldbusDevice { device: String, reason: String },

    /// Invalid arguments error
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// System I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Data parsing error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Resource not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Configuration file or value error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl MechError {
    /// Whether the failure should surface as `FATAL:` rather than `ERROR:`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MechError::FaultBitCombination { .. } | MechError::UnreachableFieldbusDevice { .. }
        )
    }
}

impl From<std::num::ParseIntError> for MechError {
    fn from(error: std::num::ParseIntError) -> Self {
        MechError::ParseError(error.to_string())
    }
}

impl From<std::num::ParseFloatError> for MechError {
    fn from(error: std::num::ParseFloatError) -> Self {
        MechError::ParseError(error.to_string())
    }
}

impl From<chrono::ParseError> for MechError {
    fn from(error: chrono::ParseError) -> Self {
        MechError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for MechError {
    fn from(error: toml::de::Error) -> Self {
        MechError::ConfigError(error.to_string())
    }
}

/// Standardized result type for the entire application
pub type Result<T> = std::result::Result<T, MechError>;
