// lib.rs - SafeZone shared core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod clock;
pub mod config;
pub mod engine;
pub mod history;
pub mod model;
pub mod store;

mod event;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use capabilities::Capabilities;
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{EmergencyEngine, EngineSnapshot, SafetyTimerStatus};
pub use history::History;
pub use model::{
    ContactId, Coordinate, EmergencyId, EmergencyKind, EmergencyRecord, EmergencySnapshot,
    UnixTimeMs, ValidationError,
};
pub use store::{FileHistoryStore, HistoryStore, MemoryHistoryStore, StoreError, StoreLimits};

pub const SAFETY_TIMER_PRESETS_SECS: &[u64] = &[120, 300, 600, 900, 1800];
pub const DEFAULT_SAFETY_TIMER_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("emergency not found: {0}")]
    NotFound(EmergencyId),

    #[error("emergency engine is not running")]
    Closed,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Storage,
    Serialization,
    Configuration,
    EngineStopped,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::EngineStopped => "ENGINE_STOPPED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Storage => ErrorSeverity::Transient,
            Self::Validation | Self::NotFound | Self::Configuration => ErrorSeverity::Permanent,
            Self::Serialization | Self::EngineStopped | Self::Internal => ErrorSeverity::Fatal,
        }
    }
}

/// Error shape handed across the FFI boundary to the native shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "This event is no longer in your history.".into(),
            ErrorKind::Storage => {
                "Unable to save your emergency history. Please free up some storage space.".into()
            }
            ErrorKind::Serialization => {
                "Your emergency history could not be read. Please contact support.".into()
            }
            ErrorKind::Configuration | ErrorKind::EngineStopped | ErrorKind::Internal => {
                "An unexpected error occurred. Please restart the app.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation(v) => AppError::new(ErrorKind::Validation, v.to_string()),
            EngineError::NotFound(id) => {
                AppError::new(ErrorKind::NotFound, "emergency not found")
                    .with_context("emergency_id", id.to_string())
            }
            EngineError::Closed => {
                AppError::new(ErrorKind::EngineStopped, "emergency engine is not running")
            }
            EngineError::Config(c) => AppError::new(ErrorKind::Configuration, c.to_string()),
        }
    }
}

/// For shells that read or export the history file outside the engine.
impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(msg) => {
                AppError::new(ErrorKind::Serialization, "history serialization failed")
                    .with_internal(msg)
            }
            s => AppError::new(ErrorKind::Storage, "history store failure").with_internal(s.to_string()),
        }
    }
}
