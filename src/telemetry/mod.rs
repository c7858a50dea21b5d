//! Telemetry: structured logging with contact-data redaction.
//!
//! Metrics are emitted through the `metrics` facade throughout the crate;
//! the embedding application chooses and installs the recorder.

pub mod logging;

pub use logging::{
    init_logging, redact, ContactRedactor, LogFormat, LoggingConfig, RedactionConfig,
};
