//! Structured logging with JSON/pretty formats and contact-data redaction.
//!
//! Notification payloads carry personal contact details (email addresses,
//! phone numbers), so anything interpolated into log output goes through the
//! redactor first.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{ForemanError, Result};

/// Global redactor instance.
static REDACTOR: OnceLock<ContactRedactor> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty, or compact)
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Redaction configuration
    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_target: default_include_target(),
            redaction: RedactionConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    #[default]
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Configuration for contact-data redaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    /// Whether redaction is enabled
    #[serde(default = "default_redaction_enabled")]
    pub enabled: bool,

    /// Replacement text for redacted values
    #[serde(default = "default_redaction_replacement")]
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_redaction_enabled(),
            replacement: default_redaction_replacement(),
        }
    }
}

/// Redactor masking personal contact details in log output.
#[derive(Debug, Clone)]
pub struct ContactRedactor {
    patterns: Vec<regex::Regex>,
    replacement: String,
    enabled: bool,
}

impl ContactRedactor {
    pub fn new(config: &RedactionConfig) -> Self {
        let patterns = [
            // Email addresses
            r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b",
            // Phone numbers (international and US-style)
            r"\+?\d{1,3}[-.\s]?\(?\d{2,4}\)?[-.\s]?\d{3,4}[-.\s]?\d{3,4}\b",
            // Social security numbers
            r"\b\d{3}-\d{2}-\d{4}\b",
        ]
        .iter()
        .filter_map(|pattern| regex::Regex::new(pattern).ok())
        .collect();

        Self {
            patterns,
            replacement: config.replacement.clone(),
            enabled: config.enabled,
        }
    }

    /// Mask any contact details in a value.
    pub fn redact(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }

        let mut result = value.to_string();
        for pattern in &self.patterns {
            result = pattern.replace_all(&result, &self.replacement).to_string();
        }
        result
    }

    /// Get the global redactor instance.
    pub fn global() -> &'static ContactRedactor {
        REDACTOR.get_or_init(|| ContactRedactor::new(&RedactionConfig::default()))
    }
}

/// Mask contact details in a value using the global redactor.
pub fn redact(value: &str) -> String {
    ContactRedactor::global().redact(value)
}

// Default value functions
fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_include_target() -> bool {
    true
}

fn default_redaction_enabled() -> bool {
    true
}

fn default_redaction_replacement() -> String {
    "[REDACTED]".to_string()
}

/// Initialize the logging subsystem.
///
/// # Errors
///
/// Returns an error if the filter directives are invalid or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let _ = REDACTOR.set(ContactRedactor::new(&config.redaction));

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| ForemanError::configuration(format!("invalid log level: {}", e)))?;

    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level)
            .parse()
            .map_err(|e| ForemanError::configuration(format!("invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    }
    .map_err(|e| {
        ForemanError::configuration("failed to install tracing subscriber").with_source(e)
    })?;

    Ok(())
}
