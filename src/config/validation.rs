#![allow(clippy::collapsible_if)]

use std::time::Duration;

use eyre::Result;

use crate::config::models::{AdmissionConfig, ServerConfig, TlsConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let errors = Self::collect_errors(config);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Every individual problem found in `config`, in field order.
    pub fn collect_errors(config: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.port == 0 {
            errors.push(missing("port"));
        }

        if let Err(mut host_errors) = Self::validate_host(&config.host) {
            errors.append(&mut host_errors);
        }

        if let Err(mut admission_errors) = Self::validate_admission(&config.admission) {
            errors.append(&mut admission_errors);
        }

        if config.shutdown_timeout.is_zero() {
            errors.push(missing("shutdown_timeout"));
        }

        if config.data_dir.trim().is_empty() {
            errors.push(missing("data_dir"));
        }

        if config.admin_key.is_empty() {
            errors.push(missing("admin_key"));
        }

        if let Some(tls) = &config.tls {
            if let Err(e) = Self::validate_tls_config(tls) {
                errors.push(e);
            }
        }

        if config.https_redirect {
            if config.tls.is_none() {
                errors.push(ValidationError::InvalidField {
                    field: "https_redirect".to_string(),
                    message: "Redirecting to https requires a TLS certificate".to_string(),
                });
            }
            if config.redirect_port == 0 {
                errors.push(missing("redirect_port"));
            } else if config.redirect_port == config.port {
                errors.push(ValidationError::InvalidField {
                    field: "redirect_port".to_string(),
                    message: format!("Must differ from port {}", config.port),
                });
            }
        }

        errors
    }

    fn validate_admission(config: &AdmissionConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.shards == 0 {
            errors.push(missing("admission.shards"));
        }
        if config.period == Duration::ZERO {
            errors.push(missing("admission.period"));
        }
        if config.max_concurrent == 0 {
            errors.push(missing("admission.max_concurrent"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Both files must be named together; the interval must be positive.
    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        match (config.cert_file.is_empty(), config.key_file.is_empty()) {
            (false, false) => {}
            (true, true) => {
                return Err(ValidationError::InvalidTls {
                    message: "cert_file and key_file are required when tls is present"
                        .to_string(),
                });
            }
            _ => {
                return Err(ValidationError::InvalidTls {
                    message: "both cert_file and key_file must be set to enable TLS".to_string(),
                });
            }
        }

        if config.reload_interval.is_zero() {
            return Err(ValidationError::InvalidTls {
                message: "reload_interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Validate host field format
    fn validate_host(host: &str) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if host.contains("://") {
            errors.push(ValidationError::InvalidField {
                field: "host".to_string(),
                message: "Host should not contain protocol (e.g., use 'example.com' not 'https://example.com')".to_string(),
            });
        }

        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            errors.push(ValidationError::InvalidField {
                field: "host".to_string(),
                message: format!("Invalid hostname format: '{host}'"),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

fn missing(field: &str) -> ValidationError {
    ValidationError::MissingField {
        field: field.to_string(),
    }
}
