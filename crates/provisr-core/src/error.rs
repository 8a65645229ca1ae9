//! Error types for Provisr

/// Provisr error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Spec not found: {0}")]
    SpecNotFound(String),

    #[error("Spec already exists: {0}")]
    SpecAlreadyExists(String),

    #[error("Invalid spec '{name}': {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Duplicate hook name: {0}")]
    DuplicateHook(String),

    #[error("Hook '{hook}' failed: {reason}")]
    HookFailed { hook: String, reason: String },

    #[error("Failed to spawn '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Failed to start '{name}' after {attempts} attempts: {reason}")]
    StartFailed {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("Failed to stop '{name}': {reason}")]
    StopFailed { name: String, reason: String },

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Invalid concurrency policy: {0}")]
    InvalidConcurrencyPolicy(String),

    #[error("CronJob already scheduled: {0}")]
    AlreadyScheduled(String),

    #[error("CronJob already exists: {0}")]
    CronJobExists(String),

    #[error("CronJob not found: {0}")]
    CronJobNotFound(String),

    #[error("Group '{group}' start failed at member '{member}': {source}")]
    GroupStartFailed {
        group: String,
        member: String,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Provisr
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_spec<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Error::InvalidSpec {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_field<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Error::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn spawn<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Error::SpawnFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn stop<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Error::StopFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SpecNotFound("web".to_string());
        assert_eq!(err.to_string(), "Spec not found: web");
    }

    #[test]
    fn test_invalid_field_names_field() {
        let err = Error::invalid_field("backoff_limit", "must be >= 0");
        assert!(err.to_string().contains("backoff_limit"));
    }

    #[test]
    fn test_group_start_failed_names_group_and_member() {
        let err = Error::GroupStartFailed {
            group: "stack".to_string(),
            member: "db".to_string(),
            source: Box::new(Error::SpecNotFound("db".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("stack"));
        assert!(msg.contains("db"));
    }
}
