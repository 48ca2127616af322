use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error types for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The external executable could not be located or launched
    #[error("Failed to spawn {label} ({program}): {source}")]
    Spawn {
        label: String,
        program: String,
        #[source]
        source: io::Error,
    },

    /// The producer process exited before its stream became ready
    #[error("{label} exited with {status}{}", format_diagnostics(.diagnostics))]
    ProducerExited {
        label: String,
        status: String,
        diagnostics: String,
    },

    /// A bounded wait elapsed
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// Write-side failure on a subprocess input stream
    #[error("Broken pipe writing to {0}")]
    BrokenPipe(String),

    /// Standard stream wiring or FIFO setup failed
    #[error("Stream wiring error: {0}")]
    StreamWiring(String),

    /// The telephony endpoint refused to attach a port
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A session for this call is already active
    #[error("Session already active for call {0}")]
    SessionExists(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn format_diagnostics(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!(": {}", diagnostics)
    }
}

// Convenience constructors
impl BridgeError {
    pub fn stream_wiring(msg: impl Into<String>) -> Self {
        BridgeError::StreamWiring(msg.into())
    }

    pub fn endpoint(msg: impl Into<String>) -> Self {
        BridgeError::Endpoint(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        BridgeError::InvalidState(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        BridgeError::InvalidConfig(msg.into())
    }

    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        BridgeError::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Whether this error came from a readiness gate (producer exit or timeout)
    pub fn is_readiness_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::ProducerExited { .. } | BridgeError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_exited_message_includes_diagnostics() {
        let err = BridgeError::ProducerExited {
            label: "ffmpeg mic".to_string(),
            status: "exit status: 1".to_string(),
            diagnostics: "Connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ffmpeg mic exited with exit status: 1: Connection refused"
        );

        let quiet = BridgeError::ProducerExited {
            label: "ffmpeg mic".to_string(),
            status: "exit status: 1".to_string(),
            diagnostics: String::new(),
        };
        assert_eq!(quiet.to_string(), "ffmpeg mic exited with exit status: 1");
    }

    #[test]
    fn test_readiness_failure_classification() {
        assert!(BridgeError::timeout("fifo", Duration::from_secs(5)).is_readiness_failure());
        assert!(!BridgeError::BrokenPipe("spk".into()).is_readiness_failure());
    }
}
