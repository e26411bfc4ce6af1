//! Errors and their operational classification.

use thiserror::Error;

/// Operational classification of a failure.
///
/// - Transient: 同じ操作が後で成功しうる (retry する意味がある)
/// - Permanent: 入力そのものが壊れている (retry しても無駄)
/// - Infrastructure: local store engine の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Envelope JSON could not be parsed or violates a required field.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Payload is not valid base64.
    #[error("invalid payload encoding: {0}")]
    PayloadDecode(#[from] base64::DecodeError),

    /// No execution time could be resolved from the envelope.
    #[error("execution time is not set (processIn={process_in}, processAt={process_at})")]
    InvalidSchedule { process_in: i64, process_at: i64 },

    /// A persisted task could not be encoded or read back.
    #[error("task encoding: {0}")]
    TaskEncoding(#[source] serde_json::Error),

    #[error("source read failed: {0}")]
    SourceRead(String),

    #[error("forward to topic={topic} failed: {reason}")]
    Forward { topic: String, reason: String },

    #[error("enqueue failed: {0}")]
    Enqueue(String),

    #[error("acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("store: {0}")]
    Store(String),
}

impl RelayError {
    pub fn forward(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::Forward {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::MalformedEnvelope(_)
            | RelayError::PayloadDecode(_)
            | RelayError::InvalidSchedule { .. }
            | RelayError::TaskEncoding(_) => ErrorKind::Permanent,
            RelayError::SourceRead(_)
            | RelayError::Forward { .. }
            | RelayError::Enqueue(_)
            | RelayError::Acknowledge(_) => ErrorKind::Transient,
            RelayError::Store(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether re-attempting the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }
}
