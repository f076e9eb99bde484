#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure reported by a batch subscriber.
///
/// Returned explicitly by a listener, or synthesized by the batcher when a
/// listener panics. Never propagated past the listener's own error boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ListenerError {
    pub message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("listener panicked: {detail}"))
    }
}

impl From<String> for ListenerError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ListenerError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
