use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

/// Errors raised while acquiring the local screen.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The user dismissed the screen picker.  Terminal; never retried.
    #[error("screen capture permission was denied")]
    PermissionDenied,
    #[error("screen capture failed: {0}")]
    Failed(String),
}

/// A live local capture: one screen track plus optional system audio.
///
/// `ended` flips to `true` when the capture stops underneath the session,
/// e.g. the user hits the platform's native "stop sharing" chrome instead of
/// the in-app button.
#[derive(Debug, Clone)]
pub struct CaptureStream {
    pub stream_id: String,
    pub has_audio: bool,
    pub ended: watch::Receiver<bool>,
}

/// Seam through which the session controller acquires the screen, so tests
/// can script grants, denials and mid-session stops.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(&self, with_audio: bool) -> Result<CaptureStream, CaptureError>;
}
