/// Errors from delivering a notification to the external chat webhook.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The HTTP request to the webhook endpoint failed.
    #[error("notify: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The webhook endpoint returned a non-success status.
    #[error("notify: webhook returned status={status}, body={body}")]
    Rejected { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, NotifyError>;
