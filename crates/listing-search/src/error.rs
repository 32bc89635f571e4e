use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("credential unavailable: {0}")]
    Auth(#[from] upstream_auth::AuthError),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}
