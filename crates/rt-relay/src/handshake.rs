//! Checks applied to each inbound upgrade request before the session starts.

use globset::{Glob, GlobSet, GlobSetBuilder};
use http::StatusCode;
use thiserror::Error;
use url::Url;

use crate::transport::CLIENT_REQUEST_ID_HEADER;

#[derive(Debug, Error)]
pub enum HandshakeRejection {
    #[error("no relay attached at '{0}'")]
    UnknownPath(String),

    #[error("malformed Origin header")]
    MalformedOrigin,

    #[error("origin '{0}' is not in the allowlist")]
    OriginNotAllowed(String),
}

impl HandshakeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownPath(_) => StatusCode::NOT_FOUND,
            Self::MalformedOrigin | Self::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
        }
    }
}

/// What the relay keeps from an accepted upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub path: String,
    pub origin: Option<String>,
    pub client_request_id: Option<String>,
}

/// Allowed `Origin` values. Browsers on localhost are always let in, as
/// are clients that send no Origin at all.
#[derive(Clone)]
pub struct OriginPolicy {
    patterns: Vec<String>,
    allowed: GlobSet,
}

impl std::fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginPolicy")
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl OriginPolicy {
    /// Compile `*`-wildcard allowlist entries.
    pub fn new(allowlist: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in allowlist {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            patterns: allowlist.to_vec(),
            allowed: builder.build()?,
        })
    }

    pub fn check(&self, origin: Option<&str>) -> Result<(), HandshakeRejection> {
        let Some(origin) = origin else {
            return Ok(());
        };
        let parsed = Url::parse(origin).map_err(|_| HandshakeRejection::MalformedOrigin)?;
        if is_loopback(&parsed) || self.allowed.is_match(origin) {
            return Ok(());
        }
        Err(HandshakeRejection::OriginNotAllowed(origin.to_string()))
    }
}

fn is_loopback(origin: &Url) -> bool {
    matches!(
        origin.host_str(),
        Some("localhost" | "127.0.0.1" | "[::1]")
    )
}

/// Validate path and origin of an upgrade request.
pub fn check_request<B>(
    req: &http::Request<B>,
    paths: &[String],
    origins: &OriginPolicy,
) -> Result<HandshakeInfo, HandshakeRejection> {
    let path = req.uri().path();
    if !paths.iter().any(|p| p == path) {
        return Err(HandshakeRejection::UnknownPath(path.to_string()));
    }

    let origin = match req.headers().get(http::header::ORIGIN) {
        None => None,
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| HandshakeRejection::MalformedOrigin)?
                .to_string(),
        ),
    };
    origins.check(origin.as_deref())?;

    let client_request_id = req
        .headers()
        .get(CLIENT_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(HandshakeInfo {
        path: path.to_string(),
        origin,
        client_request_id,
    })
}
