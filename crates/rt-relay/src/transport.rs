use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use http::{HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use upstream_auth::Credential;
use url::Url;

use crate::error::ConnectError;

/// Header used to correlate requests with the service-side logs.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Both halves of one message connection. Sessions own these outright.
pub struct Duplex {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Duplex {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }

    pub fn from_ws<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Per-session parameters for opening the upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub session_id: uuid::Uuid,
    /// Propagated from the client's upgrade request when present.
    pub client_request_id: Option<String>,
}

/// Opens the upstream realtime connection for a session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, request: &UpstreamRequest) -> Result<Duplex, ConnectError>;
}

/// `wss://<endpoint>/openai/realtime?api-version=..&deployment=..`
pub fn realtime_url(
    endpoint: &str,
    deployment: &str,
    api_version: &str,
) -> Result<Url, ConnectError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| ConnectError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    if url.host_str().is_none() {
        return Err(ConnectError::InvalidEndpoint(format!("{endpoint}: no host")));
    }

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ConnectError::InvalidEndpoint(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ConnectError::InvalidEndpoint(format!("cannot use scheme {scheme}")))?;

    url.set_path("/openai/realtime");
    url.query_pairs_mut()
        .clear()
        .append_pair("api-version", api_version)
        .append_pair("deployment", deployment);
    Ok(url)
}

/// Connects to Azure OpenAI realtime with the configured credential.
pub struct RealtimeConnector {
    url: Url,
    credential: Credential,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RealtimeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConnector")
            .field("url", &self.url.as_str())
            .field("credential", &self.credential)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RealtimeConnector {
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        credential: Credential,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        Ok(Self {
            url: realtime_url(endpoint, deployment, api_version)?,
            credential,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self, request: &UpstreamRequest) -> Result<Duplex, ConnectError> {
        let mut ws_request = self.url.as_str().into_client_request()?;
        let headers = ws_request.headers_mut();

        let (name, value) = self.credential.header()?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectError::InvalidHeader(e.to_string()))?;
        let value =
            HeaderValue::from_str(&value).map_err(|e| ConnectError::InvalidHeader(e.to_string()))?;
        headers.insert(name, value);

        if let Some(id) = &request.client_request_id {
            let value =
                HeaderValue::from_str(id).map_err(|e| ConnectError::InvalidHeader(e.to_string()))?;
            headers.insert(CLIENT_REQUEST_ID_HEADER, value);
        }

        let connect = tokio_tungstenite::connect_async(ws_request);
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout)),
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                Err(match status {
                    401 | 403 => ConnectError::Rejected { status },
                    _ => ConnectError::Status { status },
                })
            }
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok((ws, _response))) => {
                tracing::debug!(
                    session_id = %request.session_id,
                    upstream = %self.url,
                    "upstream connected"
                );
                Ok(Duplex::from_ws(ws))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_endpoint_becomes_wss() {
        let url = realtime_url(
            "https://contoso.openai.azure.com/",
            "gpt-4o-realtime-preview",
            "2024-10-01-preview",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://contoso.openai.azure.com/openai/realtime?api-version=2024-10-01-preview&deployment=gpt-4o-realtime-preview"
        );
    }

    #[test]
    fn http_endpoint_becomes_ws_and_keeps_port() {
        let url = realtime_url("http://127.0.0.1:9000", "d", "v").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(9000));
        assert_eq!(url.path(), "/openai/realtime");
    }

    #[test]
    fn bad_endpoints_are_rejected() {
        assert!(matches!(
            realtime_url("not a url", "d", "v"),
            Err(ConnectError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            realtime_url("ftp://example.com", "d", "v"),
            Err(ConnectError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn debug_redacts_credential() {
        let connector = RealtimeConnector::new(
            "https://contoso.openai.azure.com",
            "d",
            "v",
            Credential::ApiKey("super-secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let out = format!("{connector:?}");
        assert!(!out.contains("super-secret"));
    }
}
