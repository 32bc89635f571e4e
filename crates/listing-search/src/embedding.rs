use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use upstream_auth::Credential;
use url::Url;

use crate::error::SearchError;

/// Azure OpenAI embeddings deployment.
pub struct EmbeddingClient {
    url: Url,
    credential: Credential,
    http: reqwest::Client,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("url", &self.url.as_str())
            .field("credential", &self.credential)
            .finish()
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        credential: Credential,
    ) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: embeddings_url(endpoint, deployment, api_version)?,
            credential,
            http,
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let (header, value) = self.credential.header()?;
        let response = self
            .http
            .post(self.url.clone())
            .header(header, value)
            .json(&json!({ "input": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                service: "embeddings",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| SearchError::Parse("embedding response had no data".into()))
    }
}

fn embeddings_url(endpoint: &str, deployment: &str, api_version: &str) -> Result<Url, SearchError> {
    let mut url = Url::parse(endpoint).map_err(|e| SearchError::Endpoint(format!("{endpoint}: {e}")))?;
    url.set_path(&format!("/openai/deployments/{deployment}/embeddings"));
    url.query_pairs_mut()
        .clear()
        .append_pair("api-version", api_version);
    Ok(url)
}
