use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use upstream_auth::Credential;
use url::Url;

use crate::document::{Listing, SELECT_FIELDS};
use crate::embedding::EmbeddingClient;
use crate::error::SearchError;
use crate::filter::ListingFilter;
use crate::ListingSearch;

/// Page size for filter queries.
const FILTER_TOP: usize = 50;

const DEFAULT_API_VERSION: &str = "2024-07-01";

/// Where the listing index lives.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub service_name: String,
    pub index: String,
    pub api_version: Option<String>,
}

/// [`ListingSearch`] over the Azure AI Search REST API.
pub struct AzureListingSearch {
    search_url: Url,
    credential: Credential,
    embedder: EmbeddingClient,
    http: reqwest::Client,
}

impl fmt::Debug for AzureListingSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureListingSearch")
            .field("search_url", &self.search_url.as_str())
            .field("credential", &self.credential)
            .field("embedder", &self.embedder)
            .finish()
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    value: Vec<Listing>,
}

impl AzureListingSearch {
    pub fn new(
        settings: &SearchSettings,
        credential: Credential,
        embedder: EmbeddingClient,
    ) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            search_url: search_url(settings)?,
            credential,
            embedder,
            http,
        })
    }

    async fn query(&self, body: Value) -> Result<Vec<Listing>, SearchError> {
        let (header, value) = self.credential.header()?;
        let response = self
            .http
            .post(self.search_url.clone())
            .header(header, value)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                service: "search",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        Ok(parsed.value)
    }
}

#[async_trait]
impl ListingSearch for AzureListingSearch {
    async fn search_by_embedding(&self, query: &str, k: usize) -> Result<Vec<Listing>, SearchError> {
        let vector = self.embedder.embed(query).await?;
        let listings = self.query(vector_query(&vector, k)).await?;
        tracing::debug!(k, hits = listings.len(), "vector search");
        Ok(listings)
    }

    async fn search_by_filters(&self, filter: &ListingFilter) -> Result<Vec<Listing>, SearchError> {
        let listings = self.query(filter_query(filter)).await?;
        tracing::debug!(filter = ?filter.to_odata(), hits = listings.len(), "filter search");
        Ok(listings)
    }
}

fn search_url(settings: &SearchSettings) -> Result<Url, SearchError> {
    let base = format!("https://{}.search.windows.net", settings.service_name);
    let mut url = Url::parse(&base).map_err(|e| SearchError::Endpoint(format!("{base}: {e}")))?;
    url.set_path(&format!("/indexes/{}/docs/search", settings.index));
    url.query_pairs_mut().append_pair(
        "api-version",
        settings.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION),
    );
    Ok(url)
}

fn vector_query(vector: &[f32], k: usize) -> Value {
    json!({
        "select": SELECT_FIELDS,
        "top": k,
        "vectorQueries": [{
            "kind": "vector",
            "vector": vector,
            "fields": "embedding",
            "k": k,
            "exhaustive": false,
        }],
    })
}

fn filter_query(filter: &ListingFilter) -> Value {
    let mut body = json!({
        "search": "",
        "queryType": "simple",
        "select": SELECT_FIELDS,
        "top": FILTER_TOP,
    });
    if let Some(odata) = filter.to_odata() {
        body["filter"] = Value::String(odata);
    }
    body
}
