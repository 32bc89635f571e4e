//! Flat-listing lookups against an Azure AI Search index.
//!
//! Two query shapes are supported: nearest neighbours of an embedded free
//! text query, and structured OData filters. Index construction and document
//! upload are done elsewhere; this crate only reads.

mod client;
mod document;
mod embedding;
mod error;
mod filter;

use async_trait::async_trait;

pub use client::{AzureListingSearch, SearchSettings};
pub use document::Listing;
pub use embedding::EmbeddingClient;
pub use error::SearchError;
pub use filter::ListingFilter;

#[async_trait]
pub trait ListingSearch: Send + Sync {
    /// The `k` listings closest to `query` in embedding space.
    async fn search_by_embedding(&self, query: &str, k: usize) -> Result<Vec<Listing>, SearchError>;

    /// Every listing matching `filter`, capped by the backend's page size.
    async fn search_by_filters(&self, filter: &ListingFilter) -> Result<Vec<Listing>, SearchError>;
}
