//! Credentials for the upstream realtime and search endpoints.
//!
//! Either a static API key or a bearer token from Microsoft Entra ID. Bearer
//! tokens are fetched once at startup and then kept fresh by a single
//! background [`TokenRefresher`] task shared by every relay session.

mod credential;
mod refresher;
mod sources;
mod token;

pub use credential::{Credential, Identity};
pub use refresher::{TokenHandle, TokenRefresher};
pub use sources::{ClientSecretSource, DeveloperCliSource};
pub use token::{AccessToken, AuthError, TokenSource};

/// Scope for Azure OpenAI (realtime and embeddings).
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// Scope for Azure AI Search.
pub const SEARCH_SCOPE: &str = "https://search.azure.com/.default";
