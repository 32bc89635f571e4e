//! The tools voicerag offers the model.
//!
//! `search` and `update_preferences` hand their results to the browser,
//! which renders listing cards and the preference panel. `filter_listings`
//! answers the model itself so it can narrate the matches.

use std::sync::Arc;

use listing_search::{ListingFilter, ListingSearch, SearchError};
use rt_relay::{handler_fn, RegistryError, ResultDirection, ToolError, ToolRegistry};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Nearest neighbours returned by `search`.
pub const SEARCH_K: usize = 5;

/// Register every tool available with the given backend. Without a search
/// backend only `update_preferences` is offered.
pub fn register_tools(
    registry: &mut ToolRegistry,
    search: Option<Arc<dyn ListingSearch>>,
) -> Result<(), RegistryError> {
    registry.register(
        "update_preferences",
        update_preferences_schema(),
        handler_fn(|args, _cancel| async move { update_preferences(args) }),
        ResultDirection::ToClient,
    )?;

    let Some(backend) = search else {
        return Ok(());
    };

    let vector = Arc::clone(&backend);
    registry.register(
        "search",
        search_schema(),
        handler_fn(move |args, cancel| {
            let backend = Arc::clone(&vector);
            async move { run_search(backend.as_ref(), args, cancel).await }
        }),
        ResultDirection::ToClient,
    )?;

    registry.register(
        "filter_listings",
        filter_listings_schema(),
        handler_fn(move |args, cancel| {
            let backend = Arc::clone(&backend);
            async move { run_filter(backend.as_ref(), args, cancel).await }
        }),
        ResultDirection::ToServer,
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn run_search(
    backend: &dyn ListingSearch,
    args: Value,
    cancel: CancellationToken,
) -> Result<Value, ToolError> {
    let query = args
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments("`query` must be a non-empty string".into()))?;

    info!(query, k = SEARCH_K, "searching listings");
    let listings = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
        result = backend.search_by_embedding(query, SEARCH_K) => result.map_err(backend_error)?,
    };

    Ok(json!({ "listings": listings }))
}

async fn run_filter(
    backend: &dyn ListingSearch,
    args: Value,
    cancel: CancellationToken,
) -> Result<Value, ToolError> {
    let filter: ListingFilter = serde_json::from_value(args)
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

    info!(filter = ?filter.to_odata(), "filtering listings");
    let listings = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
        result = backend.search_by_filters(&filter) => result.map_err(backend_error)?,
    };

    Ok(json!({
        "count": listings.len(),
        "listings": listings,
    }))
}

fn update_preferences(args: Value) -> Result<Value, ToolError> {
    if !args.is_object() {
        return Err(ToolError::InvalidArguments(
            "preferences must be a JSON object".into(),
        ));
    }
    Ok(json!({
        "action": "update_preferences",
        "preferences": args,
    }))
}

fn backend_error(err: SearchError) -> ToolError {
    tracing::warn!(error = %err, "listing search failed");
    ToolError::Backend(err.to_string())
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

fn search_schema() -> Value {
    json!({
        "type": "function",
        "name": "search",
        "description": "Search the knowledge base for flat listings. The knowledge base \
                        will be searched for the query and the results shown to the user.",
        "parameters": {
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        }
    })
}

fn update_preferences_schema() -> Value {
    let range = json!({
        "type": "object",
        "properties": {
            "min": {"type": "number"},
            "max": {"type": "number"}
        }
    });
    json!({
        "type": "function",
        "name": "update_preferences",
        "description": "Update the user's preferences for apartment search. Only include \
                        fields that were specifically mentioned by the user.",
        "parameters": {
            "type": "object",
            "properties": {
                "budget": range.clone(),
                "size": range,
                "rooms": {
                    "type": "number",
                    "description": "Desired number of rooms"
                },
                "location": {
                    "type": "string",
                    "description": "Preferred location/district in Vienna"
                },
                "features": {
                    "type": "object",
                    "properties": {
                        "balcony": {"type": "boolean"},
                        "parking": {"type": "boolean"},
                        "elevator": {"type": "boolean"},
                        "furnished": {"type": "boolean"},
                        "pets": {"type": "boolean"},
                        "garden": {"type": "boolean"},
                        "storage": {"type": "boolean"},
                        "laundry": {"type": "boolean"}
                    },
                    "description": "Features with boolean values indicating if they are \
                                    wanted (true) or not wanted (false)"
                }
            },
            "required": [],
            "additionalProperties": false
        }
    })
}

fn filter_listings_schema() -> Value {
    json!({
        "type": "function",
        "name": "filter_listings",
        "description": "Find flat listings matching hard constraints. Returns the matches \
                        and their count so you can summarise them for the user.",
        "parameters": {
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "District, or several districts separated by commas"
                },
                "max_price": {
                    "type": "number",
                    "description": "Highest acceptable monthly rent"
                },
                "min_rooms": {
                    "type": "integer",
                    "description": "Smallest acceptable number of rooms"
                },
                "furnished": {"type": "boolean"},
                "pet_friendly": {"type": "boolean"}
            },
            "required": [],
            "additionalProperties": false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use listing_search::Listing;

    #[derive(Default)]
    struct FakeSearch {
        queries: Mutex<Vec<(String, usize)>>,
        filters: Mutex<Vec<ListingFilter>>,
        fail: bool,
    }

    fn listing(id: &str) -> Listing {
        serde_json::from_value(json!({"id": id, "title": format!("Flat {id}"), "price": 980.0}))
            .unwrap()
    }

    #[async_trait]
    impl ListingSearch for FakeSearch {
        async fn search_by_embedding(
            &self,
            query: &str,
            k: usize,
        ) -> Result<Vec<Listing>, SearchError> {
            self.queries.lock().unwrap().push((query.to_string(), k));
            if self.fail {
                return Err(SearchError::Parse("index offline".into()));
            }
            Ok(vec![listing("1"), listing("2")])
        }

        async fn search_by_filters(
            &self,
            filter: &ListingFilter,
        ) -> Result<Vec<Listing>, SearchError> {
            self.filters.lock().unwrap().push(filter.clone());
            Ok(vec![listing("3")])
        }
    }

    fn registry_with(backend: Arc<FakeSearch>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let backend: Arc<dyn ListingSearch> = backend;
        register_tools(&mut registry, Some(backend)).unwrap();
        registry
    }

    #[test]
    fn without_backend_only_preferences_are_offered() {
        let mut registry = ToolRegistry::new();
        register_tools(&mut registry, None).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["update_preferences"]);
    }

    #[test]
    fn directions_match_consumers() {
        let registry = registry_with(Arc::new(FakeSearch::default()));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.direction_of("search"), Some(ResultDirection::ToClient));
        assert_eq!(
            registry.direction_of("update_preferences"),
            Some(ResultDirection::ToClient)
        );
        assert_eq!(
            registry.direction_of("filter_listings"),
            Some(ResultDirection::ToServer)
        );
    }

    #[tokio::test]
    async fn search_returns_listings_for_the_client() {
        let backend = Arc::new(FakeSearch::default());
        let registry = registry_with(Arc::clone(&backend));

        let outcome = registry
            .lookup("search")
            .unwrap()
            .invoke(json!({"query": " flat near the Prater "}), CancellationToken::new())
            .await;

        let result = outcome.result.unwrap();
        assert_eq!(result["listings"].as_array().unwrap().len(), 2);
        assert_eq!(result["listings"][0]["id"], "1");
        assert_eq!(
            backend.queries.lock().unwrap().as_slice(),
            &[("flat near the Prater".to_string(), SEARCH_K)]
        );
    }

    #[tokio::test]
    async fn blank_query_is_rejected_without_searching() {
        let backend = Arc::new(FakeSearch::default());
        let registry = registry_with(Arc::clone(&backend));

        let outcome = registry
            .lookup("search")
            .unwrap()
            .invoke(json!({"query": "  "}), CancellationToken::new())
            .await;

        assert!(matches!(outcome.result, Err(ToolError::InvalidArguments(_))));
        assert!(backend.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_call_does_not_report_results() {
        let registry = registry_with(Arc::new(FakeSearch::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = registry
            .lookup("search")
            .unwrap()
            .invoke(json!({"query": "loft"}), cancel)
            .await;

        assert!(matches!(outcome.result, Err(ToolError::Cancelled)));
    }

    #[tokio::test]
    async fn backend_failure_becomes_tool_error() {
        let backend = Arc::new(FakeSearch {
            fail: true,
            ..Default::default()
        });
        let registry = registry_with(backend);

        let outcome = registry
            .lookup("search")
            .unwrap()
            .invoke(json!({"query": "loft"}), CancellationToken::new())
            .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.code(), "tool_error");
        assert!(err.to_string().contains("index offline"));
    }

    #[tokio::test]
    async fn filter_listings_reports_count_to_the_model() {
        let backend = Arc::new(FakeSearch::default());
        let registry = registry_with(Arc::clone(&backend));

        let outcome = registry
            .lookup("filter_listings")
            .unwrap()
            .invoke(
                json!({"location": "Leopoldstadt", "max_price": 1200, "pet_friendly": true}),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.direction, ResultDirection::ToServer);
        let result = outcome.result.unwrap();
        assert_eq!(result["count"], 1);
        assert_eq!(result["listings"][0]["id"], "3");

        let filters = backend.filters.lock().unwrap();
        assert_eq!(filters[0].location.as_deref(), Some("Leopoldstadt"));
        assert_eq!(filters[0].max_price, Some(1200.0));
        assert_eq!(filters[0].pet_friendly, Some(true));
    }

    #[tokio::test]
    async fn filter_listings_rejects_unknown_constraints() {
        let registry = registry_with(Arc::new(FakeSearch::default()));

        let outcome = registry
            .lookup("filter_listings")
            .unwrap()
            .invoke(json!({"pool": true}), CancellationToken::new())
            .await;

        assert!(matches!(outcome.result, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn preferences_are_echoed_with_action() {
        let registry = registry_with(Arc::new(FakeSearch::default()));
        let prefs = json!({"budget": {"max": 1500}, "features": {"balcony": true}});

        let outcome = registry
            .lookup("update_preferences")
            .unwrap()
            .invoke(prefs.clone(), CancellationToken::new())
            .await;

        assert_eq!(
            outcome.result.unwrap(),
            json!({"action": "update_preferences", "preferences": prefs})
        );
    }
}
