//! # session-policy
//!
//! Server-authoritative realtime session configuration. This crate loads the
//! YAML policy file, rewrites client `session.update` events so that every
//! policy-controlled field carries the server's value, and decides which
//! upstream events must never reach the client.
//!
//! ```rust,no_run
//! use session_policy::{loader, PolicyEnforcer};
//!
//! let config = loader::load_policy("policy.yaml").unwrap();
//! let enforcer = PolicyEnforcer::new(config.session, Vec::new());
//! let enforced = enforcer.enforce(serde_json::json!({
//!     "type": "session.update",
//!     "session": { "temperature": 0.1 }
//! }));
//! println!("{}", enforced.event);
//! ```

mod enforcer;
mod filter;
pub mod loader;
mod schema;

pub use enforcer::{Enforced, PolicyEnforcer, POLICY_FIELDS};
pub use filter::DownstreamFilter;
pub use schema::{DownstreamPolicy, PolicyConfig, SessionPolicy};
