//! Realtime voice middle tier.
//!
//! Sits between a browser client and the Azure OpenAI realtime endpoint,
//! relaying JSON events in both directions while the server keeps control of
//! the session configuration and executes the model's tool calls locally.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  rt-relay  <--WS-->  Azure OpenAI realtime
//!                      |
//!        [Policy Enforcer]  [Call Correlator]
//!                      |
//!               [Tool Registry] --> search / preferences / ...
//! ```
//!
//! [`RelayServer`] accepts upgrades on the attached paths and runs one
//! [`RelaySession`] per connection. Each session owns both sockets, one
//! writer task per socket, two pumps, and its in-flight tool tasks.

pub mod continuation;
pub mod correlator;
pub mod error;
pub mod event;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use continuation::ContinuationTracker;
pub use correlator::{CallCorrelator, CompletedCall, UnknownCall};
pub use error::{ConnectError, MalformedEvent};
pub use event::RelayEvent;
pub use registry::{
    handler_fn, ResultDirection, RegistryError, ToolDescriptor, ToolError, ToolHandler,
    ToolOutcome, ToolRegistry,
};
pub use server::{RelayServer, RelayServerConfig};
pub use session::{RelaySession, SessionContext, SessionServices, SessionState};
pub use transport::{Duplex, RealtimeConnector, UpstreamConnector, UpstreamRequest};
