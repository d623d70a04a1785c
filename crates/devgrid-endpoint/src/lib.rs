//! devgrid-endpoint: named mailbox endpoints for devgrid.
//!
//! An endpoint is a tokio task owning an unbounded mailbox. Messages are
//! processed sequentially; callers either `tell` (fire-and-forget) or `ask`
//! (request-reply with a per-call deadline). Endpoints are addressed by
//! name-derived [`EndpointPath`]s and references resolve on every send, so
//! a reference to a terminated endpoint simply produces dead letters.
//!
//! Several nodes can share one fabric (see [`EndpointSystem::for_node`]),
//! which is how multi-node clusters run inside a single process.

pub mod endpoint;
pub mod error;
pub mod path;
pub mod system;

pub use endpoint::{Context, Endpoint};
pub use error::{AskError, EndpointError, EndpointResult};
pub use path::EndpointPath;
pub use system::{EndpointRef, EndpointSystem, ReplyTo};
