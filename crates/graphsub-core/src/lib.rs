//! # Graphsub Core
//!
//! Service-facing types for the graphsub GraphQL subscription transport.
//!
//! This crate defines everything an execution service needs in order to be
//! driven by a graphsub transport, without depending on any particular wire
//! protocol:
//!
//! - [`GraphQLError`] - The structured error carried in `error` payloads
//! - [`InitPayload`] - The client-supplied connection initialisation map
//! - [`ConnectionContext`] - Per-connection state shared with hooks
//! - [`SubscriptionContext`] - Per-subscription state handed to the service
//! - [`SubscriptionService`] - The trait an execution engine implements
//!
//! ## Error capture
//!
//! Streaming resolvers often discover errors long after `subscribe` has
//! returned, deep inside code with no convenient return path back to the
//! transport. The [`SubscriptionContext`] carries an append-only error slot
//! for exactly that situation:
//!
//! ```
//! use graphsub_core::{ConnectionContext, GraphQLError};
//!
//! let ctx = ConnectionContext::new()
//!     .subscription_context()
//!     .with_error_capture();
//!
//! ctx.add_error(GraphQLError::new("shard went away"));
//! assert_eq!(ctx.collect_errors().len(), 1);
//! ```
//!
//! The transport reads the slot exactly once, when the payload stream
//! terminates, and turns its contents into the subscription's terminal
//! `error` frame.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod error;
mod payload;
mod service;

pub use context::{ConnectionContext, SubscriptionContext};
pub use error::GraphQLError;
pub use payload::InitPayload;
pub use service::{SubscriptionPayloads, SubscriptionRequest, SubscriptionService};
