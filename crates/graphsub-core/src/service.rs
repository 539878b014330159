//! The execution service boundary.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{GraphQLError, SubscriptionContext};

/// The lazy payload sequence produced by a subscription.
///
/// The service sends one JSON-encodable value per event; closing the channel
/// signals normal completion of the subscription.
pub type SubscriptionPayloads = mpsc::Receiver<Value>;

/// A decoded subscription request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// The operation to execute when the document contains several.
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    /// The GraphQL document.
    #[serde(default)]
    pub query: String,
    /// Operation variables.
    #[serde(default)]
    pub variables: Option<HashMap<String, Value>>,
}

/// An execution engine capable of running GraphQL subscriptions.
///
/// The transport calls [`subscribe`](Self::subscribe) once per `start` frame
/// and forwards every payload from the returned channel to the client. The
/// service should stop producing when `ctx` is cancelled, and may deposit
/// late errors through [`SubscriptionContext::add_error`]; they replace the
/// terminal `complete` frame with an `error` frame.
pub trait SubscriptionService: Send + Sync + 'static {
    /// Begin executing a subscription.
    ///
    /// An `Err` return is reported to the client immediately as an id-scoped
    /// error followed by `complete`.
    fn subscribe(
        &self,
        ctx: SubscriptionContext,
        request: SubscriptionRequest,
    ) -> BoxFuture<'static, Result<SubscriptionPayloads, GraphQLError>>;
}
