//! Connection and subscription contexts.
//!
//! A connection owns one [`ConnectionContext`]; each `start` derives a
//! [`SubscriptionContext`] from it. Cancelling the connection context cancels
//! every subscription context derived from it, while a subscription can be
//! cancelled individually without disturbing its siblings.
//!
//! Besides cancellation, the contexts carry the out-of-band slots that
//! GraphQL-over-WebSocket servers conventionally thread through execution:
//! the init payload, an optional close reason, a typed extension map that the
//! init hook may enrich, and the per-subscription error capture slot.

use std::sync::Arc;

use http::Extensions;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{GraphQLError, InitPayload};

/// Per-connection context.
///
/// Created by the transport when a connection is accepted, optionally
/// enriched by the init hook, and used to derive one [`SubscriptionContext`]
/// per active subscription.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    cancel: CancellationToken,
    extensions: Extensions,
    init_payload: Option<Arc<InitPayload>>,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl ConnectionContext {
    /// Create a fresh context with its own cancellation root.
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection-level cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the connection and, transitively, every subscription derived
    /// from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the connection is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Typed per-connection attachments.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable access to the attachments, for the init hook.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Record the client's init payload.
    ///
    /// The transport calls this once during the init handshake, before any
    /// subscription exists; the payload is read-only afterwards.
    pub fn set_init_payload(&mut self, payload: InitPayload) {
        self.init_payload = Some(Arc::new(payload));
    }

    /// The init payload, when one was supplied.
    pub fn init_payload(&self) -> Option<&InitPayload> {
        self.init_payload.as_deref()
    }

    /// Record a reason to surface to the client when the connection context
    /// is cancelled.
    ///
    /// When present at cancellation time, the transport emits it as a
    /// `connection_error` frame before closing.
    pub fn set_close_reason(&self, reason: impl Into<String>) {
        *self.close_reason.lock() = Some(reason.into());
    }

    /// The close reason, if one has been set.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Derive a context for a single subscription.
    ///
    /// The child carries its own cancellation token (cancelled transitively
    /// with the connection), a snapshot of the extensions, and the shared
    /// init payload. No error capture slot is installed yet; see
    /// [`SubscriptionContext::with_error_capture`].
    pub fn subscription_context(&self) -> SubscriptionContext {
        SubscriptionContext {
            cancel: self.cancel.child_token(),
            extensions: Arc::new(self.extensions.clone()),
            init_payload: self.init_payload.clone(),
            errors: None,
        }
    }
}

/// Per-subscription context handed to [`SubscriptionService::subscribe`].
///
/// Cheap to clone; clones share the same cancellation token and error slot.
///
/// [`SubscriptionService::subscribe`]: crate::SubscriptionService::subscribe
#[derive(Debug, Clone)]
pub struct SubscriptionContext {
    cancel: CancellationToken,
    extensions: Arc<Extensions>,
    init_payload: Option<Arc<InitPayload>>,
    errors: Option<Arc<Mutex<Vec<GraphQLError>>>>,
}

impl SubscriptionContext {
    /// The subscription-level cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this subscription only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether this subscription has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until this subscription is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Look up a typed attachment placed on the connection by the init hook.
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    /// The connection's init payload, when one was supplied.
    ///
    /// Successive reads always observe the same map.
    pub fn init_payload(&self) -> Option<&InitPayload> {
        self.init_payload.as_deref()
    }

    /// Install a fresh error capture slot.
    ///
    /// Without a slot, [`add_error`](Self::add_error) is a silent no-op and
    /// [`collect_errors`](Self::collect_errors) yields nothing.
    #[must_use]
    pub fn with_error_capture(mut self) -> Self {
        self.errors = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Deposit an error to be surfaced when the subscription stream
    /// terminates.
    ///
    /// Safe to call from any task holding a clone of this context; a no-op
    /// when no capture slot is installed.
    pub fn add_error(&self, err: GraphQLError) {
        if let Some(errors) = &self.errors {
            errors.lock().push(err);
        }
    }

    /// Snapshot the deposited errors in insertion order.
    pub fn collect_errors(&self) -> Vec<GraphQLError> {
        match &self.errors {
            Some(errors) => errors.lock().clone(),
            None => Vec::new(),
        }
    }
}
