//! Cross-process cache invalidation
//!
//! After a mutation the owning process clears its own cache and publishes a
//! [`CacheInvalidation`]; every other process applies it through
//! [`spawn_invalidation_listener`]. The transport itself is pluggable.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::record::UserId;
use super::store::PermissionStore;
use super::PermissionError;

/// Encoded size of a [`CacheInvalidation`].
pub const INVALIDATION_LEN: usize = 8;

/// "Drop the cached permissions of this user", or of everyone for id 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInvalidation {
    pub user_id: UserId,
}

impl CacheInvalidation {
    pub fn user(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn all() -> Self {
        Self { user_id: 0 }
    }

    pub fn is_all(&self) -> bool {
        self.user_id == 0
    }

    /// Write the user id as 8 big-endian bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.user_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, PermissionError> {
        if buf.remaining() < INVALIDATION_LEN {
            return Err(PermissionError::Codec(format!(
                "Invalidation needs {} bytes, got {}",
                INVALIDATION_LEN,
                buf.remaining()
            )));
        }
        Ok(Self {
            user_id: buf.get_u64(),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(INVALIDATION_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Carries invalidations between processes.
#[async_trait]
pub trait InvalidationTransport: Send + Sync {
    async fn publish(&self, message: CacheInvalidation) -> Result<(), PermissionError>;

    fn subscribe(&self) -> Box<dyn InvalidationSubscription>;
}

/// Receiving end of an [`InvalidationTransport`].
#[async_trait]
pub trait InvalidationSubscription: Send {
    /// Next invalidation, or `None` once the transport has closed.
    async fn next(&mut self) -> Result<Option<CacheInvalidation>, PermissionError>;
}

/// In-process transport over a tokio broadcast channel of encoded payloads.
#[derive(Clone)]
pub struct BroadcastTransport {
    sender: broadcast::Sender<Bytes>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl InvalidationTransport for BroadcastTransport {
    async fn publish(&self, message: CacheInvalidation) -> Result<(), PermissionError> {
        // No subscribers is not an error: nobody has anything cached.
        if self.sender.send(message.to_bytes()).is_err() {
            debug!(user_id = message.user_id, "No invalidation subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn InvalidationSubscription> {
        Box::new(BroadcastSubscription {
            receiver: self.sender.subscribe(),
        })
    }
}

struct BroadcastSubscription {
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl InvalidationSubscription for BroadcastSubscription {
    async fn next(&mut self) -> Result<Option<CacheInvalidation>, PermissionError> {
        match self.receiver.recv().await {
            Ok(mut payload) => CacheInvalidation::decode(&mut payload).map(Some),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            // Missed messages could have named anyone.
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(count, "Invalidation subscriber lagged, clearing everything");
                Ok(Some(CacheInvalidation::all()))
            }
        }
    }
}

/// Apply invalidations from `subscription` to `store` until `cancel` fires or
/// the transport closes. Undecodable messages are logged and skipped.
pub fn spawn_invalidation_listener(
    store: Arc<PermissionStore>,
    mut subscription: Box<dyn InvalidationSubscription>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(message)) => store.clear_cached_permissions(message.user_id).await,
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Dropping invalid cache invalidation"),
            }
        }
        info!("Invalidation listener stopped");
    })
}
