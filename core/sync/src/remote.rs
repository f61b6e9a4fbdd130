//! The remote call seam.

use async_trait::async_trait;

use outpost_common::Result;

use crate::queue::QueuedMutation;

/// Replays one mutation against the remote service.
///
/// Implementations own the wire format; the payload is handed over as-is.
/// Return [`outpost_common::Error::TransientRemote`] for failures worth
/// retrying and [`outpost_common::Error::PermanentRemote`] for rejections
/// that will never succeed.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, mutation: &QueuedMutation) -> Result<()>;
}
