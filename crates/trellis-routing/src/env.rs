//! # External Collaborators
//!
//! The routing core is pure logic; everything it needs from the embedding
//! daemon arrives through these traits. Tests plug in in-memory
//! implementations.

use thiserror::Error;
use trellis_overlay::address::SubscriberId;
use trellis_overlay::frame::OverlayFrame;

/// The subscriber directory: who exists, and which identities are our own.
pub trait SubscriberDirectory {
    /// Every subscriber currently known, in any stable order.
    fn subscribers(&self) -> Vec<SubscriberId>;

    /// Whether `sid` belongs to our own keyring. Own identities are always
    /// one hop from us and are advertised as such.
    fn is_own_identity(&self, sid: &SubscriberId) -> bool;
}

/// The outbound frame queue. A successfully enqueued frame belongs to the
/// queue; on failure the caller drops it and rebuilds from current state on
/// the next alarm.
pub trait FrameQueue {
    fn enqueue(&mut self, frame: OverlayFrame) -> Result<(), EnqueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound queue rejected the frame")]
pub struct EnqueueError;

/// Observer notified whenever a subscriber's best link changes. The
/// embedder forwards these to attached monitors.
pub trait LinkObserver {
    fn link_changed(
        &mut self,
        hop_count: i32,
        transmitter: Option<SubscriberId>,
        subscriber: SubscriberId,
    );
}

/// Ignore announcements.
impl LinkObserver for () {
    fn link_changed(&mut self, _: i32, _: Option<SubscriberId>, _: SubscriberId) {}
}
