//! Notification-channel collaborator interfaces.
//!
//! The wireless link (advertising, pairing, characteristic plumbing) lives
//! outside this crate. The engine sees it as two narrow seams: an outbound
//! sink for encoded records and an inbound stream of command frames and
//! subscription events.

use heapless::Vec;

use crate::storage::SensorReading;

/// Largest inbound command frame the transport will deliver.
pub const MAX_COMMAND_LEN: usize = 64;

/// One inbound command frame: a tag byte followed by an ASCII decimal
/// timestamp.
pub type CommandFrame = Vec<u8, MAX_COMMAND_LEN>;

/// Something the transport wants the engine to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer wrote a command frame.
    Command(CommandFrame),
    /// A peer subscribed to the notification channel and should be told how
    /// much history exists.
    SubscriberJoined,
}

/// Outbound notification slot.
///
/// Publishing replaces whatever the peer had not read yet; there is no
/// queueing, matching the single shared characteristic value on the device.
/// Delivery is the transport's problem, so publishing cannot fail.
pub trait RecordSink {
    fn publish(&self, frame: &[u8; SensorReading::SIZE]) -> impl Future<Output = ()>;
}

/// Inbound event stream from the transport.
pub trait CommandSource {
    fn next_event(&mut self) -> impl Future<Output = LinkEvent>;
}
