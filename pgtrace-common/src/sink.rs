//! The event channel seen from the encoder side.
//!
//! Publishing must never block or fault the observed process. A full
//! channel drops the record; encoders ignore the result on purpose —
//! delivery is best effort, liveness is not negotiable.

/// Marker for fixed-size records the channel accepts.
pub trait Record: Copy {}

impl Record for crate::events::LockEvent {}
impl Record for crate::events::RowLockEvent {}
impl Record for crate::events::LwLockEvent {}
impl Record for crate::events::SpinDelayEvent {}

/// The publish was dropped. Tolerated silently; never surfaced per event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelFull;

/// Non-blocking publish path to the collaborator.
pub trait EventSink {
    fn publish<R: Record>(&self, record: &R) -> Result<(), ChannelFull>;
}
