//! Latest-value snapshot channel
//!
//! A single slot holding the most recent snapshot. A newer snapshot replaces
//! an unread one, so a slow consumer always renders current data and the
//! producer never blocks. Receivers can poll or block with a timeout.

use crate::telemetry::TelemetrySnapshot;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a blocking receive returned without a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("no new snapshot within the timeout")]
    Timeout,
    #[error("snapshot channel closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<Arc<TelemetrySnapshot>>,
    /// Bumped on every accepted publish
    version: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Slot>,
    updated: Condvar,
}

/// Create a connected publisher/receiver pair
pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReceiver) {
    let shared = Arc::new(Shared::default());
    let receiver = SnapshotReceiver {
        shared: Arc::clone(&shared),
        seen: 0,
    };
    (SnapshotPublisher { shared }, receiver)
}

/// Producer side, owned by the acquisition thread
///
/// Dropping the publisher closes the channel.
#[derive(Debug)]
pub struct SnapshotPublisher {
    shared: Arc<Shared>,
}

impl SnapshotPublisher {
    /// Store a snapshot, replacing any unread one
    ///
    /// Returns `false` if the channel is closed or the snapshot is not newer
    /// than the one already stored.
    pub fn publish(&self, snapshot: TelemetrySnapshot) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.closed {
            return false;
        }
        if let Some(current) = &slot.latest {
            if snapshot.sequence <= current.sequence {
                log::warn!(
                    "Dropping out-of-order snapshot #{} (have #{})",
                    snapshot.sequence,
                    current.sequence
                );
                return false;
            }
        }
        slot.latest = Some(Arc::new(snapshot));
        slot.version += 1;
        drop(slot);
        self.shared.updated.notify_all();
        true
    }

    /// Reject further snapshots and wake blocked receivers
    pub fn close(&self) {
        self.shared.slot.lock().closed = true;
        self.shared.updated.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slot.lock().closed
    }

    /// Another receiver on this channel, starting with nothing seen
    pub fn subscribe(&self) -> SnapshotReceiver {
        SnapshotReceiver {
            shared: Arc::clone(&self.shared),
            seen: 0,
        }
    }

    /// Handle that can close the channel without owning the publisher
    pub(crate) fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes a channel from outside the producer thread
#[derive(Debug, Clone)]
pub(crate) struct ChannelCloser {
    shared: Arc<Shared>,
}

impl ChannelCloser {
    pub(crate) fn close(&self) {
        self.shared.slot.lock().closed = true;
        self.shared.updated.notify_all();
    }
}

/// Consumer side; clone freely, each clone tracks what it has seen
#[derive(Debug, Clone)]
pub struct SnapshotReceiver {
    shared: Arc<Shared>,
    seen: u64,
}

impl SnapshotReceiver {
    /// Most recent snapshot, seen or not
    pub fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.shared.slot.lock().latest.clone()
    }

    /// Most recent snapshot if this receiver has not seen it yet
    pub fn try_recv(&mut self) -> Option<Arc<TelemetrySnapshot>> {
        let slot = self.shared.slot.lock();
        take_unseen(&mut self.seen, &slot)
    }

    /// Block until an unseen snapshot arrives, the timeout passes or the
    /// channel closes
    ///
    /// A snapshot published before the close is still delivered. A timeout
    /// too large to represent as a deadline waits without one.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Arc<TelemetrySnapshot>, RecvError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(snapshot) = take_unseen(&mut self.seen, &slot) {
                return Ok(snapshot);
            }
            if slot.closed {
                return Err(RecvError::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.updated.wait_until(&mut slot, deadline).timed_out() {
                        return match take_unseen(&mut self.seen, &slot) {
                            Some(snapshot) => Ok(snapshot),
                            None if slot.closed => Err(RecvError::Closed),
                            None => Err(RecvError::Timeout),
                        };
                    }
                }
                None => self.shared.updated.wait(&mut slot),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slot.lock().closed
    }
}

fn take_unseen(seen: &mut u64, slot: &Slot) -> Option<Arc<TelemetrySnapshot>> {
    if slot.version == *seen {
        return None;
    }
    *seen = slot.version;
    slot.latest.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::telemetry::LinkStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::thread;

    fn snapshot(sequence: u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            sequence,
            captured_at: Instant::now(),
            published_at: Utc::now(),
            fields: BTreeMap::new(),
            link: LinkStatus::new(EngineState::Running, "test"),
        }
    }

    #[test]
    fn test_latest_value_wins() {
        let (publisher, mut receiver) = snapshot_channel();
        assert!(receiver.latest().is_none());
        assert!(publisher.publish(snapshot(1)));
        assert!(publisher.publish(snapshot(2)));

        assert_eq!(receiver.try_recv().unwrap().sequence, 2);
        assert!(receiver.try_recv().is_none());
        assert_eq!(receiver.latest().unwrap().sequence, 2);
    }

    #[test]
    fn test_receivers_track_independently() {
        let (publisher, mut first) = snapshot_channel();
        let mut second = first.clone();
        publisher.publish(snapshot(1));

        assert!(first.try_recv().is_some());
        assert!(second.try_recv().is_some());
        assert!(first.try_recv().is_none());

        let mut late = publisher.subscribe();
        assert_eq!(late.try_recv().unwrap().sequence, 1);
    }

    #[test]
    fn test_sequence_never_goes_backwards() {
        let (publisher, receiver) = snapshot_channel();
        assert!(publisher.publish(snapshot(5)));
        assert!(!publisher.publish(snapshot(5)));
        assert!(!publisher.publish(snapshot(3)));
        assert_eq!(receiver.latest().unwrap().sequence, 5);
    }

    #[test]
    fn test_recv_timeout_times_out() {
        let (_publisher, mut receiver) = snapshot_channel();
        let result = receiver.recv_timeout(Duration::from_millis(20));
        assert_eq!(result.unwrap_err(), RecvError::Timeout);
    }

    #[test]
    fn test_recv_timeout_wakes_on_publish() {
        let (publisher, mut receiver) = snapshot_channel();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish(snapshot(1));
            publisher
        });
        let received = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received.sequence, 1);
        let _publisher = producer.join().unwrap();
    }

    #[test]
    fn test_close_rejects_publish_and_wakes_receivers() {
        let (publisher, mut receiver) = snapshot_channel();
        publisher.publish(snapshot(1));
        publisher.close();

        assert!(!publisher.publish(snapshot(2)));
        // published before the close, still delivered
        assert_eq!(receiver.recv_timeout(Duration::from_millis(10)).unwrap().sequence, 1);
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap_err(),
            RecvError::Closed
        );
    }

    #[test]
    fn test_unbounded_wait_returns_on_close() {
        let (publisher, mut receiver) = snapshot_channel();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish(snapshot(1));
            thread::sleep(Duration::from_millis(20));
            drop(publisher);
        });
        assert_eq!(receiver.recv_timeout(Duration::MAX).unwrap().sequence, 1);
        assert_eq!(receiver.recv_timeout(Duration::MAX).unwrap_err(), RecvError::Closed);
        producer.join().unwrap();
    }

    #[test]
    fn test_dropping_publisher_closes() {
        let (publisher, receiver) = snapshot_channel();
        drop(publisher);
        assert!(receiver.is_closed());
    }
}
