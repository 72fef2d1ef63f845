use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::debug;

use crate::boop::{Boop, BoopHash};
use crate::error::SubmitterError;

/// A buffered boop and the channel its caller is waiting on.
pub struct BufferedEntry<T> {
    pub boop: Boop,
    responder: oneshot::Sender<Result<T, SubmitterError>>,
}

impl<T> BufferedEntry<T> {
    pub fn new(boop: Boop) -> (Self, PendingBoop<T>) {
        let (responder, receiver) = oneshot::channel();
        let pending = PendingBoop {
            boop_hash: boop.hash(),
            receiver,
        };
        (Self { boop, responder }, pending)
    }

    /// Delivers the outcome. Each entry settles exactly once since this consumes it.
    pub fn settle(self, result: Result<T, SubmitterError>) {
        if self.responder.send(result).is_err() {
            debug!(
                nonce = self.boop.nonce_value,
                key = %self.boop.key(),
                "Caller stopped waiting for boop"
            );
        }
    }

    pub fn reject(self, err: SubmitterError) {
        self.settle(Err(err))
    }
}

/// Resolves once the queue is done with a boop: with the processor's result,
/// or with the reason it was dropped from the queue.
#[must_use = "the boop keeps being processed, but its outcome is lost if this is dropped"]
pub struct PendingBoop<T> {
    boop_hash: BoopHash,
    receiver: oneshot::Receiver<Result<T, SubmitterError>>,
}

impl<T> std::fmt::Debug for PendingBoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBoop")
            .field("boop_hash", &self.boop_hash)
            .finish_non_exhaustive()
    }
}

impl<T> PendingBoop<T> {
    pub fn boop_hash(&self) -> BoopHash {
        self.boop_hash
    }
}

impl<T> Future for PendingBoop<T> {
    type Output = Result<T, SubmitterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(SubmitterError::ChannelClosed),
        })
    }
}

/// One ordered lane of work for an `(account, nonce_track)` pair.
pub struct NonceTrack<T> {
    /// Buffered entries by nonce. Never holds a nonce below `next_nonce`.
    pub(super) queue: BTreeMap<u64, BufferedEntry<T>>,
    /// The nonce expected to be processed next. Authoritative while `running`.
    pub(super) next_nonce: u64,
    /// The boop the processor is currently working on
    pub(super) active: Option<Boop>,
    /// Whether a drain loop owns this track
    pub(super) running: bool,
    /// Creation order, used to break ties when pruning
    pub(super) seq: u64,
}

impl<T> NonceTrack<T> {
    pub(super) fn new(next_nonce: u64, seq: u64) -> Self {
        Self {
            queue: BTreeMap::new(),
            next_nonce,
            active: None,
            running: false,
            seq,
        }
    }

    /// Queued and active entries
    pub fn size(&self) -> usize {
        self.queue
            .len()
            .saturating_add(usize::from(self.active.is_some()))
    }

    /// No queued or active entry and no drain loop, so the track can be dropped.
    pub(super) fn is_prunable(&self) -> bool {
        self.queue.is_empty() && self.active.is_none() && !self.running
    }

    /// Lowest nonce a new entry may take. The active entry's nonce is already spoken for.
    pub(super) fn lowest_open_nonce(&self) -> u64 {
        if self.active.is_some() {
            self.next_nonce.saturating_add(1)
        } else {
            self.next_nonce
        }
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Address;

    use super::*;
    use crate::boop::test_utils::sponsored_boop;

    #[tokio::test]
    async fn test_entry_settles_pending_future() {
        let boop = sponsored_boop(Address::repeat_byte(1), 0, 0);
        let (entry, pending) = BufferedEntry::<u64>::new(boop.clone());
        assert_eq!(pending.boop_hash(), boop.hash());

        entry.settle(Ok(7));
        assert_eq!(pending.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_entry_closes_pending_future() {
        let (entry, pending) =
            BufferedEntry::<u64>::new(sponsored_boop(Address::repeat_byte(1), 0, 0));
        drop(entry);
        assert!(matches!(pending.await, Err(SubmitterError::ChannelClosed)));
    }

    #[test]
    fn test_pending_boop_debug_without_debug_output() {
        struct Opaque;
        let boop = sponsored_boop(Address::repeat_byte(1), 0, 0);
        let (_entry, pending) = BufferedEntry::<Opaque>::new(boop.clone());
        let printed = format!("{pending:?}");
        assert!(printed.starts_with("PendingBoop"));
        assert!(printed.contains(&format!("{:?}", boop.hash())));
    }

    #[test]
    fn test_track_size_counts_active_entry() {
        let mut track = NonceTrack::<u64>::new(5, 0);
        assert_eq!(track.size(), 0);
        assert!(track.is_prunable());
        assert_eq!(track.lowest_open_nonce(), 5);

        track.active = Some(sponsored_boop(Address::repeat_byte(1), 0, 5));
        assert_eq!(track.size(), 1);
        assert!(!track.is_prunable());
        assert_eq!(track.lowest_open_nonce(), 6);
    }
}
