use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::Address;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use itertools::Itertools;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::boop::{Boop, TrackKey};
use crate::chain::ChainResult;
use crate::error::SubmitterError;

use super::track::{BufferedEntry, NonceTrack};
use super::NonceRetriever;

type SharedNonceFetch = Shared<BoxFuture<'static, ChainResult<u64>>>;

/// Outcome of offering an entry to the registry.
pub enum Admission<T> {
    Admitted(Admitted),
    Rejected(SubmitterError),
    /// The track was dropped between creation and admission. The entry is handed
    /// back so the caller can recreate the track.
    TrackMissing(BufferedEntry<T>),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// The track had no drain loop, and the caller must start one.
    pub start_drain: bool,
    /// An entry already held this nonce and was superseded.
    pub superseded: bool,
    /// Entries evicted from the most loaded track to make room.
    pub evicted: usize,
}

struct RegistryState<T> {
    tracks: HashMap<TrackKey, NonceTrack<T>>,
    /// Queued and active entries across all tracks
    total_size: usize,
    next_seq: u64,
}

/// All nonce tracks, their shared size accounting and the in-flight nonce lookups.
///
/// Every mutation happens under one lock, so admission, activation and completion are
/// atomic with respect to each other. No lock is held across an await point.
pub struct NonceTrackRegistry<T> {
    state: Mutex<RegistryState<T>>,
    nonce_fetches: Mutex<HashMap<TrackKey, SharedNonceFetch>>,
    buffer_limit: usize,
    max_capacity: usize,
}

impl<T> NonceTrackRegistry<T> {
    pub fn new(buffer_limit: usize, max_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                tracks: HashMap::new(),
                total_size: 0,
                next_seq: 0,
            }),
            nonce_fetches: Mutex::new(HashMap::new()),
            buffer_limit,
            max_capacity,
        }
    }

    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn total_size(&self) -> usize {
        self.state.lock().total_size
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    /// `next_nonce` of the track, if it is held in memory.
    pub fn next_nonce(&self, key: &TrackKey) -> Option<u64> {
        self.state.lock().tracks.get(key).map(|track| track.next_nonce)
    }

    /// Makes sure a track exists for the boop's key and returns its `next_nonce`.
    ///
    /// An existing track is reused whether or not it is running, so entries queued
    /// behind a gap are kept. Otherwise the onchain nonce is fetched, with concurrent
    /// callers for the same key sharing a single lookup.
    pub async fn get_or_create(
        &self,
        boop: &Boop,
        retriever: &Arc<dyn NonceRetriever>,
    ) -> ChainResult<u64> {
        let key = boop.key();
        if let Some(next_nonce) = self.next_nonce(&key) {
            return Ok(next_nonce);
        }

        let fetch = self.nonce_fetch(&key, boop, retriever);
        let result = fetch.clone().await;
        {
            let mut fetches = self.nonce_fetches.lock();
            if fetches.get(&key).is_some_and(|f| f.ptr_eq(&fetch)) {
                fetches.remove(&key);
            }
        }
        let fetched = result?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let seq = state.next_seq;
        state.next_seq = seq.saturating_add(1);
        let track = state.tracks.entry(key).or_insert_with(|| {
            debug!(%key, next_nonce = fetched, "Created nonce track");
            NonceTrack::new(fetched, seq)
        });
        Ok(track.next_nonce)
    }

    fn nonce_fetch(
        &self,
        key: &TrackKey,
        boop: &Boop,
        retriever: &Arc<dyn NonceRetriever>,
    ) -> SharedNonceFetch {
        let mut fetches = self.nonce_fetches.lock();
        fetches
            .entry(*key)
            .or_insert_with(|| {
                let retriever = retriever.clone();
                let boop = boop.clone();
                async move { retriever.fetch_nonce(&boop).await }
                    .boxed()
                    .shared()
            })
            .clone()
    }

    /// Admits an entry into its track.
    ///
    /// At capacity the most loaded track is pruned first. Then the nonce must be at or
    /// above the track's next open nonce and at most `buffer_limit` ahead of `next_nonce`,
    /// and the track must have room unless the entry replaces one with the same nonce.
    pub fn admit(&self, entry: BufferedEntry<T>) -> Admission<T> {
        let key = entry.boop.key();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let admission = self.admit_locked(state, key, entry);
        // a track created only for a rejected boop would otherwise linger empty
        if matches!(admission, Admission::Rejected(_))
            && state.tracks.get(&key).is_some_and(NonceTrack::is_prunable)
        {
            state.tracks.remove(&key);
        }
        admission
    }

    fn admit_locked(
        &self,
        state: &mut RegistryState<T>,
        key: TrackKey,
        entry: BufferedEntry<T>,
    ) -> Admission<T> {
        let mut evicted = 0;

        if state.total_size >= self.max_capacity {
            evicted = Self::prune_most_loaded_track_locked(state);
            if evicted == 0 {
                return Admission::Rejected(SubmitterError::CapacityExceeded);
            }
        }

        let Some(track) = state.tracks.get_mut(&key) else {
            return Admission::TrackMissing(entry);
        };

        let nonce = entry.boop.nonce_value;
        let lowest_open = track.lowest_open_nonce();
        if nonce < lowest_open {
            return Admission::Rejected(SubmitterError::NonceTooLow {
                nonce,
                next_nonce: lowest_open,
            });
        }
        let highest = track
            .next_nonce
            .saturating_add(u64::try_from(self.buffer_limit).unwrap_or(u64::MAX));
        if nonce > highest {
            return Admission::Rejected(SubmitterError::NonceOutOfRange {
                nonce,
                next_nonce: track.next_nonce,
                limit: self.buffer_limit,
            });
        }

        let superseded = match track.queue.remove(&nonce) {
            Some(previous) => {
                debug!(%key, nonce, "Superseding queued boop");
                previous.reject(SubmitterError::Superseded);
                true
            }
            None if track.size() >= self.buffer_limit => {
                return Admission::Rejected(SubmitterError::BufferExceeded {
                    key,
                    limit: self.buffer_limit,
                });
            }
            None => false,
        };
        track.queue.insert(nonce, entry);

        let start_drain = !track.running;
        track.running = true;
        if !superseded {
            state.total_size = state.total_size.saturating_add(1);
        }

        Admission::Admitted(Admitted {
            start_drain,
            superseded,
            evicted,
        })
    }

    /// Evicts the queued entries of the track holding the most entries and returns how
    /// many were evicted. The active entry, if any, is left alone.
    pub fn prune_most_loaded_track(&self) -> usize {
        Self::prune_most_loaded_track_locked(&mut self.state.lock())
    }

    fn prune_most_loaded_track_locked(state: &mut RegistryState<T>) -> usize {
        // Largest first. On a tie, prefer a track with something to evict, then the oldest.
        let Some(key) = state
            .tracks
            .iter()
            .max_by_key(|(_, track)| {
                (
                    track.size(),
                    !track.queue.is_empty(),
                    std::cmp::Reverse(track.seq),
                )
            })
            .map(|(key, _)| *key)
        else {
            return 0;
        };
        let Some(track) = state.tracks.get_mut(&key) else {
            return 0;
        };

        let evicted = std::mem::take(&mut track.queue);
        let count = evicted.len();
        for entry in evicted.into_values() {
            entry.reject(SubmitterError::CapacityEvicted);
        }
        let prunable = track.is_prunable();
        if prunable {
            state.tracks.remove(&key);
        }
        state.total_size = state.total_size.saturating_sub(count);
        info!(%key, evicted = count, "Pruned most loaded nonce track");
        count
    }

    /// The lowest queued boop of a track, if any.
    pub fn peek_next(&self, key: &TrackKey) -> Option<Boop> {
        let state = self.state.lock();
        let track = state.tracks.get(key)?;
        track.queue.values().next().map(|entry| entry.boop.clone())
    }

    /// Moves the entry at `next_nonce` into the active slot and hands it to the drain loop.
    ///
    /// Returns `None` when nothing is ready, in which case the track stops running and
    /// is dropped if it holds nothing at all. Both happen under the registry lock, so an
    /// entry admitted right after this sees a stopped track and starts a new loop.
    pub fn take_next_ready(&self, key: &TrackKey) -> Option<BufferedEntry<T>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let track = state.tracks.get_mut(key)?;
        if track.active.is_some() {
            warn!(%key, "Drain loop asked for the next boop while one is still active");
            return None;
        }
        if let Some(entry) = track.queue.remove(&track.next_nonce) {
            track.active = Some(entry.boop.clone());
            return Some(entry);
        }

        track.running = false;
        if track.is_prunable() {
            state.tracks.remove(key);
            debug!(%key, "Dropped idle nonce track");
        } else {
            debug!(
                %key,
                next_nonce = track.next_nonce,
                queued = track.queue.len(),
                "Nonce track stalled on a gap"
            );
        }
        None
    }

    /// Delivers the outcome of the active entry, then clears it and advances `next_nonce`.
    ///
    /// The outcome is sent under the registry lock, so a caller reacting to it already
    /// observes the freed slot.
    pub fn complete_active(
        &self,
        key: &TrackKey,
        entry: BufferedEntry<T>,
        result: Result<T, SubmitterError>,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        entry.settle(result);
        let Some(track) = state.tracks.get_mut(key) else {
            warn!(%key, "Completed a boop for a track that no longer exists");
            return;
        };
        if track.active.take().is_none() {
            warn!(%key, "Completed a boop on a track with no active boop");
            return;
        }
        track.next_nonce = track.next_nonce.saturating_add(1);
        state.total_size = state.total_size.saturating_sub(1);
    }

    /// Moves `next_nonce` up to the onchain value and rejects queued entries it overtook.
    /// Only applies while nothing is active. Returns how many entries were rejected.
    pub fn resync(&self, key: &TrackKey, onchain_nonce: u64) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(track) = state.tracks.get_mut(key) else {
            return 0;
        };
        if track.active.is_some() || onchain_nonce <= track.next_nonce {
            return 0;
        }

        let kept = track.queue.split_off(&onchain_nonce);
        let stale = std::mem::replace(&mut track.queue, kept);
        let count = stale.len();
        for (nonce, entry) in stale {
            entry.reject(SubmitterError::NonceTooLow {
                nonce,
                next_nonce: onchain_nonce,
            });
        }
        info!(
            %key,
            from = track.next_nonce,
            to = onchain_nonce,
            rejected = count,
            "Resynced nonce track with chain"
        );
        track.next_nonce = onchain_nonce;
        state.total_size = state.total_size.saturating_sub(count);
        count
    }

    /// Active and queued boops of an account, ordered by track then nonce.
    pub fn list_pending(&self, account: Address) -> Vec<Boop> {
        let state = self.state.lock();
        state
            .tracks
            .iter()
            .filter(|(key, _)| key.account == account)
            .sorted_by_key(|(key, _)| **key)
            .flat_map(|(_, track)| {
                track
                    .active
                    .iter()
                    .cloned()
                    .chain(track.queue.values().map(|entry| entry.boop.clone()))
            })
            .collect()
    }

    /// Sum of queued and active entries recomputed from the tracks.
    #[cfg(test)]
    pub(crate) fn recount(&self) -> usize {
        self.state
            .lock()
            .tracks
            .values()
            .map(|track| track.size())
            .sum()
    }
}
