use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ethers::types::Address;
use futures_util::FutureExt;
use tracing::{debug, error, info_span, instrument, warn, Instrument};

use crate::boop::{Boop, TrackKey};
use crate::error::SubmitterError;
use crate::metrics::SubmitterMetrics;

use super::registry::{Admission, NonceTrackRegistry};
use super::track::{BufferedEntry, PendingBoop};
use super::{NonceRetriever, Processor};

struct QueueState<P: Processor> {
    registry: NonceTrackRegistry<P::Output>,
    processor: P,
    nonce_retriever: Arc<dyn NonceRetriever>,
    metrics: SubmitterMetrics,
}

/// Accepts boops into their nonce tracks and drives one drain loop per active track.
pub struct QueueManager<P: Processor> {
    state: Arc<QueueState<P>>,
}

impl<P: Processor> Clone for QueueManager<P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<P: Processor> Debug for QueueManager<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("buffer_limit", &self.state.registry.buffer_limit())
            .field("max_capacity", &self.state.registry.max_capacity())
            .field("total_size", &self.state.registry.total_size())
            .finish()
    }
}

impl<P: Processor> QueueManager<P> {
    pub fn new(
        processor: P,
        nonce_retriever: Arc<dyn NonceRetriever>,
        buffer_limit: usize,
        max_capacity: usize,
        metrics: SubmitterMetrics,
    ) -> Self {
        Self {
            state: Arc::new(QueueState {
                registry: NonceTrackRegistry::new(buffer_limit, max_capacity),
                processor,
                nonce_retriever,
                metrics,
            }),
        }
    }

    /// Admits a boop into its track.
    ///
    /// Admission errors are returned right away. Once admitted, the returned future
    /// resolves with the processor's output, or with the reason the boop left the
    /// queue without being processed.
    #[instrument(
        skip_all,
        name = "QueueManager::enqueue",
        fields(key = %boop.key(), nonce = boop.nonce_value)
    )]
    pub async fn enqueue(&self, boop: Boop) -> Result<PendingBoop<P::Output>, SubmitterError> {
        let key = boop.key();
        let (mut entry, pending) = BufferedEntry::new(boop);
        loop {
            if let Err(err) = self
                .state
                .registry
                .get_or_create(&entry.boop, &self.state.nonce_retriever)
                .await
            {
                warn!(?err, "Failed to fetch the onchain nonce");
                return Err(err.into());
            }

            match self.state.registry.admit(entry) {
                Admission::Admitted(admitted) => {
                    if admitted.evicted > 0 {
                        self.state
                            .metrics
                            .update_evicted_boops_metric(admitted.evicted);
                    }
                    if admitted.superseded {
                        self.state.metrics.update_superseded_boops_metric();
                    }
                    self.state.update_queue_metrics();
                    if admitted.start_drain {
                        debug!("Starting drain loop");
                        tokio::spawn(
                            drain(self.state.clone(), key)
                                .instrument(info_span!("drain", %key)),
                        );
                    }
                    return Ok(pending);
                }
                Admission::Rejected(err) => {
                    debug!(?err, "Boop rejected");
                    self.state.metrics.update_rejected_boops_metric(err.label());
                    self.state.update_queue_metrics();
                    return Err(err);
                }
                Admission::TrackMissing(returned) => {
                    debug!("Track dropped before admission, recreating it");
                    entry = returned;
                }
            }
        }
    }

    /// `enqueue`, then wait for the outcome.
    pub async fn enqueue_and_wait(&self, boop: Boop) -> Result<P::Output, SubmitterError> {
        self.enqueue(boop).await?.await
    }

    /// Active and queued boops of an account across its tracks.
    pub fn list_pending(&self, account: Address) -> Vec<Boop> {
        self.state.registry.list_pending(account)
    }

    pub fn total_size(&self) -> usize {
        self.state.registry.total_size()
    }

    pub fn processor(&self) -> &P {
        &self.state.processor
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &NonceTrackRegistry<P::Output> {
        &self.state.registry
    }
}

impl<P: Processor> QueueState<P> {
    fn update_queue_metrics(&self) {
        self.metrics
            .update_queue_metrics(self.registry.total_size(), self.registry.track_count());
    }

    /// Catches up with nonces consumed outside this process before the first boop
    /// of a drain run. A failed lookup keeps the local view.
    async fn resync_nonce(&self, key: &TrackKey) {
        let Some(boop) = self.registry.peek_next(key) else {
            return;
        };
        match self.nonce_retriever.fetch_nonce(&boop).await {
            Ok(onchain_nonce) => {
                let rejected = self.registry.resync(key, onchain_nonce);
                if rejected > 0 {
                    self.update_queue_metrics();
                }
            }
            Err(err) => warn!(?err, "Failed to resync nonce, keeping local value"),
        }
    }
}

/// Feeds a track's boops to the processor in nonce order until it runs dry or hits a gap.
async fn drain<P: Processor>(state: Arc<QueueState<P>>, key: TrackKey) {
    state.resync_nonce(&key).await;

    while let Some(entry) = state.registry.take_next_ready(&key) {
        let result = AssertUnwindSafe(state.processor.process(entry.boop.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(nonce = entry.boop.nonce_value, "Processor panicked");
                Err(SubmitterError::ProcessorPanicked)
            });

        let label = match &result {
            Ok(output) => P::outcome_label(output),
            Err(err) => err.label(),
        };
        state.metrics.update_processed_boops_metric(label);
        state.registry.complete_active(&key, entry, result);
        state.update_queue_metrics();
    }
    debug!("Drain loop finished");
    state.update_queue_metrics();
}
