use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::*;
use crate::boop::test_utils::sponsored_boop;
use crate::boop::TrackKey;
use crate::chain::{ChainCommunicationError, ChainResult};
use crate::metrics::SubmitterMetrics;

#[derive(Default)]
struct RecordingProcessor {
    /// Every processed boop, in the order processing started
    started: Mutex<Vec<Boop>>,
    in_flight: Mutex<HashSet<TrackKey>>,
    overlaps: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    /// Each call consumes one permit when set
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
    panic_on_nonce: Option<u64>,
}

impl RecordingProcessor {
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Self {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        (processor, gate)
    }

    fn started_nonces(&self, account: Address) -> Vec<u64> {
        self.started
            .lock()
            .iter()
            .filter(|boop| boop.account == account)
            .map(|boop| boop.nonce_value)
            .collect()
    }
}

#[allow(clippy::panic)]
#[async_trait]
impl Processor for RecordingProcessor {
    type Output = u64;

    async fn process(&self, boop: Boop) -> Result<u64, SubmitterError> {
        let key = boop.key();
        if !self.in_flight.lock().insert(key) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.started.lock().push(boop.clone());

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_nonce == Some(boop.nonce_value) {
            panic!("processor blew up on nonce {}", boop.nonce_value);
        }

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.lock().remove(&key);
        Ok(boop.nonce_value)
    }
}

#[derive(Default)]
struct MockNonceRetriever {
    nonce: AtomicU64,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockNonceRetriever {
    fn at(nonce: u64) -> Arc<Self> {
        Arc::new(Self {
            nonce: AtomicU64::new(nonce),
            ..Default::default()
        })
    }
}

#[async_trait]
impl NonceRetriever for MockNonceRetriever {
    async fn fetch_nonce(&self, _boop: &Boop) -> ChainResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChainCommunicationError::Transport("node down".into()));
        }
        Ok(self.nonce.load(Ordering::SeqCst))
    }
}

fn manager<P: Processor>(
    processor: P,
    retriever: Arc<MockNonceRetriever>,
    buffer_limit: usize,
    max_capacity: usize,
) -> QueueManager<P> {
    QueueManager::new(
        processor,
        retriever,
        buffer_limit,
        max_capacity,
        SubmitterMetrics::dummy_instance(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(condition(), "condition not reached in time");
}

fn assert_size_consistent<P: Processor>(manager: &QueueManager<P>) {
    assert_eq!(manager.total_size(), manager.registry().recount());
}

#[tokio::test]
async fn test_processes_track_in_nonce_order() {
    let account = Address::repeat_byte(1);
    let manager = manager(RecordingProcessor::default(), MockNonceRetriever::at(0), 10, 100);

    let mut pending = Vec::new();
    for nonce in [3, 1, 0, 4, 2] {
        pending.push(
            manager
                .enqueue(sponsored_boop(account, 0, nonce))
                .await
                .unwrap(),
        );
    }
    for fut in pending {
        fut.await.unwrap();
    }

    let processor = manager.processor();
    assert_eq!(processor.started_nonces(account), vec![0, 1, 2, 3, 4]);
    assert_eq!(processor.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(manager.total_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tracks_progress_independently() {
    let processor = RecordingProcessor {
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let manager = manager(processor, MockNonceRetriever::at(0), 10, 100);
    let (a, b) = (Address::repeat_byte(1), Address::repeat_byte(2));

    // a second track of the same account is independent too
    let boops = (0..3).flat_map(|nonce| {
        [
            sponsored_boop(a, 0, nonce),
            sponsored_boop(a, 1, nonce),
            sponsored_boop(b, 0, nonce),
        ]
    });
    let mut pending = Vec::new();
    for boop in boops {
        pending.push(manager.enqueue(boop).await.unwrap());
    }
    for fut in pending {
        fut.await.unwrap();
    }

    let processor = manager.processor();
    assert_eq!(processor.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(processor.max_concurrent.load(Ordering::SeqCst), 3);
    assert_eq!(processor.started_nonces(b), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_stalled_track_does_not_block_others() {
    let manager = manager(RecordingProcessor::default(), MockNonceRetriever::at(0), 10, 100);
    let (a, b) = (Address::repeat_byte(1), Address::repeat_byte(2));

    let stalled = manager.enqueue(sponsored_boop(a, 0, 1)).await.unwrap();
    let result = manager.enqueue_and_wait(sponsored_boop(b, 0, 0)).await;

    assert_eq!(result.unwrap(), 0);
    assert!(manager.processor().started_nonces(a).is_empty());
    assert_eq!(manager.list_pending(a), vec![sponsored_boop(a, 0, 1)]);
    drop(stalled);
}

#[tokio::test]
async fn test_buffer_limit_rejects_then_frees_up() {
    let (processor, gate) = RecordingProcessor::gated();
    let manager = manager(processor, MockNonceRetriever::at(0), 4, 100);
    let account = Address::repeat_byte(1);

    let mut pending = Vec::new();
    for nonce in 0..4 {
        pending.push(
            manager
                .enqueue(sponsored_boop(account, 0, nonce))
                .await
                .unwrap(),
        );
    }
    let err = manager
        .enqueue(sponsored_boop(account, 0, 4))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitterError::BufferExceeded { limit: 4, .. }));
    assert_eq!(manager.total_size(), 4);

    gate.add_permits(1);
    let first = pending.remove(0);
    assert_eq!(first.await.unwrap(), 0);

    let fifth = manager.enqueue(sponsored_boop(account, 0, 4)).await.unwrap();
    assert_size_consistent(&manager);

    gate.add_permits(4);
    for (nonce, fut) in (1..).zip(pending) {
        assert_eq!(fut.await.unwrap(), nonce);
    }
    assert_eq!(fifth.await.unwrap(), 4);
}

#[tokio::test]
async fn test_capacity_evicts_most_loaded_track() {
    let (processor, gate) = RecordingProcessor::gated();
    let manager = manager(processor, MockNonceRetriever::at(0), 10, 4);
    let (a, b) = (Address::repeat_byte(1), Address::repeat_byte(2));

    let mut pending = Vec::new();
    for nonce in 0..4 {
        pending.push(manager.enqueue(sponsored_boop(a, 0, nonce)).await.unwrap());
    }
    wait_until(|| manager.processor().started_nonces(a) == vec![0]).await;

    let admitted = manager.enqueue(sponsored_boop(b, 0, 0)).await.unwrap();
    assert_eq!(manager.total_size(), 2);
    assert_size_consistent(&manager);

    let active = pending.remove(0);
    for evicted in pending {
        assert!(matches!(evicted.await, Err(SubmitterError::CapacityEvicted)));
    }

    gate.add_permits(2);
    assert_eq!(active.await.unwrap(), 0);
    assert_eq!(admitted.await.unwrap(), 0);
}

#[tokio::test]
async fn test_capacity_exceeded_when_nothing_is_evictable() {
    let (processor, gate) = RecordingProcessor::gated();
    let manager = manager(processor, MockNonceRetriever::at(0), 10, 1);
    let (a, b) = (Address::repeat_byte(1), Address::repeat_byte(2));

    let active = manager.enqueue(sponsored_boop(a, 0, 0)).await.unwrap();
    wait_until(|| !manager.processor().started_nonces(a).is_empty()).await;

    let err = manager.enqueue(sponsored_boop(b, 0, 0)).await.unwrap_err();
    assert!(matches!(err, SubmitterError::CapacityExceeded));

    gate.add_permits(1);
    assert_eq!(active.await.unwrap(), 0);
    assert_eq!(manager.total_size(), 0);
}

#[tokio::test]
async fn test_nonce_bounds() {
    let manager = manager(RecordingProcessor::default(), MockNonceRetriever::at(5), 4, 100);
    let account = Address::repeat_byte(1);

    let err = manager
        .enqueue(sponsored_boop(account, 0, 100))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitterError::NonceOutOfRange {
            nonce: 100,
            next_nonce: 5,
            limit: 4
        }
    ));

    let err = manager
        .enqueue(sponsored_boop(account, 0, 3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitterError::NonceTooLow {
            nonce: 3,
            next_nonce: 5
        }
    ));

    // the furthest admissible nonce sits exactly buffer_limit ahead
    let furthest = manager.enqueue(sponsored_boop(account, 0, 9)).await;
    assert!(furthest.is_ok());
}

#[tokio::test]
async fn test_same_nonce_supersedes_queued_boop() {
    let (processor, gate) = RecordingProcessor::gated();
    let manager = manager(processor, MockNonceRetriever::at(0), 10, 100);
    let account = Address::repeat_byte(1);

    let first = manager.enqueue(sponsored_boop(account, 0, 0)).await.unwrap();
    let original = manager.enqueue(sponsored_boop(account, 0, 1)).await.unwrap();
    let replacement_boop = Boop {
        call_data: Bytes::from(vec![0x01]),
        ..sponsored_boop(account, 0, 1)
    };
    let replacement = manager.enqueue(replacement_boop.clone()).await.unwrap();

    assert!(matches!(original.await, Err(SubmitterError::Superseded)));
    assert_eq!(manager.total_size(), 2);

    gate.add_permits(2);
    first.await.unwrap();
    replacement.await.unwrap();
    let started = manager.processor().started.lock().clone();
    assert_eq!(started.last(), Some(&replacement_boop));
}

#[tokio::test]
async fn test_gap_resumes_when_filled() {
    let manager = manager(RecordingProcessor::default(), MockNonceRetriever::at(0), 10, 100);
    let account = Address::repeat_byte(1);

    let zero = manager.enqueue(sponsored_boop(account, 0, 0)).await.unwrap();
    let two = manager.enqueue(sponsored_boop(account, 0, 2)).await.unwrap();
    assert_eq!(zero.await.unwrap(), 0);

    // 2 waits behind the gap
    wait_until(|| manager.list_pending(account) == vec![sponsored_boop(account, 0, 2)]).await;
    assert_eq!(manager.total_size(), 1);

    let one = manager.enqueue(sponsored_boop(account, 0, 1)).await.unwrap();
    assert_eq!(one.await.unwrap(), 1);
    assert_eq!(two.await.unwrap(), 2);
    assert_eq!(
        manager.processor().started_nonces(account),
        vec![0, 1, 2]
    );
}

#[tokio::test]
async fn test_concurrent_enqueues_share_one_nonce_fetch() {
    let gate = Arc::new(Semaphore::new(0));
    let retriever = Arc::new(MockNonceRetriever {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let manager = manager(RecordingProcessor::default(), retriever.clone(), 10, 100);
    let account = Address::repeat_byte(1);

    let handles: Vec<_> = (0..5)
        .map(|nonce| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.enqueue_and_wait(sponsored_boop(account, 0, nonce)).await })
        })
        .collect();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);

    gate.add_permits(1);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(
        manager.processor().started_nonces(account),
        vec![0, 1, 2, 3, 4]
    );
}

#[tokio::test]
async fn test_drain_resyncs_with_chain_nonce() {
    let retriever = MockNonceRetriever::at(0);
    let manager = manager(RecordingProcessor::default(), retriever.clone(), 10, 100);
    let account = Address::repeat_byte(1);

    let mut pending = Vec::new();
    for nonce in 0..4 {
        pending.push(manager.enqueue(sponsored_boop(account, 0, nonce)).await.unwrap());
    }
    // nonces 0 and 1 were used by another submitter meanwhile
    retriever.nonce.store(2, Ordering::SeqCst);

    let results: Vec<_> = futures_util::future::join_all(pending).await;
    assert!(matches!(results[0], Err(SubmitterError::NonceTooLow { nonce: 0, next_nonce: 2 })));
    assert!(matches!(results[1], Err(SubmitterError::NonceTooLow { nonce: 1, next_nonce: 2 })));
    assert_eq!(results[2].as_ref().unwrap(), &2);
    assert_eq!(results[3].as_ref().unwrap(), &3);
    assert_eq!(manager.total_size(), 0);
}

#[tokio::test]
async fn test_failed_resync_keeps_local_nonce() {
    let retriever = MockNonceRetriever::at(0);
    let manager = manager(RecordingProcessor::default(), retriever.clone(), 10, 100);
    let account = Address::repeat_byte(1);

    let pending = manager.enqueue(sponsored_boop(account, 0, 0)).await.unwrap();
    retriever.fail.store(true, Ordering::SeqCst);
    assert_eq!(pending.await.unwrap(), 0);
}

#[tokio::test]
async fn test_processor_panic_is_contained() {
    let processor = RecordingProcessor {
        panic_on_nonce: Some(0),
        ..Default::default()
    };
    let manager = manager(processor, MockNonceRetriever::at(0), 10, 100);
    let account = Address::repeat_byte(1);

    let zero = manager.enqueue(sponsored_boop(account, 0, 0)).await.unwrap();
    let one = manager.enqueue(sponsored_boop(account, 0, 1)).await.unwrap();

    assert!(matches!(zero.await, Err(SubmitterError::ProcessorPanicked)));
    assert_eq!(one.await.unwrap(), 1);
    assert_eq!(manager.total_size(), 0);
}

#[tokio::test]
async fn test_nonce_fetch_failure_rejects_enqueue() {
    let retriever = MockNonceRetriever::at(0);
    retriever.fail.store(true, Ordering::SeqCst);
    let manager = manager(RecordingProcessor::default(), retriever, 10, 100);

    let err = manager
        .enqueue(sponsored_boop(Address::repeat_byte(1), 0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitterError::ChainCommunicationError(_)));
    assert_eq!(manager.total_size(), 0);
}

#[tokio::test]
async fn test_total_size_stays_consistent() {
    let (processor, gate) = RecordingProcessor::gated();
    let manager = manager(processor, MockNonceRetriever::at(0), 3, 5);
    let accounts: Vec<_> = (1..=3).map(Address::repeat_byte).collect();

    let mut pending = Vec::new();
    for nonce in 0..4 {
        for account in &accounts {
            if let Ok(fut) = manager.enqueue(sponsored_boop(*account, 0, nonce)).await {
                pending.push(fut);
            }
            assert_size_consistent(&manager);
            assert!(manager.total_size() <= 5);
        }
    }
    // resubmit a queued nonce
    if let Ok(fut) = manager.enqueue(sponsored_boop(accounts[2], 0, 1)).await {
        pending.push(fut);
    }
    assert_size_consistent(&manager);

    // some tracks stall behind evicted nonces, so only settle what can settle
    gate.add_permits(100);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_size_consistent(&manager);
    drop(pending);
}

#[tokio::test]
async fn test_list_pending_covers_all_tracks_of_account() {
    let (processor, gate) = RecordingProcessor::gated();
    let manager = manager(processor, MockNonceRetriever::at(0), 10, 100);
    let (a, b) = (Address::repeat_byte(1), Address::repeat_byte(2));

    let mut pending = Vec::new();
    for boop in [
        sponsored_boop(a, 0, 0),
        sponsored_boop(a, 0, 1),
        sponsored_boop(a, 7, 0),
        sponsored_boop(b, 0, 0),
    ] {
        pending.push(manager.enqueue(boop).await.unwrap());
    }

    let listed = manager.list_pending(a);
    assert_eq!(
        listed,
        vec![
            sponsored_boop(a, 0, 0),
            sponsored_boop(a, 0, 1),
            sponsored_boop(a, 7, 0)
        ]
    );
    assert!(manager.list_pending(Address::repeat_byte(3)).is_empty());

    gate.add_permits(4);
    futures_util::future::join_all(pending).await;
    assert!(manager.list_pending(a).is_empty());
}
