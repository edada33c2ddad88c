use super::{MessageTag, Transport};
use crate::engine::error::CommError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

const DEFAULT_POLL: Duration = Duration::from_millis(20);
const NONE_LOST: usize = usize::MAX;

#[derive(Debug)]
struct Envelope {
    source: usize,
    tag: MessageTag,
    frame: Vec<u8>,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    lost: Vec<AtomicBool>,
    /// The rank whose endpoint went away first, or [`NONE_LOST`].
    first_lost: AtomicUsize,
    barrier: Mutex<BarrierState>,
    cond: Condvar,
}

impl Shared {
    fn first_lost(&self) -> Option<usize> {
        let rank = self.first_lost.load(Ordering::Acquire);
        (rank != NONE_LOST).then_some(rank)
    }

    fn mark_lost(&self, rank: usize) {
        self.lost[rank].store(true, Ordering::Release);
        let _ = self.first_lost.compare_exchange(
            NONE_LOST,
            rank,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Builder of an in-process fabric where each rank runs on its own thread.
pub struct ThreadedFabric;

impl ThreadedFabric {
    /// Creates `size` connected endpoints; endpoint `i` is rank `i`.
    pub fn endpoints(size: usize) -> Vec<ThreadedTransport> {
        Self::endpoints_with_poll(size, DEFAULT_POLL)
    }

    /// Like [`endpoints`](Self::endpoints), checking for lost peers every `poll`.
    pub fn endpoints_with_poll(size: usize, poll: Duration) -> Vec<ThreadedTransport> {
        let shared = Arc::new(Shared {
            size,
            lost: (0..size).map(|_| AtomicBool::new(false)).collect(),
            first_lost: AtomicUsize::new(NONE_LOST),
            barrier: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
        });
        let (senders, inboxes): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..size).map(|_| channel::unbounded()).unzip();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadedTransport {
                rank,
                senders: senders.clone(),
                inbox,
                stash: HashMap::new(),
                shared: Arc::clone(&shared),
                poll,
            })
            .collect()
    }
}

/// One rank's endpoint. Dropping it marks the rank as lost, so peers blocked on it fail
/// with [`CommError::RankLost`] instead of waiting forever.
#[derive(Debug)]
pub struct ThreadedTransport {
    rank: usize,
    senders: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: HashMap<(usize, MessageTag), VecDeque<Vec<u8>>>,
    shared: Arc<Shared>,
    poll: Duration,
}

impl ThreadedTransport {
    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.shared.size {
            return Err(CommError::UnknownRank {
                rank,
                size: self.shared.size,
            });
        }
        Ok(())
    }

    fn take_stashed(&mut self, source: usize, tag: MessageTag) -> Option<Vec<u8>> {
        self.stash
            .get_mut(&(source, tag))
            .and_then(VecDeque::pop_front)
    }

    fn stash_envelope(&mut self, envelope: Envelope) {
        self.stash
            .entry((envelope.source, envelope.tag))
            .or_default()
            .push_back(envelope.frame);
    }
}

impl Transport for ThreadedTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn post(&mut self, dest: usize, tag: MessageTag, frame: Vec<u8>) -> Result<(), CommError> {
        self.check_rank(dest)?;
        trace!(from = self.rank, to = dest, %tag, bytes = frame.len(), "post");
        self.senders[dest]
            .send(Envelope {
                source: self.rank,
                tag,
                frame,
            })
            .map_err(|_| CommError::RankLost { rank: dest })
    }

    fn receive(&mut self, source: usize, tag: MessageTag) -> Result<Vec<u8>, CommError> {
        self.check_rank(source)?;
        loop {
            if let Some(frame) = self.take_stashed(source, tag) {
                return Ok(frame);
            }
            match self.inbox.recv_timeout(self.poll) {
                Ok(envelope) => self.stash_envelope(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.shared.lost[source].load(Ordering::Acquire) {
                        continue;
                    }
                    // Frames posted before the peer went away are still deliverable.
                    while let Ok(envelope) = self.inbox.try_recv() {
                        self.stash_envelope(envelope);
                    }
                    return self
                        .take_stashed(source, tag)
                        .ok_or(CommError::RankLost { rank: source });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::RankLost { rank: source });
                }
            }
        }
    }

    fn barrier(&mut self) -> Result<(), CommError> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == shared.size {
            state.arrived = 0;
            state.generation += 1;
            shared.cond.notify_all();
            return Ok(());
        }

        loop {
            if let Some(rank) = shared.first_lost() {
                state.arrived -= 1;
                return Err(CommError::RankLost { rank });
            }
            shared.cond.wait_for(&mut state, self.poll);
            if state.generation != generation {
                return Ok(());
            }
        }
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!(rank = self.rank, "Rank endpoint dropped while unwinding");
        }
        self.shared.mark_lost(self.rank);
        let _guard = self.shared.barrier.lock();
        self.shared.cond.notify_all();
    }
}
