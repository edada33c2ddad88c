//! # Transport Module
//!
//! Point-to-point byte-frame messaging between ranks, the only thing the communicator
//! needs from the outside world.
//!
//! ## Overview
//!
//! - [`Transport`] - Rank identity, non-blocking `post`, blocking matched `receive` and a
//!   stage `barrier`
//! - [`Reducer`] - Cross-rank sums, implemented for every transport
//! - [`loopback`] - A single rank talking to itself
//! - [`threaded`] - One endpoint per worker thread on a shared in-process fabric
//!
//! Frames are matched by source rank and [`MessageTag`]. Frames with the same source and
//! tag are delivered in the order they were posted.

pub mod loopback;
pub mod threaded;

pub use loopback::LoopbackTransport;
pub use threaded::{ThreadedFabric, ThreadedTransport};

use super::config::GhostField;
use super::error::CommError;
use crate::core::models::group::GroupKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Migrate,
    MigrateGroups(GroupKind),
    GroupRanks(GroupKind),
    Ghost(GhostField),
    Reduce,
}

/// Matching key of a frame: channel, communication stage and link slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTag {
    pub channel: Channel,
    pub stage: u8,
    /// Neighborhood index of the offset the frame travels along, as seen by the sender.
    pub slot: u8,
}

impl MessageTag {
    pub const fn new(channel: Channel, stage: u8, slot: u8) -> Self {
        Self {
            channel,
            stage,
            slot,
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/stage {}/slot {}",
            self.channel, self.stage, self.slot
        )
    }
}

pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Queues `frame` for `dest` without waiting for it to be received.
    fn post(&mut self, dest: usize, tag: MessageTag, frame: Vec<u8>) -> Result<(), CommError>;

    /// Blocks until the next frame from `source` with `tag` is available.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::RankLost`] when `source` disappears before sending it.
    fn receive(&mut self, source: usize, tag: MessageTag) -> Result<Vec<u8>, CommError>;

    /// Returns once every rank has entered the barrier.
    fn barrier(&mut self) -> Result<(), CommError>;
}

/// Element-wise sums over all ranks.
pub trait Reducer {
    /// Replaces `values` with their sum over all ranks. Every rank sees bit-identical
    /// results because contributions are added in rank order.
    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), CommError>;
}

const REDUCE_TAG: MessageTag = MessageTag::new(Channel::Reduce, 0, 0);

impl<T: Transport> Reducer for T {
    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), CommError> {
        let (me, size) = (self.rank(), self.size());
        if size == 1 {
            return Ok(());
        }
        let frame = bincode::serialize(&*values)?;
        for dest in (0..size).filter(|&r| r != me) {
            self.post(dest, REDUCE_TAG, frame.clone())?;
        }

        let mut total = vec![0.0; values.len()];
        for source in 0..size {
            let contribution: Vec<f64> = if source == me {
                values.to_vec()
            } else {
                bincode::deserialize(&self.receive(source, REDUCE_TAG)?)?
            };
            if contribution.len() != values.len() {
                return Err(CommError::ReductionLength {
                    expected: values.len(),
                    found: contribution.len(),
                });
            }
            for (t, c) in total.iter_mut().zip(contribution) {
                *t += c;
            }
        }
        values.copy_from_slice(&total);
        Ok(())
    }
}
