//! Growable send/receive buffers for the communicator.
//!
//! Every exchange packs into and unpacks from a [`CommBuffer`] owned by the
//! [`BufferManager`] under a fixed [`BufferRole`]. Buffers grow by an amortized factor
//! instead of to the exact size, never shrink while the run is alive, and refuse to grow
//! past a hard cap: an exchange that would exceed it fails with
//! [`CommError::BufferOverflow`] rather than dropping data.

use super::config::{DEFAULT_BUFFER_HARD_CAP, DEFAULT_RESIZE_FACTOR, GhostField};
use super::error::CommError;
use crate::core::models::group::GroupKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use tracing::trace;

/// What a buffer is used for. Each role holds exactly one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    ParticleSend,
    ParticleRecv,
    GhostSend(GhostField),
    GhostRecv(GhostField),
    GroupSend(GroupKind),
    GroupRecv(GroupKind),
    RankUpdateSend,
    RankUpdateRecv,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::ParticleSend => write!(f, "particle send"),
            BufferRole::ParticleRecv => write!(f, "particle receive"),
            BufferRole::GhostSend(field) => write!(f, "ghost {} send", field),
            BufferRole::GhostRecv(field) => write!(f, "ghost {} receive", field),
            BufferRole::GroupSend(kind) => write!(f, "{} send", kind),
            BufferRole::GroupRecv(kind) => write!(f, "{} receive", kind),
            BufferRole::RankUpdateSend => write!(f, "rank update send"),
            BufferRole::RankUpdateRecv => write!(f, "rank update receive"),
        }
    }
}

/// A typed buffer with amortized growth and a hard element cap.
#[derive(Debug)]
pub struct CommBuffer<T> {
    role: BufferRole,
    data: Vec<T>,
    capacity: usize,
    resize_factor: f64,
    hard_cap: usize,
    resize_count: usize,
}

impl<T> CommBuffer<T> {
    pub fn new(role: BufferRole, resize_factor: f64, hard_cap: usize) -> Self {
        Self {
            role,
            data: Vec::new(),
            capacity: 0,
            resize_factor,
            hard_cap,
            resize_count: 0,
        }
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements the buffer can hold before the next resize.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of times the buffer has grown.
    pub fn resize_count(&self) -> usize {
        self.resize_count
    }

    /// Makes room for at least `required` elements in total.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::BufferOverflow`] if `required` exceeds the hard cap.
    pub fn reserve_total(&mut self, required: usize) -> Result<(), CommError> {
        if required <= self.capacity {
            return Ok(());
        }
        if required > self.hard_cap {
            return Err(CommError::BufferOverflow {
                role: self.role,
                requested: required,
                cap: self.hard_cap,
            });
        }
        let amortized = (self.capacity as f64 * self.resize_factor).ceil() as usize;
        let new_capacity = required
            .max(amortized)
            .max(self.capacity + 1)
            .min(self.hard_cap);
        self.data.reserve_exact(new_capacity - self.data.len());
        trace!(
            role = %self.role,
            from = self.capacity,
            to = new_capacity,
            "Resizing communication buffer."
        );
        self.capacity = new_capacity;
        self.resize_count += 1;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> Result<(), CommError> {
        self.reserve_total(self.data.len() + 1)?;
        self.data.push(value);
        Ok(())
    }

    pub fn extend<I>(&mut self, values: I) -> Result<(), CommError>
    where
        I: IntoIterator<Item = T>,
    {
        for v in values {
            self.push(v)?;
        }
        Ok(())
    }

    /// Empties the buffer while keeping its capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Serialize> CommBuffer<T> {
    /// Encodes `range` of the buffer as one wire frame.
    pub fn encode_range(&self, range: Range<usize>) -> Result<Vec<u8>, CommError> {
        Ok(bincode::serialize(&self.data[range])?)
    }
}

impl<T: DeserializeOwned> CommBuffer<T> {
    /// Decodes a frame and appends its elements, returning the index range they occupy.
    ///
    /// The element count in the frame header is checked against the hard cap before
    /// anything is decoded.
    pub fn decode_append(&mut self, frame: &[u8]) -> Result<Range<usize>, CommError> {
        let declared = frame_len(frame)?;
        let start = self.data.len();
        self.reserve_total(start + declared)?;
        let items: Vec<T> = bincode::deserialize(frame)?;
        self.data.extend(items);
        Ok(start..self.data.len())
    }
}

/// Element count from the `u64` little-endian length prefix of a bincode sequence.
fn frame_len(frame: &[u8]) -> Result<usize, CommError> {
    let header: [u8; 8] = frame
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            CommError::Codec(Box::new(bincode::ErrorKind::Custom(format!(
                "frame of {} bytes has no length header",
                frame.len()
            ))))
        })?;
    Ok(u64::from_le_bytes(header) as usize)
}

trait ErasedBuffer: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn as_any(&self) -> &dyn Any;
    fn resize_count(&self) -> usize;
    fn clear(&mut self);
}

impl<T: Send + 'static> ErasedBuffer for CommBuffer<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn resize_count(&self) -> usize {
        self.resize_count
    }
    fn clear(&mut self) {
        self.data.clear();
    }
}

/// Owns every communication buffer of one rank, keyed by role.
pub struct BufferManager {
    resize_factor: f64,
    hard_cap: usize,
    buffers: HashMap<BufferRole, Box<dyn ErasedBuffer>>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_RESIZE_FACTOR, DEFAULT_BUFFER_HARD_CAP)
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("resize_factor", &self.resize_factor)
            .field("hard_cap", &self.hard_cap)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl BufferManager {
    pub fn new(resize_factor: f64, hard_cap: usize) -> Self {
        Self {
            resize_factor,
            hard_cap,
            buffers: HashMap::new(),
        }
    }

    /// Returns the buffer for `role`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::BufferRoleMismatch`] if the role already holds a buffer of a
    /// different element type.
    pub fn buffer_mut<T: Send + 'static>(
        &mut self,
        role: BufferRole,
    ) -> Result<&mut CommBuffer<T>, CommError> {
        let (factor, cap) = (self.resize_factor, self.hard_cap);
        self.buffers
            .entry(role)
            .or_insert_with(|| {
                Box::new(CommBuffer::<T>::new(role, factor, cap)) as Box<dyn ErasedBuffer>
            })
            .as_any_mut()
            .downcast_mut::<CommBuffer<T>>()
            .ok_or(CommError::BufferRoleMismatch { role })
    }

    /// Returns the buffer for `role` if it has been created.
    pub fn buffer<T: Send + 'static>(
        &self,
        role: BufferRole,
    ) -> Result<Option<&CommBuffer<T>>, CommError> {
        match self.buffers.get(&role) {
            None => Ok(None),
            Some(b) => b
                .as_any()
                .downcast_ref::<CommBuffer<T>>()
                .map(Some)
                .ok_or(CommError::BufferRoleMismatch { role }),
        }
    }

    /// Empties the buffer of `role` (if any) while keeping its capacity.
    pub fn clear(&mut self, role: BufferRole) {
        if let Some(b) = self.buffers.get_mut(&role) {
            b.clear();
        }
    }

    /// Total resize events over all buffers.
    pub fn total_resizes(&self) -> usize {
        self.buffers.values().map(|b| b.resize_count()).sum()
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_amortized() {
        let mut small: CommBuffer<u32> =
            CommBuffer::new(BufferRole::ParticleSend, 1.125, 1 << 20);
        for i in 0..10_000 {
            small.push(i).unwrap();
        }
        let mut large: CommBuffer<u32> =
            CommBuffer::new(BufferRole::ParticleSend, 1.125, 1 << 20);
        for i in 0..100_000 {
            large.push(i).unwrap();
        }
        assert!(large.resize_count() < 100);
        // Ten times the elements adds only a constant number of resizes.
        assert!(large.resize_count() - small.resize_count() <= 25);
        assert!(large.capacity() >= 100_000);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf: CommBuffer<f64> = CommBuffer::new(BufferRole::ParticleRecv, 2.0, 64);
        buf.extend((0..10).map(f64::from)).unwrap();
        let cap = buf.capacity();
        let resizes = buf.resize_count();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
        buf.extend((0..10).map(f64::from)).unwrap();
        assert_eq!(buf.resize_count(), resizes);
    }

    #[test]
    fn exceeding_hard_cap_is_an_overflow() {
        let mut buf: CommBuffer<u8> = CommBuffer::new(BufferRole::ParticleSend, 1.5, 4);
        buf.extend([1, 2, 3, 4]).unwrap();
        let err = buf.push(5).unwrap_err();
        assert!(matches!(
            err,
            CommError::BufferOverflow {
                requested: 5,
                cap: 4,
                ..
            }
        ));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn decode_checks_cap_before_decoding() {
        let mut send: CommBuffer<u32> = CommBuffer::new(BufferRole::ParticleSend, 1.5, 100);
        send.extend(0..10).unwrap();
        let frame = send.encode_range(2..8).unwrap();

        let mut recv: CommBuffer<u32> = CommBuffer::new(BufferRole::ParticleRecv, 1.5, 100);
        let range = recv.decode_append(&frame).unwrap();
        assert_eq!(range, 0..6);
        assert_eq!(recv.as_slice(), &[2, 3, 4, 5, 6, 7]);

        let mut tiny: CommBuffer<u32> = CommBuffer::new(BufferRole::ParticleRecv, 1.5, 3);
        assert!(matches!(
            tiny.decode_append(&frame),
            Err(CommError::BufferOverflow { requested: 6, .. })
        ));
        assert!(tiny.is_empty());
    }

    #[test]
    fn role_type_mismatch_is_rejected() {
        let mut manager = BufferManager::default();
        manager
            .buffer_mut::<u32>(BufferRole::RankUpdateSend)
            .unwrap()
            .push(1)
            .unwrap();
        assert!(matches!(
            manager.buffer_mut::<f64>(BufferRole::RankUpdateSend),
            Err(CommError::BufferRoleMismatch {
                role: BufferRole::RankUpdateSend
            })
        ));
        assert_eq!(
            manager
                .buffer::<u32>(BufferRole::RankUpdateSend)
                .unwrap()
                .map(|b| b.len()),
            Some(1)
        );
        assert!(manager.buffer::<u32>(BufferRole::ParticleSend).unwrap().is_none());
    }

    #[test]
    fn manager_counts_resizes_across_roles() {
        let mut manager = BufferManager::new(2.0, 1024);
        manager
            .buffer_mut::<u8>(BufferRole::GhostSend(GhostField::Tag))
            .unwrap()
            .extend(0..4)
            .unwrap();
        manager
            .buffer_mut::<u8>(BufferRole::GhostRecv(GhostField::Tag))
            .unwrap()
            .push(0)
            .unwrap();
        assert_eq!(manager.num_buffers(), 2);
        // 0 -> 1 -> 2 -> 4 for the first buffer, 0 -> 1 for the second.
        assert_eq!(manager.total_resizes(), 4);
        manager.clear(BufferRole::GhostSend(GhostField::Tag));
        assert!(manager
            .buffer::<u8>(BufferRole::GhostSend(GhostField::Tag))
            .unwrap()
            .is_some_and(|b| b.is_empty()));
    }
}
