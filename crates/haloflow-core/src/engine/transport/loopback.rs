use super::{MessageTag, Transport};
use crate::engine::error::CommError;
use std::collections::{HashMap, VecDeque};

/// The transport of an undecomposed run: rank 0 of 1, where every frame a rank sends to
/// itself through a periodic boundary comes straight back.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    stash: HashMap<MessageTag, VecDeque<Vec<u8>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames posted but not yet received.
    pub fn pending(&self) -> usize {
        self.stash.values().map(VecDeque::len).sum()
    }
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn post(&mut self, dest: usize, tag: MessageTag, frame: Vec<u8>) -> Result<(), CommError> {
        if dest != 0 {
            return Err(CommError::UnknownRank {
                rank: dest,
                size: 1,
            });
        }
        self.stash.entry(tag).or_default().push_back(frame);
        Ok(())
    }

    fn receive(&mut self, source: usize, tag: MessageTag) -> Result<Vec<u8>, CommError> {
        if source != 0 {
            return Err(CommError::UnknownRank {
                rank: source,
                size: 1,
            });
        }
        // Nothing else can post, so an empty queue means the frame never comes.
        self.stash
            .get_mut(&tag)
            .and_then(VecDeque::pop_front)
            .ok_or(CommError::MissingFrame {
                source_rank: source,
                tag,
            })
    }

    fn barrier(&mut self) -> Result<(), CommError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::Channel;

    #[test]
    fn frames_come_back_in_post_order() {
        let mut t = LoopbackTransport::new();
        let tag = MessageTag::new(Channel::Migrate, 0, 4);
        t.post(0, tag, vec![1]).unwrap();
        t.post(0, tag, vec![2, 2]).unwrap();
        assert_eq!(t.pending(), 2);
        assert_eq!(t.receive(0, tag).unwrap(), vec![1]);
        assert_eq!(t.receive(0, tag).unwrap(), vec![2, 2]);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn receiving_an_unposted_frame_fails_instead_of_hanging() {
        let mut t = LoopbackTransport::new();
        let tag = MessageTag::new(Channel::Reduce, 1, 0);
        assert!(matches!(
            t.receive(0, tag),
            Err(CommError::MissingFrame { source_rank: 0, .. })
        ));
    }

    #[test]
    fn other_ranks_do_not_exist() {
        let mut t = LoopbackTransport::new();
        let tag = MessageTag::new(Channel::Migrate, 0, 0);
        assert!(matches!(
            t.post(1, tag, Vec::new()),
            Err(CommError::UnknownRank { rank: 1, size: 1 })
        ));
    }
}
