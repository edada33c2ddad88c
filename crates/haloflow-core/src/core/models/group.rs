use super::ids::{GroupKey, Tag};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum GroupError {
    #[error("A {kind} needs {expected} members, got {found}")]
    ArityMismatch {
        kind: GroupKind,
        expected: usize,
        found: usize,
    },

    #[error("{kind} tag {tag} is already registered")]
    DuplicateTag { kind: GroupKind, tag: Tag },
}

/// The four families of bonded interactions, distinguished by member count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKind {
    /// Pair interaction between two particles.
    Bond,
    /// Three-body angle term.
    Angle,
    /// Four-body proper torsion.
    Dihedral,
    /// Four-body improper torsion.
    Improper,
}

impl GroupKind {
    /// Every group kind, in the order the communicator processes them.
    pub const ALL: [GroupKind; 4] = [
        GroupKind::Bond,
        GroupKind::Angle,
        GroupKind::Dihedral,
        GroupKind::Improper,
    ];

    /// Returns the number of particles in a group of this kind.
    pub fn arity(self) -> usize {
        match self {
            GroupKind::Bond => 2,
            GroupKind::Angle => 3,
            GroupKind::Dihedral | GroupKind::Improper => 4,
        }
    }

    /// Returns a dense index in `0..4`, usable for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            GroupKind::Bond => 0,
            GroupKind::Angle => 1,
            GroupKind::Dihedral => 2,
            GroupKind::Improper => 3,
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupKind::Bond => "bond",
            GroupKind::Angle => "angle",
            GroupKind::Dihedral => "dihedral",
            GroupKind::Improper => "improper",
        };
        f.write_str(name)
    }
}

/// A bonded group as stored on a rank and exchanged between ranks.
///
/// `members` holds the particle tags in interaction order and `ranks` the rank believed
/// to own each member. The two vectors always have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Global group tag.
    pub tag: Tag,
    /// Interaction type index.
    pub type_id: u32,
    /// Member particle tags.
    pub members: SmallVec<[Tag; 4]>,
    /// Owning rank of each member.
    pub ranks: SmallVec<[u32; 4]>,
}

impl GroupRecord {
    /// Creates a group record whose members are all assumed to live on `rank`.
    pub fn new(tag: Tag, type_id: u32, members: &[Tag], rank: u32) -> Self {
        Self {
            tag,
            type_id,
            members: members.iter().copied().collect(),
            ranks: std::iter::repeat_n(rank, members.len()).collect(),
        }
    }

    /// Returns the member slot holding `particle`, if any.
    pub fn slot_of(&self, particle: Tag) -> Option<usize> {
        self.members.iter().position(|&m| m == particle)
    }

    /// Returns `true` when every member is owned by `rank`.
    pub fn is_complete_on(&self, rank: u32) -> bool {
        self.ranks.iter().all(|&r| r == rank)
    }
}

/// Local completeness of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStatus {
    /// All members are owned by this rank.
    #[default]
    Complete,
    /// At least one member is owned by another rank.
    NotLocal,
}

#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub record: GroupRecord,
    pub status: GroupStatus,
    /// Set when a member migrated since the last ownership refresh.
    pub dirty: bool,
}

/// All groups of one kind known to a rank.
///
/// A rank keeps a group for as long as it owns at least one of its members. Storage is a
/// slot map so that keys stay valid while other groups are inserted or dropped during
/// migration; `by_tag` maps the global group tag back to its key.
#[derive(Debug, Clone)]
pub struct GroupTable {
    kind: GroupKind,
    entries: SlotMap<GroupKey, GroupEntry>,
    by_tag: HashMap<Tag, GroupKey>,
}

impl GroupTable {
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            entries: SlotMap::with_key(),
            by_tag: HashMap::new(),
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a new group.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::ArityMismatch`] when the member count does not match the
    /// table's kind and [`GroupError::DuplicateTag`] when the tag is already present.
    pub fn insert(&mut self, record: GroupRecord) -> Result<GroupKey, GroupError> {
        let expected = self.kind.arity();
        if record.members.len() != expected || record.ranks.len() != expected {
            return Err(GroupError::ArityMismatch {
                kind: self.kind,
                expected,
                found: record.members.len(),
            });
        }
        if self.by_tag.contains_key(&record.tag) {
            return Err(GroupError::DuplicateTag {
                kind: self.kind,
                tag: record.tag,
            });
        }
        let tag = record.tag;
        let key = self.entries.insert(GroupEntry {
            record,
            status: GroupStatus::Complete,
            dirty: true,
        });
        self.by_tag.insert(tag, key);
        Ok(key)
    }

    pub fn get(&self, key: GroupKey) -> Option<&GroupEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: GroupKey) -> Option<&mut GroupEntry> {
        self.entries.get_mut(key)
    }

    pub fn key_of(&self, tag: Tag) -> Option<GroupKey> {
        self.by_tag.get(&tag).copied()
    }

    pub fn find(&self, tag: Tag) -> Option<&GroupEntry> {
        self.key_of(tag).and_then(|key| self.entries.get(key))
    }

    pub fn find_mut(&mut self, tag: Tag) -> Option<&mut GroupEntry> {
        let key = self.key_of(tag)?;
        self.entries.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupKey, &GroupEntry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (GroupKey, &mut GroupEntry)> {
        self.entries.iter_mut()
    }

    /// Keeps only the groups for which `keep` returns `true`. Returns the number removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&GroupEntry) -> bool,
    {
        let before = self.entries.len();
        let by_tag = &mut self.by_tag;
        self.entries.retain(|_, entry| {
            let kept = keep(entry);
            if !kept {
                by_tag.remove(&entry.record.tag);
            }
            kept
        });
        before - self.entries.len()
    }

    /// Recomputes [`GroupStatus`] of every group from its ownership vector.
    pub fn refresh_status(&mut self, rank: u32) {
        for entry in self.entries.values_mut() {
            entry.status = if entry.record.is_complete_on(rank) {
                GroupStatus::Complete
            } else {
                GroupStatus::NotLocal
            };
        }
    }

    pub fn count_not_local(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == GroupStatus::NotLocal)
            .count()
    }
}

/// The group tables of every kind held by one rank.
#[derive(Debug, Clone)]
pub struct BondedGroups {
    tables: [GroupTable; 4],
}

impl Default for BondedGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl BondedGroups {
    pub fn new() -> Self {
        Self {
            tables: GroupKind::ALL.map(GroupTable::new),
        }
    }

    pub fn table(&self, kind: GroupKind) -> &GroupTable {
        &self.tables[kind.index()]
    }

    pub fn table_mut(&mut self, kind: GroupKind) -> &mut GroupTable {
        &mut self.tables[kind.index()]
    }

    pub fn total(&self) -> usize {
        self.tables.iter().map(GroupTable::len).sum()
    }
}
