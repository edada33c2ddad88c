use slotmap::new_key_type;

/// Global particle or group tag, unique and stable for a whole run.
pub type Tag = u32;

/// Reverse-lookup sentinel for a tag that has no copy on this rank.
pub const NOT_LOCAL: u32 = u32::MAX;

new_key_type! {
    pub struct GroupKey;
}
