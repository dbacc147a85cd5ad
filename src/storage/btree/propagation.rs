//! What one level of a mutation tells the level above it.

use crate::types::PageId;

/// How a separator key in an ancestor is rewritten.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum KeyReplace {
    /// Overwrite with the propagated key.
    #[default]
    Replace,
    /// The subtree left of the key lost its rightmost node: pull up the
    /// rightmost key of that subtree instead.
    Bubble,
}

/// Which child pointer of the parent a new successor replaces.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ChildUpdate {
    /// The left sibling of the node being changed.
    Left,
    /// The node itself.
    Mid,
    /// The right sibling of the node being changed.
    Right,
}

/// Side channel filled while a mutation unwinds towards the root. Cleared
/// at the start of every operation.
#[derive(Debug, Default)]
pub(crate) struct StructurePropagation {
    pub has_left_child_update: bool,
    pub has_mid_child_update: bool,
    pub has_right_child_update: bool,
    pub has_right_key_insert: bool,
    pub has_left_key_replace: bool,
    pub has_right_key_replace: bool,
    pub left_child: PageId,
    pub mid_child: PageId,
    pub right_child: PageId,
    pub left_key: Vec<u8>,
    pub right_key: Vec<u8>,
    pub key_replace: KeyReplace,
}

impl StructurePropagation {
    pub fn clear(&mut self) {
        self.has_left_child_update = false;
        self.has_mid_child_update = false;
        self.has_right_child_update = false;
        self.has_right_key_insert = false;
        self.has_left_key_replace = false;
        self.has_right_key_replace = false;
        self.left_key.clear();
        self.right_key.clear();
        self.key_replace = KeyReplace::Replace;
    }

    pub fn any(&self) -> bool {
        self.has_left_child_update
            || self.has_mid_child_update
            || self.has_right_child_update
            || self.has_right_key_insert
            || self.has_left_key_replace
            || self.has_right_key_replace
    }

    pub fn child_update(&mut self, which: ChildUpdate, id: PageId) {
        match which {
            ChildUpdate::Left => {
                self.has_left_child_update = true;
                self.left_child = id;
            }
            ChildUpdate::Mid => {
                self.has_mid_child_update = true;
                self.mid_child = id;
            }
            ChildUpdate::Right => {
                self.has_right_child_update = true;
                self.right_child = id;
            }
        }
    }
}
