//! The preferred-base tree cache (component G's satellite structure):
//! given a base commit's tree and the set of paths that changed since
//! it, register every tree along the changed paths — and the final
//! entry at each path — as a preferred delta base.
//!
//! This mirrors `add_preferred_base`/`add_preferred_base_object` in
//! git's pack-objects builtin: descend the root tree one path component
//! at a time, registering the tree object at each level so the delta
//! search has a nearby, unchanged ancestor to diff large subtrees
//! against, without re-reading those trees from scratch for every
//! changed path that shares a prefix.
//!
//! The source keeps visited trees in a small cache (bounded by `window`)
//! with an undocumented neighbor-probe eviction scheme; here eviction is
//! a strict LRU over a fixed number of slots, the substitute the design
//! accepts (see the Open Questions in the design notes).

use std::collections::{HashSet, VecDeque};

use bstr::ByteSlice;
use cas_hash::ObjectId;
use cas_object::{ObjectType, Tree};

use crate::PackError;

use super::table::{CandidateTable, ObjectProvider};

/// Default bound on the number of distinct trees tracked by the cache.
pub const DEFAULT_MAX_SLOTS: usize = 256;

/// Tracks which tree OIDs have already been registered as preferred
/// bases, with LRU eviction once `max_slots` is reached. Eviction only
/// forgets local bookkeeping: a tree already added to the candidate
/// table stays there (git never un-wants an object once registered)
/// and is simply re-registered (a harmless no-op merge) if later work
/// revisits the same path.
pub struct PreferredBaseTreeCache {
    max_slots: usize,
    order: VecDeque<ObjectId>,
    registered: HashSet<ObjectId>,
}

impl PreferredBaseTreeCache {
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots: max_slots.max(1),
            order: VecDeque::new(),
            registered: HashSet::new(),
        }
    }

    /// Walk `base_tree_oid` along `changed_path`'s components, registering
    /// every directory entered and the final entry reached as preferred
    /// delta bases in `table`. No-op if the path isn't found in the tree
    /// (e.g. the path was newly added since the base).
    pub fn register_changed_path(
        &mut self,
        table: &mut CandidateTable,
        provider: &dyn ObjectProvider,
        base_tree_oid: ObjectId,
        changed_path: &[u8],
    ) -> Result<(), PackError> {
        self.note_tree(table, provider, base_tree_oid)?;
        self.walk(table, provider, base_tree_oid, changed_path, changed_path)
    }

    fn walk(
        &mut self,
        table: &mut CandidateTable,
        provider: &dyn ObjectProvider,
        tree_oid: ObjectId,
        remaining: &[u8],
        full_path: &[u8],
    ) -> Result<(), PackError> {
        let tree_bytes = provider.payload(&tree_oid)?;
        let tree = Tree::parse(&tree_bytes)?;

        let (component, rest) = split_first_component(remaining);

        for entry in tree.iter() {
            if entry.name.as_slice() != component {
                continue;
            }
            match rest {
                None => {
                    let kind = if entry.mode.is_tree() {
                        ObjectType::Tree
                    } else {
                        ObjectType::Blob
                    };
                    table.add_candidate(entry.oid, kind, 0, full_path, true);
                }
                Some(rest_path) => {
                    if entry.mode.is_tree() {
                        self.note_tree(table, provider, entry.oid)?;
                        self.walk(table, provider, entry.oid, rest_path, full_path)?;
                    }
                }
            }
            return Ok(());
        }
        Ok(())
    }

    fn note_tree(
        &mut self,
        table: &mut CandidateTable,
        provider: &dyn ObjectProvider,
        tree_oid: ObjectId,
    ) -> Result<(), PackError> {
        if self.registered.contains(&tree_oid) {
            self.touch(tree_oid);
            return Ok(());
        }
        if self.registered.len() >= self.max_slots {
            self.evict_one();
        }
        // Confirm the tree actually exists and learn its size, rather
        // than trusting the caller's OID blindly.
        let payload = provider.payload(&tree_oid)?;
        table.add_candidate(tree_oid, ObjectType::Tree, payload.len() as u64, b"", true);
        self.registered.insert(tree_oid);
        self.order.push_back(tree_oid);
        Ok(())
    }

    fn touch(&mut self, oid: ObjectId) {
        if let Some(pos) = self.order.iter().position(|o| *o == oid) {
            self.order.remove(pos);
            self.order.push_back(oid);
        }
    }

    fn evict_one(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.registered.remove(&oldest);
        }
    }
}

fn split_first_component(path: &[u8]) -> (&[u8], Option<&[u8]>) {
    match path.find_byte(b'/') {
        Some(pos) => (&path[..pos], Some(&path[pos + 1..])),
        None => (path, None),
    }
}
