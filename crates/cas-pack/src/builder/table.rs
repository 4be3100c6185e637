//! The pack writer's candidate object table.
//!
//! Every object a caller wants packed (or offered only as a delta base)
//! becomes one [`CandidateEntry`] in an arena. Entries refer to each other
//! by `u32` index rather than by pointer, so the arena can grow (and
//! reallocate) without invalidating any entry's view of its relatives, and
//! so a parallel delta search (see [`crate::builder::search`]) can hand
//! disjoint index ranges to worker threads without sharing raw pointers.

use std::collections::HashMap;

use cas_hash::ObjectId;
use cas_object::ObjectType;

use crate::PackError;

/// Where an object's current on-disk representation lives, if it has one.
///
/// Populated by the caller before delta search runs, typically by
/// consulting the object database's open packs. `pack_id` is an opaque
/// handle the caller assigns; the builder never dereferences it itself,
/// only compares it for equality (e.g. to detect "already a delta from the
/// same source pack").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingLocation {
    pub pack_id: u32,
    pub offset: u64,
    /// Raw pack entry type number (1-4 base types, 6 ofs-delta, 7 ref-delta).
    pub on_disk_type: u8,
    pub header_len: u32,
    /// If the on-disk representation is itself a delta, the base's OID
    /// (ref-delta) or offset (ofs-delta, expressed as an absolute pack
    /// offset here for convenience).
    pub delta_base_oid: Option<ObjectId>,
    pub delta_base_offset: Option<u64>,
}

/// One object under consideration for the pack being built.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub oid: ObjectId,
    pub kind: ObjectType,
    pub size: u64,
    pub name_hash: u32,
    pub in_pack: Option<ExistingLocation>,
    /// Available as a delta base, but not itself emitted.
    pub preferred_base: bool,
    /// Index of the chosen delta base entry, if any.
    pub delta_base: Option<u32>,
    pub delta_size: Option<u64>,
    /// Cached compressed delta bytes, retained only if admitted by the
    /// delta-cache heuristic (see [`crate::builder::search`]).
    pub delta_data: Option<Vec<u8>>,
    pub no_try_delta: bool,
    /// Length of the delta chain ending at this entry (0 if not a delta).
    pub depth: u32,
}

impl CandidateEntry {
    fn new(oid: ObjectId, kind: ObjectType, size: u64, name_hash: u32, preferred_base: bool) -> Self {
        Self {
            oid,
            kind,
            size,
            name_hash,
            in_pack: None,
            preferred_base,
            delta_base: None,
            delta_size: None,
            delta_data: None,
            no_try_delta: false,
            depth: 0,
        }
    }
}

/// Computes git's path-derived sort hint: a 32-bit value in which the last
/// sixteen non-whitespace bytes of a path dominate, so files with a shared
/// suffix (e.g. the same extension) cluster together in the sort order the
/// delta search window walks.
pub fn name_hash(path: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &c in path {
        if c.is_ascii_whitespace() {
            continue;
        }
        hash = (hash >> 2).wrapping_add((c as u32) << 24);
    }
    hash
}

/// The arena of candidate entries plus the dedup index over their OIDs.
///
/// This is the object table of the pack writer (component G of the design).
/// It owns no I/O; callers populate it via [`CandidateTable::add_candidate`]
/// and [`CandidateTable::note_existing_location`], then hand it to
/// [`crate::builder::search::run_delta_search`] and finally
/// [`crate::builder::emit::emit_pack`].
#[derive(Default)]
pub struct CandidateTable {
    entries: Vec<CandidateEntry>,
    by_oid: HashMap<ObjectId, u32>,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate object. If `exclude` is true the object is made
    /// available only as a delta base (never emitted). Registering the same
    /// OID twice merges into the existing entry; an `exclude=true` call can
    /// flip an already-wanted entry to preferred-base-only is *not* done
    /// here (git itself never un-wants an object this way) — merging only
    /// ever promotes preferred_base from false to true when the new call
    /// asks for it and the object was not otherwise already wanted.
    pub fn add_candidate(
        &mut self,
        oid: ObjectId,
        kind: ObjectType,
        size: u64,
        path_hint: &[u8],
        exclude: bool,
    ) -> u32 {
        if let Some(&idx) = self.by_oid.get(&oid) {
            if exclude {
                self.entries[idx as usize].preferred_base = true;
            }
            return idx;
        }

        let entry = CandidateEntry::new(oid, kind, size, name_hash(path_hint), exclude);
        let idx = self.entries.len() as u32;
        self.entries.push(entry);
        self.by_oid.insert(oid, idx);
        idx
    }

    pub fn note_existing_location(&mut self, idx: u32, location: ExistingLocation) {
        self.entries[idx as usize].in_pack = Some(location);
    }

    pub fn set_no_try_delta(&mut self, idx: u32, no_try_delta: bool) {
        self.entries[idx as usize].no_try_delta = no_try_delta;
    }

    pub fn index_of(&self, oid: &ObjectId) -> Option<u32> {
        self.by_oid.get(oid).copied()
    }

    pub fn get(&self, idx: u32) -> &CandidateEntry {
        &self.entries[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut CandidateEntry {
        &mut self.entries[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &CandidateEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i as u32, e))
    }

    pub fn entries(&self) -> &[CandidateEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [CandidateEntry] {
        &mut self.entries
    }

    /// Chain length below `idx`, i.e. the tallest delta chain that already
    /// has `idx` as an ancestor base. Used to keep a reused base's
    /// effective depth budget from letting a new delta push some
    /// already-built child past `max_depth`.
    pub fn deepest_descendant_depth(&self, idx: u32) -> u32 {
        let mut max_depth = 0;
        for entry in &self.entries {
            if entry.delta_base == Some(idx) {
                max_depth = max_depth.max(entry.depth);
            }
        }
        max_depth
    }
}

/// Resolves object bytes and metadata for objects the candidate table
/// references but does not itself store. Implemented by the caller (an
/// object database) and passed into delta search and emission.
pub trait ObjectProvider {
    fn payload(&self, oid: &ObjectId) -> Result<Vec<u8>, PackError>;
}
