//! The pack writer (components G, H, I of the design): collect candidate
//! objects into an arena-indexed table, search for delta bases across a
//! type/size-sorted sliding window, and emit the result as one or more
//! pack files.
//!
//! ```text
//! CandidateTable  (this module's table::CandidateTable)
//!        │  add_candidate / note_existing_location
//!        ▼
//! preassign_existing_deltas   (reuse already-on-disk deltas, skip search)
//!        │
//!        ▼
//! run_delta_search            (search::run_delta_search)
//!        │
//!        ▼
//! emit_pack                   (emit::emit_pack)
//! ```

pub mod emit;
pub mod search;
pub mod table;
pub mod treecache;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use flate2::Compression;

use crate::PackError;

pub use emit::{EmitConfig, EmitDestination, EmitOutcome, ReuseSource, WrittenPack};
pub use search::{DeltaCacheAccounting, DeltaSearchConfig, SearchProgress};
pub use table::{CandidateTable, ExistingLocation, ObjectProvider};
pub use treecache::{PreferredBaseTreeCache, DEFAULT_MAX_SLOTS};

/// The full tunable surface of §6's options table, gathered into one
/// configuration value. `window`/`depth`/`threads` and the memory/cache
/// caps drive delta search; `compression`/`pack_size_limit`/
/// `allow_ofs_delta` drive emission.
#[derive(Debug, Clone)]
pub struct PackBuilderConfig {
    pub window: usize,
    pub depth: u32,
    pub threads: usize,
    pub window_memory: u64,
    pub delta_cache_size: u64,
    pub delta_cache_limit: u64,
    pub pack_size_limit: Option<u64>,
    pub allow_ofs_delta: bool,
    pub compression: Compression,
    pub no_reuse_delta: bool,
    pub no_reuse_object: bool,
    pub thin: bool,
    pub min_size_for_delta: u64,
}

impl Default for PackBuilderConfig {
    fn default() -> Self {
        Self {
            window: 10,
            depth: 50,
            threads: 1,
            window_memory: 0,
            delta_cache_size: 256 * 1024 * 1024,
            delta_cache_limit: 1000,
            pack_size_limit: None,
            allow_ofs_delta: true,
            compression: Compression::default(),
            no_reuse_delta: false,
            no_reuse_object: false,
            thin: false,
            min_size_for_delta: 50,
        }
    }
}

impl PackBuilderConfig {
    fn search_config(&self) -> DeltaSearchConfig {
        DeltaSearchConfig {
            window: self.window,
            max_depth: self.depth,
            window_memory_limit: self.window_memory,
            delta_cache_size: self.delta_cache_size,
            small_delta_threshold: self.delta_cache_limit,
            threads: self.threads,
            no_reuse_delta: self.no_reuse_delta,
            min_size_for_delta: self.min_size_for_delta,
        }
    }

    fn emit_config(&self) -> EmitConfig {
        EmitConfig {
            allow_ofs_delta: self.allow_ofs_delta,
            no_reuse_object: self.no_reuse_object,
            compression: self.compression,
            pack_size_limit: self.pack_size_limit,
            thin: self.thin,
        }
    }
}

/// Pre-populate `delta_base` for candidates whose existing on-disk
/// representation is already a delta against another candidate in this
/// same table — so search (which skips any entry with `delta_base`
/// already set) neither re-derives nor discards a perfectly good
/// existing delta. Mirrors git's `check_object()` pre-pass, which sets
/// `entry->delta` before `prepare_pack()` ever builds the search
/// worklist.
///
/// Resolution is a fixed-point pass rather than a single topological
/// sort, since candidates are not necessarily registered in on-pack
/// offset order. `depth` is recounted here (each entry's depth becomes
/// one more than its resolved base's) rather than trusted from the
/// source pack, the safer of the two choices §9 leaves open: trusting
/// the input risks exceeding `max_depth` in the output if multiple
/// source packs are combined.
pub fn preassign_existing_deltas(table: &mut CandidateTable, no_reuse_delta: bool) {
    if no_reuse_delta {
        return;
    }

    let n = table.len() as u32;
    let mut by_pack_offset: HashMap<(u32, u64), u32> = HashMap::new();
    for (i, entry) in table.iter() {
        if let Some(loc) = &entry.in_pack {
            by_pack_offset.insert((loc.pack_id, loc.offset), i);
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            let entry = table.get(i);
            if entry.delta_base.is_some() || entry.preferred_base {
                continue;
            }
            let Some(loc) = entry.in_pack.clone() else {
                continue;
            };
            let base_idx = loc
                .delta_base_oid
                .and_then(|oid| table.index_of(&oid))
                .or_else(|| {
                    loc.delta_base_offset
                        .and_then(|off| by_pack_offset.get(&(loc.pack_id, off)).copied())
                });
            let Some(base_idx) = base_idx else { continue };
            if base_idx == i {
                continue;
            }
            let base = table.get(base_idx);
            let base_is_resolved = base.in_pack.is_none()
                || (base.in_pack.as_ref().unwrap().delta_base_oid.is_none()
                    && base.in_pack.as_ref().unwrap().delta_base_offset.is_none())
                || base.delta_base.is_some();
            if !base_is_resolved {
                continue;
            }
            let base_depth = table.get(base_idx).depth;
            let entry = table.get_mut(i);
            entry.delta_base = Some(base_idx);
            entry.depth = base_depth + 1;
            changed = true;
        }
    }
}

/// Run the full pipeline — preassignment, delta search, emission — for a
/// populated candidate table.
#[allow(clippy::too_many_arguments)]
pub fn build_pack(
    table: &mut CandidateTable,
    provider: &dyn ObjectProvider,
    reuse: Option<&dyn ReuseSource>,
    config: &PackBuilderConfig,
    dest: EmitDestination,
    abort: &AtomicBool,
    progress: &dyn SearchProgress,
) -> Result<EmitOutcome, PackError> {
    preassign_existing_deltas(table, config.no_reuse_delta);
    search::run_delta_search(table, provider, &config.search_config(), abort, progress)?;
    emit::emit_pack(
        table,
        provider,
        reuse,
        &config.emit_config(),
        dest,
        abort,
        progress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cas_hash::{HashAlgorithm, ObjectId};
    use cas_object::ObjectType;
    use std::collections::HashMap as StdMap;
    use std::sync::Mutex;

    struct MapProvider(Mutex<StdMap<ObjectId, Vec<u8>>>);

    impl ObjectProvider for MapProvider {
        fn payload(&self, oid: &ObjectId) -> Result<Vec<u8>, PackError> {
            self.0
                .lock()
                .unwrap()
                .get(oid)
                .cloned()
                .ok_or(PackError::MissingBase(*oid))
        }
    }

    fn oid_for(n: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn build_pack_end_to_end_produces_directory_output() {
        let base = vec![b'x'; 4096];
        let mut target = base.clone();
        target.push(b'!');

        let base_oid = oid_for(1);
        let target_oid = oid_for(2);

        let mut objects = StdMap::new();
        objects.insert(base_oid, base);
        objects.insert(target_oid, target);
        let provider = MapProvider(Mutex::new(objects));

        let mut table = CandidateTable::new();
        table.add_candidate(base_oid, ObjectType::Blob, 4096, b"a.bin", false);
        table.add_candidate(target_oid, ObjectType::Blob, 4097, b"b.bin", false);

        let config = PackBuilderConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let abort = AtomicBool::new(false);

        let outcome = build_pack(
            &mut table,
            &provider,
            None,
            &config,
            EmitDestination::Directory(dir.path().to_path_buf()),
            &abort,
            &(),
        )
        .unwrap();

        assert_eq!(outcome.objects_written, 2);
        assert_eq!(outcome.packs.len(), 1);
        let written = &outcome.packs[0];
        assert!(written.pack_path.exists());
        assert!(written.idx_path.as_ref().unwrap().exists());

        let pack = crate::pack::PackFile::open(&written.pack_path).unwrap();
        assert_eq!(pack.num_objects(), 2);
    }

    #[test]
    fn preassign_skips_when_no_reuse_delta() {
        let mut table = CandidateTable::new();
        let base_oid = oid_for(1);
        let target_oid = oid_for(2);
        let base_idx = table.add_candidate(base_oid, ObjectType::Blob, 10, b"", false);
        let target_idx = table.add_candidate(target_oid, ObjectType::Blob, 10, b"", false);
        table.note_existing_location(
            target_idx,
            ExistingLocation {
                pack_id: 0,
                offset: 100,
                on_disk_type: 7,
                header_len: 3,
                delta_base_oid: Some(base_oid),
                delta_base_offset: None,
            },
        );
        let _ = base_idx;

        preassign_existing_deltas(&mut table, true);
        assert!(table.get(target_idx).delta_base.is_none());

        preassign_existing_deltas(&mut table, false);
        assert_eq!(table.get(target_idx).delta_base, Some(base_idx));
        assert_eq!(table.get(target_idx).depth, 1);
    }
}
