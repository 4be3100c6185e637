//! Pack writer emission (component I of the design): walks the candidate
//! table in an order that respects delta-base dependencies, choosing
//! between byte-for-byte reuse of an existing on-disk representation and
//! fresh deflate, optionally splitting the output into several
//! size-capped packs, and committing each one with fsync + atomic rename
//! (pack before index) so a reader never observes an index without its
//! pack.
//!
//! Each segment is assembled in memory before being committed. Real git
//! streams a pack incrementally and seeks back to patch the header; doing
//! the same here would mean threading a `Seek` bound through both the
//! directory and stdout destinations. Buffering trades some peak memory
//! for a single, uniform commit path; pack_size_limit keeps any one
//! segment's buffer bounded.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::write::ZlibEncoder;
use flate2::Compression;

use cas_hash::hasher::Hasher;
use cas_hash::{HashAlgorithm, ObjectId};
use cas_object::ObjectType;

use crate::entry::{encode_entry_header, encode_ofs_delta_offset};
use crate::write::build_pack_index;
use crate::{PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION, PackError};

use super::search::SearchProgress;
use super::table::{CandidateTable, ExistingLocation, ObjectProvider};

/// Resolves byte ranges and CRCs from a candidate's existing on-disk
/// representation, identified by the opaque `pack_id` the caller assigned
/// when populating [`ExistingLocation`].
pub trait ReuseSource: Sync {
    /// Raw on-pack bytes (header, delta base reference if any, and the
    /// still-compressed payload) for the record of `len` bytes starting
    /// at `offset`.
    fn read_raw(&self, pack_id: u32, offset: u64, len: u64) -> Result<Vec<u8>, PackError>;
    /// The record's stored CRC32, if the source pack has a v2 index.
    /// `None` means the source index is v1, and the copy must be
    /// re-inflated to check against a known-good payload rather than
    /// trusted blindly.
    fn crc32(&self, pack_id: u32, offset: u64) -> Option<u32>;
    /// Length, in bytes, of the on-pack record (header + compressed
    /// payload, excluding any trailer) starting at `offset`.
    fn record_len(&self, pack_id: u32, offset: u64) -> Option<u64>;
}

/// Where finished packs should be delivered.
pub enum EmitDestination {
    /// Write `pack-<digest>.pack` (and, unless streaming, a matching
    /// `.idx`) into `dir`, using the standard temp-then-rename lifecycle.
    Directory(PathBuf),
    /// Stream the raw pack byte sequence to a writer (e.g. stdout).
    /// Forbids `pack_size_limit` and never emits an index.
    Stream(Box<dyn std::io::Write + Send>),
}

/// External configuration surface (§6) governing emission.
pub struct EmitConfig {
    pub allow_ofs_delta: bool,
    pub no_reuse_object: bool,
    pub compression: Compression,
    /// Split threshold for output packs. Must be `None` when streaming.
    pub pack_size_limit: Option<u64>,
    /// Permit deltas whose base is a preferred-base (not itself emitted)
    /// object, referenced by OID only. Forbidden for on-disk output.
    pub thin: bool,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            allow_ofs_delta: true,
            no_reuse_object: false,
            compression: Compression::default(),
            pack_size_limit: None,
            thin: false,
        }
    }
}

/// Outcome of writing one output pack segment.
#[derive(Debug, Clone)]
pub struct WrittenPack {
    pub pack_path: PathBuf,
    pub idx_path: Option<PathBuf>,
    pub checksum: ObjectId,
    pub num_objects: u32,
}

#[derive(Debug, Default)]
pub struct EmitOutcome {
    pub packs: Vec<WrittenPack>,
    pub objects_written: u64,
}

const TRAILER_LEN: u64 = 20; // sha1 digest width

/// Build the emission order: walk the table in its original insertion
/// order; for each entry not yet emitted, recursively emit its delta base
/// first. Preferred-base entries are marked visited but never appended —
/// they exist only to be pointed at.
fn emission_order(table: &CandidateTable) -> Vec<u32> {
    let n = table.len() as u32;
    let mut emitted = vec![false; n as usize];
    let mut order = Vec::with_capacity(n as usize);
    for i in 0..n {
        emit_walk(table, i, &mut emitted, &mut order);
    }
    order
}

fn emit_walk(table: &CandidateTable, idx: u32, emitted: &mut [bool], order: &mut Vec<u32>) {
    if emitted[idx as usize] {
        return;
    }
    let entry = table.get(idx);
    if entry.preferred_base {
        emitted[idx as usize] = true;
        return;
    }
    if let Some(base) = entry.delta_base {
        if !table.get(base).preferred_base {
            emit_walk(table, base, emitted, order);
        }
    }
    emitted[idx as usize] = true;
    order.push(idx);
}

fn type_number(kind: ObjectType) -> u8 {
    match kind {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    }
}

/// What to do for one candidate at emission time, decided once the
/// candidate's delta base's availability in the *current* output segment
/// is known.
enum Plan {
    ReuseVerbatim { pack_id: u32, offset: u64 },
    RecomputeFull,
    RecomputeOfsDelta { base_idx: u32 },
    RecomputeRefDelta { base_oid: ObjectId },
}

fn plan_emission(
    table: &CandidateTable,
    idx: u32,
    offsets_in_segment: &HashMap<u32, u64>,
    config: &EmitConfig,
) -> Plan {
    let entry = table.get(idx);

    let delta_target = entry.delta_base.and_then(|base_idx| {
        let base = table.get(base_idx);
        if base.preferred_base {
            config.thin.then_some((base_idx, true))
        } else if offsets_in_segment.contains_key(&base_idx) {
            Some((base_idx, false))
        } else {
            None
        }
    });

    if let Some((base_idx, external)) = delta_target {
        let reusable = !config.no_reuse_object
            && entry
                .in_pack
                .as_ref()
                .map(|loc| is_same_delta(loc, table, base_idx))
                .unwrap_or(false);

        if reusable {
            let loc = entry.in_pack.as_ref().unwrap();
            return Plan::ReuseVerbatim {
                pack_id: loc.pack_id,
                offset: loc.offset,
            };
        }

        return if external || !config.allow_ofs_delta {
            Plan::RecomputeRefDelta {
                base_oid: table.get(base_idx).oid,
            }
        } else {
            Plan::RecomputeOfsDelta { base_idx }
        };
    }

    // No usable delta in this segment: try full-object reuse, else recompute.
    if !config.no_reuse_object {
        if let Some(loc) = &entry.in_pack {
            if loc.on_disk_type == type_number(entry.kind) {
                return Plan::ReuseVerbatim {
                    pack_id: loc.pack_id,
                    offset: loc.offset,
                };
            }
        }
    }

    Plan::RecomputeFull
}

/// Whether `loc` (an entry's existing on-disk representation) already is
/// a delta against `base_idx`, i.e. reuse would reproduce exactly what
/// search (or reuse preassignment) picked.
fn is_same_delta(loc: &ExistingLocation, table: &CandidateTable, base_idx: u32) -> bool {
    let base = table.get(base_idx);
    if let Some(oid) = loc.delta_base_oid {
        return oid == base.oid;
    }
    if let Some(off) = loc.delta_base_offset {
        return base
            .in_pack
            .as_ref()
            .map(|b| b.pack_id == loc.pack_id && b.offset == off)
            .unwrap_or(false);
    }
    false
}

fn delta_bytes_for(
    table: &CandidateTable,
    idx: u32,
    provider: &dyn ObjectProvider,
) -> Result<Vec<u8>, PackError> {
    let entry = table.get(idx);
    if let Some(cached) = &entry.delta_data {
        return Ok(cached.clone());
    }
    let base_idx = entry.delta_base.expect("delta plan requires a base");
    let base_oid = table.get(base_idx).oid;
    let base_payload = provider.payload(&base_oid)?;
    let target_payload = provider.payload(&entry.oid)?;
    Ok(crate::delta::compute::compute_delta(&base_payload, &target_payload))
}

fn deflate(data: &[u8], level: Compression) -> Result<Vec<u8>, PackError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Re-inflate a raw base-type record, for reuse from a source whose index
/// carries no CRC (v1) and so cannot be trusted by checksum alone.
fn verify_reinflate(raw_record: &[u8]) -> Result<Vec<u8>, PackError> {
    let parsed = crate::entry::parse_entry_header(raw_record, 0)?;
    let compressed = &raw_record[parsed.header_size..];
    let mut decoder = flate2::bufread::ZlibDecoder::new(compressed);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out).map_err(|_| PackError::CorruptEntry(0))?;
    Ok(out)
}

enum Record {
    /// Header (plus REF_DELTA base OID, if any) and compressed payload
    /// already fully assembled.
    Prebuilt { bytes: Vec<u8>, crc: u32 },
    /// OFS_DELTA whose header can only be built once the base's absolute
    /// offset in the current segment is known.
    OfsDelta {
        base_idx: u32,
        uncompressed_len: u64,
        compressed: Vec<u8>,
    },
}

impl Record {
    /// Conservative upper bound used only to decide whether this record
    /// would push the segment past `pack_size_limit`.
    fn projected_len(&self) -> u64 {
        match self {
            Record::Prebuilt { bytes, .. } => bytes.len() as u64,
            Record::OfsDelta { compressed, .. } => compressed.len() as u64 + 20,
        }
    }
}

/// One output pack segment, assembled in memory.
struct Segment {
    buf: Vec<u8>,
    num_objects: u32,
    entries: Vec<(ObjectId, u64, u32)>,
}

impl Segment {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(PACK_HEADER_SIZE);
        buf.extend_from_slice(PACK_SIGNATURE);
        buf.extend_from_slice(&PACK_VERSION.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // object count, patched at finish
        Self {
            buf,
            num_objects: 0,
            entries: Vec::new(),
        }
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    fn write_record(
        &mut self,
        record: Record,
        oid: ObjectId,
        offsets_in_segment: &HashMap<u32, u64>,
    ) -> u64 {
        let offset = self.position();
        match record {
            Record::Prebuilt { bytes, crc } => {
                self.buf.extend_from_slice(&bytes);
                self.entries.push((oid, offset, crc));
            }
            Record::OfsDelta {
                base_idx,
                uncompressed_len,
                compressed,
            } => {
                let base_offset = *offsets_in_segment
                    .get(&base_idx)
                    .expect("ofs-delta base must already be written in this segment");
                let mut bytes = encode_entry_header(6, uncompressed_len);
                bytes.extend_from_slice(&encode_ofs_delta_offset(offset - base_offset));
                bytes.extend_from_slice(&compressed);
                let crc = crc32fast::hash(&bytes);
                self.buf.extend_from_slice(&bytes);
                self.entries.push((oid, offset, crc));
            }
        }
        self.num_objects += 1;
        offset
    }

    /// Patch the header's object count and append the trailing checksum.
    fn seal(mut self) -> Result<(Vec<u8>, Vec<(ObjectId, u64, u32)>, ObjectId, u32), PackError> {
        self.buf[8..12].copy_from_slice(&self.num_objects.to_be_bytes());
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(&self.buf);
        let checksum = hasher.finalize().map_err(PackError::Hash)?;
        self.buf.extend_from_slice(checksum.as_bytes());
        Ok((self.buf, self.entries, checksum, self.num_objects))
    }
}

fn commit_to_directory(
    dir: &std::path::Path,
    bytes: Vec<u8>,
    mut entries: Vec<(ObjectId, u64, u32)>,
    checksum: ObjectId,
    num_objects: u32,
) -> Result<WrittenPack, PackError> {
    std::fs::create_dir_all(dir)?;

    let mut pack_tmp = tempfile::Builder::new().prefix("tmp_pack_").tempfile_in(dir)?;
    pack_tmp.write_all(&bytes)?;
    pack_tmp.as_file().sync_all()?;

    let pack_path = dir.join(format!("pack-{}.pack", checksum.to_hex()));
    let idx_path = dir.join(format!("pack-{}.idx", checksum.to_hex()));

    pack_tmp
        .persist(&pack_path)
        .map_err(|e| PackError::Io(e.error))?;

    let idx_tmp = tempfile::Builder::new().prefix("tmp_idx_").tempfile_in(dir)?;
    build_pack_index(idx_tmp.path(), &mut entries, &checksum)?;
    idx_tmp
        .persist(&idx_path)
        .map_err(|e| PackError::Io(e.error))?;

    Ok(WrittenPack {
        pack_path,
        idx_path: Some(idx_path),
        checksum,
        num_objects,
    })
}

/// Build the output [`Record`] for `idx` under `plan`, which must have been
/// computed against the `offsets_in_segment` state that is still current
/// when this is called — a `Plan::RecomputeOfsDelta`'s base must already be
/// in that map, or [`Segment::write_record`] has nothing to resolve it to.
fn build_record(
    table: &CandidateTable,
    idx: u32,
    plan: &Plan,
    provider: &dyn ObjectProvider,
    reuse: Option<&dyn ReuseSource>,
    config: &EmitConfig,
) -> Result<Record, PackError> {
    let entry = table.get(idx);

    Ok(match plan {
        Plan::ReuseVerbatim { pack_id, offset } => {
            let reuse = reuse.expect("ReuseVerbatim plan requires a ReuseSource");
            let len = reuse
                .record_len(*pack_id, *offset)
                .ok_or_else(|| PackError::Policy("reuse source has no record length".into()))?;
            let raw = reuse.read_raw(*pack_id, *offset, len)?;
            let crc = match reuse.crc32(*pack_id, *offset) {
                Some(crc) => crc,
                None => {
                    if entry.delta_base.is_none() {
                        let payload = verify_reinflate(&raw)?;
                        let expected = provider.payload(&entry.oid)?;
                        if payload != expected {
                            return Err(PackError::CorruptEntry(*offset));
                        }
                    }
                    crc32fast::hash(&raw)
                }
            };
            Record::Prebuilt { bytes: raw, crc }
        }
        Plan::RecomputeFull => {
            let payload = provider.payload(&entry.oid)?;
            let mut bytes = encode_entry_header(type_number(entry.kind), payload.len() as u64);
            bytes.extend_from_slice(&deflate(&payload, config.compression)?);
            let crc = crc32fast::hash(&bytes);
            Record::Prebuilt { bytes, crc }
        }
        Plan::RecomputeRefDelta { base_oid } => {
            let delta = delta_bytes_for(table, idx, provider)?;
            let mut bytes = encode_entry_header(7, delta.len() as u64);
            bytes.extend_from_slice(base_oid.as_bytes());
            bytes.extend_from_slice(&deflate(&delta, config.compression)?);
            let crc = crc32fast::hash(&bytes);
            Record::Prebuilt { bytes, crc }
        }
        Plan::RecomputeOfsDelta { base_idx } => {
            let delta = delta_bytes_for(table, idx, provider)?;
            let uncompressed_len = delta.len() as u64;
            let compressed = deflate(&delta, config.compression)?;
            Record::OfsDelta {
                base_idx: *base_idx,
                uncompressed_len,
                compressed,
            }
        }
    })
}

/// Write `table`'s non-preferred-base entries to one or more pack files.
pub fn emit_pack(
    table: &CandidateTable,
    provider: &dyn ObjectProvider,
    reuse: Option<&dyn ReuseSource>,
    config: &EmitConfig,
    dest: EmitDestination,
    abort: &AtomicBool,
    progress: &dyn SearchProgress,
) -> Result<EmitOutcome, PackError> {
    if matches!(dest, EmitDestination::Stream(_)) && config.pack_size_limit.is_some() {
        return Err(PackError::Policy(
            "pack_size_limit is forbidden in streaming mode".into(),
        ));
    }

    let order = emission_order(table);
    let mut outcome = EmitOutcome::default();
    let mut segment = Segment::new();
    let mut offsets_in_segment: HashMap<u32, u64> = HashMap::new();

    // `dest` is consumed exactly once: directory mode commits every
    // segment under the same directory; stream mode has only one
    // segment (pack_size_limit is forbidden above).
    let (dir, mut stream) = match dest {
        EmitDestination::Directory(dir) => (Some(dir), None),
        EmitDestination::Stream(w) => (None, Some(w)),
    };

    for idx in order {
        if abort.load(Ordering::Relaxed) {
            return Err(PackError::WriteAborted);
        }
        let plan = plan_emission(table, idx, &offsets_in_segment, config);
        let entry = table.get(idx);
        let mut record = build_record(table, idx, &plan, provider, reuse, config)?;

        if let Some(cap) = config.pack_size_limit {
            let projected = segment.position() + record.projected_len() + TRAILER_LEN;
            if segment.num_objects > 0 && projected >= cap {
                let (bytes, entries, checksum, num_objects) = segment.seal()?;
                let written = commit_to_directory(
                    dir.as_deref().expect("split requires directory mode"),
                    bytes,
                    entries,
                    checksum,
                    num_objects,
                )?;
                outcome.packs.push(written);
                offsets_in_segment.clear();
                segment = Segment::new();

                // `record` above may have been planned against a base
                // that lived in the segment just sealed. That base is
                // now in a previous pack; a cross-pack reference is not
                // allowed on disk, so re-plan against the fresh, empty
                // segment. `plan_emission` already degrades to a full
                // object (or, if thin, an external ref-delta) whenever
                // the base isn't in `offsets_in_segment`, so this
                // naturally drops the stale cross-segment delta instead
                // of handing `write_record` a base it can't resolve.
                let replanned = plan_emission(table, idx, &offsets_in_segment, config);
                record = build_record(table, idx, &replanned, provider, reuse, config)?;
            }
        }

        let offset = segment.write_record(record, entry.oid, &offsets_in_segment);
        offsets_in_segment.insert(idx, offset);
        progress.processed(1);
        outcome.objects_written += 1;
    }

    let (bytes, entries, checksum, num_objects) = segment.seal()?;
    let written = match (&dir, &mut stream) {
        (Some(dir), _) => commit_to_directory(dir, bytes, entries, checksum, num_objects)?,
        (None, Some(w)) => {
            w.write_all(&bytes)?;
            w.flush()?;
            WrittenPack {
                pack_path: PathBuf::new(),
                idx_path: None,
                checksum,
                num_objects,
            }
        }
        (None, None) => unreachable!("exactly one destination is selected at entry"),
    };
    outcome.packs.push(written);
    Ok(outcome)
}
