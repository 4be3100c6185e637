//! PackFile: reading .pack files.
//!
//! A pack file contains a header, a sequence of compressed objects
//! (possibly deltified), and a trailing checksum.

use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;
use cas_hash::{HashAlgorithm, ObjectId};
use cas_object::ObjectType;
use memmap2::Mmap;
use std::io::Read;

use crate::cache::{BaseObjectCache, CacheKey};
use crate::entry::{parse_entry_header, PackEntry};
use crate::index::PackIndex;
use crate::{
    PackEntryType, PackError, PackedObject, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION,
    MAX_DELTA_CHAIN_DEPTH,
};

/// A memory-mapped packfile with its index.
pub struct PackFile {
    data: Mmap,
    index: PackIndex,
    pack_path: PathBuf,
    num_objects: u32,
    hash_algo: HashAlgorithm,
    /// Identity used to key entries in a [`BaseObjectCache`]; distinct
    /// across every `PackFile` instance in the process, even for the
    /// same on-disk pack opened twice.
    pack_id: u64,
}

impl PackFile {
    /// Open a pack file and its associated index.
    ///
    /// Given a `.pack` file path, opens both the pack and its `.idx` file.
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let pack_path = pack_path.as_ref().to_path_buf();

        // Derive .idx path from .pack path
        let idx_path = pack_path.with_extension("idx");

        let file = std::fs::File::open(&pack_path)?;
        let data = unsafe { Mmap::map(&file)? };

        // Validate pack header
        if data.len() < PACK_HEADER_SIZE {
            return Err(PackError::InvalidHeader("file too small".into()));
        }
        if &data[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let index = PackIndex::open(&idx_path)?;

        // Validate object count matches between pack and index
        if index.num_objects() != num_objects {
            return Err(PackError::InvalidHeader(format!(
                "pack has {} objects but index has {}",
                num_objects,
                index.num_objects()
            )));
        }

        Ok(Self {
            data,
            index,
            pack_path,
            num_objects,
            hash_algo: HashAlgorithm::Sha1,
            pack_id: crate::cache::next_pack_id(),
        })
    }

    /// Identity used to key this pack's entries in a [`BaseObjectCache`].
    pub fn pack_id(&self) -> u64 {
        self.pack_id
    }

    /// Read an object by OID.
    ///
    /// Returns `None` if the OID is not in this pack.
    pub fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.read_at_offset(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset in the pack.
    ///
    /// Resolves delta chains iteratively (not recursively) to handle
    /// arbitrary chain depths safely.
    pub fn read_at_offset(&self, offset: u64) -> Result<PackedObject, PackError> {
        self.read_at_offset_with_resolver(offset, None, |_| None)
    }

    /// Read an object at a known offset, consulting (and populating) a
    /// shared [`BaseObjectCache`] so that a chain of deltas sharing a
    /// tail across many calls only inflates and reconstructs that tail
    /// once.
    pub fn read_at_offset_cached(
        &self,
        offset: u64,
        cache: &BaseObjectCache,
    ) -> Result<PackedObject, PackError> {
        self.read_at_offset_with_resolver(offset, Some(cache), |_| None)
    }

    /// Read an object by OID, with an external resolver for cross-pack REF_DELTA bases.
    ///
    /// The resolver is called when a REF_DELTA references a base OID not found in this pack.
    /// It should return the resolved base object's type and data if found externally.
    pub fn read_object_with_resolver(
        &self,
        oid: &ObjectId,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self
                .read_at_offset_with_resolver(offset, None, resolver)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Read an object by OID, with both a base-object cache and an
    /// external resolver for cross-pack REF_DELTA bases.
    pub fn read_object_with_cache_and_resolver(
        &self,
        oid: &ObjectId,
        cache: &BaseObjectCache,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self
                .read_at_offset_with_resolver(offset, Some(cache), resolver)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset, with an external resolver for
    /// cross-pack REF_DELTA bases and an optional base-object cache.
    ///
    /// Delta layers are collected walking backward from `offset` (never
    /// recursing), stopping early on a cache hit; the chain is then
    /// unwound forward, applying one delta per step and admitting each
    /// intermediate result into the cache at its own offset so that a
    /// future read starting anywhere in this chain is also a hit.
    fn read_at_offset_with_resolver(
        &self,
        offset: u64,
        cache: Option<&BaseObjectCache>,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<PackedObject, PackError> {
        // Build the delta chain (innermost delta first, base last).
        // Each layer remembers the offset it was read at, so the unwind
        // pass below can cache its own resolved result.
        let mut chain: Vec<(u64, PackEntry, Vec<u8>)> = Vec::new();
        let mut current_offset = offset;

        for depth in 0..MAX_DELTA_CHAIN_DEPTH {
            if let Some(cache) = cache {
                if let Some((cached_type, cached_data)) = cache.get(CacheKey {
                    pack_id: self.pack_id,
                    offset: current_offset,
                }) {
                    let mut data = cached_data.to_vec();
                    let obj_type = cached_type;
                    for (layer_offset, _, delta_data) in chain.iter().rev() {
                        data = crate::delta::apply::apply_delta(&data, delta_data)?;
                        cache.insert(
                            CacheKey {
                                pack_id: self.pack_id,
                                offset: *layer_offset,
                            },
                            obj_type,
                            std::sync::Arc::from(data.clone()),
                        );
                    }
                    return Ok(PackedObject { obj_type, data });
                }
            }

            let entry = parse_entry_header(
                &self.data[current_offset as usize..],
                current_offset,
            )?;

            // Decompress the data
            let compressed = &self.data[entry.data_offset as usize..];
            let decompressed = decompress(compressed, entry.uncompressed_size, current_offset)?;

            match entry.entry_type {
                PackEntryType::Commit
                | PackEntryType::Tree
                | PackEntryType::Blob
                | PackEntryType::Tag => {
                    // Base object — resolve chain
                    let obj_type = entry
                        .entry_type
                        .to_object_type()
                        .expect("non-delta type");

                    if let Some(cache) = cache {
                        cache.insert(
                            CacheKey {
                                pack_id: self.pack_id,
                                offset: current_offset,
                            },
                            obj_type,
                            std::sync::Arc::from(decompressed.clone()),
                        );
                    }

                    // Apply delta chain in reverse order, caching each
                    // intermediate result at its own offset.
                    let mut data = decompressed;
                    for (layer_offset, _, delta_data) in chain.iter().rev() {
                        data = crate::delta::apply::apply_delta(&data, delta_data)?;
                        if let Some(cache) = cache {
                            cache.insert(
                                CacheKey {
                                    pack_id: self.pack_id,
                                    offset: *layer_offset,
                                },
                                obj_type,
                                std::sync::Arc::from(data.clone()),
                            );
                        }
                    }

                    return Ok(PackedObject {
                        obj_type,
                        data,
                    });
                }
                PackEntryType::OfsDelta { base_offset } => {
                    chain.push((current_offset, entry, decompressed));
                    current_offset = base_offset;
                }
                PackEntryType::RefDelta { base_oid } => {
                    chain.push((current_offset, entry, decompressed));
                    // Try the index within this pack first
                    if let Some(base_offset) = self.index.lookup(&base_oid) {
                        current_offset = base_offset;
                    } else if let Some((obj_type, base_data)) = resolver(&base_oid) {
                        // External resolver found the base — apply delta chain
                        let mut data = base_data;
                        for (layer_offset, _, delta_data) in chain.iter().rev() {
                            data = crate::delta::apply::apply_delta(&data, delta_data)?;
                            if let Some(cache) = cache {
                                cache.insert(
                                    CacheKey {
                                        pack_id: self.pack_id,
                                        offset: *layer_offset,
                                    },
                                    obj_type,
                                    std::sync::Arc::from(data.clone()),
                                );
                            }
                        }
                        return Ok(PackedObject { obj_type, data });
                    } else {
                        return Err(PackError::MissingBase(base_oid));
                    }
                }
            }

            if depth + 1 >= MAX_DELTA_CHAIN_DEPTH {
                return Err(PackError::DeltaChainTooDeep {
                    offset,
                    max_depth: MAX_DELTA_CHAIN_DEPTH,
                });
            }
        }

        Err(PackError::DeltaChainTooDeep {
            offset,
            max_depth: MAX_DELTA_CHAIN_DEPTH,
        })
    }

    /// Check if this pack contains the given OID.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.index.lookup(oid).is_some()
    }

    /// Get the number of objects in this pack.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Get the pack index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Get the path to the .pack file.
    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    /// Get the raw memory-mapped pack data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the hash algorithm used by this pack.
    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }
}

/// Decompress zlib data with an expected uncompressed size.
fn decompress(compressed: &[u8], expected_size: usize, offset: u64) -> Result<Vec<u8>, PackError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut buf = Vec::with_capacity(expected_size);
    decoder.read_to_end(&mut buf).map_err(|_| {
        PackError::CorruptEntry(offset)
    })?;
    Ok(buf)
}
