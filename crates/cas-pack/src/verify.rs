//! Pack checksum and integrity verification.

use cas_hash::hasher::Hasher;
use cas_hash::ObjectId;

use crate::pack::PackFile;
use crate::revindex::ReverseIndex;
use crate::PackError;

impl PackFile {
    /// Verify a single record's on-disk bytes against its stored CRC32,
    /// without inflating or delta-resolving it.
    ///
    /// `index_pos` identifies the record the same way [`crate::index::PackIndex`]'s
    /// `nth`-style accessors do: its position in the index's OID-sorted
    /// table, as yielded by [`PackIter`] or [`crate::revindex::ReverseIndex`].
    /// The byte range is derived from the reverse index (this record's
    /// offset up to the next one, or the trailer for the last record), so
    /// this catches corruption the delta-chain reader would otherwise
    /// silently inflate through.
    pub fn verify_object(&self, index_pos: u32) -> Result<(), PackError> {
        if index_pos >= self.num_objects() {
            return Err(PackError::InvalidIndex(format!(
                "index position {index_pos} out of range ({} objects)",
                self.num_objects()
            )));
        }

        let offset = self.index().offset_at_index(index_pos);
        let rev = ReverseIndex::build(self.index());
        let trailer_len = self.hash_algo().digest_len() as u64;
        let pack_len = self.data().len() as u64;

        let len = rev
            .record_length(offset, pack_len, trailer_len)
            .ok_or(PackError::CorruptEntry(offset))?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= pack_len)
            .ok_or(PackError::CorruptEntry(offset))?;

        let record = &self.data()[offset as usize..end as usize];
        let actual = crc32fast::hash(record);
        let expected = self.index().crc32_at_index(index_pos);

        if actual != expected {
            return Err(PackError::CrcMismatch {
                offset,
                expected,
                actual,
            });
        }

        Ok(())
    }

    /// Verify the pack file checksum.
    ///
    /// Computes SHA-1 over all pack content (excluding the trailing checksum)
    /// and compares it with the stored checksum.
    pub fn verify_checksum(&self) -> Result<(), PackError> {
        let data = self.data();
        let hash_len = self.hash_algo().digest_len();

        if data.len() < hash_len {
            return Err(PackError::InvalidHeader("pack too small for checksum".into()));
        }

        let content = &data[..data.len() - hash_len];
        let stored_checksum_bytes = &data[data.len() - hash_len..];

        let stored = ObjectId::from_bytes(stored_checksum_bytes, self.hash_algo())
            .map_err(|_| PackError::InvalidHeader("invalid checksum bytes".into()))?;

        let mut hasher = Hasher::new(self.hash_algo());
        hasher.update(content);
        let computed = hasher.finalize().map_err(PackError::Hash)?;

        if computed != stored {
            return Err(PackError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        Ok(())
    }
}

/// Iterator over all objects in a pack file.
pub struct PackIter<'a> {
    pack: &'a PackFile,
    index_pos: u32,
}

impl PackFile {
    /// Iterate over all objects in the pack.
    ///
    /// Objects are yielded in index-sorted order (by OID).
    pub fn iter(&self) -> PackIter<'_> {
        PackIter {
            pack: self,
            index_pos: 0,
        }
    }
}

impl<'a> Iterator for PackIter<'a> {
    type Item = Result<(ObjectId, crate::PackedObject), PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index_pos >= self.pack.num_objects() {
            return None;
        }

        let oid = self.pack.index().oid_at_index(self.index_pos);
        let offset = self.pack.index().offset_at_index(self.index_pos);
        self.index_pos += 1;

        Some(self.pack.read_at_offset(offset).map(|obj| (oid, obj)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.pack.num_objects() - self.index_pos) as usize;
        (remaining, Some(remaining))
    }
}
