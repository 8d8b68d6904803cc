//! Basement node: the key/value content of one leaf of a
//! write-optimized index.
//!
//! A basement node owns two arenas. The first backs a [`Dmt`] of
//! **klpairs** — `payload_offset:u32 | key bytes` records, sorted by the
//! caller's key order. The second holds the payload records
//! ("leafentries") those offsets point into. Payload compaction
//! therefore never perturbs the container's shape; it only rewrites the
//! stored offset integers.
//!
//! Payload records are self-describing: a leading `u32` total length
//! followed by the payload bytes. The layers above still pass sizes
//! through the API (and those are cross-checked in debug builds), but
//! compaction, splitting, and serialization recover sizes from the
//! records themselves.
//!
//! Key ordering is always supplied by the caller as a comparator; this
//! layer never interprets key bytes.

use std::cmp::Ordering;
use std::ops::ControlFlow;

use smallvec::SmallVec;
use tracing::debug;

use crate::dmt::{Direction, Dmt, DmtBuilder};
use crate::error::{Error, Result};
use crate::mempool::{align4, Mempool, ALLOC_ALIGN};

/// Bytes of the `payload_offset` field at the head of every klpair.
const KLPAIR_HEADER: usize = 4;

/// Bytes of the length prefix at the head of every payload record.
const PAYLOAD_HEADER: usize = 4;

/// Serialized header: `key_data_size`, `val_data_size`,
/// `fixed_key_length`, `all_keys_same_length`, `keys_vals_separate`.
pub const SERIALIZED_HEADER_SIZE: usize = 14;

/// Current version of the bulk serialized layout. Older (incremental)
/// encodings are rejected with [`Error::UnsupportedVersion`].
pub const BASEMENT_FORMAT_VERSION: u32 = 2;

#[inline]
fn klpair_offset(klpair: &[u8]) -> u32 {
    u32::from_le_bytes([klpair[0], klpair[1], klpair[2], klpair[3]])
}

#[inline]
fn klpair_key(klpair: &[u8]) -> &[u8] {
    &klpair[KLPAIR_HEADER..]
}

/// In-memory content of one leaf node.
#[derive(Clone, Debug)]
pub struct BasementNode {
    dmt: Dmt,
    payload_mp: Mempool,
    /// Aggregate on-disk key size: one length word plus the key bytes
    /// per entry.
    disk_key_size: u64,
    /// Aggregate on-disk payload size: one length word plus the payload
    /// bytes per entry.
    disk_val_size: u64,
}

impl BasementNode {
    /// Create an empty basement node.
    pub fn new() -> Self {
        Self {
            dmt: Dmt::new(),
            payload_mp: Mempool::new(0),
            disk_key_size: 0,
            disk_val_size: 0,
        }
    }

    /// Number of klpairs held.
    pub fn num_klpairs(&self) -> u32 {
        self.dmt.size()
    }

    /// Aggregate on-disk size of the keys.
    pub fn key_disk_size(&self) -> u64 {
        self.disk_key_size
    }

    /// Aggregate on-disk size of the payloads.
    pub fn val_disk_size(&self) -> u64 {
        self.disk_val_size
    }

    /// Key and payload at index `idx`.
    pub fn get(&self, idx: u32) -> Result<(&[u8], &[u8])> {
        let klpair = self.dmt.fetch(idx)?;
        Ok((klpair_key(klpair), self.payload(klpair_offset(klpair))))
    }

    #[inline]
    fn payload(&self, offset: u32) -> &[u8] {
        let len = self.payload_mp.read_u32(offset) as usize;
        self.payload_mp.slice(offset + PAYLOAD_HEADER as u32, len)
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// Find the entry whose key compares `Equal` to `key`.
    ///
    /// Returns `(index, key, payload)`; on a miss the error carries the
    /// insertion point for that key.
    pub fn find_zero<C>(&self, cmp: C, key: &[u8]) -> Result<(u32, &[u8], &[u8])>
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        let (idx, klpair) = self.dmt.find_zero(|v| cmp(klpair_key(v), key))?;
        Ok((
            idx,
            klpair_key(klpair),
            self.payload(klpair_offset(klpair)),
        ))
    }

    /// Directional search relative to `key`: the first entry strictly
    /// after it, or the last entry strictly before it.
    pub fn find<C>(&self, cmp: C, key: &[u8], direction: Direction) -> Result<(u32, &[u8], &[u8])>
    where
        C: Fn(&[u8], &[u8]) -> Ordering,
    {
        let (idx, klpair) = self.dmt.find(|v| cmp(klpair_key(v), key), direction)?;
        Ok((
            idx,
            klpair_key(klpair),
            self.payload(klpair_offset(klpair)),
        ))
    }

    /// In-order visit of `(index, key, payload)` over `[left, right)`.
    pub fn iterate_on_range<F>(&self, left: u32, right: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &[u8], &[u8]) -> ControlFlow<()>,
    {
        let BasementNode {
            dmt, payload_mp, ..
        } = self;
        dmt.iterate_on_range(left, right, |idx, klpair| {
            let offset = klpair_offset(klpair);
            let len = payload_mp.read_u32(offset) as usize;
            let payload = payload_mp.slice(offset + PAYLOAD_HEADER as u32, len);
            f(idx, klpair_key(klpair), payload)
        })
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Insert a new klpair at `idx` and hand back the freshly allocated
    /// `size`-byte payload region for the caller to fill.
    ///
    /// Atomic from the caller's point of view: on error nothing changed.
    /// May compact the payload arena first when it is fragmented, which
    /// rewrites only the stored payload offsets.
    pub fn get_space_for_insert(&mut self, idx: u32, key: &[u8], size: usize) -> Result<&mut [u8]> {
        let num = self.dmt.size();
        if idx > num {
            return Err(Error::InvalidIndex { index: idx, size: num });
        }
        let offset = self.alloc_payload(size)?;

        let mut klpair: SmallVec<[u8; 64]> = SmallVec::new();
        klpair.extend_from_slice(&offset.to_le_bytes());
        klpair.extend_from_slice(key);
        if let Err(e) = self.dmt.insert_at(&klpair, idx) {
            self.payload_mp.free(offset, PAYLOAD_HEADER + size);
            return Err(e);
        }
        self.disk_key_size += (KLPAIR_HEADER + key.len()) as u64;
        self.disk_val_size += (PAYLOAD_HEADER + size) as u64;
        Ok(self
            .payload_mp
            .slice_mut(offset + PAYLOAD_HEADER as u32, size))
    }

    /// Replace the payload of the klpair at `idx`, possibly with a
    /// different size, and hand back the new region to fill. The old
    /// allocation is freed.
    pub fn get_space_for_overwrite(
        &mut self,
        idx: u32,
        key: &[u8],
        old_size: usize,
        new_size: usize,
    ) -> Result<&mut [u8]> {
        let num = self.dmt.size();
        if idx >= num {
            return Err(Error::InvalidIndex { index: idx, size: num });
        }
        {
            let klpair = self.dmt.fetch(idx)?;
            debug_assert_eq!(klpair_key(klpair), key, "overwrite key mismatch");
            debug_assert_eq!(
                self.payload_mp.read_u32(klpair_offset(klpair)) as usize,
                old_size,
                "overwrite size mismatch"
            );
        }
        // Allocate before freeing: on failure nothing has changed. The
        // allocation may compact the arena, so the old offset must be
        // re-read from the klpair afterwards.
        let new_offset = self.alloc_payload(new_size)?;
        let klpair = self.dmt.value_mut(idx)?;
        let old_offset = klpair_offset(klpair);
        klpair[..KLPAIR_HEADER].copy_from_slice(&new_offset.to_le_bytes());
        let stored = self.payload_mp.read_u32(old_offset) as usize;
        self.payload_mp.free(old_offset, PAYLOAD_HEADER + stored);
        self.disk_val_size -= (PAYLOAD_HEADER + stored) as u64;
        self.disk_val_size += (PAYLOAD_HEADER + new_size) as u64;
        Ok(self
            .payload_mp
            .slice_mut(new_offset + PAYLOAD_HEADER as u32, new_size))
    }

    /// Remove the klpair at `idx` and free its payload allocation.
    pub fn delete_leafentry(&mut self, idx: u32, key_len: usize, old_size: usize) -> Result<()> {
        let klpair = self.dmt.fetch(idx)?;
        let stored_key_len = klpair.len() - KLPAIR_HEADER;
        debug_assert_eq!(stored_key_len, key_len, "delete key length mismatch");
        let offset = klpair_offset(klpair);
        let stored = self.payload_mp.read_u32(offset) as usize;
        debug_assert_eq!(stored, old_size, "delete payload size mismatch");

        self.dmt.delete_at(idx)?;
        self.payload_mp.free(offset, PAYLOAD_HEADER + stored);
        self.disk_key_size -= (KLPAIR_HEADER + stored_key_len) as u64;
        self.disk_val_size -= (PAYLOAD_HEADER + stored) as u64;
        if self.dmt.size() == 0 {
            self.payload_mp.reset();
        }
        Ok(())
    }

    fn alloc_payload(&mut self, size: usize) -> Result<u32> {
        let total = PAYLOAD_HEADER + size;
        let aligned = align4(total);
        if self.payload_mp.free_space() < aligned {
            if self.payload_mp.frag_size() * 4 > self.payload_mp.capacity() {
                let live = self.payload_mp.used() - self.payload_mp.frag_size();
                self.compact_payloads(aligned.max(live));
            }
            if self.payload_mp.free_space() < aligned {
                let needed = self.payload_mp.used() + aligned;
                if needed > u32::MAX as usize {
                    return Err(Error::OutOfMemory {
                        requested: total,
                        available: self.payload_mp.free_space(),
                    });
                }
                let new_capacity = needed
                    .max(self.payload_mp.capacity() * 2)
                    .min(u32::MAX as usize);
                self.payload_mp.grow(new_capacity);
            }
        }
        let offset = self.payload_mp.alloc(total).ok_or(Error::OutOfMemory {
            requested: total,
            available: self.payload_mp.free_space(),
        })?;
        self.payload_mp.write_u32(offset, size as u32);
        Ok(offset)
    }

    /// Copy every live payload record into a fresh arena and rewrite the
    /// `payload_offset` field of each klpair. Klpair order and container
    /// shape are untouched.
    fn compact_payloads(&mut self, reserve: usize) {
        let live = self.payload_mp.used() - self.payload_mp.frag_size();
        debug!(
            live,
            frag = self.payload_mp.frag_size(),
            "compacting payload arena"
        );
        let num = self.dmt.size();
        let BasementNode {
            dmt, payload_mp, ..
        } = self;
        let mut fresh = Mempool::new(live + reserve);
        dmt.iterate_mut_on_range(0, num, |_, klpair| {
            let old_offset = klpair_offset(klpair);
            let len = payload_mp.read_u32(old_offset) as usize;
            let new_offset = fresh
                .alloc(PAYLOAD_HEADER + len)
                .expect("compaction arena sized for all live payloads");
            fresh.write_u32(new_offset, len as u32);
            fresh
                .slice_mut(new_offset + PAYLOAD_HEADER as u32, len)
                .copy_from_slice(payload_mp.slice(old_offset + PAYLOAD_HEADER as u32, len));
            klpair[..KLPAIR_HEADER].copy_from_slice(&new_offset.to_le_bytes());
            ControlFlow::Continue(())
        })
        .expect("iteration range is within size");
        *payload_mp = fresh;
    }

    // -------------------------------------------------------------------------
    // Split & clone
    // -------------------------------------------------------------------------

    /// Move the suffix `[first_index_for_dest, size)` — klpairs and the
    /// bytes of their payloads — into `dest`, which must be empty. Both
    /// halves end up in tightly rebuilt arenas; this is a deep copy, not
    /// a shared reference.
    pub fn split_klpairs(&mut self, dest: &mut BasementNode, first_index_for_dest: u32) -> Result<()> {
        let num = self.dmt.size();
        if first_index_for_dest > num {
            return Err(Error::InvalidIndex {
                index: first_index_for_dest,
                size: num,
            });
        }
        debug_assert_eq!(dest.num_klpairs(), 0, "split destination must be empty");
        debug!(
            total = num,
            split_at = first_index_for_dest,
            "splitting basement node"
        );
        let (dest_dmt, dest_mp, dest_keys, dest_vals) =
            self.rebuild_range(first_index_for_dest, num)?;
        let (src_dmt, src_mp, src_keys, src_vals) = self.rebuild_range(0, first_index_for_dest)?;
        dest.dmt = dest_dmt;
        dest.payload_mp = dest_mp;
        dest.disk_key_size = dest_keys;
        dest.disk_val_size = dest_vals;
        self.dmt = src_dmt;
        self.payload_mp = src_mp;
        self.disk_key_size = src_keys;
        self.disk_val_size = src_vals;
        Ok(())
    }

    /// Deep-copy the entries in `[lo, hi)` into a freshly built
    /// container and payload arena.
    fn rebuild_range(&self, lo: u32, hi: u32) -> Result<(Dmt, Mempool, u64, u64)> {
        let count = hi - lo;
        let mut klpair_bytes = 0usize;
        let mut payload_aligned = 0usize;
        let mut disk_val_size = 0u64;
        self.dmt.iterate_on_range(lo, hi, |_, klpair| {
            klpair_bytes += klpair.len();
            let len = self.payload_mp.read_u32(klpair_offset(klpair)) as usize;
            payload_aligned += align4(PAYLOAD_HEADER + len);
            disk_val_size += (PAYLOAD_HEADER + len) as u64;
            ControlFlow::Continue(())
        })?;

        let mut builder = DmtBuilder::new(count, klpair_bytes);
        let mut mp = Mempool::new(payload_aligned);
        let mut append_err = None;
        self.dmt.iterate_on_range(lo, hi, |_, klpair| {
            let old_offset = klpair_offset(klpair);
            let len = self.payload_mp.read_u32(old_offset) as usize;
            let new_offset = mp
                .alloc(PAYLOAD_HEADER + len)
                .expect("range arena sized for its payloads");
            mp.write_u32(new_offset, len as u32);
            mp.slice_mut(new_offset + PAYLOAD_HEADER as u32, len)
                .copy_from_slice(
                    self.payload_mp
                        .slice(old_offset + PAYLOAD_HEADER as u32, len),
                );
            let mut rehomed: SmallVec<[u8; 64]> = SmallVec::new();
            rehomed.extend_from_slice(&new_offset.to_le_bytes());
            rehomed.extend_from_slice(klpair_key(klpair));
            if let Err(e) = builder.append(&rehomed) {
                append_err = Some(e);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })?;
        if let Some(e) = append_err {
            return Err(e);
        }
        Ok((builder.build(), mp, klpair_bytes as u64, disk_val_size))
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    /// Convert to the packed-array representation when legal. Must be
    /// called before [`BasementNode::serialize_header`] /
    /// [`BasementNode::serialize_rest`].
    pub fn prepare_to_serialize(&mut self) {
        self.dmt.prepare_for_serialize();
    }

    fn fixed_key_length(&self) -> Option<u32> {
        if self.dmt.size() == 0 {
            return Some(0);
        }
        self.dmt
            .fixed_value_length()
            .map(|len| len - KLPAIR_HEADER as u32)
    }

    /// Append the serialized header fields to `out`.
    pub fn serialize_header(&self, out: &mut Vec<u8>) {
        let fixed = self.fixed_key_length();
        assert!(
            fixed.is_none() || self.dmt.is_array(),
            "serialize called without prepare_to_serialize"
        );
        let num = self.dmt.size() as u64;
        let key_data_size = match fixed {
            Some(len) => num * len as u64,
            None => self.disk_key_size,
        };
        out.extend_from_slice(&(key_data_size as u32).to_le_bytes());
        out.extend_from_slice(&(self.disk_val_size as u32).to_le_bytes());
        out.extend_from_slice(&fixed.unwrap_or(0).to_le_bytes());
        out.push(u8::from(fixed.is_some()));
        // The current format packs keys separately exactly when they all
        // share one length; the flags are parsed independently.
        out.push(u8::from(fixed.is_some()));
    }

    /// Append the key and payload sections to `out`.
    ///
    /// Fixed-key layout: all keys packed back to back, then all payload
    /// records. Variable layout: `key_len | key | payload record` per
    /// entry, interleaved in sorted order.
    pub fn serialize_rest(&self, out: &mut Vec<u8>) {
        let fixed = self.fixed_key_length();
        assert!(
            fixed.is_none() || self.dmt.is_array(),
            "serialize called without prepare_to_serialize"
        );
        let num = self.dmt.size();
        let BasementNode {
            dmt, payload_mp, ..
        } = self;
        if fixed.is_some() {
            dmt.iterate_on_range(0, num, |_, klpair| {
                out.extend_from_slice(klpair_key(klpair));
                ControlFlow::Continue(())
            })
            .expect("iteration range is within size");
            dmt.iterate_on_range(0, num, |_, klpair| {
                let offset = klpair_offset(klpair);
                let len = payload_mp.read_u32(offset) as usize;
                out.extend_from_slice(payload_mp.slice(offset, PAYLOAD_HEADER + len));
                ControlFlow::Continue(())
            })
            .expect("iteration range is within size");
        } else {
            dmt.iterate_on_range(0, num, |_, klpair| {
                let key = klpair_key(klpair);
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key);
                let offset = klpair_offset(klpair);
                let len = payload_mp.read_u32(offset) as usize;
                out.extend_from_slice(payload_mp.slice(offset, PAYLOAD_HEADER + len));
                ControlFlow::Continue(())
            })
            .expect("iteration range is within size");
        }
    }

    /// Inverse of serialization: rebuild a basement node from a
    /// serialized image of `num_entries` entries.
    ///
    /// `version` selects the layout; only the current bulk layout is
    /// readable. `data_size` must match the image length exactly.
    pub fn deserialize_from_rbuf(
        num_entries: u32,
        buf: &[u8],
        data_size: u32,
        version: u32,
    ) -> Result<Self> {
        if version != BASEMENT_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if buf.len() != data_size as usize {
            return Err(Error::Deserialize(format!(
                "buffer length {} does not match declared data size {}",
                buf.len(),
                data_size
            )));
        }
        let mut rbuf = Rbuf::new(buf);
        let key_data_size = rbuf.read_u32()? as usize;
        let val_data_size = rbuf.read_u32()? as usize;
        let fixed_key_length = rbuf.read_u32()? as usize;
        let all_keys_same_length = rbuf.read_u8()? != 0;
        let keys_vals_separate = rbuf.read_u8()? != 0;
        if keys_vals_separate != all_keys_same_length {
            return Err(Error::Deserialize(
                "inconsistent layout flags in header".into(),
            ));
        }
        if rbuf.remaining() != key_data_size + val_data_size {
            return Err(Error::Deserialize(format!(
                "section sizes {}+{} do not match remaining {} bytes",
                key_data_size,
                val_data_size,
                rbuf.remaining()
            )));
        }

        // Alignment never pads a record by more than one word, so this
        // arena always holds the whole value section.
        let mut payload_mp =
            Mempool::new(val_data_size + num_entries as usize * ALLOC_ALIGN);
        let mut builder = DmtBuilder::new(
            num_entries,
            key_data_size + num_entries as usize * KLPAIR_HEADER,
        );
        let mut disk_key_size = 0u64;
        let mut disk_val_size = 0u64;

        if all_keys_same_length {
            // Array fast path: the key section is already the sorted
            // fixed-size run the builder wants.
            if key_data_size != num_entries as usize * fixed_key_length {
                return Err(Error::Deserialize(
                    "key section does not match entry count".into(),
                ));
            }
            let keys = rbuf.read_bytes(key_data_size)?;
            let mut vals = Rbuf::new(rbuf.read_bytes(val_data_size)?);
            for i in 0..num_entries as usize {
                let key = &keys[i * fixed_key_length..(i + 1) * fixed_key_length];
                let len = vals.read_u32()? as usize;
                let payload = vals.read_bytes(len)?;
                let offset = payload_mp
                    .alloc(PAYLOAD_HEADER + len)
                    .expect("payload arena sized for the value section");
                payload_mp.write_u32(offset, len as u32);
                payload_mp
                    .slice_mut(offset + PAYLOAD_HEADER as u32, len)
                    .copy_from_slice(payload);
                let mut klpair: SmallVec<[u8; 64]> = SmallVec::new();
                klpair.extend_from_slice(&offset.to_le_bytes());
                klpair.extend_from_slice(key);
                builder.append(&klpair)?;
                disk_key_size += (KLPAIR_HEADER + fixed_key_length) as u64;
                disk_val_size += (PAYLOAD_HEADER + len) as u64;
            }
            if !vals.is_empty() {
                return Err(Error::Deserialize("trailing bytes in value section".into()));
            }
        } else {
            for _ in 0..num_entries {
                let key_len = rbuf.read_u32()? as usize;
                let key = rbuf.read_bytes(key_len)?;
                let len = rbuf.read_u32()? as usize;
                let payload = rbuf.read_bytes(len)?;
                let offset = payload_mp
                    .alloc(PAYLOAD_HEADER + len)
                    .expect("payload arena sized for the value section");
                payload_mp.write_u32(offset, len as u32);
                payload_mp
                    .slice_mut(offset + PAYLOAD_HEADER as u32, len)
                    .copy_from_slice(payload);
                let mut klpair: SmallVec<[u8; 64]> = SmallVec::new();
                klpair.extend_from_slice(&offset.to_le_bytes());
                klpair.extend_from_slice(key);
                builder.append(&klpair)?;
                disk_key_size += (KLPAIR_HEADER + key_len) as u64;
                disk_val_size += (PAYLOAD_HEADER + len) as u64;
            }
            if !rbuf.is_empty() {
                return Err(Error::Deserialize("trailing bytes after entries".into()));
            }
            if disk_key_size != key_data_size as u64 || disk_val_size != val_data_size as u64 {
                return Err(Error::Deserialize(
                    "entry sizes disagree with header sections".into(),
                ));
            }
        }

        Ok(Self {
            dmt: builder.build(),
            payload_mp,
            disk_key_size,
            disk_val_size,
        })
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check structural invariants of both arenas and the aggregate size
    /// counters. Idempotent and side-effect-free; panics on violation.
    pub fn verify(&self) {
        self.dmt.verify();
        let num = self.dmt.size();
        let mut key_bytes = 0u64;
        let mut val_bytes = 0u64;
        let mut live = 0usize;
        let BasementNode {
            dmt, payload_mp, ..
        } = self;
        dmt.iterate_on_range(0, num, |_, klpair| {
            assert!(klpair.len() >= KLPAIR_HEADER, "klpair too short");
            let offset = klpair_offset(klpair) as usize;
            let len = payload_mp.read_u32(offset as u32) as usize;
            assert!(
                offset + PAYLOAD_HEADER + len <= payload_mp.used(),
                "payload outside the allocated arena region"
            );
            key_bytes += klpair.len() as u64;
            val_bytes += (PAYLOAD_HEADER + len) as u64;
            live += align4(PAYLOAD_HEADER + len);
            ControlFlow::Continue(())
        })
        .expect("iteration range is within size");
        assert_eq!(key_bytes, self.disk_key_size, "key size accounting mismatch");
        assert_eq!(val_bytes, self.disk_val_size, "payload size accounting mismatch");
        assert_eq!(
            live,
            payload_mp.used() - payload_mp.frag_size(),
            "payload arena accounting mismatch"
        );
    }
}

impl Default for BasementNode {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Read cursor over a serialized image
// =============================================================================

struct Rbuf<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Rbuf<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Deserialize(format!(
                "truncated image: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bytecmp(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn insert(bn: &mut BasementNode, idx: u32, key: &[u8], payload: &[u8]) {
        bn.get_space_for_insert(idx, key, payload.len())
            .unwrap()
            .copy_from_slice(payload);
    }

    fn collect(bn: &BasementNode) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        bn.iterate_on_range(0, bn.num_klpairs(), |_, k, p| {
            out.push((k.to_vec(), p.to_vec()));
            ControlFlow::Continue(())
        })
        .unwrap();
        out
    }

    fn serialize(bn: &BasementNode) -> Vec<u8> {
        let mut out = Vec::new();
        bn.serialize_header(&mut out);
        bn.serialize_rest(&mut out);
        out
    }

    #[test]
    fn test_insert_and_find() {
        let mut bn = BasementNode::new();
        insert(&mut bn, 0, b"bravo", b"2");
        insert(&mut bn, 0, b"alfa", b"1");
        insert(&mut bn, 2, b"delta", b"4");
        bn.verify();

        let (idx, key, payload) = bn.find_zero(bytecmp, b"bravo").unwrap();
        assert_eq!((idx, key, payload), (1, &b"bravo"[..], &b"2"[..]));

        let err = bn.find_zero(bytecmp, b"charlie").unwrap_err();
        assert_eq!(err, Error::NotFound { insert_index: 2 });
    }

    #[test]
    fn test_find_directional() {
        let mut bn = BasementNode::new();
        for (i, key) in [&b"aa"[..], b"cc", b"ee"].iter().enumerate() {
            insert(&mut bn, i as u32, key, b"x");
        }
        let (idx, key, _) = bn.find(bytecmp, b"bb", Direction::Greater).unwrap();
        assert_eq!((idx, key), (1, &b"cc"[..]));
        let (idx, key, _) = bn.find(bytecmp, b"bb", Direction::Less).unwrap();
        assert_eq!((idx, key), (0, &b"aa"[..]));
        assert!(bn.find(bytecmp, b"ff", Direction::Greater).is_err());
    }

    #[test]
    fn test_get_by_index() {
        let mut bn = BasementNode::new();
        insert(&mut bn, 0, b"key", b"payload bytes");
        let (key, payload) = bn.get(0).unwrap();
        assert_eq!(key, b"key");
        assert_eq!(payload, b"payload bytes");
        assert!(bn.get(1).is_err());
    }

    #[test]
    fn test_overwrite_changes_size() {
        let mut bn = BasementNode::new();
        insert(&mut bn, 0, b"key", b"short");
        bn.get_space_for_overwrite(0, b"key", 5, 11)
            .unwrap()
            .copy_from_slice(b"much longer");
        bn.verify();
        let (_, payload) = bn.get(0).unwrap();
        assert_eq!(payload, b"much longer");
        assert_eq!(bn.val_disk_size(), (PAYLOAD_HEADER + 11) as u64);
    }

    #[test]
    fn test_delete_leafentry() {
        let mut bn = BasementNode::new();
        insert(&mut bn, 0, b"aa", b"1");
        insert(&mut bn, 1, b"bb", b"2");
        bn.delete_leafentry(0, 2, 1).unwrap();
        bn.verify();
        assert_eq!(bn.num_klpairs(), 1);
        assert_eq!(bn.find_zero(bytecmp, b"aa").unwrap_err(), Error::NotFound { insert_index: 0 });

        bn.delete_leafentry(0, 2, 1).unwrap();
        assert_eq!(bn.num_klpairs(), 0);
        assert_eq!(bn.key_disk_size(), 0);
        assert_eq!(bn.val_disk_size(), 0);
        bn.verify();
    }

    #[test]
    fn test_find_then_delete_then_miss() {
        let mut bn = BasementNode::new();
        for i in 0..10u32 {
            let key = format!("key{:02}", i);
            insert(&mut bn, i, key.as_bytes(), b"payload");
        }
        let (idx, _, _) = bn.find_zero(bytecmp, b"key05").unwrap();
        bn.delete_leafentry(idx, 5, 7).unwrap();
        let err = bn.find_zero(bytecmp, b"key05").unwrap_err();
        assert_eq!(err, Error::NotFound { insert_index: 5 });
    }

    #[test]
    fn test_overwrite_churn_compacts() {
        // Repeated resizing overwrites leave freed allocations behind;
        // the arena must compact and stay consistent throughout.
        let mut bn = BasementNode::new();
        for i in 0..10u32 {
            let key = format!("key{:02}", i);
            insert(&mut bn, i, key.as_bytes(), &vec![i as u8; 16]);
        }
        let mut size = 16usize;
        for round in 0..20 {
            let new_size = 16 + (round % 5) * 8;
            for i in 0..10u32 {
                let key = format!("key{:02}", i);
                bn.get_space_for_overwrite(i, key.as_bytes(), size, new_size)
                    .unwrap()
                    .fill(i as u8);
            }
            size = new_size;
            bn.verify();
        }
        for i in 0..10u32 {
            let key = format!("key{:02}", i);
            let (_, _, payload) = bn.find_zero(bytecmp, key.as_bytes()).unwrap();
            assert_eq!(payload, vec![i as u8; size].as_slice());
        }
    }

    #[test]
    fn test_split_conserves_entries() {
        // Scenario E: split a 100-entry node at the midpoint; the two
        // halves concatenate back to the original sequence and no
        // payload bytes are lost or duplicated.
        let mut bn = BasementNode::new();
        for i in 0..100u32 {
            let key = format!("key{:03}", i);
            let payload = vec![i as u8; (i % 7) as usize + 1];
            insert(&mut bn, i, key.as_bytes(), &payload);
        }
        let original = collect(&bn);
        let total_vals = bn.val_disk_size();
        let total_keys = bn.key_disk_size();

        let mut dest = BasementNode::new();
        bn.split_klpairs(&mut dest, 50).unwrap();
        bn.verify();
        dest.verify();

        assert_eq!(bn.num_klpairs(), 50);
        assert_eq!(dest.num_klpairs(), 50);
        let mut joined = collect(&bn);
        joined.extend(collect(&dest));
        assert_eq!(joined, original);
        assert_eq!(bn.val_disk_size() + dest.val_disk_size(), total_vals);
        assert_eq!(bn.key_disk_size() + dest.key_disk_size(), total_keys);
    }

    #[test]
    fn test_split_at_boundaries() {
        let mut bn = BasementNode::new();
        for i in 0..4u32 {
            insert(&mut bn, i, format!("k{}", i).as_bytes(), b"v");
        }
        let original = collect(&bn);

        let mut dest = BasementNode::new();
        bn.split_klpairs(&mut dest, 4).unwrap();
        assert_eq!(bn.num_klpairs(), 4);
        assert_eq!(dest.num_klpairs(), 0);
        assert_eq!(collect(&bn), original);

        let mut dest2 = BasementNode::new();
        bn.split_klpairs(&mut dest2, 0).unwrap();
        assert_eq!(bn.num_klpairs(), 0);
        assert_eq!(collect(&dest2), original);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut bn = BasementNode::new();
        insert(&mut bn, 0, b"key", b"before");
        let clone = bn.clone();
        bn.get_space_for_overwrite(0, b"key", 6, 5)
            .unwrap()
            .copy_from_slice(b"after");
        assert_eq!(collect(&clone), vec![(b"key".to_vec(), b"before".to_vec())]);
        assert_eq!(collect(&bn), vec![(b"key".to_vec(), b"after".to_vec())]);
        clone.verify();
    }

    #[test]
    fn test_round_trip_fixed_keys() {
        let mut bn = BasementNode::new();
        for i in 0..20u32 {
            let key = format!("key{:04}", i);
            let payload = vec![i as u8; (i % 5) as usize + 1];
            insert(&mut bn, i, key.as_bytes(), &payload);
        }
        // Push through the tree representation, then back.
        bn.delete_leafentry(3, 7, 4).unwrap();
        bn.prepare_to_serialize();
        let image = serialize(&bn);
        let restored = BasementNode::deserialize_from_rbuf(
            bn.num_klpairs(),
            &image,
            image.len() as u32,
            BASEMENT_FORMAT_VERSION,
        )
        .unwrap();
        restored.verify();
        assert_eq!(collect(&restored), collect(&bn));
        assert_eq!(restored.key_disk_size(), bn.key_disk_size());
        assert_eq!(restored.val_disk_size(), bn.val_disk_size());
    }

    #[test]
    fn test_round_trip_variable_keys() {
        let mut bn = BasementNode::new();
        let keys = [&b"a"[..], b"bb", b"ccc", b"dddd", b"eeeee"];
        for (i, key) in keys.iter().enumerate() {
            insert(&mut bn, i as u32, key, &vec![i as u8; i + 1]);
        }
        bn.prepare_to_serialize();
        let image = serialize(&bn);
        let restored = BasementNode::deserialize_from_rbuf(
            5,
            &image,
            image.len() as u32,
            BASEMENT_FORMAT_VERSION,
        )
        .unwrap();
        restored.verify();
        assert_eq!(collect(&restored), collect(&bn));
    }

    #[test]
    fn test_round_trip_empty() {
        let mut bn = BasementNode::new();
        bn.prepare_to_serialize();
        let image = serialize(&bn);
        let restored =
            BasementNode::deserialize_from_rbuf(0, &image, image.len() as u32, BASEMENT_FORMAT_VERSION)
                .unwrap();
        assert_eq!(restored.num_klpairs(), 0);
        restored.verify();
    }

    #[test]
    fn test_deserialize_rejects_old_version() {
        let err = BasementNode::deserialize_from_rbuf(0, &[], 0, BASEMENT_FORMAT_VERSION - 1)
            .unwrap_err();
        assert_eq!(err, Error::UnsupportedVersion(BASEMENT_FORMAT_VERSION - 1));
    }

    #[test]
    fn test_deserialize_rejects_truncated_image() {
        let mut bn = BasementNode::new();
        insert(&mut bn, 0, b"key", b"value");
        bn.prepare_to_serialize();
        let image = serialize(&bn);
        let truncated = &image[..image.len() - 2];
        let err = BasementNode::deserialize_from_rbuf(
            1,
            truncated,
            truncated.len() as u32,
            BASEMENT_FORMAT_VERSION,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn test_verify_is_idempotent() {
        let mut bn = BasementNode::new();
        for i in 0..8u32 {
            insert(&mut bn, i, format!("k{}", i).as_bytes(), b"v");
        }
        bn.verify();
        let before = collect(&bn);
        bn.verify();
        assert_eq!(collect(&bn), before);
    }
}
