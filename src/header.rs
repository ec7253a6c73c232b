//! The 512-byte `PageDb` header, duplicated across pages 0 and 1.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! offset  size  field
//! 0       8     magic
//! 8       16    database id
//! 24      4     page size
//! 28      4     commit number
//! 32      4     CRC-32 (over the whole 512 bytes with this field zeroed)
//! 36      96    page-manager header (see pagemanager.rs)
//! 132     124   reserved
//! 256     256   opaque "extra" commit data
//! ```
//!
//! The 512-byte image above is then replicated `page_size / 512` times
//! across the physical page, so a partially corrupted page can still be
//! recovered forensically from one of its copies.

use crc32fast::Hasher;

use crate::error::{Result, StoreError};

/// Magic value identifying a page of this storage engine.
pub const MAGIC: u64 = 0x4c41_5443_4854_5245; // "LATCHTRE" as bytes, little-endian

/// Size in bytes of the logical header image (before replication).
pub const HEADER_LEN: usize = 512;

pub(crate) const OFF_MAGIC: usize = 0;
pub(crate) const OFF_DB_ID: usize = 8;
pub(crate) const OFF_PAGE_SIZE: usize = 24;
pub(crate) const OFF_COMMIT_NUMBER: usize = 28;
pub(crate) const OFF_CRC: usize = 32;
pub(crate) const OFF_PAGEMANAGER: usize = 36;
pub(crate) const PAGEMANAGER_LEN: usize = 96;
pub(crate) const OFF_RESERVED: usize = OFF_PAGEMANAGER + PAGEMANAGER_LEN; // 132
pub(crate) const RESERVED_LEN: usize = 124;
pub(crate) const OFF_EXTRA: usize = OFF_RESERVED + RESERVED_LEN; // 256
pub(crate) const EXTRA_LEN: usize = 256;

/// Parsed, owned view of one header copy.
#[derive(Clone)]
pub struct Header {
    pub database_id: [u8; 16],
    pub page_size: u32,
    pub commit_number: u32,
    pub pagemanager: [u8; PAGEMANAGER_LEN],
    pub extra: [u8; EXTRA_LEN],
}

impl Header {
    /// Build a fresh header for a brand new database.
    pub fn fresh(database_id: [u8; 16], page_size: u32) -> Self {
        Header {
            database_id,
            page_size,
            commit_number: 0,
            pagemanager: [0u8; PAGEMANAGER_LEN],
            extra: [0u8; EXTRA_LEN],
        }
    }

    /// Encode this header into a buffer of exactly `page_size` bytes,
    /// computing the CRC and replicating the 512-byte image across the
    /// whole page for forensic recovery.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size as usize {
            return Err(StoreError::invalid("header buffer does not match page size"));
        }
        if buf.len() < HEADER_LEN {
            return Err(StoreError::invalid("page size smaller than header length"));
        }

        let mut image = [0u8; HEADER_LEN];
        image[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
        image[OFF_DB_ID..OFF_DB_ID + 16].copy_from_slice(&self.database_id);
        image[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_le_bytes());
        image[OFF_COMMIT_NUMBER..OFF_COMMIT_NUMBER + 4]
            .copy_from_slice(&self.commit_number.to_le_bytes());
        image[OFF_PAGEMANAGER..OFF_PAGEMANAGER + PAGEMANAGER_LEN].copy_from_slice(&self.pagemanager);
        image[OFF_EXTRA..OFF_EXTRA + EXTRA_LEN].copy_from_slice(&self.extra);
        // OFF_CRC field stays zero while hashing.

        let mut hasher = Hasher::new();
        hasher.update(&image);
        let crc = hasher.finalize();
        image[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());

        for chunk in buf.chunks_mut(HEADER_LEN) {
            let n = chunk.len().min(HEADER_LEN);
            chunk[..n].copy_from_slice(&image[..n]);
        }
        Ok(())
    }

    /// Decode and CRC-verify a header image from a page buffer. Only the
    /// first 512-byte copy is consulted; forensic recovery from the
    /// replicated copies is a repair-tool concern, not something `PageDb`
    /// does on the hot path.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(StoreError::corrupt("page too small to hold a header"));
        }
        let image = &buf[..HEADER_LEN];

        let magic = u64::from_le_bytes(image[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic != MAGIC {
            return Err(StoreError::corrupt("bad header magic"));
        }

        let stored_crc =
            u32::from_le_bytes(image[OFF_CRC..OFF_CRC + 4].try_into().unwrap());
        let mut zeroed = [0u8; HEADER_LEN];
        zeroed.copy_from_slice(image);
        zeroed[OFF_CRC..OFF_CRC + 4].fill(0);
        let mut hasher = Hasher::new();
        hasher.update(&zeroed);
        if hasher.finalize() != stored_crc {
            return Err(StoreError::corrupt("header CRC mismatch"));
        }

        let mut database_id = [0u8; 16];
        database_id.copy_from_slice(&image[OFF_DB_ID..OFF_DB_ID + 16]);
        let page_size =
            u32::from_le_bytes(image[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap());
        let commit_number = u32::from_le_bytes(
            image[OFF_COMMIT_NUMBER..OFF_COMMIT_NUMBER + 4].try_into().unwrap(),
        );
        let mut pagemanager = [0u8; PAGEMANAGER_LEN];
        pagemanager.copy_from_slice(&image[OFF_PAGEMANAGER..OFF_PAGEMANAGER + PAGEMANAGER_LEN]);
        let mut extra = [0u8; EXTRA_LEN];
        extra.copy_from_slice(&image[OFF_EXTRA..OFF_EXTRA + EXTRA_LEN]);

        Ok(Header {
            database_id,
            page_size,
            commit_number,
            pagemanager,
            extra,
        })
    }

    /// Try to decode; return `None` instead of erroring on magic/CRC
    /// failure (used when selecting between the two header slots, where a
    /// torn or never-written slot is expected, not exceptional).
    pub fn try_decode(buf: &[u8]) -> Option<Self> {
        Header::decode(buf).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let h = Header::fresh([7u8; 16], 4096);
        let mut buf = vec![0u8; 4096];
        h.encode(&mut buf).unwrap();
        let back = Header::decode(&buf).unwrap();
        assert_eq!(back.database_id, h.database_id);
        assert_eq!(back.page_size, 4096);
        assert_eq!(back.commit_number, 0);
    }

    #[test]
    fn detects_flipped_bit_corruption() {
        let h = Header::fresh([1u8; 16], 512);
        let mut buf = vec![0u8; 512];
        h.encode(&mut buf).unwrap();
        buf[100] ^= 0xFF;
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn rejects_buffer_with_wrong_page_size() {
        let h = Header::fresh([1u8; 16], 4096);
        let mut buf = vec![0u8; 512];
        assert!(h.encode(&mut buf).is_err());
    }

    #[test]
    fn replicates_header_image_across_page() {
        let h = Header::fresh([9u8; 16], 2048);
        let mut buf = vec![0u8; 2048];
        h.encode(&mut buf).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &buf[HEADER_LEN..HEADER_LEN * 2]);
        assert_eq!(&buf[..HEADER_LEN], &buf[HEADER_LEN * 2..HEADER_LEN * 3]);
    }
}
