//! Record layout
//!
//! Every archived object is stored as one record:
//! ```text
//! +--------+--------+--------+-------+-------+------+------+--------+----------+
//! | size   | date   | mode   | uid   | gid   | comp | encr | crc    | reserved |  32 bytes
//! | u64    | u32    | u16    | u16   | u16   | u8   | u8   | u32    | u64      |
//! +--------+--------+--------+-------+-------+------+------+--------+----------+
//! | payload (exactly `size` bytes)                                             |
//! +----------------------------------------------------------------------------+
//! ```
//! Fields use the host's native byte order; archives are not portable across
//! hosts of different endianness.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use nix::unistd::{getgid, getuid};
use packstore_common::checksum;

/// Record header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Metadata captured at upload time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordMeta {
    /// Upload time (unix seconds)
    pub date: u32,
    /// Permission bits of the upload
    pub mode: u16,
    /// Owner of the serving process
    pub uid: u16,
    pub gid: u16,
}

impl RecordMeta {
    /// Metadata for an upload happening now, owned by this process
    #[must_use]
    pub fn now(mode: u32) -> Self {
        Self {
            date: u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX),
            mode: (mode & 0o7777) as u16,
            uid: u16::try_from(getuid().as_raw()).unwrap_or(u16::MAX),
            gid: u16::try_from(getgid().as_raw()).unwrap_or(u16::MAX),
        }
    }
}

/// Fixed-width record header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Payload length
    pub size: u64,
    pub date: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    /// Compression flag, always 0
    pub comp: u8,
    /// Encryption flag, always 0
    pub encr: u8,
    /// CRC-32 of the payload, 0 when integrity is disabled
    pub crc: u32,
    pub reserved: u64,
}

impl RecordHeader {
    /// Create a header for a payload of `size` bytes
    #[must_use]
    pub const fn new(size: u64, meta: &RecordMeta, crc: u32) -> Self {
        Self {
            size,
            date: meta.date,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            comp: 0,
            encr: 0,
            crc,
            reserved: 0,
        }
    }

    /// Serialize to bytes
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.size.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.date.to_ne_bytes());
        buf[12..14].copy_from_slice(&self.mode.to_ne_bytes());
        buf[14..16].copy_from_slice(&self.uid.to_ne_bytes());
        buf[16..18].copy_from_slice(&self.gid.to_ne_bytes());
        buf[18] = self.comp;
        buf[19] = self.encr;
        buf[20..24].copy_from_slice(&self.crc.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.reserved.to_ne_bytes());
        buf
    }

    /// Parse from bytes (only the first [`HEADER_SIZE`] bytes are read)
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        let Some(raw) = data.first_chunk::<HEADER_SIZE>() else {
            return Err(StoreError::MalformedRecord(format!(
                "record header needs {HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        };

        let header = Self {
            size: u64::from_ne_bytes(field(raw, 0)),
            date: u32::from_ne_bytes(field(raw, 8)),
            mode: u16::from_ne_bytes(field(raw, 12)),
            uid: u16::from_ne_bytes(field(raw, 14)),
            gid: u16::from_ne_bytes(field(raw, 16)),
            comp: raw[18],
            encr: raw[19],
            crc: u32::from_ne_bytes(field(raw, 20)),
            reserved: u64::from_ne_bytes(field(raw, 24)),
        };

        if header.comp != 0 || header.encr != 0 {
            return Err(StoreError::UnsupportedRecord(format!(
                "compression={} encryption={}",
                header.comp, header.encr
            )));
        }

        Ok(header)
    }

    /// Verify a payload against the stored checksum.
    /// Records written without integrity (`crc == 0`) always pass.
    pub fn verify(&self, payload: &[u8]) -> StoreResult<()> {
        if self.crc == 0 {
            return Ok(());
        }
        let actual = checksum(payload);
        if actual != self.crc {
            return Err(StoreError::ChecksumMismatch {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}

fn field<const N: usize>(raw: &[u8; HEADER_SIZE], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&raw[offset..offset + N]);
    out
}

/// Encode a payload into a record (header followed by payload)
#[must_use]
pub fn encode_record(payload: &[u8], meta: &RecordMeta, crc: u32) -> Vec<u8> {
    let header = RecordHeader::new(payload.len() as u64, meta, crc);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a record into its header and a view over the payload
pub fn decode_record(data: &[u8]) -> StoreResult<(RecordHeader, &[u8])> {
    let header = RecordHeader::decode(data)?;
    let body = &data[HEADER_SIZE..];
    if body.len() as u64 != header.size {
        return Err(StoreError::MalformedRecord(format!(
            "header declares {} payload bytes, record holds {}",
            header.size,
            body.len()
        )));
    }
    Ok((header, body))
}
