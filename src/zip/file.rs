// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A single central-directory entry.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use crate::zip::records::*;
use crate::zip::{ReadAt, ZipError};

/// One file entry in a ZIP central directory.
///
/// Entries parsed from an archive keep their raw central-directory bytes so
/// that re-serialization is byte-identical; the cache is dropped when the
/// entry is rebased to a new offset.
#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub creator_version: u16,
    pub reader_version: u16,
    pub flags: u16,
    pub method: u16,
    pub modified_time: u16,
    pub modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub offset: u64,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
    pub(crate) raw: Option<Vec<u8>>,
}

impl File {
    /// Whether any field of this entry requires ZIP64 representation.
    pub fn needs_zip64(&self) -> bool {
        self.compressed_size >= U32_MAX
            || self.uncompressed_size >= U32_MAX
            || self.offset >= U32_MAX
    }

    pub(crate) fn invalidate_raw(&mut self) {
        self.raw = None;
    }

    /// The central-directory record for this entry: the cached original
    /// bytes when present, a fresh serialization otherwise.
    pub fn directory_header(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }

        // Strip any stale ZIP64 extra; it is rebuilt below if still needed.
        let mut extra = Vec::with_capacity(self.extra.len());
        let mut rest = self.extra.as_slice();
        while rest.len() >= 4 {
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let size = u16::from_le_bytes([rest[2], rest[3]]) as usize;
            if size > rest.len() - 4 {
                extra.extend_from_slice(rest);
                break;
            }
            if tag != ZIP64_EXTRA_ID {
                extra.extend_from_slice(&rest[..4 + size]);
            }
            rest = &rest[4 + size..];
        }

        let mut reader_version = self.reader_version;
        let (compressed, uncompressed, offset) = if self.needs_zip64() {
            let mut zip64 = Vec::with_capacity(4 + 24);
            zip64.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
            zip64.extend_from_slice(&24u16.to_le_bytes());
            zip64.extend_from_slice(&self.uncompressed_size.to_le_bytes());
            zip64.extend_from_slice(&self.compressed_size.to_le_bytes());
            zip64.extend_from_slice(&self.offset.to_le_bytes());
            extra.extend_from_slice(&zip64);
            reader_version = reader_version.max(ZIP_VERSION_45);
            (U32_MAX as u32, U32_MAX as u32, U32_MAX as u32)
        } else {
            (
                self.compressed_size as u32,
                self.uncompressed_size as u32,
                self.offset as u32,
            )
        };

        let header = ZipCentralHeader {
            signature: U32::new(DIRECTORY_HEADER_SIGNATURE),
            creator_version: U16::new(self.creator_version),
            reader_version: U16::new(reader_version),
            flags: U16::new(self.flags),
            method: U16::new(self.method),
            modified_time: U16::new(self.modified_time),
            modified_date: U16::new(self.modified_date),
            crc32: U32::new(self.crc32),
            compressed_size: U32::new(compressed),
            uncompressed_size: U32::new(uncompressed),
            filename_len: U16::new(self.name.len() as u16),
            extra_len: U16::new(extra.len() as u16),
            comment_len: U16::new(self.comment.len() as u16),
            disk_number: U16::new(0),
            internal_attrs: U16::new(self.internal_attrs),
            external_attrs: U32::new(self.external_attrs),
            offset: U32::new(offset),
        };

        let mut blob =
            Vec::with_capacity(DIRECTORY_HEADER_LEN + self.name.len() + extra.len() + self.comment.len());
        blob.extend_from_slice(header.as_bytes());
        blob.extend_from_slice(self.name.as_bytes());
        blob.extend_from_slice(&extra);
        blob.extend_from_slice(&self.comment);
        blob
    }

    /// Read this entry's local header bytes out of the archive.
    pub fn local_header<R: ReadAt>(&self, reader: &mut R) -> Result<Vec<u8>, ZipError> {
        let mut fixed = [0u8; LOCAL_HEADER_LEN];
        reader.read_exact_at(&mut fixed, self.offset)?;
        let (header, _) = ZipLocalHeader::read_from_prefix(&fixed[..])
            .map_err(|_| ZipError::MalformedArchive("short local header".to_string()))?;
        if header.signature.get() != LOCAL_HEADER_SIGNATURE {
            return Err(ZipError::MalformedArchive(format!(
                "no local header at offset {}",
                self.offset
            )));
        }
        let trailing = header.filename_len.get() as usize + header.extra_len.get() as usize;
        let mut blob = vec![0u8; LOCAL_HEADER_LEN + trailing];
        blob[..LOCAL_HEADER_LEN].copy_from_slice(&fixed);
        reader.read_exact_at(
            &mut blob[LOCAL_HEADER_LEN..],
            self.offset + LOCAL_HEADER_LEN as u64,
        )?;
        Ok(blob)
    }

    /// Read this entry's data descriptor, if flag bit 3 says it has one.
    ///
    /// The descriptor's CRC and sizes are checked against the central
    /// directory record; a mismatch means the archive is inconsistent.
    pub fn data_descriptor<R: ReadAt>(
        &self,
        reader: &mut R,
        data_end: u64,
    ) -> Result<Vec<u8>, ZipError> {
        if self.flags & FLAG_DATA_DESCRIPTOR == 0 {
            return Ok(vec![]);
        }
        let wide = self.compressed_size >= U32_MAX || self.uncompressed_size >= U32_MAX;
        let size_len = if wide { 8 } else { 4 };
        // The signature is optional; probe for it before the CRC.
        let mut probe = [0u8; 4];
        reader.read_exact_at(&mut probe, data_end)?;
        let has_signature = u32::from_le_bytes(probe) == DATA_DESCRIPTOR_SIGNATURE;
        let prefix = if has_signature { 4 } else { 0 };
        let total = prefix + 4 + 2 * size_len;
        let mut blob = vec![0u8; total];
        reader.read_exact_at(&mut blob, data_end)?;

        let crc = u32::from_le_bytes(blob[prefix..prefix + 4].try_into().unwrap());
        let (compressed, uncompressed) = if wide {
            (
                u64::from_le_bytes(blob[prefix + 4..prefix + 12].try_into().unwrap()),
                u64::from_le_bytes(blob[prefix + 12..prefix + 20].try_into().unwrap()),
            )
        } else {
            (
                u32::from_le_bytes(blob[prefix + 4..prefix + 8].try_into().unwrap()) as u64,
                u32::from_le_bytes(blob[prefix + 8..prefix + 12].try_into().unwrap()) as u64,
            )
        };
        if crc != self.crc32 || compressed != self.compressed_size || uncompressed != self.uncompressed_size
        {
            return Err(ZipError::MalformedArchive(format!(
                "data descriptor for '{}' disagrees with the central directory",
                self.name
            )));
        }
        Ok(blob)
    }

    /// Total on-disk footprint: local header, data, and data descriptor.
    pub fn total_size<R: ReadAt>(&self, reader: &mut R) -> Result<u64, ZipError> {
        let local = self.local_header(reader)?;
        let data_end = self.offset + local.len() as u64 + self.compressed_size;
        let descriptor = self.data_descriptor(reader, data_end)?;
        Ok(local.len() as u64 + self.compressed_size + descriptor.len() as u64)
    }
}
