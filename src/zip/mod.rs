// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Streaming ZIP central-directory slicer.
//!
//! Signs ZIP-family containers (JAR, APK, VSIX, xpi) by re-emitting the
//! archive with a signature section appended. The reader understands ZIP64
//! end records and per-entry extras; the writer re-serializes directories
//! byte-identically unless an entry was rebased.

mod directory;
mod file;
pub(crate) mod records;

use std::io::Read;

pub use directory::{Directory, find_directory};
pub use file::File;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ZipError {
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// The streaming reader was asked to go backward. Stream mode is a
    /// narrow forward-only adapter, not a buffer.
    #[error("attempted to seek backwards: at {at}, to {to}")]
    StreamNonMonotonic { at: u64, to: u64 },

    /// The archive was not ZIP64 but the requested rewrite no longer fits
    /// in 32-bit fields.
    #[error("file too big for 32-bit ZIP")]
    TooLargeFor32Bit,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Positioned reads against an archive.
///
/// Implemented by real random-access sources and by the forward-only
/// stream shim; `&mut` because the shim advances its position.
pub trait ReadAt {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), ZipError>;
}

impl ReadAt for &[u8] {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), ZipError> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.len() {
            return Err(ZipError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {}..{} past end of {}-byte source", start, end, self.len()),
            )));
        }
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl ReadAt for std::fs::File {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), ZipError> {
        use std::os::unix::fs::FileExt;
        FileExt::read_exact_at(&*self, buf, offset).map_err(ZipError::Io)
    }
}

impl ReadAt for () {
    fn read_exact_at(&mut self, _buf: &mut [u8], _offset: u64) -> Result<(), ZipError> {
        Err(ZipError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "directory has no backing archive",
        )))
    }
}

/// Emulates random access over a strictly-forward stream by skipping ahead;
/// a backward seek is an error.
pub struct StreamReaderAt<R> {
    reader: R,
    pos: u64,
}

impl<R: Read> StreamReaderAt<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, pos: 0 }
    }
}

impl<R: Read> ReadAt for StreamReaderAt<R> {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), ZipError> {
        if offset > self.pos {
            let mut to_skip = offset - self.pos;
            let mut scratch = [0u8; 8192];
            while to_skip > 0 {
                let chunk = to_skip.min(scratch.len() as u64) as usize;
                self.reader.read_exact(&mut scratch[..chunk])?;
                to_skip -= chunk as u64;
            }
            self.pos = offset;
        } else if offset < self.pos {
            return Err(ZipError::StreamNonMonotonic {
                at: self.pos,
                to: offset,
            });
        }
        self.reader.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }
}

/// Read a ZIP from a stream, using a separate copy of the central
/// directory. Contents must be consumed in archive order.
pub fn read_stream<R: Read>(
    reader: R,
    size: u64,
    cd: &[u8],
) -> Result<Directory<StreamReaderAt<R>>, ZipError> {
    Directory::read_with_directory(StreamReaderAt::new(reader), size, cd)
}

#[cfg(test)]
mod tests {
    use super::records::*;
    use super::*;
    use zerocopy::IntoBytes;
    use zerocopy::little_endian::{U16, U32, U64};

    /// Build a stored-method archive and return (archive bytes, cd offset).
    fn stored_zip(entries: &[(&str, &[u8])]) -> (Vec<u8>, u64) {
        let mut out = vec![];
        let mut dir = Directory::new();
        for (name, contents) in entries {
            dir.add_file_data(name, contents, &mut out).unwrap();
        }
        let cd_offset = out.len() as u64;
        dir.write_directory_all(&mut out, false)
            .unwrap();
        (out, cd_offset)
    }

    #[test]
    fn read_reports_all_entries() {
        let (zip, cd_offset) = stored_zip(&[("a.txt", b"alpha"), ("b/b.txt", b"bravo")]);
        let size = zip.len() as u64;
        let dir = Directory::read(zip.as_slice(), size).unwrap();
        assert_eq!(dir.files.len(), 2);
        assert_eq!(dir.files[0].name, "a.txt");
        assert_eq!(dir.files[1].name, "b/b.txt");
        assert_eq!(dir.files[0].uncompressed_size, 5);
        assert!(dir.files[0].offset < dir.files[1].offset);
        assert_eq!(dir.dir_loc, cd_offset);
        assert_eq!(dir.size, size);
    }

    #[test]
    fn rewrite_is_byte_identical() {
        let (zip, cd_offset) = stored_zip(&[("one", b"1"), ("two", b"22"), ("three", b"333")]);
        let size = zip.len() as u64;
        let dir = Directory::read(zip.as_slice(), size).unwrap();
        let mut rewritten = vec![];
        dir.write_directory_all(&mut rewritten, false)
            .unwrap();
        assert_eq!(&zip[cd_offset as usize..], rewritten.as_slice());
    }

    #[test]
    fn truncate_drops_trailing_entries() {
        let (zip, _) = stored_zip(&[("keep", b"kept data"), ("drop", b"dropped")]);
        let size = zip.len() as u64;
        let mut dir = Directory::read(zip.as_slice(), size).unwrap();

        let mut body = vec![];
        let mut cd = vec![];
        dir.truncate(1, Some(&mut body), &mut cd).unwrap();

        let mut truncated = body.clone();
        truncated.extend_from_slice(&cd);
        let truncated_size = truncated.len() as u64;
        let reread = Directory::read(truncated.as_slice(), truncated_size).unwrap();
        assert_eq!(reread.files.len(), 1);
        assert_eq!(reread.files[0].name, "keep");
        assert_eq!(reread.files[0].crc32, dir.files[0].crc32);
        assert_eq!(reread.files[0].uncompressed_size, 9);
    }

    #[test]
    fn forced_zip64_emits_45_and_reads_back() {
        let (zip, _) = stored_zip(&[("entry", b"data")]);
        let size = zip.len() as u64;
        let dir = Directory::read(zip.as_slice(), size).unwrap();

        let mut body = zip[..dir.dir_loc as usize].to_vec();
        dir.write_directory_all(&mut body, true)
            .unwrap();

        // The ZIP64 end record must be present with reader version 4.5.
        let end64_at = body
            .windows(4)
            .position(|w| w == DIRECTORY64_END_SIGNATURE.to_le_bytes())
            .expect("ZIP64 end record missing");
        let reader_version =
            u16::from_le_bytes([body[end64_at + 14], body[end64_at + 15]]);
        assert_eq!(reader_version, 0x2D);

        let new_size = body.len() as u64;
        let reread = Directory::read(body.as_slice(), new_size).unwrap();
        assert!(reread.is_zip64());
        assert_eq!(reread.files.len(), 1);
        assert_eq!(reread.files[0].name, "entry");
    }

    /// A central directory whose entry claims a 5 GiB uncompressed size via
    /// the 0x0001 extra; the base fields hold sentinels.
    fn zip64_cd_blob(uncompressed: u64, compressed: u64, offset: u64) -> Vec<u8> {
        let name = b"big.bin";
        let mut extra = vec![];
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&24u16.to_le_bytes());
        extra.extend_from_slice(&uncompressed.to_le_bytes());
        extra.extend_from_slice(&compressed.to_le_bytes());
        extra.extend_from_slice(&offset.to_le_bytes());
        let header = ZipCentralHeader {
            signature: U32::new(DIRECTORY_HEADER_SIGNATURE),
            creator_version: U16::new(ZIP_VERSION_45),
            reader_version: U16::new(ZIP_VERSION_45),
            flags: U16::new(0),
            method: U16::new(0),
            modified_time: U16::new(0),
            modified_date: U16::new(0),
            crc32: U32::new(0xDEADBEEF),
            compressed_size: U32::new(U32_MAX as u32),
            uncompressed_size: U32::new(U32_MAX as u32),
            filename_len: U16::new(name.len() as u16),
            extra_len: U16::new(extra.len() as u16),
            comment_len: U16::new(0),
            disk_number: U16::new(0),
            internal_attrs: U16::new(0),
            external_attrs: U32::new(0),
            offset: U32::new(U32_MAX as u32),
        };
        let mut cd = vec![];
        cd.extend_from_slice(header.as_bytes());
        cd.extend_from_slice(name);
        cd.extend_from_slice(&extra);
        cd
    }

    #[test]
    fn zip64_extra_parsed_and_reemitted() {
        let five_gib: u64 = 5 * 1024 * 1024 * 1024;
        let mut cd = zip64_cd_blob(five_gib, five_gib, 0);
        let cd_len = cd.len() as u64;
        let cd_offset = five_gib + 1000;

        let end64 = Zip64EndRecord {
            signature: U32::new(DIRECTORY64_END_SIGNATURE),
            record_size: U64::new((DIRECTORY64_END_LEN - 12) as u64),
            creator_version: U16::new(ZIP_VERSION_45),
            reader_version: U16::new(ZIP_VERSION_45),
            disk_number: U32::new(0),
            disk_cd: U32::new(0),
            disk_cd_count: U64::new(1),
            total_cd_count: U64::new(1),
            cd_size: U64::new(cd_len),
            cd_offset: U64::new(cd_offset),
        };
        cd.extend_from_slice(end64.as_bytes());
        let loc64 = Zip64Locator {
            signature: U32::new(DIRECTORY64_LOC_SIGNATURE),
            disk_cd: U32::new(0),
            offset: U64::new(cd_offset + cd_len),
            disk_count: U32::new(1),
        };
        cd.extend_from_slice(loc64.as_bytes());
        let end = ZipEndRecord {
            signature: U32::new(DIRECTORY_END_SIGNATURE),
            disk_number: U16::new(0),
            disk_cd: U16::new(0),
            disk_cd_count: U16::new(U16_MAX as u16),
            total_cd_count: U16::new(U16_MAX as u16),
            cd_size: U32::new(U32_MAX as u32),
            cd_offset: U32::new(U32_MAX as u32),
            comment_len: U16::new(0),
        };
        cd.extend_from_slice(end.as_bytes());

        let size = cd_offset + cd.len() as u64;
        let dir = Directory::read_with_directory((), size, &cd).unwrap();
        assert!(dir.is_zip64());
        assert_eq!(dir.files.len(), 1);
        assert_eq!(dir.files[0].uncompressed_size, five_gib);
        assert_eq!(dir.files[0].offset, 0);

        // Even without force, the rewrite must stay ZIP64: the directory
        // offset exceeds 32 bits.
        let mut rewritten = vec![];
        dir.write_directory_all(&mut rewritten, false)
            .unwrap();
        assert_eq!(rewritten, cd);
    }

    #[test]
    fn missing_zip64_extra_is_malformed() {
        let name = b"bad";
        let header = ZipCentralHeader {
            signature: U32::new(DIRECTORY_HEADER_SIGNATURE),
            creator_version: U16::new(ZIP_VERSION_45),
            reader_version: U16::new(ZIP_VERSION_45),
            flags: U16::new(0),
            method: U16::new(0),
            modified_time: U16::new(0),
            modified_date: U16::new(0),
            crc32: U32::new(0),
            compressed_size: U32::new(U32_MAX as u32),
            uncompressed_size: U32::new(U32_MAX as u32),
            filename_len: U16::new(name.len() as u16),
            extra_len: U16::new(0),
            comment_len: U16::new(0),
            disk_number: U16::new(0),
            internal_attrs: U16::new(0),
            external_attrs: U32::new(0),
            offset: U32::new(U32_MAX as u32),
        };
        let mut cd = vec![];
        cd.extend_from_slice(header.as_bytes());
        cd.extend_from_slice(name);
        let end = ZipEndRecord {
            signature: U32::new(DIRECTORY_END_SIGNATURE),
            ..Default::default()
        };
        cd.extend_from_slice(end.as_bytes());

        let error = Directory::read_with_directory((), 10_000, &cd).unwrap_err();
        assert!(matches!(error, ZipError::MalformedArchive(_)), "{error}");
    }

    #[test]
    fn missing_zip64_locator_is_malformed() {
        let (mut zip, _) = stored_zip(&[("x", b"y")]);
        // Poison the EOCD entry count with the sentinel; there is no ZIP64
        // locator in front of it, which must be rejected.
        let eocd_at = zip
            .windows(4)
            .rposition(|w| w == DIRECTORY_END_SIGNATURE.to_le_bytes())
            .unwrap();
        zip[eocd_at + 10] = 0xff;
        zip[eocd_at + 11] = 0xff;
        zip[eocd_at + 8] = 0xff;
        zip[eocd_at + 9] = 0xff;
        let size = zip.len() as u64;
        let error = Directory::read(zip.as_slice(), size).unwrap_err();
        assert!(
            error.to_string().contains("ZIP64 locator"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn stream_reader_rejects_backward_seek() {
        let data = vec![7u8; 64];
        let mut shim = StreamReaderAt::new(data.as_slice());
        let mut buf = [0u8; 8];
        shim.read_exact_at(&mut buf, 16).unwrap();
        let error = shim.read_exact_at(&mut buf, 8).unwrap_err();
        assert!(matches!(
            error,
            ZipError::StreamNonMonotonic { at: 24, to: 8 }
        ));
    }

    #[test]
    fn stream_mode_reads_entries_in_order() {
        let (zip, cd_offset) = stored_zip(&[("first", b"first contents"), ("second", b"2nd")]);
        let size = zip.len() as u64;
        let cd = zip[cd_offset as usize..].to_vec();

        let mut out = vec![];
        let mut dir = read_stream(zip.as_slice(), size, &cd).unwrap();
        let mut rebuilt = Directory::new();
        for i in 0..dir.files.len() {
            rebuilt.add_file_from(&mut dir, i, &mut out).unwrap();
        }
        rebuilt
            .write_directory_all(&mut out, false)
            .unwrap();
        assert_eq!(out, zip);
    }

    #[test]
    fn rebased_entry_is_reserialized() {
        let (zip, _) = stored_zip(&[("a", b"AA"), ("b", b"BB")]);
        let size = zip.len() as u64;
        let mut dir = Directory::read(zip.as_slice(), size).unwrap();

        // Copy only the second entry into a new archive; its offset moves
        // to zero, which must invalidate the cached raw header.
        let mut out = vec![];
        let mut rebuilt = Directory::new();
        let copied = rebuilt.add_file_from(&mut dir, 1, &mut out).unwrap();
        assert_eq!(copied.offset, 0);
        rebuilt
            .write_directory_all(&mut out, false)
            .unwrap();

        let out_size = out.len() as u64;
        let reread = Directory::read(out.as_slice(), out_size).unwrap();
        assert_eq!(reread.files.len(), 1);
        assert_eq!(reread.files[0].name, "b");
        assert_eq!(reread.files[0].offset, 0);
    }
}
