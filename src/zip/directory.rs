// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Central-directory reading and streaming re-emission.

use std::io::Write;

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, IntoBytes};

use crate::zip::file::File;
use crate::zip::records::*;
use crate::zip::{ReadAt, ZipError};

/// A parsed ZIP central directory bound to its archive reader.
///
/// Invariants maintained throughout: entry offsets strictly increase, the
/// ZIP64 extra is present exactly when a size or offset exceeds the 32-bit
/// limits, and `dir_loc` plus the serialized directory length equals the
/// archive size.
pub struct Directory<R> {
    pub files: Vec<File>,
    /// Total archive size in bytes.
    pub size: u64,
    /// Offset where the central directory starts; equivalently, where the
    /// next appended file's local header would land.
    pub dir_loc: u64,
    reader: R,
    end64: Option<Zip64EndRecord>,
    loc64: Option<Zip64Locator>,
    end: ZipEndRecord,
}

/// Locate the offset of the central directory.
///
/// The end-of-central-directory record is parsed backward from the end of
/// the archive; sentinel values route through the ZIP64 locator.
pub fn find_directory<R: ReadAt>(reader: &mut R, size: u64) -> Result<u64, ZipError> {
    let tail_len = (DIRECTORY_END_LEN + DIRECTORY64_LOC_LEN) as u64;
    if size < tail_len {
        return Err(ZipError::MalformedArchive(
            "archive too small to hold an end-of-directory record".to_string(),
        ));
    }
    let mut tail = [0u8; DIRECTORY_END_LEN + DIRECTORY64_LOC_LEN];
    reader.read_exact_at(&mut tail, size - tail_len)?;
    let (loc64, rest) = Zip64Locator::read_from_prefix(&tail[..])
        .map_err(|_| ZipError::MalformedArchive("short end record".to_string()))?;
    let (end, _) = ZipEndRecord::read_from_prefix(rest)
        .map_err(|_| ZipError::MalformedArchive("short end record".to_string()))?;
    if end.signature.get() != DIRECTORY_END_SIGNATURE {
        return Err(ZipError::MalformedArchive(
            "zip central directory not found".to_string(),
        ));
    }
    if u64::from(end.total_cd_count.get()) == U16_MAX
        || u64::from(end.cd_size.get()) == U32_MAX
        || u64::from(end.cd_offset.get()) == U32_MAX
    {
        if loc64.signature.get() != DIRECTORY64_LOC_SIGNATURE {
            return Err(ZipError::MalformedArchive(
                "expected ZIP64 locator".to_string(),
            ));
        }
        let mut end64_buf = [0u8; DIRECTORY64_END_LEN];
        reader.read_exact_at(&mut end64_buf, loc64.offset.get())?;
        let (end64, _) = Zip64EndRecord::read_from_prefix(&end64_buf[..])
            .map_err(|_| ZipError::MalformedArchive("short ZIP64 end record".to_string()))?;
        if end64.signature.get() != DIRECTORY64_END_SIGNATURE {
            return Err(ZipError::MalformedArchive(
                "zip central directory not found".to_string(),
            ));
        }
        return Ok(end64.cd_offset.get());
    }
    Ok(u64::from(end.cd_offset.get()))
}

impl Directory<()> {
    /// An empty directory for assembling a new archive. `dir_loc` tracks
    /// where the next appended file lands.
    pub fn new() -> Self {
        Directory {
            files: vec![],
            size: 0,
            dir_loc: 0,
            reader: (),
            end64: None,
            loc64: None,
            end: ZipEndRecord {
                signature: U32::new(DIRECTORY_END_SIGNATURE),
                ..Default::default()
            },
        }
    }
}

impl Default for Directory<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: ReadAt> Directory<R> {
    /// Read a ZIP central directory from a random-access source.
    pub fn read(mut reader: R, size: u64) -> Result<Self, ZipError> {
        let loc = find_directory(&mut reader, size)?;
        let mut cd = vec![0u8; (size - loc) as usize];
        reader.read_exact_at(&mut cd, loc)?;
        Self::read_with_directory(reader, size, &cd)
    }

    /// Read a ZIP whose central directory bytes are supplied out of band.
    ///
    /// This is how streaming callers work: the body is read forward-only
    /// while the directory, fetched separately, drives interpretation.
    pub fn read_with_directory(reader: R, size: u64, cd: &[u8]) -> Result<Self, ZipError> {
        let dir_loc = size - cd.len() as u64;
        let mut files = vec![];
        let mut cd = cd;
        loop {
            if cd.len() < 4 || u32::from_le_bytes(cd[..4].try_into().unwrap()) != DIRECTORY_HEADER_SIGNATURE {
                break;
            }
            let (hdr, _) = ZipCentralHeader::read_from_prefix(cd)
                .map_err(|_| ZipError::MalformedArchive("short directory header".to_string()))?;
            let filename_len = hdr.filename_len.get() as usize;
            let extra_len = hdr.extra_len.get() as usize;
            let comment_len = hdr.comment_len.get() as usize;
            let record_len = DIRECTORY_HEADER_LEN + filename_len + extra_len + comment_len;
            if cd.len() < record_len {
                return Err(ZipError::MalformedArchive(
                    "directory record extends past the directory".to_string(),
                ));
            }
            let raw = cd[..record_len].to_vec();
            let name = String::from_utf8_lossy(&cd[DIRECTORY_HEADER_LEN..DIRECTORY_HEADER_LEN + filename_len])
                .into_owned();
            let extra =
                cd[DIRECTORY_HEADER_LEN + filename_len..DIRECTORY_HEADER_LEN + filename_len + extra_len].to_vec();
            let comment = cd[DIRECTORY_HEADER_LEN + filename_len + extra_len..record_len].to_vec();
            cd = &cd[record_len..];

            let mut file = File {
                name,
                creator_version: hdr.creator_version.get(),
                reader_version: hdr.reader_version.get(),
                flags: hdr.flags.get(),
                method: hdr.method.get(),
                modified_time: hdr.modified_time.get(),
                modified_date: hdr.modified_date.get(),
                crc32: hdr.crc32.get(),
                compressed_size: u64::from(hdr.compressed_size.get()),
                uncompressed_size: u64::from(hdr.uncompressed_size.get()),
                internal_attrs: hdr.internal_attrs.get(),
                external_attrs: hdr.external_attrs.get(),
                offset: u64::from(hdr.offset.get()),
                extra,
                comment,
                raw: Some(raw),
            };

            let mut need_usize = file.uncompressed_size == U32_MAX;
            let mut need_csize = file.compressed_size == U32_MAX;
            let mut need_offset = file.offset == U32_MAX;
            let mut extra = file.extra.as_slice();
            while extra.len() >= 4 {
                let tag = u16::from_le_bytes([extra[0], extra[1]]);
                let size = u16::from_le_bytes([extra[2], extra[3]]) as usize;
                if size > extra.len() - 4 {
                    break;
                }
                if tag == ZIP64_EXTRA_ID {
                    // Fields appear in a fixed order, but only for those
                    // that were sentinel in the base record.
                    let e = &extra[4..4 + size];
                    if need_usize && size >= 8 {
                        file.uncompressed_size = u64::from_le_bytes(e[..8].try_into().unwrap());
                        need_usize = false;
                    }
                    if need_csize && size >= 16 {
                        file.compressed_size = u64::from_le_bytes(e[8..16].try_into().unwrap());
                        need_csize = false;
                    }
                    if need_offset && size >= 24 {
                        file.offset = u64::from_le_bytes(e[16..24].try_into().unwrap());
                        need_offset = false;
                    }
                    break;
                }
                extra = &extra[4 + size..];
            }
            if need_csize || need_offset {
                return Err(ZipError::MalformedArchive(
                    "missing ZIP64 header".to_string(),
                ));
            }
            files.push(file);
        }

        let mut end64 = None;
        let mut loc64 = None;
        let end;
        if cd.len() >= 4 {
            match u32::from_le_bytes(cd[..4].try_into().unwrap()) {
                DIRECTORY64_END_SIGNATURE => {
                    let (parsed64, rest) = Zip64EndRecord::read_from_prefix(cd).map_err(|_| {
                        ZipError::MalformedArchive("short ZIP64 end record".to_string())
                    })?;
                    let (parsed_loc, rest) = Zip64Locator::read_from_prefix(rest).map_err(|_| {
                        ZipError::MalformedArchive("short ZIP64 locator".to_string())
                    })?;
                    let (parsed_end, _) = ZipEndRecord::read_from_prefix(rest).map_err(|_| {
                        ZipError::MalformedArchive("short end record".to_string())
                    })?;
                    end64 = Some(parsed64);
                    loc64 = Some(parsed_loc);
                    end = parsed_end;
                }
                DIRECTORY_END_SIGNATURE => {
                    let (parsed_end, _) = ZipEndRecord::read_from_prefix(cd).map_err(|_| {
                        ZipError::MalformedArchive("short end record".to_string())
                    })?;
                    end = parsed_end;
                }
                _ => {
                    return Err(ZipError::MalformedArchive(
                        "expected end record".to_string(),
                    ));
                }
            }
        } else {
            return Err(ZipError::MalformedArchive(
                "expected end record".to_string(),
            ));
        }

        Ok(Directory {
            files,
            size,
            dir_loc,
            reader,
            end64,
            loc64,
            end,
        })
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Serialize the archive up to, but not including, entry `n`.
    ///
    /// Entry bodies (local header, data, descriptor) go to `body` when
    /// given; the truncated central directory and end records go to `dir`.
    pub fn truncate(
        &mut self,
        n: usize,
        mut body: Option<&mut dyn Write>,
        dir: &mut dyn Write,
    ) -> Result<(), ZipError> {
        if n > self.files.len() {
            return Err(ZipError::MalformedArchive(format!(
                "cannot truncate to {n} entries; archive has {}",
                self.files.len()
            )));
        }
        if let Some(body) = body.as_mut() {
            for i in 0..n {
                let file = self.files[i].clone();
                let total = file.total_size(&mut self.reader)?;
                copy_range(&mut self.reader, file.offset, total, &mut **body)?;
            }
        }

        let cd_offset = if n < self.files.len() {
            self.files[n].offset
        } else {
            self.dir_loc
        };
        let mut size = 0u64;
        for file in &self.files[..n] {
            let blob = file.directory_header();
            dir.write_all(&blob)?;
            size += blob.len() as u64;
        }

        if let Some(orig64) = &self.end64 {
            let mut end64 = *orig64;
            end64.disk_cd_count = U64::new(n as u64);
            end64.total_cd_count = U64::new(n as u64);
            end64.cd_size = U64::new(size);
            end64.cd_offset = U64::new(cd_offset);
            dir.write_all(end64.as_bytes())?;
            let mut loc = self.loc64.unwrap_or(Zip64Locator {
                signature: U32::new(DIRECTORY64_LOC_SIGNATURE),
                disk_cd: U32::new(0),
                offset: U64::new(0),
                disk_count: U32::new(1),
            });
            loc.offset = U64::new(cd_offset + size);
            dir.write_all(loc.as_bytes())?;
            let mut end = self.end;
            end.comment_len = U16::new(0);
            dir.write_all(end.as_bytes())?;
        } else {
            if cd_offset >= U32_MAX || n as u64 >= U16_MAX {
                return Err(ZipError::TooLargeFor32Bit);
            }
            let mut end = self.end;
            end.disk_cd_count = U16::new(n as u16);
            end.total_cd_count = U16::new(n as u16);
            end.cd_size = U32::new(size as u32);
            end.cd_offset = U32::new(cd_offset as u32);
            end.comment_len = U16::new(0);
            dir.write_all(end.as_bytes())?;
        }
        Ok(())
    }

    /// Copy entry `index` of `src` (local header, data, descriptor) to `w`
    /// and append it to this directory at the current load position.
    pub fn add_file_from<R2: ReadAt>(
        &mut self,
        src: &mut Directory<R2>,
        index: usize,
        w: &mut dyn Write,
    ) -> Result<&File, ZipError> {
        let file = src.files[index].clone();
        let local = file.local_header(&mut src.reader)?;
        w.write_all(&local)?;
        copy_range(
            &mut src.reader,
            file.offset + local.len() as u64,
            file.compressed_size,
            w,
        )?;
        let data_end = file.offset + local.len() as u64 + file.compressed_size;
        let descriptor = file.data_descriptor(&mut src.reader, data_end)?;
        w.write_all(&descriptor)?;
        let total = local.len() as u64 + file.compressed_size + descriptor.len() as u64;
        Ok(self.add_file(file, total))
    }
}

impl<R> Directory<R> {
    /// Append an entry whose contents are already located after the last
    /// added file. `total_size` is the entry's on-disk footprint (local
    /// header + data + descriptor).
    ///
    /// If the entry's stored offset does not match the load position its
    /// cached raw header is dropped so it will be re-serialized.
    pub fn add_file(&mut self, mut file: File, total_size: u64) -> &File {
        let offset = self.dir_loc;
        if file.offset != offset {
            file.invalidate_raw();
            file.offset = offset;
        }
        self.dir_loc += total_size;
        self.size = self.dir_loc;
        self.files.push(file);
        self.files.last().expect("just pushed")
    }

    /// Write a stored (uncompressed) entry to `w` and append it.
    pub fn add_file_data(
        &mut self,
        name: &str,
        contents: &[u8],
        w: &mut dyn Write,
    ) -> Result<&File, ZipError> {
        if contents.len() as u64 >= U32_MAX {
            // Appended signature sections are small; a 4 GiB one is a bug.
            return Err(ZipError::TooLargeFor32Bit);
        }
        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(contents);
            hasher.finalize()
        };
        let wide = self.dir_loc >= U32_MAX;
        let header = ZipLocalHeader {
            signature: U32::new(LOCAL_HEADER_SIGNATURE),
            reader_version: U16::new(if wide { ZIP_VERSION_45 } else { ZIP_VERSION_20 }),
            flags: U16::new(0),
            method: U16::new(0),
            modified_time: U16::new(0),
            modified_date: U16::new(0),
            crc32: U32::new(crc),
            compressed_size: U32::new(contents.len() as u32),
            uncompressed_size: U32::new(contents.len() as u32),
            filename_len: U16::new(name.len() as u16),
            extra_len: U16::new(0),
        };
        w.write_all(header.as_bytes())?;
        w.write_all(name.as_bytes())?;
        w.write_all(contents)?;
        let total = LOCAL_HEADER_LEN as u64 + name.len() as u64 + contents.len() as u64;
        let file = File {
            name: name.to_string(),
            creator_version: ZIP_VERSION_20,
            reader_version: if wide { ZIP_VERSION_45 } else { ZIP_VERSION_20 },
            flags: 0,
            method: 0,
            modified_time: 0,
            modified_date: 0,
            crc32: crc,
            compressed_size: contents.len() as u64,
            uncompressed_size: contents.len() as u64,
            internal_attrs: 0,
            external_attrs: 0,
            offset: self.dir_loc,
            extra: vec![],
            comment: vec![],
            raw: None,
        };
        Ok(self.add_file(file, total))
    }

    /// Re-emit the central directory. Entry records go to `wcd`, the end
    /// markers to `weod` (they may be the same writer).
    ///
    /// ZIP64 end records are chosen when the entry count, directory size,
    /// or directory offset exceed the 32-bit format's limits, or when
    /// `force_zip64` is set. The version-needed field is the maximum of
    /// the entries' reader versions and 4.5 when ZIP64 is emitted.
    pub fn write_directory(
        &self,
        wcd: &mut dyn Write,
        weod: &mut dyn Write,
        force_zip64: bool,
    ) -> Result<(), ZipError> {
        let mut count = 0u64;
        let mut size = 0u64;
        let mut min_version = ZIP_VERSION_20;
        for file in &self.files {
            min_version = min_version.max(file.reader_version);
            let blob = file.directory_header();
            wcd.write_all(&blob)?;
            count += 1;
            size += blob.len() as u64;
        }
        weod.write_all(&self.end_records(count, size, min_version, force_zip64))?;
        Ok(())
    }

    /// [`Directory::write_directory`] with entry records and end markers
    /// interleaved into a single writer.
    pub fn write_directory_all(
        &self,
        w: &mut dyn Write,
        force_zip64: bool,
    ) -> Result<(), ZipError> {
        let mut count = 0u64;
        let mut size = 0u64;
        let mut min_version = ZIP_VERSION_20;
        for file in &self.files {
            min_version = min_version.max(file.reader_version);
            let blob = file.directory_header();
            w.write_all(&blob)?;
            count += 1;
            size += blob.len() as u64;
        }
        w.write_all(&self.end_records(count, size, min_version, force_zip64))?;
        Ok(())
    }

    fn end_records(&self, count: u64, size: u64, min_version: u16, force_zip64: bool) -> Vec<u8> {
        let cd_offset = self.dir_loc;
        let zip64 =
            count >= U16_MAX || size >= U32_MAX || cd_offset >= U32_MAX || force_zip64;
        let mut out = vec![];
        if zip64 {
            let min_version = min_version.max(ZIP_VERSION_45);
            let end64 = Zip64EndRecord {
                signature: U32::new(DIRECTORY64_END_SIGNATURE),
                record_size: U64::new((DIRECTORY64_END_LEN - 12) as u64),
                creator_version: U16::new(ZIP_VERSION_45),
                reader_version: U16::new(min_version),
                disk_number: U32::new(0),
                disk_cd: U32::new(0),
                disk_cd_count: U64::new(count),
                total_cd_count: U64::new(count),
                cd_size: U64::new(size),
                cd_offset: U64::new(cd_offset),
            };
            out.extend_from_slice(end64.as_bytes());
            let loc64 = Zip64Locator {
                signature: U32::new(DIRECTORY64_LOC_SIGNATURE),
                disk_cd: U32::new(0),
                offset: U64::new(cd_offset + size),
                disk_count: U32::new(1),
            };
            out.extend_from_slice(loc64.as_bytes());
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
            out.extend_from_slice(end.as_bytes());
        } else {
            let end = ZipEndRecord {
                signature: U32::new(DIRECTORY_END_SIGNATURE),
                disk_number: U16::new(0),
                disk_cd: U16::new(0),
                disk_cd_count: U16::new(count as u16),
                total_cd_count: U16::new(count as u16),
                cd_size: U32::new(size as u32),
                cd_offset: U32::new(cd_offset as u32),
                comment_len: U16::new(0),
            };
            out.extend_from_slice(end.as_bytes());
        }
        out
    }

    /// Whether the source archive used ZIP64 end records.
    pub fn is_zip64(&self) -> bool {
        self.end64.is_some()
    }
}

fn copy_range<R: ReadAt>(
    reader: &mut R,
    mut offset: u64,
    mut remaining: u64,
    w: &mut dyn Write,
) -> Result<(), ZipError> {
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        reader.read_exact_at(&mut buf[..chunk], offset)?;
        w.write_all(&buf[..chunk])?;
        offset += chunk as u64;
        remaining -= chunk as u64;
    }
    Ok(())
}
