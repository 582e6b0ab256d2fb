// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! On-disk ZIP record layouts.
//!
//! All multi-byte fields are little-endian per the ZIP application note;
//! the structs are byte-for-byte wire images.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const DIRECTORY_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const DIRECTORY_END_SIGNATURE: u32 = 0x0605_4b50;
pub const DIRECTORY64_END_SIGNATURE: u32 = 0x0606_4b50;
pub const DIRECTORY64_LOC_SIGNATURE: u32 = 0x0706_4b50;
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

pub const LOCAL_HEADER_LEN: usize = 30;
pub const DIRECTORY_HEADER_LEN: usize = 46;
pub const DIRECTORY_END_LEN: usize = 22;
pub const DIRECTORY64_LOC_LEN: usize = 20;
pub const DIRECTORY64_END_LEN: usize = 56;

pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Version-needed values (major * 10 + minor).
pub const ZIP_VERSION_20: u16 = 20;
pub const ZIP_VERSION_45: u16 = 45;

pub const U16_MAX: u64 = 0xffff;
pub const U32_MAX: u64 = 0xffff_ffff;

/// Flag bit 3: sizes and CRC live in a trailing data descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x8;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ZipLocalHeader {
    pub signature: U32,
    pub reader_version: U16,
    pub flags: U16,
    pub method: U16,
    pub modified_time: U16,
    pub modified_date: U16,
    pub crc32: U32,
    pub compressed_size: U32,
    pub uncompressed_size: U32,
    pub filename_len: U16,
    pub extra_len: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ZipCentralHeader {
    pub signature: U32,
    pub creator_version: U16,
    pub reader_version: U16,
    pub flags: U16,
    pub method: U16,
    pub modified_time: U16,
    pub modified_date: U16,
    pub crc32: U32,
    pub compressed_size: U32,
    pub uncompressed_size: U32,
    pub filename_len: U16,
    pub extra_len: U16,
    pub comment_len: U16,
    pub disk_number: U16,
    pub internal_attrs: U16,
    pub external_attrs: U32,
    pub offset: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ZipEndRecord {
    pub signature: U32,
    pub disk_number: U16,
    pub disk_cd: U16,
    pub disk_cd_count: U16,
    pub total_cd_count: U16,
    pub cd_size: U32,
    pub cd_offset: U32,
    pub comment_len: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Zip64EndRecord {
    pub signature: U32,
    pub record_size: U64,
    pub creator_version: U16,
    pub reader_version: U16,
    pub disk_number: U32,
    pub disk_cd: U32,
    pub disk_cd_count: U64,
    pub total_cd_count: U64,
    pub cd_size: U64,
    pub cd_offset: U64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Zip64Locator {
    pub signature: U32,
    pub disk_cd: U32,
    pub offset: U64,
    pub disk_count: U32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_wire_format() {
        assert_eq!(std::mem::size_of::<ZipLocalHeader>(), LOCAL_HEADER_LEN);
        assert_eq!(std::mem::size_of::<ZipCentralHeader>(), DIRECTORY_HEADER_LEN);
        assert_eq!(std::mem::size_of::<ZipEndRecord>(), DIRECTORY_END_LEN);
        assert_eq!(std::mem::size_of::<Zip64EndRecord>(), DIRECTORY64_END_LEN);
        assert_eq!(std::mem::size_of::<Zip64Locator>(), DIRECTORY64_LOC_LEN);
    }
}
