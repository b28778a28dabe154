//! dbheader builds and validates the header of a database file.
//!
//! The first 100 bytes of page 1 hold the file header. A fixed set of bytes
//! identifies the format and is checked byte-for-byte when an existing file
//! is opened; the remaining fields (page size, counters, cookies) are read
//! out. New files get a header with every counter at its initial value.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("The pagesize is not a supported power of two.")]
    UnsupportedPagesize,
    #[error("A fixed header field does not hold its required value.")]
    Invalid,
    #[error("Error reading file header.")]
    ReadFailed,
}

/// Length of the file header at the start of page 1.
pub const HEADER_SIZE: usize = 100;

const MAGIC_STRING: &[u8] = &[
    0x53, 0x51, 0x4c, 0x69, 0x74, 0x65, 0x20, 0x66, 0x6f, 0x72, 0x6d, 0x61, 0x74, 0x20, 0x33, 0x00,
];
// Format/version bytes at offset 0x12.
const VERSION_BYTES: &[u8] = &[0x01, 0x01, 0x00, 0x40, 0x20, 0x20];

const PAGE_CACHE_SIZE_INITIAL: u32 = 20000;

/// The mutable fields of the file header.
#[derive(Debug, Clone, PartialEq)]
pub struct DbfileHeader {
    pub pagesize: u32,
    pub changecnt: u32,
    pub schema_version: u32,
    pub page_cache_size: u32,
    pub user_cookie: u32,
}

impl DbfileHeader {
    /// Header values for a freshly created file.
    pub fn new(pagesize: u32) -> DbfileHeader {
        DbfileHeader {
            pagesize,
            changecnt: 0,
            schema_version: 0,
            page_cache_size: PAGE_CACHE_SIZE_INITIAL,
            user_cookie: 0,
        }
    }
}

/// True if `pagesize` is a power of two this code supports.
///
/// In-node offsets are 16 bit, so the 65536-byte page size (which the wire
/// format would encode as 1) is not supported.
pub fn supported_page_size(pagesize: u32) -> bool {
    matches!(pagesize, 512 | 1024 | 2048 | 4096 | 8192 | 16384 | 32768)
}

/// Serializes the header for a new database file.
pub fn build_header(pagesize: u32) -> [u8; HEADER_SIZE] {
    debug_assert!(supported_page_size(pagesize));
    let h = DbfileHeader::new(pagesize);
    let mut buf = [0_u8; HEADER_SIZE];
    buf[0x00..0x10].copy_from_slice(MAGIC_STRING);
    BigEndian::write_u16(&mut buf[0x10..], h.pagesize as u16);
    buf[0x12..0x18].copy_from_slice(VERSION_BYTES);
    BigEndian::write_u32(&mut buf[0x18..], h.changecnt);
    BigEndian::write_u32(&mut buf[0x28..], h.schema_version);
    BigEndian::write_u32(&mut buf[0x2c..], 1);
    BigEndian::write_u32(&mut buf[0x30..], h.page_cache_size);
    BigEndian::write_u32(&mut buf[0x38..], 1);
    BigEndian::write_u32(&mut buf[0x44..], h.user_cookie);
    buf
}

/// Validates the fixed header fields and reads out the rest.
///
/// `buf` holds the first 100 bytes of the file. Every fixed byte is compared
/// against its required value; a mismatch fails the whole open.
pub fn get_header(buf: &[u8]) -> Result<DbfileHeader, Error> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::ReadFailed);
    }
    let mut c = Cursor::new(buf);

    // Offset	Size	Description
    // 0x00     16      The header string: "SQLite format 3\000"
    let mut magic_buffer = [0; 16];
    c.read_exact(&mut magic_buffer).map_err(|_| Error::ReadFailed)?;
    if magic_buffer[..] != *MAGIC_STRING {
        return Err(Error::WrongMagic);
    }

    // Offset	Size	Description
    // 0x10     2       The database page size in bytes, big-endian.
    let pagesize = c.read_u16::<BigEndian>().map_err(|_| Error::ReadFailed)? as u32;
    if !supported_page_size(pagesize) {
        return Err(Error::UnsupportedPagesize);
    }

    // Offset	Size	Description
    // 0x12     6       Format and payload-fraction bytes: 01 01 00 40 20 20.
    let mut version_buffer = [0; 6];
    c.read_exact(&mut version_buffer).map_err(|_| Error::ReadFailed)?;
    if version_buffer[..] != *VERSION_BYTES {
        return Err(Error::Invalid);
    }

    // Offset	Size	Description
    // 0x18     4       File change counter.
    // 0x1c     4       Unused.
    let changecnt = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    c.seek(SeekFrom::Start(0x20)).map_err(|_| Error::ReadFailed)?;

    // Offset	Size	Description
    // 0x20     4       Must be zero.
    // 0x24     4       Must be zero.
    // 0x28     4       Schema version counter.
    // 0x2c     4       Must be one.
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 0 {
        return Err(Error::Invalid);
    }
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 0 {
        return Err(Error::Invalid);
    }
    let schema_version = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 1 {
        return Err(Error::Invalid);
    }

    // Offset	Size	Description
    // 0x30     4       Page-cache size hint.
    // 0x34     4       Must be zero.
    // 0x38     4       Must be one.
    // 0x3c     4       Unused.
    let page_cache_size = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 0 {
        return Err(Error::Invalid);
    }
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 1 {
        return Err(Error::Invalid);
    }
    c.seek(SeekFrom::Start(0x40)).map_err(|_| Error::ReadFailed)?;

    // Offset	Size	Description
    // 0x40     4       Must be zero.
    // 0x44     4       User cookie.
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 0 {
        return Err(Error::Invalid);
    }
    let user_cookie = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;

    Ok(DbfileHeader {
        pagesize,
        changecnt,
        schema_version,
        page_cache_size,
        user_cookie,
    })
}
