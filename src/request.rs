//! The decoded request handed to the bridge by its host
//!
//! By the time the bridge sees a request the host has already split cookies,
//! decoded form fields and spooled uploads to disk. The bridge only reads
//! these values; it never mutates or deletes anything it is given.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

/// Somewhere request bytes can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSource {
    Memory(Vec<u8>),
    File(PathBuf)
}

impl ByteSource {
    pub fn empty() -> ByteSource {
        ByteSource::Memory(Vec::new())
    }

    /// Opens a fresh reader positioned at the first byte.
    pub fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        match *self {
            ByteSource::Memory(ref bytes) => Ok(Box::new(Cursor::new(&bytes[..]))),
            ByteSource::File(ref path) => Ok(Box::new(File::open(path)?))
        }
    }

    /// Number of bytes `open` will yield
    pub fn len(&self) -> io::Result<u64> {
        match *self {
            ByteSource::Memory(ref bytes) => Ok(bytes.len() as u64),
            ByteSource::File(ref path) => Ok(fs::metadata(path)?.len())
        }
    }
}

impl Default for ByteSource {
    fn default() -> ByteSource {
        ByteSource::empty()
    }
}

/// How an upload fared while the host was receiving it
///
/// Mirrors the usual server-side upload error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Ok,
    /// Bigger than the host allows
    TooLarge,
    /// The client stopped sending partway
    Partial,
    /// The form had a file input but nothing was chosen
    NoFile,
    /// The host could not spool the data
    CantWrite
}

impl UploadStatus {
    pub fn is_ok(self) -> bool {
        self == UploadStatus::Ok
    }
}

/// A file uploaded as part of a `multipart/form-data` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// The form field the file was sent under
    pub field: String,
    /// Filename as the client reported it
    pub filename: String,
    /// Content type as the client declared it
    pub content_type: String,
    pub status: UploadStatus,
    pub source: ByteSource
}

/// An already-decoded HTTP request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub content_type: String,
    /// Raw request body; only used when the body is not multipart
    pub body: ByteSource,
    pub cookies: Vec<(String, String)>,
    /// Decoded multipart text fields, in the host's order
    pub fields: Vec<(String, String)>,
    /// Server variables, copied into the child's environment
    pub server: Vec<(String, String)>,
    pub files: Vec<UploadedFile>
}

impl ParsedRequest {
    pub fn new<M: Into<String>>(method: M) -> ParsedRequest {
        ParsedRequest {
            method: method.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }
}
