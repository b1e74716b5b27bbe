//! Wire format of rehost entries
//!
//! ```text
//! uint    flags            (bit 0: description present)
//! uint    version.major
//! uint    version.minor
//! [string description]     (uint byte length, then UTF-8)
//! ```
//!
//! `uint` is the compact variable-length form: values up to `0xfc` take one
//! byte, larger ones a marker byte (`0xfd`, `0xfe`, `0xff`) followed by a
//! little-endian u16, u32 or u64.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SUPPORTED_MAJOR: u64 = 1;
pub const SUPPORTED_MINOR: u64 = 1;

const FLAG_DESCRIPTION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
}

impl Version {
    pub const CURRENT: Version = Version {
        major: SUPPORTED_MAJOR,
        minor: SUPPORTED_MINOR,
    };

    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    OtherMajor,
    HigherMinor,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::OtherMajor => write!(f, "other major"),
            Mismatch::HigherMinor => write!(f, "higher minor"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("entry ends before its {0}")]
    OutOfBounds(&'static str),
    #[error("description is not valid utf-8")]
    InvalidUtf8,
    #[error("cannot decode rehost entry of {kind} version {found}")]
    VersionMismatch { kind: Mismatch, found: Version },
}

/// A decoded, supported rehost entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehostEntry {
    pub description: Option<String>,
    pub version: Version,
}

/// What a caller asks to store. A missing version means the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehostValue {
    pub description: Option<String>,
    pub version: Option<Version>,
}

impl RehostValue {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            version: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

impl From<RehostEntry> for RehostValue {
    fn from(entry: RehostEntry) -> Self {
        Self {
            description: entry.description,
            version: Some(entry.version),
        }
    }
}

pub fn encode(value: &RehostValue) -> Bytes {
    let version = value.version.unwrap_or(Version::CURRENT);
    let description = value.description.as_deref().filter(|d| !d.is_empty());

    let mut buf = BytesMut::new();
    let flags = if description.is_some() {
        FLAG_DESCRIPTION
    } else {
        0
    };
    put_uint(&mut buf, flags);
    put_uint(&mut buf, version.major);
    put_uint(&mut buf, version.minor);
    if let Some(description) = description {
        put_uint(&mut buf, description.len() as u64);
        buf.put_slice(description.as_bytes());
    }
    buf.freeze()
}

pub fn decode(mut buf: &[u8]) -> Result<RehostEntry, EncodingError> {
    let flags = get_uint(&mut buf, "flags")?;
    let found = Version {
        major: get_uint(&mut buf, "major version")?,
        minor: get_uint(&mut buf, "minor version")?,
    };

    if found.major != SUPPORTED_MAJOR {
        return Err(EncodingError::VersionMismatch {
            kind: Mismatch::OtherMajor,
            found,
        });
    }
    if found.minor > SUPPORTED_MINOR {
        return Err(EncodingError::VersionMismatch {
            kind: Mismatch::HigherMinor,
            found,
        });
    }

    let description = if flags & FLAG_DESCRIPTION != 0 {
        let len = get_uint(&mut buf, "description length")? as usize;
        if buf.remaining() < len {
            return Err(EncodingError::OutOfBounds("description"));
        }
        let raw = &buf[..len];
        Some(
            std::str::from_utf8(raw)
                .map_err(|_| EncodingError::InvalidUtf8)?
                .to_string(),
        )
    } else {
        None
    };

    Ok(RehostEntry {
        description,
        version: found,
    })
}

fn put_uint(buf: &mut BytesMut, n: u64) {
    if n <= 0xfc {
        buf.put_u8(n as u8);
    } else if n <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16_le(n as u16);
    } else if n <= 0xffff_ffff {
        buf.put_u8(0xfe);
        buf.put_u32_le(n as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64_le(n);
    }
}

fn get_uint(buf: &mut &[u8], field: &'static str) -> Result<u64, EncodingError> {
    if !buf.has_remaining() {
        return Err(EncodingError::OutOfBounds(field));
    }
    let width = match buf.get_u8() {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        n => return Ok(n as u64),
    };
    if buf.remaining() < width {
        return Err(EncodingError::OutOfBounds(field));
    }
    Ok(match width {
        2 => buf.get_u16_le() as u64,
        4 => buf.get_u32_le() as u64,
        _ => buf.get_u64_le(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        assert_eq!(&encode(&RehostValue::default())[..], &[0, 1, 1]);
        assert_eq!(
            &encode(&RehostValue::described("d1"))[..],
            &[1, 1, 1, 2, b'd', b'1']
        );
        // an empty description is the same as none
        assert_eq!(&encode(&RehostValue::described(""))[..], &[0, 1, 1]);
    }

    #[test]
    fn test_compact_uint_widths() {
        let mut buf = BytesMut::new();
        put_uint(&mut buf, 0xfc);
        put_uint(&mut buf, 0xfd);
        put_uint(&mut buf, 0x1_0000);
        put_uint(&mut buf, 0x1_0000_0000);
        assert_eq!(buf.len(), 1 + 3 + 5 + 9);
        assert_eq!(&buf[..4], &[0xfc, 0xfd, 0xfd, 0x00]);

        let mut read = &buf[..];
        assert_eq!(get_uint(&mut read, "a").unwrap(), 0xfc);
        assert_eq!(get_uint(&mut read, "b").unwrap(), 0xfd);
        assert_eq!(get_uint(&mut read, "c").unwrap(), 0x1_0000);
        assert_eq!(get_uint(&mut read, "d").unwrap(), 0x1_0000_0000);
        assert!(read.is_empty());
    }

    #[test]
    fn test_decode_current_version() {
        let entry = decode(&encode(&RehostValue::described("a log"))).unwrap();
        assert_eq!(entry.description.as_deref(), Some("a log"));
        assert_eq!(entry.version, Version::CURRENT);
    }

    #[test]
    fn test_older_minor_is_accepted() {
        let value = RehostValue::default().with_version(Version::new(1, 0));
        assert_eq!(decode(&encode(&value)).unwrap().version, Version::new(1, 0));
    }

    #[test]
    fn test_version_mismatch() {
        let major = RehostValue::described("x").with_version(Version::new(2, 0));
        let err = decode(&encode(&major)).unwrap_err();
        assert_eq!(
            err,
            EncodingError::VersionMismatch {
                kind: Mismatch::OtherMajor,
                found: Version::new(2, 0)
            }
        );
        assert!(err.to_string().contains("other major version"));

        let minor = RehostValue::default().with_version(Version::new(1, 2));
        let err = decode(&encode(&minor)).unwrap_err();
        assert!(err.to_string().contains("higher minor version"));
    }

    #[test]
    fn test_truncated_and_garbage() {
        assert_eq!(decode(&[]), Err(EncodingError::OutOfBounds("flags")));
        assert_eq!(
            decode(&[1, 1, 1, 5, b'a']),
            Err(EncodingError::OutOfBounds("description"))
        );
        assert_eq!(decode(&[1, 1, 1, 1, 0xff]), Err(EncodingError::InvalidUtf8));
        assert_eq!(
            decode(&[0, 0xfd, 0x01]),
            Err(EncodingError::OutOfBounds("major version"))
        );
    }
}
