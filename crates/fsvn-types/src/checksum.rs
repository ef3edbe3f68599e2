//! MD5 and SHA-1 digest values.
//!
//! These are value types only; the digest contexts live with the writers
//! that accumulate them (`fsvn-fs`). MD5 is the authoritative content
//! checksum carried by every representation; SHA-1 keys the rep-sharing
//! index.

use std::fmt;

use fsvn_error::FsError;

/// An MD5 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5(pub [u8; 16]);

/// A SHA-1 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1(pub [u8; 20]);

fn hex_of(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use fmt::Write as _;
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

fn bytes_of<const N: usize>(kind: &'static str, hex: &str) -> Result<[u8; N], FsError> {
    let malformed = || FsError::BadChecksumParse {
        kind,
        hex: hex.to_owned(),
    };
    if hex.len() != N * 2 || !hex.is_ascii() {
        return Err(malformed());
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| malformed())?;
    }
    Ok(out)
}

impl Md5 {
    /// Parse a 32-character lowercase hex string.
    pub fn from_hex(hex: &str) -> Result<Self, FsError> {
        bytes_of("md5", hex).map(Self)
    }

    #[must_use]
    pub fn hex(&self) -> String {
        hex_of(&self.0)
    }
}

impl Sha1 {
    /// Parse a 40-character lowercase hex string.
    pub fn from_hex(hex: &str) -> Result<Self, FsError> {
        bytes_of("sha1", hex).map(Self)
    }

    #[must_use]
    pub fn hex(&self) -> String {
        hex_of(&self.0)
    }
}

impl fmt::Display for Md5 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Display for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}
