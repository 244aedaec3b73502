//! RAP ("RTEMS Application Package") loader (§4.6).
pub mod loader;

#[cfg(feature = "lz77")]
pub mod lz77;

use crate::error::{format_error, Result};
use alloc::string::String;

/// RAP compression identifiers named in the header (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz77,
}

/// A parsed RAP header: `RAP,<length>,<version>,<NONE|LZ77>,<hex-cksum>\n`.
#[derive(Debug, Clone, Copy)]
pub struct RapHeader {
    pub length: u32,
    pub version: u32,
    pub compression: Compression,
    /// Recorded but not verified by this core (§4.6).
    pub checksum: u32,
}

const MAX_HEADER_LEN: usize = 64;

/// Parse a RAP header from the start of `buf`, returning the header and
/// the number of bytes it occupied (up to and including the trailing
/// `\n`).
pub fn parse_header(buf: &[u8]) -> Result<(RapHeader, usize)> {
    let scan_len = buf.len().min(MAX_HEADER_LEN);
    let nl = buf[..scan_len]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| format_error("RAP header missing terminating newline"))?;
    let line = core::str::from_utf8(&buf[..nl]).map_err(|_| format_error("RAP header is not ASCII"))?;

    let mut fields = line.split(',');
    let magic = fields.next().ok_or_else(|| format_error("empty RAP header"))?;
    if magic != "RAP" {
        return Err(format_error("bad RAP magic"));
    }
    let length: u32 = fields
        .next()
        .ok_or_else(|| format_error("RAP header missing length field"))?
        .parse()
        .map_err(|_| format_error("RAP header length field is not numeric"))?;
    let version: u32 = fields
        .next()
        .ok_or_else(|| format_error("RAP header missing version field"))?
        .parse()
        .map_err(|_| format_error("RAP header version field is not numeric"))?;
    let comp_str = fields.next().ok_or_else(|| format_error("RAP header missing compression field"))?;
    let compression = match comp_str {
        "NONE" => Compression::None,
        "LZ77" => Compression::Lz77,
        other => {
            return Err(format_error(alloc::format!(
                "unknown RAP compression: {other}"
            )))
        }
    };
    let cksum_str = fields.next().ok_or_else(|| format_error("RAP header missing checksum field"))?;
    let checksum = u32::from_str_radix(cksum_str.trim(), 16)
        .map_err(|_| format_error("RAP header checksum field is not hex"))?;

    if fields.next().is_some() {
        return Err(format_error("RAP header has extra fields"));
    }

    Ok((
        RapHeader {
            length,
            version,
            compression,
            checksum,
        },
        nl + 1,
    ))
}

#[allow(dead_code)]
fn format_header(length: u32, version: u32, compression: &str, checksum: u32) -> String {
    alloc::format!("RAP,{length},{version},{compression},{checksum:x}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_header() {
        let line = format_header(1234, 1, "NONE", 0xdeadbeef);
        let (hdr, consumed) = parse_header(line.as_bytes()).unwrap();
        assert_eq!(hdr.length, 1234);
        assert_eq!(hdr.version, 1);
        assert_eq!(hdr.compression, Compression::None);
        assert_eq!(hdr.checksum, 0xdeadbeef);
        assert_eq!(consumed, line.len());
    }

    #[test]
    fn parses_lz77_compression() {
        let line = format_header(1, 1, "LZ77", 0);
        let (hdr, _) = parse_header(line.as_bytes()).unwrap();
        assert_eq!(hdr.compression, Compression::Lz77);
    }

    #[test]
    fn rejects_unknown_compression() {
        let line = format_header(1, 1, "ZSTD", 0);
        assert!(parse_header(line.as_bytes()).is_err());
    }

    #[test]
    fn rejects_bad_comma_position() {
        // Testable property (§8): a corrupted header fails with `format`
        // without reaching module allocation.
        let mut bytes = format_header(1234, 1, "NONE", 0).into_bytes();
        bytes[3] = b'X'; // mangle the comma after "RAP"
        let err = parse_header(&bytes).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }

    #[test]
    fn rejects_missing_newline() {
        let bytes = b"RAP,1,1,NONE,0".to_vec();
        assert!(parse_header(&bytes).is_err());
    }
}
