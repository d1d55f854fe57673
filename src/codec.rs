//! Payload compression behind a single `(mode, level)` strategy.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Zstd is exposed at a fixed level, matching what the patcher always used.
const ZSTD_LEVEL: i32 = 3;
const GZIP_DEFAULT_LEVEL: u32 = 6;

/// Compression algorithm identifier, as stored in the archive preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    /// Payloads stored as-is
    None = 0,
    /// Self-contained gzip stream, the standard archive codec (levels 0-9)
    Gzip = 1,
    /// Zstandard
    Zstd = 2,
    /// LZ4 frame format
    Lz4 = 3,
    /// Raw zlib stream
    Zlib = 4,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::None,
        Compression::Gzip,
        Compression::Zstd,
        Compression::Lz4,
        Compression::Zlib,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u8 == value)
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
            Compression::Zlib => "zlib",
        }
    }

    /// Highest level the codec accepts. Codecs with a fixed algorithm only take 0.
    pub fn max_level(self) -> u8 {
        match self {
            Compression::Gzip => 9,
            _ => 0,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "unknown compression {s:?} (expected one of: none, gzip, zstd, lz4, zlib)"
                )
            })
    }
}

/// A codec selection: algorithm plus level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSpec {
    pub mode: Compression,
    pub level: u8,
}

impl CompressionSpec {
    pub fn new(mode: Compression, level: u8) -> Self {
        Self { mode, level }
    }

    pub fn level_is_valid(&self) -> bool {
        self.level <= self.mode.max_level()
    }

    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self.mode {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let level = if self.level == 0 {
                    GZIP_DEFAULT_LEVEL
                } else {
                    u32::from(self.level)
                };
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::new(level),
                );
                encoder.write_all(data)?;
                encoder.finish()
            }
            Compression::Zstd => zstd::bulk::compress(data, ZSTD_LEVEL),
            Compression::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                encoder.write_all(data)?;
                encoder.finish().map_err(io::Error::other)
            }
            Compression::Zlib => {
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::default(),
                );
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }

    /// Decompress a payload whose uncompressed size is recorded as `raw_len`.
    ///
    /// Decoding stops one byte past `raw_len`, so a lying table cannot make
    /// us inflate an arbitrarily large stream.
    pub fn decompress(&self, data: &[u8], raw_len: u64) -> io::Result<Vec<u8>> {
        match self.mode {
            Compression::None => {
                if data.len() as u64 != raw_len {
                    return Err(length_mismatch(data.len() as u64, raw_len));
                }
                Ok(data.to_vec())
            }
            Compression::Gzip => read_bounded(flate2::read::GzDecoder::new(data), raw_len),
            Compression::Zstd => read_bounded(zstd::stream::read::Decoder::new(data)?, raw_len),
            Compression::Lz4 => read_bounded(lz4_flex::frame::FrameDecoder::new(data), raw_len),
            Compression::Zlib => read_bounded(flate2::read::ZlibDecoder::new(data), raw_len),
        }
    }
}

impl Default for CompressionSpec {
    fn default() -> Self {
        Self::new(Compression::Zstd, 0)
    }
}

impl fmt::Display for CompressionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.level == 0 {
            write!(f, "{}", self.mode)
        } else {
            write!(f, "{} (level {})", self.mode, self.level)
        }
    }
}

fn read_bounded<R: Read>(reader: R, raw_len: u64) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(raw_len.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 != raw_len {
        return Err(length_mismatch(out.len() as u64, raw_len));
    }
    Ok(out)
}

fn length_mismatch(actual: u64, expected: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("decoded {actual} bytes, table records {expected}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut data = b"tree delta payload ".repeat(200);
        data.extend((0..=255u8).cycle().take(3000));
        data
    }

    #[test]
    fn test_every_codec_restores_payload() {
        let data = sample();
        for mode in Compression::ALL {
            let spec = CompressionSpec::new(mode, mode.max_level());
            let packed = spec.compress(&data).unwrap();
            let unpacked = spec.decompress(&packed, data.len() as u64).unwrap();
            assert_eq!(unpacked, data, "codec {mode}");
        }
    }

    #[test]
    fn test_gzip_default_level_compresses() {
        let data = sample();
        let packed = CompressionSpec::new(Compression::Gzip, 0)
            .compress(&data)
            .unwrap();
        assert!(packed.len() < data.len());
    }

    #[test]
    fn test_wrong_raw_length_is_rejected() {
        let data = sample();
        let spec = CompressionSpec::new(Compression::Zstd, 0);
        let packed = spec.compress(&data).unwrap();
        let err = spec.decompress(&packed, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(spec.decompress(&packed, data.len() as u64 + 1).is_err());
    }

    #[test]
    fn test_garbage_input_fails() {
        let spec = CompressionSpec::new(Compression::Gzip, 0);
        assert!(spec.decompress(b"definitely not gzip", 5).is_err());
    }

    #[test]
    fn test_level_limits() {
        assert!(CompressionSpec::new(Compression::Gzip, 9).level_is_valid());
        assert!(!CompressionSpec::new(Compression::Gzip, 10).level_is_valid());
        assert!(CompressionSpec::new(Compression::None, 0).level_is_valid());
        assert!(!CompressionSpec::new(Compression::None, 1).level_is_valid());
        assert!(!CompressionSpec::new(Compression::Lz4, 3).level_is_valid());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("bzip2".parse::<Compression>().is_err());
        assert_eq!(Compression::from_u8(3), Some(Compression::Lz4));
        assert_eq!(Compression::from_u8(9), None);
    }
}
