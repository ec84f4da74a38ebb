//! Compression layers (gzip, bzip2, zstd).

use super::{ClassifyErrors, LayerRead, LayerWrite};
use crate::error::DbVaultError;
use serde::{Deserialize, Serialize};
use std::io;

/// Compression algorithm applied to the artifact body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
    Bzip2,
    Zstd,
}

impl CompressionKind {
    /// Accepted level range, `None` for the identity transform
    pub fn level_range(&self) -> Option<(u32, u32)> {
        match self {
            Self::None => None,
            Self::Gzip => Some((0, 9)),
            Self::Bzip2 => Some((1, 9)),
            Self::Zstd => Some((1, 22)),
        }
    }

    /// Level used when none is configured
    pub fn default_level(&self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Gzip | Self::Bzip2 => Some(6),
            Self::Zstd => Some(3),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CompressionKind {
    type Err = DbVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(DbVaultError::compression(format!(
                "unknown compression kind '{}'",
                other
            ))),
        }
    }
}

/// Compression kind plus optional level
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressionSpec {
    pub kind: CompressionKind,
    pub level: Option<u32>,
}

impl CompressionSpec {
    /// Creates a spec with the kind's default level
    pub fn new(kind: CompressionKind) -> Self {
        Self { kind, level: None }
    }

    /// Builder method to set the level.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// Validates the level against the kind.
    ///
    /// # Errors
    /// Returns `Compression` when a level is set for `none` or lies outside
    /// the kind's range.
    pub fn validate(&self) -> crate::Result<()> {
        match (self.kind.level_range(), self.level) {
            (None, Some(level)) => Err(DbVaultError::compression(format!(
                "compression level {} given without a compression kind",
                level
            ))),
            (Some((min, max)), Some(level)) if level < min || level > max => {
                Err(DbVaultError::compression(format!(
                    "{} level must be between {} and {}, got {}",
                    self.kind, min, max, level
                )))
            }
            _ => Ok(()),
        }
    }

    /// Level actually used by the encoder
    pub fn effective_level(&self) -> Option<u32> {
        self.level.or_else(|| self.kind.default_level())
    }
}

impl std::fmt::Display for CompressionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.effective_level() {
            Some(level) => write!(f, "{}({})", self.kind, level),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl LayerWrite for flate2::write::GzEncoder<Box<dyn LayerWrite>> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = flate2::write::GzEncoder::finish(*self)?;
        inner.finish()
    }
}

impl LayerWrite for bzip2::write::BzEncoder<Box<dyn LayerWrite>> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = bzip2::write::BzEncoder::finish(*self)?;
        inner.finish()
    }
}

impl LayerWrite for zstd::stream::write::Encoder<'static, Box<dyn LayerWrite>> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = zstd::stream::write::Encoder::finish(*self)?;
        inner.finish()
    }
}

/// Wraps `inner` with the configured compressor.
///
/// # Errors
/// Returns `Compression` if the spec is invalid or the encoder cannot be
/// created.
pub fn compress_writer(
    spec: &CompressionSpec,
    inner: Box<dyn LayerWrite>,
) -> crate::Result<Box<dyn LayerWrite>> {
    spec.validate()?;
    let level = spec.effective_level().unwrap_or_default();

    Ok(match spec.kind {
        CompressionKind::None => inner,
        CompressionKind::Gzip => Box::new(flate2::write::GzEncoder::new(
            inner,
            flate2::Compression::new(level),
        )),
        CompressionKind::Bzip2 => Box::new(bzip2::write::BzEncoder::new(
            inner,
            bzip2::Compression::new(level),
        )),
        CompressionKind::Zstd => {
            let level = i32::try_from(level)
                .map_err(|_| DbVaultError::compression("zstd level out of range"))?;
            let encoder = zstd::stream::write::Encoder::new(inner, level).map_err(|e| {
                DbVaultError::compression(format!("failed to create zstd encoder: {}", e))
            })?;
            Box::new(encoder)
        }
    })
}

/// Wraps `inner` with the matching decompressor.
///
/// Corrupt input surfaces as a `Compression` error when read.
pub fn decompress_reader(kind: CompressionKind, inner: LayerRead) -> crate::Result<LayerRead> {
    let reader: LayerRead = match kind {
        CompressionKind::None => return Ok(inner),
        CompressionKind::Gzip => Box::new(flate2::read::GzDecoder::new(inner)),
        CompressionKind::Bzip2 => Box::new(bzip2::read::BzDecoder::new(inner)),
        CompressionKind::Zstd => Box::new(zstd::stream::read::Decoder::new(inner).map_err(
            |e| DbVaultError::compression(format!("failed to create zstd decoder: {}", e)),
        )?),
    };
    Ok(Box::new(ClassifyErrors::new(reader, |message| {
        DbVaultError::compression(message)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecSink;
    use std::io::{Read, Write};

    fn compress(spec: &CompressionSpec, payload: &[u8]) -> Vec<u8> {
        let (sink, bytes) = VecSink::new();
        let mut writer = compress_writer(spec, Box::new(sink)).unwrap();
        writer.write_all(payload).unwrap();
        writer.finish().unwrap();
        let out = bytes.lock().unwrap().clone();
        out
    }

    #[test]
    fn test_level_validation() {
        assert!(CompressionSpec::new(CompressionKind::Gzip).with_level(0).validate().is_ok());
        assert!(CompressionSpec::new(CompressionKind::Gzip).with_level(10).validate().is_err());
        assert!(CompressionSpec::new(CompressionKind::Bzip2).with_level(0).validate().is_err());
        assert!(CompressionSpec::new(CompressionKind::Zstd).with_level(22).validate().is_ok());
        assert!(CompressionSpec::new(CompressionKind::Zstd).with_level(23).validate().is_err());
        assert!(CompressionSpec::new(CompressionKind::None).with_level(1).validate().is_err());
        assert!(CompressionSpec::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_level_rejected_before_write() {
        let (sink, bytes) = VecSink::new();
        let spec = CompressionSpec::new(CompressionKind::Bzip2).with_level(42);
        let result = compress_writer(&spec, Box::new(sink));
        assert!(matches!(result, Err(DbVaultError::Compression { .. })));
        assert!(bytes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_each_kind_roundtrips_and_shrinks() {
        let payload = b"row,row,row,row\n".repeat(4096);
        for kind in [CompressionKind::Gzip, CompressionKind::Bzip2, CompressionKind::Zstd] {
            let spec = CompressionSpec::new(kind);
            let compressed = compress(&spec, &payload);
            assert!(compressed.len() < payload.len(), "{} did not shrink", kind);

            let mut reader =
                decompress_reader(kind, Box::new(io::Cursor::new(compressed))).unwrap();
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn test_corrupt_stream_is_compression_error() {
        let garbage = vec![0x42u8; 256];
        let mut reader =
            decompress_reader(CompressionKind::Zstd, Box::new(io::Cursor::new(garbage))).unwrap();
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).unwrap_err();
        let error = DbVaultError::io("reading body", error);
        assert!(matches!(error, DbVaultError::Compression { .. }));
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("GZIP".parse::<CompressionKind>().unwrap(), CompressionKind::Gzip);
        assert_eq!("bz2".parse::<CompressionKind>().unwrap(), CompressionKind::Bzip2);
        assert!("lzma".parse::<CompressionKind>().is_err());
    }
}
