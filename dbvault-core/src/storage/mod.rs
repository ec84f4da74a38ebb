//! Reversible byte-stream transforms for backup artifacts.
//!
//! The write side is a chain of boxed [`LayerWrite`] decorators:
//!
//! ```text
//! frames -> [compress] -> [encrypt] -> sink
//! ```
//!
//! Each layer owns the layer below it. [`LayerWrite::finish`] finalizes the
//! layer (gzip trailer, last GCM segment, CBC padding) and then finishes the
//! layer it wraps, so finishing the outermost layer finalizes the whole chain
//! in order.
//!
//! The read side mirrors it with plain `Box<dyn Read + Send>` decorators
//! applied in reverse: `sink -> [decrypt] -> [decompress] -> frames`.
//!
//! Adding a transform means adding one writer/reader pair and one variant
//! to the layer description; no other code changes.

pub mod compression;
pub mod encryption;

pub use compression::{CompressionKind, CompressionSpec};
pub use encryption::{CipherKind, EncryptionKey, EncryptionParams};

use std::io::{self, Read, Write};

/// A `Write` layer that can be finalized.
///
/// `Drop` must not be relied on to flush trailing state: codecs that need a
/// trailer only produce a valid stream after `finish`.
pub trait LayerWrite: Write + Send {
    /// Finalizes this layer, then the layer it wraps.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Boxed readable layer
pub type LayerRead = Box<dyn Read + Send>;

/// Builds the write chain on top of `sink`.
///
/// Compression is applied before encryption; encrypted bytes do not
/// compress.
pub fn build_writer(
    sink: Box<dyn LayerWrite>,
    compression: &CompressionSpec,
    encryption: Option<(&EncryptionParams, &EncryptionKey)>,
) -> crate::Result<Box<dyn LayerWrite>> {
    let mut writer = sink;
    if let Some((params, key)) = encryption {
        writer = encryption::encrypt_writer(params, key, writer)?;
    }
    compression::compress_writer(compression, writer)
}

/// Builds the read chain on top of `source`, undoing [`build_writer`].
pub fn build_reader(
    source: LayerRead,
    compression: CompressionKind,
    encryption: Option<(&EncryptionParams, &EncryptionKey)>,
) -> crate::Result<LayerRead> {
    let mut reader = source;
    if let Some((params, key)) = encryption {
        reader = encryption::decrypt_reader(params, key, reader)?;
    }
    compression::decompress_reader(compression, reader)
}

/// Human-readable description of a layer stack, e.g. `zstd(3) -> aes-256-gcm`.
pub fn describe_layers(compression: &CompressionSpec, cipher: Option<CipherKind>) -> String {
    let mut layers = vec!["raw".to_string()];
    if compression.kind != CompressionKind::None {
        layers.push(compression.to_string());
    }
    if let Some(cipher) = cipher {
        layers.push(cipher.to_string());
    }
    layers.join(" -> ")
}

/// Memory sink used by tests and by in-process round trips.
#[derive(Debug, Default)]
pub struct VecSink {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

impl VecSink {
    /// Creates a sink and a handle to the bytes it will collect.
    pub fn new() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Self {
                buffer: buffer.clone(),
            },
            buffer,
        )
    }
}

impl Write for VecSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| io::Error::other("sink buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LayerWrite for VecSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Wraps a reader and reclassifies untyped I/O errors.
///
/// Errors that already carry a [`crate::DbVaultError`] (from a lower layer)
/// pass through untouched; anything else is converted with `classify`.
pub(crate) struct ClassifyErrors<R> {
    inner: R,
    classify: fn(String) -> crate::DbVaultError,
}

impl<R> ClassifyErrors<R> {
    pub(crate) fn new(inner: R, classify: fn(String) -> crate::DbVaultError) -> Self {
        Self { inner, classify }
    }
}

impl<R: Read> Read for ClassifyErrors<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|error| {
            if error
                .get_ref()
                .is_some_and(|inner| inner.is::<crate::DbVaultError>())
            {
                error
            } else {
                (self.classify)(error.to_string()).into_io()
            }
        })
    }
}
