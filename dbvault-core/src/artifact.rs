//! Backup artifact file format.
//!
//! ```text
//! "DBVAULT\x01" | u32 LE header length | header JSON
//! | body
//! | SHA-256(body) | u64 LE body length | "DBVEND\x00\x01"
//! ```
//!
//! The body is a stream of newline-delimited JSON [`Frame`]s pushed through
//! the storage chain (compress, then encrypt). The header stays plaintext so
//! the cipher parameters and key check value can be inspected without the
//! key. The footer checksum covers the stored body bytes, so an artifact can
//! be verified without decrypting it.

use crate::Result;
use crate::config::BackupMode;
use crate::error::DbVaultError;
use crate::models::{DatabaseType, RelationshipEdge, Row, TableMetadata};
use crate::storage::{
    self, CompressionKind, CompressionSpec, EncryptionKey, EncryptionParams, LayerRead, LayerWrite,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use uuid::Uuid;

/// Leading file magic
pub const MAGIC: &[u8; 8] = b"DBVAULT\x01";
/// Trailing footer magic
pub const FOOTER_MAGIC: &[u8; 8] = b"DBVEND\x00\x01";
/// Checksum, body length and magic
pub const FOOTER_LEN: u64 = 32 + 8 + 8;
/// Current header format version
pub const FORMAT_VERSION: u32 = 1;

const MAX_HEADER_LEN: u32 = 1024 * 1024;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Plaintext artifact header.
///
/// Carries everything needed to rebuild the read chain except the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format_version: u32,
    pub backup_id: Uuid,
    pub name: String,
    pub mode: BackupMode,
    pub engine: DatabaseType,
    pub compression: CompressionKind,
    /// Cipher, IV and key check value; `None` for plaintext bodies
    pub encryption: Option<EncryptionParams>,
    /// Reference to the externally held key
    pub key_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One newline-delimited JSON record of the artifact body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Creation order and the edges broken to obtain it
    Plan {
        order: Vec<String>,
        broken_edges: Vec<RelationshipEdge>,
        deferred_columns: BTreeMap<String, Vec<String>>,
    },
    /// Table definition, schema phase
    Table { table: TableMetadata },
    /// Start of a table's row data
    Begin {
        table: String,
        columns: Vec<String>,
        primary_key: Vec<String>,
    },
    /// A chunk of rows, cells in `Begin` column order
    Rows { table: String, rows: Vec<Row> },
    /// End of a table's row data
    End { table: String, row_count: u64 },
    /// Last frame of a complete artifact
    Complete { tables: u64, rows: u64 },
}

/// Result of a finished artifact write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub path: PathBuf,
    /// Total file size including header and footer
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the body
    pub checksum: String,
    pub body_len: u64,
}

fn corrupt(path: &Path, message: impl Into<String>) -> DbVaultError {
    DbVaultError::io(
        format!("reading artifact {}", path.display()),
        io::Error::new(io::ErrorKind::InvalidData, message.into()),
    )
}

/// Where artifact bytes end up
pub(crate) trait ArtifactSink: Write + Send {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl ArtifactSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Encoded bytes waiting for the file
type Staged = Arc<Mutex<Vec<u8>>>;

fn lock(staged: &Staged) -> MutexGuard<'_, Vec<u8>> {
    staged.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Innermost layer of the write chain: hashes, counts and stages the body
/// bytes, and stages the footer on finish.
struct HashingSink {
    staged: Staged,
    path: PathBuf,
    header_len: u64,
    hasher: Sha256,
    body_len: u64,
    summary: Arc<OnceLock<ArtifactSummary>>,
}

impl Write for HashingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.staged).extend_from_slice(buf);
        self.hasher.update(buf);
        self.body_len = self.body_len.saturating_add(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LayerWrite for HashingSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let Self {
            staged,
            path,
            header_len,
            hasher,
            body_len,
            summary,
        } = *self;

        let digest = hasher.finalize();
        {
            let mut staged = lock(&staged);
            staged.extend_from_slice(&digest);
            staged.extend_from_slice(&body_len.to_le_bytes());
            staged.extend_from_slice(FOOTER_MAGIC);
        }

        let size_bytes = header_len
            .saturating_add(body_len)
            .saturating_add(FOOTER_LEN);
        let _ = summary.set(ArtifactSummary {
            path,
            size_bytes,
            checksum: hex::encode(digest),
            body_len,
        });
        Ok(())
    }
}

/// Streams frames into a new artifact file.
///
/// Frames pass through the storage chain into an in-memory stage;
/// [`ArtifactWriter::flush_staged`] moves staged bytes to the file and can
/// be repeated after a failed write. The file is created with `create_new`;
/// an existing artifact is never replaced. Dropping the writer without
/// [`ArtifactWriter::finish`] leaves a file without a footer, which
/// [`ArtifactReader::open`] rejects.
pub struct ArtifactWriter {
    /// `None` once sealed
    chain: Option<Box<dyn LayerWrite>>,
    staged: Staged,
    out: Box<dyn ArtifactSink>,
    path: PathBuf,
    summary: Arc<OnceLock<ArtifactSummary>>,
    frames: u64,
}

impl ArtifactWriter {
    /// Creates the file, stages the header and builds the storage chain.
    ///
    /// # Errors
    /// Returns `Io` if the file exists or cannot be created, and
    /// `Compression` / `Encryption` for invalid layer parameters.
    pub fn create(
        path: &Path,
        header: &ArtifactHeader,
        compression: &CompressionSpec,
        encryption: Option<(&EncryptionParams, &EncryptionKey)>,
    ) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| DbVaultError::io(format!("creating {}", path.display()), e))?;
        Self::with_sink(path, Box::new(file), header, compression, encryption)
    }

    pub(crate) fn with_sink(
        path: &Path,
        out: Box<dyn ArtifactSink>,
        header: &ArtifactHeader,
        compression: &CompressionSpec,
        encryption: Option<(&EncryptionParams, &EncryptionKey)>,
    ) -> Result<Self> {
        let header_json = serde_json::to_vec(header)
            .map_err(|e| DbVaultError::serialization("encoding artifact header", e))?;
        let header_len = u32::try_from(header_json.len())
            .ok()
            .filter(|len| *len <= MAX_HEADER_LEN)
            .ok_or_else(|| DbVaultError::configuration("artifact header is too large"))?;

        let mut prefix = Vec::with_capacity(MAGIC.len() + 4 + header_json.len());
        prefix.extend_from_slice(MAGIC);
        prefix.extend_from_slice(&header_len.to_le_bytes());
        prefix.extend_from_slice(&header_json);
        let prefix_len = prefix.len() as u64;
        let staged = Arc::new(Mutex::new(prefix));

        let summary = Arc::new(OnceLock::new());
        let sink = HashingSink {
            staged: staged.clone(),
            path: path.to_path_buf(),
            header_len: prefix_len,
            hasher: Sha256::new(),
            body_len: 0,
            summary: summary.clone(),
        };
        let chain = storage::build_writer(Box::new(sink), compression, encryption)?;

        Ok(Self {
            chain: Some(chain),
            staged,
            out,
            path: path.to_path_buf(),
            summary,
            frames: 0,
        })
    }

    /// Appends one frame to the body.
    ///
    /// # Errors
    /// Returns `Configuration` after [`ArtifactWriter::seal`].
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let chain = self
            .chain
            .as_mut()
            .ok_or_else(|| DbVaultError::configuration("artifact body is already sealed"))?;
        let mut line = serde_json::to_vec(frame)
            .map_err(|e| DbVaultError::serialization("encoding artifact frame", e))?;
        line.push(b'\n');
        chain
            .write_all(&line)
            .map_err(|e| DbVaultError::io("writing artifact frame", e))?;
        self.frames = self.frames.saturating_add(1);
        Ok(())
    }

    /// Number of frames written so far
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Bytes encoded but not yet written to the file
    pub fn staged_len(&self) -> usize {
        lock(&self.staged).len()
    }

    /// Writes staged bytes to the file.
    ///
    /// Bytes reach the file once and in order. After an error the unwritten
    /// remainder stays staged and the next call resumes with it.
    pub fn flush_staged(&mut self) -> io::Result<()> {
        let mut staged = lock(&self.staged);
        while !staged.is_empty() {
            match self.out.write(staged.as_slice()) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => {
                    staged.drain(..written);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Finalizes every layer and stages the footer. Later calls do nothing.
    pub fn seal(&mut self) -> Result<()> {
        if let Some(chain) = self.chain.take() {
            chain
                .finish()
                .map_err(|e| DbVaultError::io("finalizing artifact", e))?;
        }
        Ok(())
    }

    /// Seals the body, writes whatever is still staged and syncs the file.
    pub fn finish(mut self) -> Result<ArtifactSummary> {
        self.seal()?;
        self.flush_staged()
            .and_then(|()| self.out.flush())
            .and_then(|()| self.out.sync())
            .map_err(|e| DbVaultError::io(format!("writing {}", self.path.display()), e))?;
        self.summary.get().cloned().ok_or_else(|| {
            DbVaultError::io(
                "finalizing artifact",
                io::Error::other("artifact footer was not written"),
            )
        })
    }
}

/// Opened artifact with a validated header and footer.
#[derive(Debug, Clone)]
pub struct ArtifactReader {
    path: PathBuf,
    header: ArtifactHeader,
    body_offset: u64,
    body_len: u64,
    footer_checksum: String,
}

impl ArtifactReader {
    /// Reads the header and footer. The body is not touched.
    ///
    /// # Errors
    /// Returns `Io` for a missing, truncated or foreign file, `Serialization`
    /// for an unreadable header and `UnsupportedFeature` for a newer format.
    pub fn open(path: &Path) -> Result<Self> {
        let context = || format!("reading artifact {}", path.display());
        let mut file = File::open(path).map_err(|e| DbVaultError::io(context(), e))?;
        let file_len = file
            .metadata()
            .map_err(|e| DbVaultError::io(context(), e))?
            .len();

        let mut prefix = [0u8; 12];
        file.read_exact(&mut prefix)
            .map_err(|e| DbVaultError::io(context(), e))?;
        if &prefix[..8] != MAGIC {
            return Err(corrupt(path, "not a dbvault artifact"));
        }
        let header_len = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);
        if header_len > MAX_HEADER_LEN {
            return Err(corrupt(path, "header length out of range"));
        }

        let mut header_json = vec![0u8; header_len as usize];
        file.read_exact(&mut header_json)
            .map_err(|e| DbVaultError::io(context(), e))?;
        let header: ArtifactHeader = serde_json::from_slice(&header_json)
            .map_err(|e| DbVaultError::serialization("decoding artifact header", e))?;
        if header.format_version != FORMAT_VERSION {
            return Err(DbVaultError::unsupported_feature(
                format!("artifact format version {}", header.format_version),
                format!("dbvault {}", env!("CARGO_PKG_VERSION")),
            ));
        }

        let body_offset = 12u64.saturating_add(u64::from(header_len));
        if file_len < body_offset.saturating_add(FOOTER_LEN) {
            return Err(corrupt(path, "artifact is truncated (no footer)"));
        }
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))
            .and_then(|_| file.read_exact(&mut footer))
            .map_err(|e| DbVaultError::io(context(), e))?;
        if &footer[40..] != FOOTER_MAGIC {
            return Err(corrupt(path, "artifact is truncated (footer magic missing)"));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&footer[32..40]);
        let body_len = u64::from_le_bytes(len_bytes);
        if body_offset.saturating_add(body_len).saturating_add(FOOTER_LEN) != file_len {
            return Err(corrupt(
                path,
                format!(
                    "footer records {} body bytes but the file holds {}",
                    body_len,
                    file_len - body_offset - FOOTER_LEN
                ),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            body_offset,
            body_len,
            footer_checksum: hex::encode(&footer[..32]),
        })
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    /// Checksum recorded in the footer
    pub fn footer_checksum(&self) -> &str {
        &self.footer_checksum
    }

    fn body(&self) -> Result<io::Take<BufReader<File>>> {
        let context = || format!("reading artifact {}", self.path.display());
        let mut file = File::open(&self.path).map_err(|e| DbVaultError::io(context(), e))?;
        file.seek(SeekFrom::Start(self.body_offset))
            .map_err(|e| DbVaultError::io(context(), e))?;
        Ok(BufReader::with_capacity(READ_BUFFER_SIZE, file).take(self.body_len))
    }

    /// Recomputes the SHA-256 of the stored body bytes.
    pub fn body_checksum(&self) -> Result<String> {
        let mut body = self.body()?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = body
                .read(&mut buffer)
                .map_err(|e| DbVaultError::io("hashing artifact body", e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Opens the frame stream, checking the key before reading any body
    /// byte.
    ///
    /// # Errors
    /// Returns `Encryption` when the artifact is encrypted and the key is
    /// missing or does not match.
    pub fn frames(&self, key: Option<&EncryptionKey>) -> Result<FrameReader> {
        let encryption = match (&self.header.encryption, key) {
            (Some(params), Some(key)) => {
                params.check_key(key)?;
                Some((params, key))
            }
            (Some(params), None) => {
                return Err(DbVaultError::encryption(format!(
                    "artifact is encrypted with {} but no key was supplied",
                    params.cipher
                )));
            }
            (None, _) => None,
        };

        let body: LayerRead = Box::new(self.body()?);
        let reader = storage::build_reader(body, self.header.compression, encryption)?;
        Ok(FrameReader {
            lines: BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            line: String::new(),
        })
    }
}

/// Sequential decoder over the plaintext body
pub struct FrameReader {
    lines: BufReader<LayerRead>,
    line: String,
}

impl FrameReader {
    /// Next frame, or `None` at the end of the body.
    ///
    /// # Errors
    /// Returns `Encryption` / `Compression` for a body that fails to
    /// decode and `Serialization` for a malformed frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            self.line.clear();
            let read = self
                .lines
                .read_line(&mut self.line)
                .map_err(|e| DbVaultError::io("reading artifact body", e))?;
            if read == 0 {
                return Ok(None);
            }
            let line = self.line.trim_end();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| DbVaultError::serialization("decoding artifact frame", e));
        }
    }
}
