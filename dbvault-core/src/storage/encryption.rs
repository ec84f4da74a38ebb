//! AES encryption layers for artifact bodies.
//!
//! Two families are supported, each at 128, 192 and 256 bit key sizes:
//!
//! - **GCM**: the plaintext is sealed in fixed-size segments so that memory
//!   stays bounded. Every segment is authenticated; the final segment is
//!   flagged in its associated data, which makes truncation at a segment
//!   boundary detectable.
//! - **CBC**: one continuous chain over the whole body with PKCS#7 padding.
//!   CBC is not authenticated; integrity comes from the artifact checksum.
//!
//! # Security Guarantees
//! - A fresh random IV per artifact, stored in the artifact header
//! - Key length validated against the cipher before any byte is written
//! - Wrong keys detected up front through a key check value (KCV)
//! - Keys held in zeroizing memory and never serialized

use super::{LayerRead, LayerWrite};
use crate::error::DbVaultError;
use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload, consts::U12, rand_core::RngCore},
    aes::{Aes128, Aes192, Aes256},
};
use base64::Engine;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use zeroize::Zeroizing;

/// AES-192-GCM with the standard 96-bit nonce
type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES-GCM nonce size: 96 bits (12 bytes)
///
/// Segment nonces are derived from this base by XORing the segment counter
/// into the last four bytes, so a single random base never repeats a nonce
/// within one artifact.
const GCM_NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size: 128 bits (16 bytes)
const GCM_TAG_SIZE: usize = 16;

/// Plaintext bytes per GCM segment
const GCM_SEGMENT_SIZE: usize = 64 * 1024;

/// AES block size, also the CBC IV size
const AES_BLOCK_SIZE: usize = 16;

/// Length of the key check value stored in the header
const KCV_SIZE: usize = 16;

/// Domain separator for the key check value
const KCV_DOMAIN: &[u8] = b"dbvault-kcv";

/// Domain separator for segment associated data
const SEGMENT_AAD: &[u8] = b"dbvault-segment";

/// Supported ciphers, identified on the wire by their lowercase id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
    #[serde(rename = "aes-192-cbc")]
    Aes192Cbc,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes-192-gcm")]
    Aes192Gcm,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherKind {
    /// All supported ciphers
    pub const ALL: [CipherKind; 6] = [
        Self::Aes128Cbc,
        Self::Aes192Cbc,
        Self::Aes256Cbc,
        Self::Aes128Gcm,
        Self::Aes192Gcm,
        Self::Aes256Gcm,
    ];

    /// Required key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes128Gcm => 16,
            Self::Aes192Cbc | Self::Aes192Gcm => 24,
            Self::Aes256Cbc | Self::Aes256Gcm => 32,
        }
    }

    /// IV length in bytes
    pub fn iv_len(&self) -> usize {
        if self.is_authenticated() {
            GCM_NONCE_SIZE
        } else {
            AES_BLOCK_SIZE
        }
    }

    /// True for the GCM family
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Aes128Gcm | Self::Aes192Gcm | Self::Aes256Gcm)
    }

    /// Wire identifier, e.g. `aes-256-gcm`
    pub fn id(&self) -> &'static str {
        match self {
            Self::Aes128Cbc => "aes-128-cbc",
            Self::Aes192Cbc => "aes-192-cbc",
            Self::Aes256Cbc => "aes-256-cbc",
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes192Gcm => "aes-192-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Validates that `key` has the length this cipher requires.
    ///
    /// # Errors
    /// Returns `Encryption` on a length mismatch.
    pub fn validate_key(&self, key: &EncryptionKey) -> crate::Result<()> {
        if key.len() != self.key_len() {
            return Err(DbVaultError::encryption(format!(
                "{} requires a {}-byte key, got {} bytes",
                self,
                self.key_len(),
                key.len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for CipherKind {
    type Err = DbVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|cipher| cipher.id() == normalized)
            .ok_or_else(|| DbVaultError::encryption(format!("unknown cipher '{}'", s)))
    }
}

/// Raw key material, zeroized on drop.
///
/// Keys are supplied out of band by the caller; they are never derived,
/// logged or written into an artifact.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<Vec<u8>>);

impl EncryptionKey {
    /// Wraps raw key bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Decodes a base64 key, ignoring surrounding whitespace.
    ///
    /// # Errors
    /// Returns `Encryption` if the text is not valid base64.
    pub fn from_base64(encoded: &str) -> crate::Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| DbVaultError::encryption(format!("key is not valid base64: {}", e)))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey(<{} bytes redacted>)", self.len())
    }
}

/// Per-artifact cipher parameters, stored in the artifact header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub cipher: CipherKind,
    /// Random IV (CBC) or nonce base (GCM)
    #[serde(with = "crate::models::base64_bytes")]
    pub iv: Vec<u8>,
    /// Key check value binding the key to this IV
    #[serde(with = "crate::models::base64_bytes")]
    pub kcv: Vec<u8>,
}

impl EncryptionParams {
    /// Validates the key and draws a fresh IV for a new artifact.
    ///
    /// # Errors
    /// Returns `Encryption` if the key length does not match the cipher.
    pub fn generate(cipher: CipherKind, key: &EncryptionKey) -> crate::Result<Self> {
        cipher.validate_key(key)?;
        let mut iv = vec![0u8; cipher.iv_len()];
        OsRng.fill_bytes(&mut iv);
        let kcv = key_check_value(&iv, key);
        Ok(Self { cipher, iv, kcv })
    }

    /// Checks `key` against the stored key check value.
    ///
    /// # Errors
    /// Returns `Encryption` for a key of the wrong length or a key that does
    /// not match the one the artifact was written with.
    pub fn check_key(&self, key: &EncryptionKey) -> crate::Result<()> {
        self.cipher.validate_key(key)?;
        if self.iv.len() != self.cipher.iv_len() {
            return Err(DbVaultError::encryption(format!(
                "stored IV has {} bytes, {} expects {}",
                self.iv.len(),
                self.cipher,
                self.cipher.iv_len()
            )));
        }
        if key_check_value(&self.iv, key) != self.kcv {
            return Err(DbVaultError::encryption(
                "key does not match the key this artifact was encrypted with",
            ));
        }
        Ok(())
    }

    /// IV as base64, for display
    pub fn iv_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.iv)
    }
}

/// First 16 bytes of SHA-256(domain || iv || key)
fn key_check_value(iv: &[u8], key: &EncryptionKey) -> Vec<u8> {
    let digest = Sha256::new()
        .chain_update(KCV_DOMAIN)
        .chain_update(iv)
        .chain_update(key.as_bytes())
        .finalize();
    digest[..KCV_SIZE].to_vec()
}

fn cipher_error(context: impl Into<String>) -> io::Error {
    DbVaultError::encryption(context).into_io()
}

/// Wraps `inner` with the cipher described by `params`.
///
/// # Errors
/// Returns `Encryption` if the key does not fit the cipher or the IV.
pub fn encrypt_writer(
    params: &EncryptionParams,
    key: &EncryptionKey,
    inner: Box<dyn LayerWrite>,
) -> crate::Result<Box<dyn LayerWrite>> {
    params.check_key(key)?;
    if params.cipher.is_authenticated() {
        Ok(Box::new(GcmWriter {
            cipher: GcmCipher::new(params.cipher, key)?,
            nonce_base: nonce_base(&params.iv)?,
            counter: 0,
            buffer: Vec::with_capacity(GCM_SEGMENT_SIZE),
            inner,
        }))
    } else {
        Ok(Box::new(CbcWriter {
            cipher: CbcEncryptor::new(params.cipher, key, &params.iv)?,
            pending: Vec::with_capacity(AES_BLOCK_SIZE),
            inner,
        }))
    }
}

/// Wraps `inner` with the decryptor matching `params`.
///
/// # Errors
/// Returns `Encryption` if the key is wrong; nothing is read from `inner`
/// in that case.
pub fn decrypt_reader(
    params: &EncryptionParams,
    key: &EncryptionKey,
    inner: LayerRead,
) -> crate::Result<LayerRead> {
    params.check_key(key)?;
    if params.cipher.is_authenticated() {
        Ok(Box::new(GcmReader {
            cipher: GcmCipher::new(params.cipher, key)?,
            nonce_base: nonce_base(&params.iv)?,
            counter: 0,
            plain: Vec::new(),
            position: 0,
            finished: false,
            inner,
        }))
    } else {
        Ok(Box::new(CbcReader {
            cipher: CbcDecryptor::new(params.cipher, key, &params.iv)?,
            ciphertext: Vec::new(),
            plain: Vec::new(),
            position: 0,
            held_block: None,
            eof: false,
            inner,
        }))
    }
}

fn nonce_base(iv: &[u8]) -> crate::Result<[u8; GCM_NONCE_SIZE]> {
    iv.try_into()
        .map_err(|_| DbVaultError::encryption("GCM nonce base must be 12 bytes"))
}

fn segment_nonce(base: &[u8; GCM_NONCE_SIZE], counter: u32) -> [u8; GCM_NONCE_SIZE] {
    let mut nonce = *base;
    for (byte, counter_byte) in nonce[GCM_NONCE_SIZE - 4..]
        .iter_mut()
        .zip(counter.to_be_bytes())
    {
        *byte ^= counter_byte;
    }
    nonce
}

fn segment_aad(is_final: bool) -> Vec<u8> {
    let mut aad = SEGMENT_AAD.to_vec();
    aad.push(u8::from(is_final));
    aad
}

enum GcmCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl GcmCipher {
    fn new(kind: CipherKind, key: &EncryptionKey) -> crate::Result<Self> {
        let invalid = |_| DbVaultError::encryption(format!("invalid key for {}", kind));
        Ok(match kind {
            CipherKind::Aes128Gcm => {
                Self::Aes128(Box::new(Aes128Gcm::new_from_slice(key.as_bytes()).map_err(invalid)?))
            }
            CipherKind::Aes192Gcm => {
                Self::Aes192(Box::new(Aes192Gcm::new_from_slice(key.as_bytes()).map_err(invalid)?))
            }
            CipherKind::Aes256Gcm => {
                Self::Aes256(Box::new(Aes256Gcm::new_from_slice(key.as_bytes()).map_err(invalid)?))
            }
            other => {
                return Err(DbVaultError::encryption(format!(
                    "{} is not an authenticated cipher",
                    other
                )));
            }
        })
    }

    fn seal(&self, nonce: &[u8; GCM_NONCE_SIZE], aad: &[u8], msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        let payload = Payload { msg, aad };
        let result = match self {
            Self::Aes128(c) => c.encrypt(nonce, payload),
            Self::Aes192(c) => c.encrypt(nonce, payload),
            Self::Aes256(c) => c.encrypt(nonce, payload),
        };
        result.map_err(|_| cipher_error("segment encryption failed"))
    }

    fn open(&self, nonce: &[u8; GCM_NONCE_SIZE], aad: &[u8], msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        let payload = Payload { msg, aad };
        let result = match self {
            Self::Aes128(c) => c.decrypt(nonce, payload),
            Self::Aes192(c) => c.decrypt(nonce, payload),
            Self::Aes256(c) => c.decrypt(nonce, payload),
        };
        result.map_err(|_| cipher_error("segment authentication failed (wrong key or tampered data)"))
    }
}

/// Segment frame: `final flag (1 byte) | ciphertext length (u32 LE) | ciphertext`
struct GcmWriter {
    cipher: GcmCipher,
    nonce_base: [u8; GCM_NONCE_SIZE],
    counter: u32,
    buffer: Vec<u8>,
    inner: Box<dyn LayerWrite>,
}

impl GcmWriter {
    fn seal_segment(&mut self, is_final: bool) -> io::Result<()> {
        let nonce = segment_nonce(&self.nonce_base, self.counter);
        let sealed = self
            .cipher
            .seal(&nonce, &segment_aad(is_final), &self.buffer)?;
        let length = u32::try_from(sealed.len())
            .map_err(|_| cipher_error("segment too large"))?;

        self.inner.write_all(&[u8::from(is_final)])?;
        self.inner.write_all(&length.to_le_bytes())?;
        self.inner.write_all(&sealed)?;

        self.buffer.clear();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| cipher_error("segment counter exhausted"))?;
        Ok(())
    }
}

impl Write for GcmWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // A full buffer is only sealed once more data shows it is not the last.
        if self.buffer.len() == GCM_SEGMENT_SIZE {
            self.seal_segment(false)?;
        }
        let take = (GCM_SEGMENT_SIZE - self.buffer.len()).min(buf.len());
        self.buffer.extend_from_slice(&buf[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl LayerWrite for GcmWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.seal_segment(true)?;
        self.inner.finish()
    }
}

struct GcmReader {
    cipher: GcmCipher,
    nonce_base: [u8; GCM_NONCE_SIZE],
    counter: u32,
    plain: Vec<u8>,
    position: usize,
    finished: bool,
    inner: LayerRead,
}

impl GcmReader {
    fn next_segment(&mut self) -> io::Result<()> {
        let mut header = [0u8; 5];
        self.inner.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                cipher_error("encrypted body truncated before final segment")
            } else {
                e
            }
        })?;

        let is_final = match header[0] {
            0 => false,
            1 => true,
            _ => return Err(cipher_error("malformed segment header")),
        };
        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if length < GCM_TAG_SIZE || length > GCM_SEGMENT_SIZE + GCM_TAG_SIZE {
            return Err(cipher_error("segment length out of range"));
        }

        let mut sealed = vec![0u8; length];
        self.inner
            .read_exact(&mut sealed)
            .map_err(|_| cipher_error("encrypted segment truncated"))?;

        let nonce = segment_nonce(&self.nonce_base, self.counter);
        self.plain = self.cipher.open(&nonce, &segment_aad(is_final), &sealed)?;
        self.position = 0;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| cipher_error("segment counter exhausted"))?;

        if is_final {
            self.finished = true;
            let mut trailing = [0u8; 1];
            if self.inner.read(&mut trailing)? != 0 {
                return Err(cipher_error("data found after final segment"));
            }
        }
        Ok(())
    }
}

impl Read for GcmReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.plain.len() {
            if self.finished || out.is_empty() {
                return Ok(0);
            }
            self.next_segment()?;
        }
        let available = &self.plain[self.position..];
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        self.position += count;
        Ok(count)
    }
}

macro_rules! cbc_dispatch {
    ($name:ident, $mode:ident, $trait_method:ident) => {
        enum $name {
            Aes128(cbc::$mode<Aes128>),
            Aes192(cbc::$mode<Aes192>),
            Aes256(cbc::$mode<Aes256>),
        }

        impl $name {
            fn new(kind: CipherKind, key: &EncryptionKey, iv: &[u8]) -> crate::Result<Self> {
                let invalid =
                    |_| DbVaultError::encryption(format!("invalid key or IV for {}", kind));
                Ok(match kind {
                    CipherKind::Aes128Cbc => Self::Aes128(
                        cbc::$mode::new_from_slices(key.as_bytes(), iv).map_err(invalid)?,
                    ),
                    CipherKind::Aes192Cbc => Self::Aes192(
                        cbc::$mode::new_from_slices(key.as_bytes(), iv).map_err(invalid)?,
                    ),
                    CipherKind::Aes256Cbc => Self::Aes256(
                        cbc::$mode::new_from_slices(key.as_bytes(), iv).map_err(invalid)?,
                    ),
                    other => {
                        return Err(DbVaultError::encryption(format!(
                            "{} is not a CBC cipher",
                            other
                        )));
                    }
                })
            }

            /// Processes whole blocks in place; `data.len()` must be a
            /// multiple of the block size.
            fn process(&mut self, data: &mut [u8]) {
                for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    let block = GenericArray::from_mut_slice(chunk);
                    match self {
                        Self::Aes128(c) => c.$trait_method(block),
                        Self::Aes192(c) => c.$trait_method(block),
                        Self::Aes256(c) => c.$trait_method(block),
                    }
                }
            }
        }
    };
}

cbc_dispatch!(CbcEncryptor, Encryptor, encrypt_block_mut);
cbc_dispatch!(CbcDecryptor, Decryptor, decrypt_block_mut);

struct CbcWriter {
    cipher: CbcEncryptor,
    pending: Vec<u8>,
    inner: Box<dyn LayerWrite>,
}

impl Write for CbcWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let whole = self.pending.len() - self.pending.len() % AES_BLOCK_SIZE;
        if whole > 0 {
            let mut blocks: Vec<u8> = self.pending.drain(..whole).collect();
            self.cipher.process(&mut blocks);
            self.inner.write_all(&blocks)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl LayerWrite for CbcWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        // PKCS#7: always pad, a full block when already aligned.
        let pad = AES_BLOCK_SIZE - self.pending.len();
        let mut last = std::mem::take(&mut self.pending);
        last.resize(AES_BLOCK_SIZE, pad as u8);
        self.cipher.process(&mut last);
        self.inner.write_all(&last)?;
        self.inner.finish()
    }
}

struct CbcReader {
    cipher: CbcDecryptor,
    ciphertext: Vec<u8>,
    plain: Vec<u8>,
    position: usize,
    /// Last decrypted block, held back until EOF shows whether it is padding
    held_block: Option<Vec<u8>>,
    eof: bool,
    inner: LayerRead,
}

impl CbcReader {
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 8192];
        let read = self.inner.read(&mut chunk)?;
        self.plain.clear();
        self.position = 0;

        if read == 0 {
            self.eof = true;
            if !self.ciphertext.is_empty() {
                return Err(cipher_error("CBC body is not a whole number of blocks"));
            }
            let last = self
                .held_block
                .take()
                .ok_or_else(|| cipher_error("CBC body is empty"))?;
            let pad = usize::from(last[AES_BLOCK_SIZE - 1]);
            if pad == 0
                || pad > AES_BLOCK_SIZE
                || !last[AES_BLOCK_SIZE - pad..].iter().all(|b| usize::from(*b) == pad)
            {
                return Err(cipher_error("invalid CBC padding (wrong key or corrupt data)"));
            }
            self.plain.extend_from_slice(&last[..AES_BLOCK_SIZE - pad]);
            return Ok(());
        }

        self.ciphertext.extend_from_slice(&chunk[..read]);
        let whole = self.ciphertext.len() - self.ciphertext.len() % AES_BLOCK_SIZE;
        if whole == 0 {
            return Ok(());
        }
        let mut blocks: Vec<u8> = self.ciphertext.drain(..whole).collect();
        self.cipher.process(&mut blocks);

        if let Some(held) = self.held_block.take() {
            self.plain.extend_from_slice(&held);
        }
        let keep = blocks.split_off(whole - AES_BLOCK_SIZE);
        self.plain.extend_from_slice(&blocks);
        self.held_block = Some(keep);
        Ok(())
    }
}

impl Read for CbcReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.plain.len() {
            if self.eof || out.is_empty() {
                return Ok(0);
            }
            self.fill()?;
        }
        let available = &self.plain[self.position..];
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        self.position += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecSink;

    fn encrypt(params: &EncryptionParams, key: &EncryptionKey, payload: &[u8]) -> Vec<u8> {
        let (sink, bytes) = VecSink::new();
        let mut writer = encrypt_writer(params, key, Box::new(sink)).unwrap();
        // Odd write sizes exercise partial blocks and segment boundaries.
        for piece in payload.chunks(7777) {
            writer.write_all(piece).unwrap();
        }
        writer.finish().unwrap();
        let out = bytes.lock().unwrap().clone();
        out
    }

    fn decrypt(params: &EncryptionParams, key: &EncryptionKey, stored: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut reader =
            decrypt_reader(params, key, Box::new(io::Cursor::new(stored))).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    fn key_for(cipher: CipherKind) -> EncryptionKey {
        EncryptionKey::from_bytes((0..cipher.key_len() as u8).collect())
    }

    #[test]
    fn test_encryption_roundtrip_all_ciphers() {
        let payloads: [Vec<u8>; 4] = [
            Vec::new(),
            b"exactly sixteen!".to_vec(),
            b"short".to_vec(),
            (0..150_000u32).map(|i| (i % 256) as u8).collect(),
        ];

        for cipher in CipherKind::ALL {
            let key = key_for(cipher);
            let params = EncryptionParams::generate(cipher, &key).unwrap();
            for payload in &payloads {
                let stored = encrypt(&params, &key, payload);
                if !payload.is_empty() {
                    assert_ne!(&stored, payload, "{} left plaintext visible", cipher);
                }
                assert_eq!(&decrypt(&params, &key, stored).unwrap(), payload, "{}", cipher);
            }
        }
    }

    #[test]
    fn test_encryption_wrong_key_length_rejected_before_write() {
        for cipher in CipherKind::ALL {
            let short = EncryptionKey::from_bytes(vec![1u8; cipher.key_len() - 1]);
            let result = EncryptionParams::generate(cipher, &short);
            assert!(matches!(result, Err(DbVaultError::Encryption { .. })));
        }
    }

    #[test]
    fn test_encryption_wrong_key_detected_by_kcv() {
        let cipher = CipherKind::Aes256Gcm;
        let key = key_for(cipher);
        let params = EncryptionParams::generate(cipher, &key).unwrap();

        let wrong = EncryptionKey::from_bytes(vec![0xAA; 32]);
        let result = decrypt_reader(&params, &wrong, Box::new(io::empty()));
        assert!(matches!(result, Err(DbVaultError::Encryption { .. })));
    }

    #[test]
    fn test_encryption_iv_is_fresh() {
        let key = key_for(CipherKind::Aes128Cbc);
        let first = EncryptionParams::generate(CipherKind::Aes128Cbc, &key).unwrap();
        let second = EncryptionParams::generate(CipherKind::Aes128Cbc, &key).unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.kcv, second.kcv);
    }

    #[test]
    fn test_encryption_gcm_detects_truncation() {
        let cipher = CipherKind::Aes128Gcm;
        let key = key_for(cipher);
        let params = EncryptionParams::generate(cipher, &key).unwrap();
        let payload = vec![9u8; GCM_SEGMENT_SIZE * 2 + 10];
        let mut stored = encrypt(&params, &key, &payload);

        // Drop the final segment entirely.
        let last_frame = 5 + 10 + GCM_TAG_SIZE;
        stored.truncate(stored.len() - last_frame);
        let error = decrypt(&params, &key, stored).unwrap_err();
        assert!(matches!(
            DbVaultError::io("reading", error),
            DbVaultError::Encryption { .. }
        ));
    }

    #[test]
    fn test_encryption_gcm_detects_tampering() {
        let cipher = CipherKind::Aes192Gcm;
        let key = key_for(cipher);
        let params = EncryptionParams::generate(cipher, &key).unwrap();
        let mut stored = encrypt(&params, &key, b"payload that matters");
        let middle = stored.len() / 2;
        stored[middle] ^= 0x01;
        assert!(decrypt(&params, &key, stored).is_err());
    }

    #[test]
    fn test_cipher_parse_and_display() {
        for cipher in CipherKind::ALL {
            assert_eq!(cipher.id().parse::<CipherKind>().unwrap(), cipher);
        }
        assert!("aes-512-gcm".parse::<CipherKind>().is_err());
        assert_eq!(
            serde_json::to_string(&CipherKind::Aes256Cbc).unwrap(),
            "\"aes-256-cbc\""
        );
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = EncryptionKey::from_base64("AAECAwQFBgcICQoLDA0ODw==").unwrap();
        assert_eq!(key.len(), 16);
        assert_eq!(format!("{:?}", key), "EncryptionKey(<16 bytes redacted>)");
    }
}
