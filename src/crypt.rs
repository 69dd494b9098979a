//! Streaming encryption for stored objects.
//!
//! The proxy treats encryption as a transparent filter: uploads are written through
//! [`Crypter::encrypt`] before they reach the backend, downloads are read through
//! [`Crypter::decrypt`] before they reach the client. Failures surface as ordinary
//! [`io::Error`]s on the wrapped stream.
//!
//! # Stream Format
//!
//! [`AesGcmCrypter`] uses the AES-256-GCM STREAM construction (big-endian 32-bit counter):
//!
//! - A 7-byte random nonce prefix opens the stream.
//! - Each record is `last:u8 | len:u32 | ciphertext`, where `ciphertext` seals at most
//!   [`SEGMENT_SIZE`] bytes of plaintext plus a 16-byte tag.
//! - The final record has `last = 1`; its absence means the stream was truncated.
use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

use aes_gcm::{
    Aes256Gcm, KeyInit,
    aead::{
        generic_array::GenericArray,
        stream::{DecryptorBE32, EncryptorBE32},
    },
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::StreamSink;

pub const KEY_SIZE: usize = 32;
pub const SEGMENT_SIZE: usize = 64 * 1024;

const NONCE_PREFIX_SIZE: usize = 7;
const TAG_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 5;
const KEY_INFO: &[u8] = b"objproxy-object-key-v1";
const KEY_SALT: &[u8] = b"objproxy";

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("failed to read key file: {0}")]
    KeyFile(#[from] io::Error),

    #[error("key file is empty")]
    EmptyKey,

    #[error("key derivation failed")]
    Derivation,
}

/// Wraps streams for encryption and decryption.
pub trait Crypter: Send + Sync {
    fn encrypt(&self, sink: Box<dyn StreamSink>) -> io::Result<Box<dyn StreamSink>>;

    fn decrypt<'a>(&self, source: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>>;
}

/// An absent crypter rejects every request.
impl<C: Crypter> Crypter for Option<C> {
    fn encrypt(&self, sink: Box<dyn StreamSink>) -> io::Result<Box<dyn StreamSink>> {
        match self {
            Some(crypter) => crypter.encrypt(sink),
            None => Err(not_configured()),
        }
    }

    fn decrypt<'a>(&self, source: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        match self {
            Some(crypter) => crypter.decrypt(source),
            None => Err(not_configured()),
        }
    }
}

fn not_configured() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "encryption is not configured")
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey {
    bytes: [u8; KEY_SIZE],
}

impl CryptoKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Derives a key from a passphrase with HKDF-SHA256.
    pub fn derive(passphrase: &[u8]) -> Result<Self, CryptError> {
        if passphrase.is_empty() {
            return Err(CryptError::EmptyKey);
        }
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), passphrase);
        let mut bytes = [0_u8; KEY_SIZE];
        hk.expand(KEY_INFO, &mut bytes)
            .map_err(|_| CryptError::Derivation)?;
        Ok(Self { bytes })
    }

    /// Loads a key file. Exactly [`KEY_SIZE`] bytes are used verbatim; anything else is a
    /// passphrase, with surrounding whitespace ignored.
    pub fn load(path: &Path) -> Result<Self, CryptError> {
        let mut contents = fs::read(path)?;
        let key = match <[u8; KEY_SIZE]>::try_from(contents.as_slice()) {
            Ok(raw) => Ok(Self::from_bytes(raw)),
            Err(_) => Self::derive(contents.trim_ascii()),
        };
        contents.zeroize();
        key
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AesGcmCrypter {
    key: CryptoKey,
}

impl AesGcmCrypter {
    pub fn new(key: CryptoKey) -> Self {
        Self { key }
    }
}

impl Crypter for AesGcmCrypter {
    fn encrypt(&self, mut sink: Box<dyn StreamSink>) -> io::Result<Box<dyn StreamSink>> {
        let mut prefix = [0_u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        sink.write_all(&prefix)?;

        Ok(Box::new(EncryptingSink {
            inner: sink,
            encryptor: Some(EncryptorBE32::from_aead(
                self.key.cipher(),
                GenericArray::from_slice(&prefix),
            )),
            buffer: Vec::with_capacity(SEGMENT_SIZE),
        }))
    }

    fn decrypt<'a>(&self, source: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(DecryptingReader {
            inner: source,
            cipher: Some(self.key.cipher()),
            decryptor: None,
            plain: Vec::new(),
            pos: 0,
            done: false,
        }))
    }
}

struct EncryptingSink {
    inner: Box<dyn StreamSink>,
    encryptor: Option<EncryptorBE32<Aes256Gcm>>,
    buffer: Vec<u8>,
}

impl EncryptingSink {
    fn write_record(&mut self, last: bool, ciphertext: &[u8]) -> io::Result<()> {
        let mut header = [0_u8; RECORD_HEADER_SIZE];
        header[0] = u8::from(last);
        header[1..].copy_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        self.inner.write_all(&header)?;
        self.inner.write_all(ciphertext)
    }
}

impl Write for EncryptingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        // Hold back a full segment so the final record is never empty unless the stream is.
        while self.buffer.len() > SEGMENT_SIZE {
            let encryptor = self
                .encryptor
                .as_mut()
                .ok_or_else(|| invalid("encrypted stream already finished"))?;
            let sealed = encryptor
                .encrypt_next(&self.buffer[..SEGMENT_SIZE])
                .map_err(|_| invalid("failed to seal segment"))?;
            self.buffer.drain(..SEGMENT_SIZE);
            self.write_record(false, &sealed)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StreamSink for EncryptingSink {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let encryptor = self
            .encryptor
            .take()
            .ok_or_else(|| invalid("encrypted stream already finished"))?;
        let rest = std::mem::take(&mut self.buffer);
        let sealed = encryptor
            .encrypt_last(rest.as_slice())
            .map_err(|_| invalid("failed to seal final segment"))?;
        self.write_record(true, &sealed)?;

        let this = *self;
        this.inner.finish()
    }
}

struct DecryptingReader<'a> {
    inner: Box<dyn Read + 'a>,
    cipher: Option<Aes256Gcm>,
    decryptor: Option<DecryptorBE32<Aes256Gcm>>,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl DecryptingReader<'_> {
    fn read_exact_or_truncated(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => invalid("encrypted stream is truncated"),
            _ => e,
        })
    }

    fn next_record(&mut self) -> io::Result<()> {
        if let Some(cipher) = self.cipher.take() {
            let mut prefix = [0_u8; NONCE_PREFIX_SIZE];
            self.read_exact_or_truncated(&mut prefix)?;
            self.decryptor = Some(DecryptorBE32::from_aead(
                cipher,
                GenericArray::from_slice(&prefix),
            ));
        }

        let mut header = [0_u8; RECORD_HEADER_SIZE];
        self.read_exact_or_truncated(&mut header)?;
        let last = match header[0] {
            0 => false,
            1 => true,
            _ => return Err(invalid("corrupt record header")),
        };
        let mut len = [0_u8; 4];
        len.copy_from_slice(&header[1..]);
        let len = u32::from_be_bytes(len) as usize;
        if len < TAG_SIZE || len > SEGMENT_SIZE + TAG_SIZE {
            return Err(invalid("corrupt record length"));
        }

        let mut sealed = vec![0_u8; len];
        self.read_exact_or_truncated(&mut sealed)?;

        let opened = if last {
            self.done = true;
            self.decryptor
                .take()
                .ok_or_else(|| invalid("encrypted stream already finished"))?
                .decrypt_last(sealed.as_slice())
        } else {
            self.decryptor
                .as_mut()
                .ok_or_else(|| invalid("encrypted stream already finished"))?
                .decrypt_next(sealed.as_slice())
        };
        self.plain = opened.map_err(|_| invalid("failed to authenticate segment"))?;
        self.pos = 0;

        Ok(())
    }
}

impl Read for DecryptingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_record()?;
        }

        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
