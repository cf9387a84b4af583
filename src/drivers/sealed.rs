//! Sealed archives
//!
//! [`SealedDriver`] wraps another driver and encrypts the complete archive
//! file with AES-256-GCM. The key is derived from a passphrase obtained
//! through the key manager, one provider per mount point.
//!
//! Layout: `[magic: 8][salt: 16][nonce: 12][ciphertext + tag]`. The key is
//! SHA-256 over salt and passphrase. A fresh salt and nonce are drawn every
//! time the archive is written.

use super::{read_source, MemorySource};
use crate::core::buffer_pool::IoBufferPool;
use crate::core::container::{InputContainer, OutputContainer};
use crate::core::driver::ArchiveDriver;
use crate::core::entry::{Entry, EntryType, FsEntry};
use crate::core::error::{FsError, Result};
use crate::core::key::{KeyProvider, PromptingKeyManager};
use crate::core::model::FsModel;
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAGIC: &[u8; 8] = b"MTRYSEAL";
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = MAGIC.len() + SALT_SIZE + NONCE_SIZE;

/// Secret entered by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Passphrase(secret.into())
    }

    fn derive(&self, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(self.0.as_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

fn crypto_error(what: &str) -> FsError {
    FsError::Io(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}

/// Encrypts `plain` into the sealed layout.
pub fn seal(plain: &[u8], passphrase: &Passphrase) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = passphrase.derive(&salt);
    let cipher = Aes256Gcm::new(&key.into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| crypto_error("encryption failed"))?;

    let mut sealed = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    sealed.extend_from_slice(MAGIC);
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Parsed sealed archive, not yet decrypted.
struct Sealed<'a> {
    salt: &'a [u8],
    nonce: &'a [u8],
    ciphertext: &'a [u8],
}

impl<'a> Sealed<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE || &data[..MAGIC.len()] != MAGIC {
            return Err(crypto_error("not a sealed archive"));
        }
        let (salt, rest) = data[MAGIC.len()..].split_at(SALT_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        Ok(Sealed {
            salt,
            nonce,
            ciphertext,
        })
    }

    /// `None` if the passphrase is wrong or the data was tampered with.
    fn open(&self, passphrase: &Passphrase) -> Option<Vec<u8>> {
        let key = passphrase.derive(self.salt);
        Aes256Gcm::new(&key.into())
            .decrypt(Nonce::from_slice(self.nonce), self.ciphertext)
            .ok()
    }
}

pub struct SealedDriver<D> {
    inner: D,
    keys: Arc<PromptingKeyManager<Passphrase>>,
}

impl<D: ArchiveDriver> SealedDriver<D> {
    pub fn new(inner: D, keys: Arc<PromptingKeyManager<Passphrase>>) -> Self {
        SealedDriver { inner, keys }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ArchiveDriver> ArchiveDriver for SealedDriver<D> {
    type Entry = D::Entry;

    fn new_entry(&self, name: &str, entry_type: EntryType, template: Option<&dyn Entry>) -> D::Entry {
        self.inner.new_entry(name, entry_type, template)
    }

    fn new_input_container(
        &self,
        model: &FsModel,
        source: &mut dyn InputSocket<FsEntry>,
    ) -> Result<Box<dyn InputContainer<D::Entry>>> {
        let (target, data) = read_source(source)?;
        let sealed = Sealed::parse(&data)?;
        let provider = self.keys.provider(model.mount_point().path());

        let mut invalid = false;
        let plain = loop {
            let passphrase = provider.key_for_reading(invalid)?;
            match sealed.open(&passphrase) {
                Some(plain) => break plain,
                None => {
                    warn!("Wrong passphrase for {}", model.mount_point());
                    invalid = true;
                }
            }
        };
        debug!("Unsealed {} ({} bytes)", model.mount_point(), plain.len());
        self.inner
            .new_input_container(model, &mut MemorySource { target, data: plain })
    }

    fn new_output_container(
        &self,
        model: &FsModel,
        sink: &mut dyn OutputSocket<FsEntry>,
        source: Option<&dyn InputContainer<D::Entry>>,
    ) -> Result<Box<dyn OutputContainer<D::Entry>>> {
        let passphrase = self
            .keys
            .provider(model.mount_point().path())
            .key_for_writing()?;
        let mut sealing = SealingSink {
            target: sink.target()?,
            writer: Some(sink.stream(None)?),
            passphrase,
        };
        self.inner.new_output_container(model, &mut sealing, source)
    }

    fn redundant_content_support(&self) -> bool {
        self.inner.redundant_content_support()
    }

    fn redundant_meta_data_support(&self) -> bool {
        self.inner.redundant_meta_data_support()
    }

    fn pool(&self) -> Arc<dyn IoBufferPool> {
        self.inner.pool()
    }
}

/// Hands the real archive stream to the inner driver, sealed.
struct SealingSink {
    target: FsEntry,
    writer: Option<Box<dyn EntryWriter>>,
    passphrase: Passphrase,
}

impl OutputSocket<FsEntry> for SealingSink {
    fn target(&mut self) -> Result<FsEntry> {
        Ok(self.target.clone())
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let inner = self
            .writer
            .take()
            .ok_or_else(|| FsError::Busy(self.target.name().to_string()))?;
        Ok(Box::new(SealingWriter {
            inner,
            plain: Vec::new(),
            passphrase: self.passphrase.clone(),
        }))
    }
}

struct SealingWriter {
    inner: Box<dyn EntryWriter>,
    plain: Vec<u8>,
    passphrase: Passphrase,
}

impl Write for SealingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.plain.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter for SealingWriter {
    fn close(self: Box<Self>) -> Result<()> {
        let SealingWriter {
            mut inner,
            plain,
            passphrase,
        } = *self;
        let sealed = seal(&plain, &passphrase)?;
        inner.write_all(&sealed)?;
        inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let passphrase = Passphrase::new("correct horse");
        let sealed = seal(b"archive bytes", &passphrase).unwrap();
        assert_eq!(&sealed[..MAGIC.len()], MAGIC);

        let parsed = Sealed::parse(&sealed).unwrap();
        assert_eq!(parsed.open(&passphrase).unwrap(), b"archive bytes");
        assert!(parsed.open(&Passphrase::new("wrong")).is_none());
    }

    #[test]
    fn test_fresh_salt_per_seal() {
        let passphrase = Passphrase::new("p");
        assert_ne!(seal(b"x", &passphrase).unwrap(), seal(b"x", &passphrase).unwrap());
    }

    #[test]
    fn test_rejects_unsealed_data() {
        assert!(Sealed::parse(b"PK\x03\x04").is_err());
    }

    #[test]
    fn test_passphrase_debug_is_redacted() {
        assert_eq!(format!("{:?}", Passphrase::new("secret")), "Passphrase(..)");
    }
}
