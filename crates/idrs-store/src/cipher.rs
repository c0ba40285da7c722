use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Result, anyhow, bail};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-GCM nonce length in bytes.
const IV_LEN: usize = 12;

/// Output of [`Cipher::encrypt`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Symmetric cipher used to wrap snapshots.
pub trait Cipher: Send + Sync {
    /// Name recorded in the envelope's `algorithm` field.
    fn algorithm(&self) -> &str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed>;

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM keyed by the SHA-256 digest of a configured secret.
pub struct AesGcmCipher {
    inner: Aes256Gcm,
}

impl AesGcmCipher {
    pub const ALGORITHM: &'static str = "aes-256-gcm";

    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            inner: Aes256Gcm::new(key),
        }
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn algorithm(&self) -> &str {
        Self::ALGORITHM
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = self
            .inner
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| anyhow!("aes-256-gcm encryption failed"))?;
        Ok(Sealed {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != IV_LEN {
            bail!("invalid iv length {} (expected {IV_LEN})", iv.len());
        }
        self.inner
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| anyhow!("aes-256-gcm decryption failed (wrong key or tampered data)"))
    }
}
