use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::cipher::Cipher;

/// On-disk wrapper for an encrypted snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Hex-encoded ciphertext.
    pub encrypted: String,
    /// Hex-encoded nonce.
    pub iv: String,
    pub algorithm: String,
}

impl Envelope {
    pub fn seal(cipher: &dyn Cipher, plaintext: &[u8]) -> Result<Self> {
        let sealed = cipher.encrypt(plaintext)?;
        Ok(Self {
            encrypted: hex::encode(sealed.ciphertext),
            iv: hex::encode(sealed.iv),
            algorithm: cipher.algorithm().to_string(),
        })
    }

    pub fn open(&self, cipher: &dyn Cipher) -> Result<Vec<u8>> {
        if self.algorithm != cipher.algorithm() {
            bail!(
                "envelope algorithm '{}' does not match cipher '{}'",
                self.algorithm,
                cipher.algorithm()
            );
        }
        let iv = hex::decode(&self.iv).context("envelope iv is not valid hex")?;
        let ciphertext = hex::decode(&self.encrypted).context("envelope payload is not valid hex")?;
        cipher.decrypt(&iv, &ciphertext)
    }
}
