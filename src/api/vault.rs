use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum VaultError {
    #[error("VAULT_KEY must be 64 hex characters (32 bytes)")]
    BadKey,
    #[error("sealed value is corrupt or was sealed with another key")]
    Corrupt,
}

/// AES-256-GCM envelope for exchange secrets at rest.
/// Sealed form: `hex(nonce || ciphertext || tag)`.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn from_hex(key_hex: &str) -> Result<Self, VaultError> {
        let key = hex::decode(key_hex.trim()).map_err(|_| VaultError::BadKey)?;
        if key.len() != 32 {
            return Err(VaultError::BadKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::BadKey)?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        use rand::Rng;
        let nonce: [u8; NONCE_LEN] = rand::rng().random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Corrupt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String, VaultError> {
        let raw = hex::decode(sealed).map_err(|_| VaultError::Corrupt)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Corrupt);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Corrupt)?;
        String::from_utf8(plain).map_err(|_| VaultError::Corrupt)
    }
}
