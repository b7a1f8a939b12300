pub mod keyfile;

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SiloError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Nonce length in bytes.
pub const NONCE_SIZE: usize = 16;
/// Poly1305 tag length in bytes.
pub const TAG_SIZE: usize = 16;
/// Ciphertext overhead: every encrypted payload is `NONCE_SIZE + TAG_SIZE`
/// bytes longer than its plaintext.
pub const EXTENSION: usize = NONCE_SIZE + TAG_SIZE;

/// An authenticated-encryption key: AES-256-CTR for confidentiality,
/// Poly1305-AES for integrity. The same structure serves as the
/// password-derived user key and as the repository master key.
///
/// Serialized form (inside the key file's encrypted payload):
/// `{"mac": {"k": base64, "r": base64}, "encrypt": base64}`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    encryption: [u8; 32],
    mac_k: [u8; 16],
    mac_r: [u8; 16],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyWire {
    mac: MacKeyWire,
    #[serde(with = "b64")]
    encrypt: Vec<u8>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MacKeyWire {
    #[serde(with = "b64")]
    k: Vec<u8>,
    #[serde(with = "b64")]
    r: Vec<u8>,
}

impl Key {
    /// Generate a fresh random key from OS entropy.
    pub fn generate() -> Self {
        let mut key = Key {
            encryption: [0u8; 32],
            mac_k: [0u8; 16],
            mac_r: [0u8; 16],
        };
        rand::rngs::OsRng.fill_bytes(&mut key.encryption);
        rand::rngs::OsRng.fill_bytes(&mut key.mac_k);
        rand::rngs::OsRng.fill_bytes(&mut key.mac_r);
        key
    }

    /// Build a key from a 64-byte KDF output: 32 bytes encryption key,
    /// 16 bytes MAC block key, 16 bytes MAC polynomial part.
    pub(crate) fn from_derived(buf: &[u8; 64]) -> Self {
        let mut key = Key {
            encryption: [0u8; 32],
            mac_k: [0u8; 16],
            mac_r: [0u8; 16],
        };
        key.encryption.copy_from_slice(&buf[..32]);
        key.mac_k.copy_from_slice(&buf[32..48]);
        key.mac_r.copy_from_slice(&buf[48..64]);
        key
    }

    /// Sanity-check the key material. All-zero keys indicate a decode bug,
    /// not a usable key.
    pub fn valid(&self) -> bool {
        self.encryption.iter().any(|&b| b != 0) && self.mac_r.iter().any(|&b| b != 0)
    }

    /// Poly1305-AES: the one-time Poly1305 key is `r` plus the AES-128
    /// encryption of the nonce under `k`.
    fn mac(&self, nonce: &[u8; NONCE_SIZE], msg: &[u8]) -> [u8; TAG_SIZE] {
        let aes = Aes128::new_from_slice(&self.mac_k).expect("16-byte AES-128 key");
        let mut block = aes::Block::clone_from_slice(nonce);
        aes.encrypt_block(&mut block);

        let mut poly_key = [0u8; 32];
        poly_key[..16].copy_from_slice(&self.mac_r);
        poly_key[16..].copy_from_slice(&block);

        let tag = poly1305::Poly1305::new(poly1305::Key::from_slice(&poly_key))
            .compute_unpadded(msg);
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        poly_key.zeroize();
        out
    }

    /// Encrypt and authenticate `plaintext` under `nonce`.
    /// Returns ciphertext with the tag appended: `len(plaintext) + TAG_SIZE`.
    /// Nonces must be fresh per call and never reused with the same key.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        out.extend_from_slice(plaintext);
        let mut cipher = Aes256Ctr::new((&self.encryption).into(), nonce.into());
        cipher.apply_keystream(&mut out);
        let tag = self.mac(nonce, &out);
        out.extend_from_slice(&tag);
        out
    }

    /// Verify and decrypt `data` (ciphertext with trailing tag). Tag failure
    /// is fatal: no partial plaintext is ever returned.
    pub fn open(&self, nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE || data.len() < TAG_SIZE {
            return Err(SiloError::DecryptionFailed);
        }
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        let (ciphertext, tag) = data.split_at(data.len() - TAG_SIZE);
        let expected = self.mac(&nonce_bytes, ciphertext);
        if expected.ct_eq(tag).unwrap_u8() != 1 {
            return Err(SiloError::DecryptionFailed);
        }

        let mut out = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new((&self.encryption).into(), (&nonce_bytes).into());
        cipher.apply_keystream(&mut out);
        Ok(out)
    }

    /// Encrypt with a fresh random nonce. Wire layout: `nonce ‖ ciphertext ‖ tag`,
    /// `EXTENSION` bytes longer than the plaintext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = random_nonce();
        let mut out = Vec::with_capacity(plaintext.len() + EXTENSION);
        out.extend_from_slice(&nonce);
        out.extend(self.seal(&nonce, plaintext));
        out
    }

    /// Decrypt data produced by [`Key::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < EXTENSION {
            return Err(SiloError::DecryptionFailed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.open(nonce, ciphertext)
    }

    /// Serialize to the master-key JSON payload.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let wire = KeyWire {
            mac: MacKeyWire {
                k: self.mac_k.to_vec(),
                r: self.mac_r.to_vec(),
            },
            encrypt: self.encryption.to_vec(),
        };
        serde_json::to_vec(&wire).map_err(|e| SiloError::Decode("key", e))
    }

    /// Parse the master-key JSON payload.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let wire: KeyWire =
            serde_json::from_slice(data).map_err(|e| SiloError::Decode("key", e))?;
        if wire.encrypt.len() != 32 || wire.mac.k.len() != 16 || wire.mac.r.len() != 16 {
            return Err(SiloError::DecryptionFailed);
        }
        let mut key = Key {
            encryption: [0u8; 32],
            mac_k: [0u8; 16],
            mac_r: [0u8; 16],
        };
        key.encryption.copy_from_slice(&wire.encrypt);
        key.mac_k.copy_from_slice(&wire.mac.k);
        key.mac_r.copy_from_slice(&wire.mac.r);
        Ok(key)
    }
}

/// A fresh random nonce from OS entropy.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Base64 (standard alphabet) serde adapter for binary JSON fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}
