use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{b64, Key};
use crate::backend::{Backend, FileKind, Handle};
use crate::error::{Result, SiloError};
use crate::id::Id;

/// Maximum number of key files tried when opening a repository.
pub const MAX_KEY_ATTEMPTS: usize = 20;

const SALT_LEN: usize = 64;

// KDF parameter bounds. Key files are unencrypted JSON, so a hostile file
// could otherwise request unbounded work or degenerate parameters.
const MIN_N: u32 = 256;
const MAX_N: u32 = 1 << 22;
const MAX_R: u32 = 32;
const MAX_P: u32 = 16;
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

/// Default scrypt work parameters for newly created keys.
pub const DEFAULT_N: u32 = 32768;
pub const DEFAULT_R: u32 = 8;
pub const DEFAULT_P: u32 = 4;

/// One key file, stored unencrypted at `keys/<id>`. The master key lives in
/// `data`, sealed under a user key derived from the password via scrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: DateTime<Utc>,
    pub username: String,
    pub hostname: String,

    pub kdf: String,
    #[serde(rename = "N")]
    pub n: u32,
    pub r: u32,
    pub p: u32,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

fn validate_params(key: &KeyFile) -> Result<()> {
    if key.kdf != "scrypt" {
        return Err(SiloError::KeyDerivation(format!(
            "unsupported KDF '{}'",
            key.kdf
        )));
    }
    if !key.n.is_power_of_two() || key.n < MIN_N || key.n > MAX_N {
        return Err(SiloError::KeyDerivation(format!("invalid N: {}", key.n)));
    }
    if key.r == 0 || key.r > MAX_R {
        return Err(SiloError::KeyDerivation(format!("invalid r: {}", key.r)));
    }
    if key.p == 0 || key.p > MAX_P {
        return Err(SiloError::KeyDerivation(format!("invalid p: {}", key.p)));
    }
    if key.salt.len() < MIN_SALT_LEN || key.salt.len() > MAX_SALT_LEN {
        return Err(SiloError::KeyDerivation(format!(
            "invalid salt length: {}",
            key.salt.len()
        )));
    }
    Ok(())
}

/// Derive the 64-byte user key from a password and stored scrypt parameters.
fn derive_user_key(password: &str, salt: &[u8], n: u32, r: u32, p: u32) -> Result<Key> {
    let log_n = n.trailing_zeros() as u8;
    let params = scrypt::Params::new(log_n, r, p, 64)
        .map_err(|e| SiloError::KeyDerivation(format!("scrypt params: {e}")))?;
    let mut out = Zeroizing::new([0u8; 64]);
    scrypt::scrypt(password.as_bytes(), salt, &params, out.as_mut())
        .map_err(|e| SiloError::KeyDerivation(format!("scrypt: {e}")))?;
    Ok(Key::from_derived(&out))
}

impl KeyFile {
    /// Wrap `master` under a password with the given scrypt parameters.
    pub fn create(master: &Key, password: &str, n: u32, r: u32, p: u32) -> Result<KeyFile> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let user = derive_user_key(password, &salt, n, r, p)?;
        let payload = Zeroizing::new(master.to_json()?);
        let data = user.encrypt(&payload);

        let key = KeyFile {
            created: Utc::now(),
            username: crate::platform::username(),
            hostname: crate::platform::hostname(),
            kdf: "scrypt".to_string(),
            n,
            r,
            p,
            salt,
            data,
        };
        validate_params(&key)?;
        Ok(key)
    }

    /// Try to unlock the master key with `password`.
    pub fn open(&self, password: &str) -> Result<Key> {
        validate_params(self)?;
        let user = derive_user_key(password, &self.salt, self.n, self.r, self.p)?;
        let payload = Zeroizing::new(user.decrypt(&self.data)?);
        let master = Key::from_json(&payload)?;
        if !master.valid() {
            return Err(SiloError::DecryptionFailed);
        }
        Ok(master)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SiloError::Decode("key file", e))
    }

    pub fn from_json(data: &[u8]) -> Result<KeyFile> {
        serde_json::from_slice(data).map_err(|e| SiloError::Decode("key file", e))
    }
}

/// Try each key file in the repository until one opens with `password`.
/// Attempts are bounded so a repository stuffed with key files cannot stall
/// open indefinitely. Returns the unlocking key file's id and the master key.
pub fn search_key(
    backend: &dyn Backend,
    password: &str,
    max_attempts: usize,
) -> Result<(Id, Key)> {
    let mut names = Vec::new();
    backend.list(FileKind::Key, &mut |info| {
        names.push(info.name.clone());
        Ok(())
    })?;
    names.sort();

    let mut checked = 0;
    for name in names {
        if checked >= max_attempts {
            break;
        }
        checked += 1;

        let raw = backend.load(&Handle::new(FileKind::Key, &name), 0, 0)?;
        let keyfile = match KeyFile::from_json(&raw) {
            Ok(kf) => kf,
            Err(e) => {
                tracing::debug!("skipping malformed key file {name}: {e}");
                continue;
            }
        };
        match keyfile.open(password) {
            Ok(master) => {
                let id = Id::parse(&name)?;
                return Ok((id, master));
            }
            Err(SiloError::DecryptionFailed) => continue,
            Err(e) => {
                tracing::debug!("key file {name}: {e}");
                continue;
            }
        }
    }

    Err(SiloError::NoKeyFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PASSWORD: &str = "test-password-123";

    fn fast_keyfile(master: &Key) -> KeyFile {
        KeyFile::create(master, TEST_PASSWORD, 256, 2, 1).unwrap()
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let master = Key::generate();
        let kf = fast_keyfile(&master);
        let opened = kf.open(TEST_PASSWORD).unwrap();
        let a = master.encrypt(b"probe");
        assert_eq!(opened.decrypt(&a).unwrap(), b"probe");
    }

    #[test]
    fn wrong_password_fails() {
        let kf = fast_keyfile(&Key::generate());
        assert!(matches!(
            kf.open("not the password"),
            Err(SiloError::DecryptionFailed)
        ));
    }

    #[test]
    fn json_roundtrip_preserves_fields() {
        let kf = fast_keyfile(&Key::generate());
        let json = kf.to_json().unwrap();
        let back = KeyFile::from_json(&json).unwrap();
        assert_eq!(back.kdf, "scrypt");
        assert_eq!(back.n, 256);
        assert_eq!(back.r, 2);
        assert_eq!(back.p, 1);
        assert_eq!(back.salt, kf.salt);
        assert_eq!(back.data, kf.data);
        assert!(back.open(TEST_PASSWORD).is_ok());
    }

    #[test]
    fn wire_field_names() {
        let kf = fast_keyfile(&Key::generate());
        let json: serde_json::Value =
            serde_json::from_slice(&kf.to_json().unwrap()).unwrap();
        for field in ["created", "username", "hostname", "kdf", "N", "r", "p", "salt", "data"] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn rejects_non_power_of_two_n() {
        let mut kf = fast_keyfile(&Key::generate());
        kf.n = 1000;
        assert!(kf.open(TEST_PASSWORD).is_err());
    }

    #[test]
    fn rejects_excessive_parameters() {
        let mut kf = fast_keyfile(&Key::generate());
        kf.n = 1 << 30;
        assert!(kf.open(TEST_PASSWORD).is_err());

        let mut kf = fast_keyfile(&Key::generate());
        kf.p = 1024;
        assert!(kf.open(TEST_PASSWORD).is_err());
    }

    #[test]
    fn rejects_short_salt() {
        let mut kf = fast_keyfile(&Key::generate());
        kf.salt = vec![0u8; 8];
        assert!(kf.open(TEST_PASSWORD).is_err());
    }

    #[test]
    fn rejects_unknown_kdf() {
        let mut kf = fast_keyfile(&Key::generate());
        kf.kdf = "argon2id".into();
        assert!(kf.open(TEST_PASSWORD).is_err());
    }
}
