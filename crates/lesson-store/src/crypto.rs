//! Authenticated encryption and integrity primitives keyed by the master key.
//!
//! Encrypted records use AES-256-GCM with a fresh 128-bit IV per call and
//! are encoded as `base64(hex(iv) ":" base64(ciphertext || tag))`.

use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::keys::{KeyError, KeyManager};
use crate::sensitivity::SensitivitySchema;

pub const IV_LEN: usize = 16;
const RECORD_DELIMITER: char = ':';
const ENCRYPTED_FLAG_SUFFIX: &str = "_encrypted";
const BACKUP_VERSION: &str = "1.0";

type Aes256Gcm16 = AesGcm<Aes256, U16>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("invalid encrypted record: {0}")]
    InvalidFormat(&'static str),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("authentication failed: record was tampered with or the key changed")]
    AuthenticationFailed,
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backup integrity check failed")]
    IntegrityCheckFailed,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupEnvelope {
    data: Value,
    timestamp: i64,
    version: String,
    checksum: String,
}

#[derive(Clone)]
pub struct Cipher {
    keys: Arc<KeyManager>,
    schema: Arc<SensitivitySchema>,
}

impl Cipher {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self::with_schema(keys, SensitivitySchema::default())
    }

    pub fn with_schema(keys: Arc<KeyManager>, schema: SensitivitySchema) -> Self {
        Self {
            keys,
            schema: Arc::new(schema),
        }
    }

    pub fn schema(&self) -> &SensitivitySchema {
        &self.schema
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let iv = random_iv();
        let ciphertext = self
            .keys
            .with_key(|key| {
                let cipher =
                    Aes256Gcm16::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
                cipher
                    .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
                    .map_err(|_| CryptoError::EncryptionFailed)
            })
            .await??;
        let record = format!(
            "{}{}{}",
            hex::encode(iv),
            RECORD_DELIMITER,
            general_purpose::STANDARD.encode(ciphertext)
        );
        Ok(general_purpose::STANDARD.encode(record))
    }

    pub async fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let outer = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidFormat("record is not base64"))?;
        let record =
            String::from_utf8(outer).map_err(|_| CryptoError::InvalidFormat("record is not text"))?;
        let parts: Vec<&str> = record.split(RECORD_DELIMITER).collect();
        let [iv_hex, body] = parts.as_slice() else {
            return Err(CryptoError::InvalidFormat("expected exactly iv:ciphertext"));
        };
        let iv = hex::decode(iv_hex).map_err(|_| CryptoError::InvalidFormat("iv is not hex"))?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidFormat("iv has wrong length"));
        }
        let ciphertext = general_purpose::STANDARD
            .decode(body)
            .map_err(|_| CryptoError::InvalidFormat("ciphertext is not base64"))?;

        let plaintext = self
            .keys
            .with_key(|key| {
                let cipher = Aes256Gcm16::new_from_slice(key)
                    .map_err(|_| CryptoError::AuthenticationFailed)?;
                cipher
                    .decrypt(Nonce::<U16>::from_slice(&iv), ciphertext.as_slice())
                    .map_err(|_| CryptoError::AuthenticationFailed)
            })
            .await??;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Hex SHA-256 digest. Uses no key material.
    pub fn hash(&self, data: &str) -> String {
        hex::encode(Sha256::digest(data.as_bytes()))
    }

    pub async fn create_hmac(&self, data: &str) -> Result<String, CryptoError> {
        let tag = self
            .keys
            .with_key(|key| {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                mac.update(data.as_bytes());
                Ok::<_, CryptoError>(mac.finalize().into_bytes())
            })
            .await??;
        Ok(hex::encode(tag))
    }

    /// `Ok(false)` for any mismatch or malformed tag. Errors only when the
    /// master key is unavailable.
    pub async fn verify_hmac(&self, data: &str, tag: &str) -> Result<bool, CryptoError> {
        let Ok(expected) = hex::decode(tag) else {
            return Ok(false);
        };
        let verified = self
            .keys
            .with_key(|key| match <HmacSha256 as Mac>::new_from_slice(key) {
                Ok(mut mac) => {
                    mac.update(data.as_bytes());
                    mac.verify_slice(&expected).is_ok()
                }
                Err(_) => false,
            })
            .await?;
        Ok(verified)
    }

    /// `len` hex characters from the OS RNG.
    pub fn generate_secure_random(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len.div_ceil(2)];
        OsRng.fill_bytes(&mut bytes);
        let mut out = hex::encode(bytes);
        out.truncate(len);
        out
    }

    pub fn should_encrypt(&self, key: &str, data: &Value) -> bool {
        self.schema.should_encrypt(key, data)
    }

    /// Encrypt every tagged top-level field of an object, marking each with
    /// `<field>_encrypted: true`. Non-objects are returned unchanged.
    pub async fn encrypt_fields(&self, record: &Value) -> Result<Value, CryptoError> {
        let Value::Object(fields) = record else {
            return Ok(record.clone());
        };
        let mut out = Map::with_capacity(fields.len());
        for (name, value) in fields {
            if self.schema.is_sensitive_field(name) && !value.is_null() {
                let sealed = self.encrypt(&serde_json::to_string(value)?).await?;
                out.insert(name.clone(), Value::String(sealed));
                out.insert(format!("{name}{ENCRYPTED_FLAG_SUFFIX}"), Value::Bool(true));
            } else {
                out.insert(name.clone(), value.clone());
            }
        }
        Ok(Value::Object(out))
    }

    /// Reverse [`Cipher::encrypt_fields`], dropping the marker fields.
    pub async fn decrypt_fields(&self, record: &Value) -> Result<Value, CryptoError> {
        let Value::Object(fields) = record else {
            return Ok(record.clone());
        };
        let mut out = fields.clone();
        for (flag, marker) in fields {
            let Some(name) = flag.strip_suffix(ENCRYPTED_FLAG_SUFFIX) else {
                continue;
            };
            if marker != &Value::Bool(true) {
                continue;
            }
            if let Some(Value::String(sealed)) = fields.get(name) {
                let plain = self.decrypt(sealed).await?;
                out.insert(name.to_string(), serde_json::from_str(&plain)?);
            }
            out.remove(flag);
        }
        Ok(Value::Object(out))
    }

    /// Encrypt `data` together with a SHA-256 checksum of its canonical JSON.
    pub async fn create_encrypted_backup(&self, data: &Value) -> Result<String, CryptoError> {
        let envelope = BackupEnvelope {
            checksum: self.hash(&serde_json::to_string(data)?),
            data: data.clone(),
            timestamp: Utc::now().timestamp_millis(),
            version: BACKUP_VERSION.to_string(),
        };
        self.encrypt(&serde_json::to_string(&envelope)?).await
    }

    pub async fn restore_encrypted_backup(&self, backup: &str) -> Result<Value, CryptoError> {
        let envelope: BackupEnvelope = serde_json::from_str(&self.decrypt(backup).await?)?;
        if self.hash(&serde_json::to_string(&envelope.data)?) != envelope.checksum {
            return Err(CryptoError::IntegrityCheckFailed);
        }
        Ok(envelope.data)
    }
}

fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::keys::StaticDeviceId;
    use serde_json::json;

    fn cipher_for(device: &str) -> Cipher {
        let backend = Arc::new(MemoryBackend::new());
        let keys = KeyManager::new(Arc::new(StaticDeviceId::new(device)), backend, "__salt");
        Cipher::new(Arc::new(keys))
    }

    #[tokio::test]
    async fn record_format_is_hex_iv_and_base64_body() {
        let cipher = cipher_for("dev");
        let encoded = cipher.encrypt("hello").await.unwrap();
        let record = String::from_utf8(general_purpose::STANDARD.decode(&encoded).unwrap()).unwrap();
        let (iv, body) = record.split_once(':').unwrap();
        assert_eq!(iv.len(), IV_LEN * 2);
        // 5 bytes of plaintext plus the 16-byte tag.
        assert_eq!(general_purpose::STANDARD.decode(body).unwrap().len(), 5 + 16);
        assert_eq!(cipher.decrypt(&encoded).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn extra_delimiter_is_a_format_error() {
        let cipher = cipher_for("dev");
        let bogus = general_purpose::STANDARD.encode("00:11:22");
        assert!(matches!(
            cipher.decrypt(&bogus).await,
            Err(CryptoError::InvalidFormat(_))
        ));
        let missing = general_purpose::STANDARD.encode("no-delimiter");
        assert!(matches!(
            cipher.decrypt(&missing).await,
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn other_key_cannot_decrypt() {
        let sealed = cipher_for("device-a").encrypt("secret").await.unwrap();
        let err = cipher_for("device-b").decrypt(&sealed).await.unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn hmac_verifies_and_rejects() {
        let cipher = cipher_for("dev");
        let tag = cipher.create_hmac("lesson").await.unwrap();
        assert_eq!(tag.len(), 64);
        assert!(cipher.verify_hmac("lesson", &tag).await.unwrap());
        assert!(!cipher.verify_hmac("lesson!", &tag).await.unwrap());
        assert!(!cipher.verify_hmac("lesson", "zz-not-hex").await.unwrap());
    }

    #[test]
    fn hash_is_plain_sha256() {
        let cipher = cipher_for("dev");
        assert_eq!(
            cipher.hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn secure_random_has_requested_length() {
        let cipher = cipher_for("dev");
        let a = cipher.generate_secure_random(31);
        assert_eq!(a.len(), 31);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cipher.generate_secure_random(32), cipher.generate_secure_random(32));
    }

    #[tokio::test]
    async fn field_encryption_marks_and_restores() {
        let cipher = cipher_for("dev");
        let record = json!({"name": "Ana", "email": "ana@example.org", "phone": null});
        let sealed = cipher.encrypt_fields(&record).await.unwrap();
        assert_eq!(sealed["name"], "Ana");
        assert_eq!(sealed["email_encrypted"], true);
        assert_ne!(sealed["email"], "ana@example.org");
        assert!(sealed.get("phone_encrypted").is_none());
        assert_eq!(cipher.decrypt_fields(&sealed).await.unwrap(), record);
    }

    #[tokio::test]
    async fn backup_detects_checksum_mismatch() {
        let cipher = cipher_for("dev");
        let data = json!({"lesson_plans": "[]"});
        let backup = cipher.create_encrypted_backup(&data).await.unwrap();
        assert_eq!(cipher.restore_encrypted_backup(&backup).await.unwrap(), data);

        let forged = json!({"data": {"x": 1}, "timestamp": 0, "version": "1.0", "checksum": "00"});
        let sealed = cipher.encrypt(&forged.to_string()).await.unwrap();
        assert!(matches!(
            cipher.restore_encrypted_backup(&sealed).await,
            Err(CryptoError::IntegrityCheckFailed)
        ));
    }
}
