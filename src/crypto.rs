//! Field-level envelope encryption for sensitive collections.
//!
//! Documents in a small closed set of collections carry fields that must
//! never reach disk in the clear: password hashes, session tokens, private
//! key material, and the like. For those fields the store applies envelope
//! encryption: each value is sealed with AES-256-GCM under a key derived
//! from the process-wide master key, wrapped in a JSON envelope
//! `{ payload: { key_id, algorithm, ciphertext }, signature }`, signed with
//! HMAC-SHA256, and base64-encoded as a whole for storage.
//!
//! The construction is deliberately replaceable: the store depends only on
//! the envelope shape, so a different primitive (including a post-quantum
//! one) can be swapped in at this seam.

use crate::error::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Algorithm tag recorded in every envelope.
const ENVELOPE_ALGORITHM: &str = "AES-256-GCM";

/// Sensitive collections and the payload fields encrypted at rest.
const SENSITIVE_COLLECTIONS: &[(&str, &[&str])] = &[
    ("credentials", &["hash", "salt"]),
    ("keystore", &["private_key"]),
    ("sessions", &["token_hash"]),
    ("audit", &["details"]),
    ("threat_events", &["indicators"]),
    ("access_control", &["permissions"]),
];

/// The declared sensitive fields for a collection, if it is sensitive.
pub fn sensitive_fields(collection: &str) -> Option<&'static [&'static str]> {
    SENSITIVE_COLLECTIONS
        .iter()
        .find(|(name, _)| *name == collection)
        .map(|(_, fields)| *fields)
}

/// The process-wide master encryption key.
///
/// Installed once on the store before the first sensitive read or write.
/// The key id is stable per key material, so documents written under one
/// key can name it in their `encryption_key_id` marker.
#[derive(Clone)]
pub struct MasterKey {
    material: Vec<u8>,
    key_id: String,
}

impl MasterKey {
    /// Create a master key from raw key material.
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        let material = material.into();
        let digest = Sha256::digest(&material);
        let key_id = hex::encode(&digest[..8]);
        Self { material, key_id }
    }

    /// Stable identifier for this key (first 16 hex chars of its SHA-256).
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Derive a purpose-bound 32-byte subkey via HKDF-SHA256.
    fn derive(&self, purpose: &[u8]) -> MeshResult<[u8; 32]> {
        let hk = Hkdf::<Sha256>::new(None, &self.material);
        let mut info = Vec::with_capacity(purpose.len() + self.key_id.len());
        info.extend_from_slice(purpose);
        info.extend_from_slice(self.key_id.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| MeshError::crypto("key derivation failed"))?;
        Ok(okm)
    }

    fn encryption_key(&self) -> MeshResult<[u8; 32]> {
        self.derive(b"meshdb field encryption v1:")
    }

    fn signing_key(&self) -> MeshResult<[u8; 32]> {
        self.derive(b"meshdb envelope signing v1:")
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in logs.
        f.debug_struct("MasterKey")
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Inner envelope: the encrypted value plus the metadata needed to open it.
#[derive(Debug, Serialize, Deserialize)]
struct EnvelopePayload {
    key_id: String,
    algorithm: String,
    /// base64(nonce || ciphertext || tag)
    ciphertext: String,
}

/// Outer envelope: payload plus HMAC-SHA256 signature over its JSON bytes.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: EnvelopePayload,
    /// base64 HMAC-SHA256
    signature: String,
}

/// Encrypt a single field value into its encoded envelope string.
pub fn encrypt_field(key: &MasterKey, value: &JsonValue) -> MeshResult<String> {
    let plaintext = serde_json::to_vec(value)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| MeshError::crypto("nonce generation failed"))?;

    let unbound = UnboundKey::new(&AES_256_GCM, &key.encryption_key()?)
        .map_err(|_| MeshError::crypto("cipher key rejected"))?;
    let sealing = LessSafeKey::new(unbound);

    let mut in_out = plaintext;
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| MeshError::crypto("encryption failed"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);

    let payload = EnvelopePayload {
        key_id: key.key_id.clone(),
        algorithm: ENVELOPE_ALGORITHM.to_string(),
        ciphertext: BASE64.encode(&sealed),
    };
    let signature = sign_payload(key, &payload)?;

    let envelope = Envelope { payload, signature };
    Ok(BASE64.encode(serde_json::to_vec(&envelope)?))
}

/// Open an encoded envelope string back into the original field value.
///
/// The signature is verified before any decryption is attempted; an
/// envelope produced under a different key id is rejected.
pub fn decrypt_field(key: &MasterKey, encoded: &str) -> MeshResult<JsonValue> {
    let envelope_bytes = BASE64
        .decode(encoded)
        .map_err(|_| MeshError::crypto("envelope is not valid base64"))?;
    let envelope: Envelope = serde_json::from_slice(&envelope_bytes)
        .map_err(|_| MeshError::crypto("envelope parse failure"))?;

    if envelope.payload.key_id != key.key_id {
        return Err(MeshError::crypto(format!(
            "envelope was sealed under inactive key id '{}'",
            envelope.payload.key_id
        )));
    }
    if envelope.payload.algorithm != ENVELOPE_ALGORITHM {
        return Err(MeshError::crypto(format!(
            "unsupported envelope algorithm '{}'",
            envelope.payload.algorithm
        )));
    }

    verify_payload(key, &envelope.payload, &envelope.signature)?;

    let sealed = BASE64
        .decode(&envelope.payload.ciphertext)
        .map_err(|_| MeshError::crypto("ciphertext is not valid base64"))?;
    if sealed.len() <= NONCE_LEN {
        return Err(MeshError::crypto("ciphertext too short"));
    }
    let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| MeshError::crypto("malformed nonce"))?;

    let unbound = UnboundKey::new(&AES_256_GCM, &key.encryption_key()?)
        .map_err(|_| MeshError::crypto("cipher key rejected"))?;
    let opening = LessSafeKey::new(unbound);

    let mut in_out = body.to_vec();
    let plaintext = opening
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| MeshError::crypto("decryption failed"))?;

    serde_json::from_slice(plaintext).map_err(|_| MeshError::crypto("decrypted value is not JSON"))
}

fn sign_payload(key: &MasterKey, payload: &EnvelopePayload) -> MeshResult<String> {
    let bytes = serde_json::to_vec(payload)?;
    let mut mac = HmacSha256::new_from_slice(&key.signing_key()?)
        .map_err(|_| MeshError::crypto("signing key rejected"))?;
    mac.update(&bytes);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn verify_payload(key: &MasterKey, payload: &EnvelopePayload, signature: &str) -> MeshResult<()> {
    let bytes = serde_json::to_vec(payload)?;
    let expected = BASE64
        .decode(signature)
        .map_err(|_| MeshError::crypto("signature is not valid base64"))?;
    let mut mac = HmacSha256::new_from_slice(&key.signing_key()?)
        .map_err(|_| MeshError::crypto("signing key rejected"))?;
    mac.update(&bytes);
    mac.verify_slice(&expected)
        .map_err(|_| MeshError::crypto("signature verification failure"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_registry() {
        assert_eq!(sensitive_fields("credentials"), Some(["hash", "salt"].as_slice()));
        assert_eq!(sensitive_fields("sessions"), Some(["token_hash"].as_slice()));
        assert!(sensitive_fields("users").is_none());
    }

    #[test]
    fn test_key_id_is_stable() {
        let a = MasterKey::new(b"secret".to_vec());
        let b = MasterKey::new(b"secret".to_vec());
        let c = MasterKey::new(b"other".to_vec());
        assert_eq!(a.key_id(), b.key_id());
        assert_ne!(a.key_id(), c.key_id());
        assert_eq!(a.key_id().len(), 16);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = MasterKey::new(b"test master key".to_vec());
        for value in [json!("abc"), json!(42), json!({"nested": [1, 2, 3]})] {
            let sealed = encrypt_field(&key, &value).unwrap();
            assert_ne!(sealed, value.to_string());
            let opened = decrypt_field(&key, &sealed).unwrap();
            assert_eq!(opened, value);
        }
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let key = MasterKey::new(b"test master key".to_vec());
        let sealed = encrypt_field(&key, &json!("super-secret-hash")).unwrap();
        assert!(!sealed.contains("super-secret-hash"));
        let decoded = String::from_utf8(BASE64.decode(&sealed).unwrap()).unwrap();
        assert!(!decoded.contains("super-secret-hash"));
    }

    #[test]
    fn test_wrong_key_id_is_rejected() {
        let key = MasterKey::new(b"key one".to_vec());
        let other = MasterKey::new(b"key two".to_vec());
        let sealed = encrypt_field(&key, &json!("value")).unwrap();
        let err = decrypt_field(&other, &sealed).unwrap_err();
        assert!(matches!(err, MeshError::Crypto { .. }));
    }

    #[test]
    fn test_tampered_envelope_fails_verification() {
        let key = MasterKey::new(b"test master key".to_vec());
        let sealed = encrypt_field(&key, &json!("value")).unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(&sealed).unwrap()).unwrap();
        envelope["payload"]["ciphertext"] = json!(BASE64.encode(b"forged bytes here, 12+"));
        let forged = BASE64.encode(serde_json::to_vec(&envelope).unwrap());

        let err = decrypt_field(&key, &forged).unwrap_err();
        assert!(matches!(err, MeshError::Crypto { .. }));
    }

    #[test]
    fn test_envelope_shape() {
        let key = MasterKey::new(b"test master key".to_vec());
        let sealed = encrypt_field(&key, &json!("v")).unwrap();
        let envelope: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(&sealed).unwrap()).unwrap();
        assert_eq!(envelope["payload"]["algorithm"], "AES-256-GCM");
        assert_eq!(envelope["payload"]["key_id"], key.key_id());
        assert!(envelope["payload"]["ciphertext"].is_string());
        assert!(envelope["signature"].is_string());
    }
}
