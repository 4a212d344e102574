use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use tracing::debug;

use trellis_core::config::SecretsConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::SecretValue;
use trellis_core::types::TemplateId;
use trellis_store::SqliteStore;

const KEY_CONTEXT: &str = "trellis template-secrets v1";

/// Encrypts and decrypts template-scoped secrets.
///
/// Each template gets its own ChaCha20-Poly1305 key derived from the master
/// key; the `(template, name)` pair is bound as associated data so a
/// ciphertext cannot be moved to another slot. Nothing is cached: every
/// `resolve` decrypts afresh and the plaintext lives only as long as the
/// returned `SecretValue`.
pub struct SecretResolver {
    store: Arc<SqliteStore>,
    master_key: Option<[u8; 32]>,
}

impl SecretResolver {
    pub fn new(store: Arc<SqliteStore>, master_key: Option<[u8; 32]>) -> Self {
        Self { store, master_key }
    }

    pub fn from_config(store: Arc<SqliteStore>, config: &SecretsConfig) -> Result<Self> {
        let master_key = config
            .master_key
            .as_deref()
            .map(decode_master_key)
            .transpose()?;
        Ok(Self::new(store, master_key))
    }

    /// A fresh random master key, base64-encoded.
    pub fn generate_master_key() -> String {
        STANDARD.encode(rand::random::<[u8; 32]>())
    }

    pub fn is_configured(&self) -> bool {
        self.master_key.is_some()
    }

    fn cipher(&self, template_id: &TemplateId) -> Result<ChaCha20Poly1305> {
        let master = self
            .master_key
            .as_ref()
            .ok_or_else(|| TrellisError::Crypto("no master key configured".into()))?;
        let mut material = Vec::with_capacity(32 + template_id.0.len());
        material.extend_from_slice(master);
        material.extend_from_slice(template_id.0.as_bytes());
        let key = blake3::derive_key(KEY_CONTEXT, &material);
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }

    /// Encrypt and persist (insert or replace) a secret.
    pub fn store_secret(&self, template_id: &TemplateId, name: &str, plaintext: &str) -> Result<()> {
        let cipher = self.cipher(template_id)?;
        let nonce = rand::random::<[u8; 12]>();
        let aad = associated_data(template_id, name);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| TrellisError::Crypto("encryption failed".into()))?;
        self.store
            .put_secret(template_id, name, &nonce, &ciphertext, Utc::now())?;
        debug!(template_id = %template_id, name, "Secret stored");
        Ok(())
    }

    /// Decrypt a secret for the duration of one call.
    pub fn resolve(&self, template_id: &TemplateId, name: &str) -> Result<SecretValue> {
        let (nonce, ciphertext) =
            self.store
                .get_secret(template_id, name)?
                .ok_or_else(|| TrellisError::SecretNotFound {
                    template_id: template_id.0.clone(),
                    name: name.to_string(),
                })?;
        if nonce.len() != 12 {
            return Err(TrellisError::Crypto("stored nonce has wrong length".into()));
        }
        let cipher = self.cipher(template_id)?;
        let aad = associated_data(template_id, name);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| TrellisError::Crypto("decryption failed (wrong key or tampered data)".into()))?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| TrellisError::Crypto("secret is not valid UTF-8".into()))?;
        Ok(SecretValue::new(text))
    }

    pub fn list(&self, template_id: &TemplateId) -> Result<Vec<String>> {
        self.store.list_secret_names(template_id)
    }
}

fn associated_data(template_id: &TemplateId, name: &str) -> String {
    format!("{}/{}", template_id, name)
}

fn decode_master_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TrellisError::Config(format!("secrets.master_key is not base64: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| TrellisError::Config("secrets.master_key must decode to 32 bytes".into()))
}
