//! Key handling for the frontend/factory credential exchange.
//!
//! The frontend seals a per-classad symmetric session key with the factory
//! public RSA key (`ReqEncKeyCode`, base64). Every encrypted attribute is
//! then hex-encoded AES ciphertext under that session key. The session key
//! travels as a `cypher:<name>,key:<hex>,iv:<hex>` code.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::hash::MessageDigest;
use openssl::pkey::Private;
use openssl::rsa::{Padding, Rsa};
use openssl::symm::Cipher;
use std::path::Path;

use crate::Result;
use crate::common::error::FactoryError;

fn cred_err(msg: impl Into<String>) -> FactoryError {
    FactoryError::CredentialError(msg.into())
}

/// The factory RSA key pair; the private half unseals session keys, the
/// public half is advertised so frontends can seal them.
pub struct FactoryKey {
    rsa: Rsa<Private>,
    pub_pem: String,
    key_id: String,
}

impl FactoryKey {
    pub fn load(path: &Path) -> Result<FactoryKey> {
        let pem = std::fs::read(path)
            .map_err(|e| cred_err(format!("cannot read RSA key {}: {e}", path.display())))?;
        let rsa = Rsa::private_key_from_pem(&pem)
            .map_err(|e| cred_err(format!("invalid RSA key {}: {e}", path.display())))?;
        Self::from_rsa(rsa)
    }

    /// Fresh key pair, used by tests and by first-boot key creation.
    pub fn generate() -> Result<FactoryKey> {
        let rsa = Rsa::generate(2048).map_err(|e| cred_err(format!("RSA generate: {e}")))?;
        Self::from_rsa(rsa)
    }

    fn from_rsa(rsa: Rsa<Private>) -> Result<FactoryKey> {
        let pub_der = rsa
            .public_key_to_pem()
            .map_err(|e| cred_err(format!("cannot export public key: {e}")))?;
        let pub_pem = String::from_utf8(pub_der)
            .map_err(|_| cred_err("public key PEM is not UTF-8".to_string()))?;
        let digest = openssl::hash::hash(MessageDigest::md5(), pub_pem.as_bytes())
            .map_err(|e| cred_err(format!("cannot hash public key: {e}")))?;
        Ok(FactoryKey {
            rsa,
            key_id: hex::encode(digest),
            pub_pem,
        })
    }

    pub fn key_type(&self) -> &'static str {
        "RSA"
    }

    /// Identifier the frontends put into `ReqPubKeyID`.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn pub_key_pem(&self) -> &str {
        &self.pub_pem
    }

    /// Unseal a base64 `ReqEncKeyCode` into the session key.
    pub fn extract_sym_key(&self, enc_key_code: &str) -> Result<SymKey> {
        let sealed = BASE64
            .decode(enc_key_code.trim().as_bytes())
            .map_err(|e| cred_err(format!("ReqEncKeyCode is not base64: {e}")))?;
        let mut plain = vec![0u8; self.rsa.size() as usize];
        let len = self
            .rsa
            .private_decrypt(&sealed, &mut plain, Padding::PKCS1_OAEP)
            .map_err(|e| cred_err(format!("cannot unseal session key: {e}")))?;
        plain.truncate(len);
        let code = String::from_utf8(plain)
            .map_err(|_| cred_err("session key code is not UTF-8".to_string()))?;
        SymKey::from_key_iv_code(&code)
    }

    /// Seal a session key with the public half; the frontend-side operation,
    /// exercised in tests.
    pub fn seal_sym_key(&self, key: &SymKey) -> Result<String> {
        let code = key.key_iv_code();
        let mut sealed = vec![0u8; self.rsa.size() as usize];
        let len = self
            .rsa
            .public_encrypt(code.as_bytes(), &mut sealed, Padding::PKCS1_OAEP)
            .map_err(|e| cred_err(format!("cannot seal session key: {e}")))?;
        sealed.truncate(len);
        Ok(BASE64.encode(sealed))
    }
}

/// Symmetric session key; ciphertexts on the wire are hex-encoded.
#[derive(Clone)]
pub struct SymKey {
    cipher_name: String,
    key: Vec<u8>,
    iv: Vec<u8>,
}

fn cipher_for(name: &str) -> Result<Cipher> {
    match name {
        "aes_256_cbc" => Ok(Cipher::aes_256_cbc()),
        "aes_128_cbc" => Ok(Cipher::aes_128_cbc()),
        other => Err(cred_err(format!("unsupported cypher '{other}'"))),
    }
}

impl SymKey {
    pub fn from_key_iv_code(code: &str) -> Result<SymKey> {
        let parts: Vec<&str> = code.split(',').collect();
        let [cypher, key, iv] = parts.as_slice() else {
            return Err(cred_err("malformed session key code".to_string()));
        };
        let cipher_name = cypher
            .strip_prefix("cypher:")
            .ok_or_else(|| cred_err("session key code: cypher not found".to_string()))?;
        let key_hex = key
            .strip_prefix("key:")
            .ok_or_else(|| cred_err("session key code: key not found".to_string()))?;
        let iv_hex = iv
            .strip_prefix("iv:")
            .ok_or_else(|| cred_err("session key code: iv not found".to_string()))?;

        let cipher = cipher_for(cipher_name)?;
        let key = hex::decode(key_hex).map_err(|e| cred_err(format!("bad key hex: {e}")))?;
        let iv = hex::decode(iv_hex).map_err(|e| cred_err(format!("bad iv hex: {e}")))?;
        if key.len() != cipher.key_len() {
            return Err(cred_err(format!(
                "key must be exactly {} bytes, got {}",
                cipher.key_len(),
                key.len()
            )));
        }
        if Some(iv.len()) != cipher.iv_len() {
            return Err(cred_err(format!(
                "iv must be exactly {:?} bytes, got {}",
                cipher.iv_len(),
                iv.len()
            )));
        }
        Ok(SymKey {
            cipher_name: cipher_name.to_string(),
            key,
            iv,
        })
    }

    pub fn new_random() -> Result<SymKey> {
        let cipher = Cipher::aes_256_cbc();
        let mut key = vec![0u8; cipher.key_len()];
        let mut iv = vec![0u8; cipher.iv_len().unwrap_or(16)];
        openssl::rand::rand_bytes(&mut key).map_err(|e| cred_err(format!("rand: {e}")))?;
        openssl::rand::rand_bytes(&mut iv).map_err(|e| cred_err(format!("rand: {e}")))?;
        Ok(SymKey {
            cipher_name: "aes_256_cbc".to_string(),
            key,
            iv,
        })
    }

    pub fn key_iv_code(&self) -> String {
        format!(
            "cypher:{},key:{},iv:{}",
            self.cipher_name,
            hex::encode(&self.key),
            hex::encode(&self.iv)
        )
    }

    pub fn decrypt_hex(&self, data: &str) -> Result<Vec<u8>> {
        let cipher = cipher_for(&self.cipher_name)?;
        let raw = hex::decode(data.trim()).map_err(|e| cred_err(format!("bad ciphertext hex: {e}")))?;
        openssl::symm::decrypt(cipher, &self.key, Some(&self.iv), &raw)
            .map_err(|e| cred_err(format!("decryption failed: {e}")))
    }

    /// Decrypt and require valid UTF-8, for string-typed attributes.
    pub fn decrypt_hex_string(&self, data: &str) -> Result<String> {
        let plain = self.decrypt_hex(data)?;
        String::from_utf8(plain).map_err(|_| cred_err("decrypted value is not UTF-8".to_string()))
    }

    pub fn encrypt_hex(&self, data: &[u8]) -> Result<String> {
        let cipher = cipher_for(&self.cipher_name)?;
        let raw = openssl::symm::encrypt(cipher, &self.key, Some(&self.iv), data)
            .map_err(|e| cred_err(format!("encryption failed: {e}")))?;
        Ok(hex::encode(raw))
    }
}
