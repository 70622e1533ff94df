//! Secure-store encryption: AES-256-CBC with PKCS7 padding, keyed by a
//! PBKDF2-SHA256-derived passphrase.
//!
//! Adapted from `shipper-encrypt`, which encrypts state files with
//! AES-256-GCM and a random salt per value. This crate uses CBC/PKCS7 and a
//! salt namespaced to the agent rather than randomized per write, so the
//! same key derives deterministically across store/load cycles without
//! persisting a salt alongside every value — see `DESIGN.md` for why this
//! diverges from the GCM scheme.
//!
//! Encrypted values are recognized by an `encrypted:` prefix on a
//! base64-encoded `iv || ciphertext` payload.

use aes::Aes256;
use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use pbkdf2::pbkdf2_hmac_array;
use rand::Rng;
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Prefix marking a stored value as encrypted.
pub const ENCRYPTED_PREFIX: &str = "encrypted:";

const IV_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Derive the fixed, agent-namespaced salt used for key derivation.
///
/// The salt is intentionally not random: the store persists only the
/// ciphertext (`iv || ciphertext`), never a per-value salt, so the same
/// passphrase must always derive the same key for a given agent.
fn salt_for_agent(agent_id: &str) -> Vec<u8> {
    format!("superagent:{agent_id}").into_bytes()
}

fn derive_key(passphrase: &str, agent_id: &str) -> [u8; KEY_SIZE] {
    let salt = salt_for_agent(agent_id);
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), &salt, PBKDF2_ITERATIONS)
}

/// Encrypt `data` and return the `encrypted:`-prefixed, base64-encoded
/// ciphertext ready to persist via the Secure Store.
pub fn encrypt(data: &[u8], passphrase: &str, agent_id: &str) -> Result<String> {
    let key = derive_key(passphrase, agent_id);

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(data);

    let mut payload = Vec::with_capacity(IV_SIZE + ciphertext.len());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);

    Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(payload)))
}

/// Decrypt a value previously produced by [`encrypt`]. Fails if the value
/// does not carry the `encrypted:` prefix.
pub fn decrypt(stored: &str, passphrase: &str, agent_id: &str) -> Result<Vec<u8>> {
    let Some(b64) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
        bail!("value is not encrypted (missing `{ENCRYPTED_PREFIX}` prefix)");
    };

    let payload = BASE64.decode(b64).context("invalid base64 payload")?;
    if payload.len() < IV_SIZE {
        bail!("encrypted payload too short");
    }

    let (iv, ciphertext) = payload.split_at(IV_SIZE);
    let key = derive_key(passphrase, agent_id);

    let iv: [u8; IV_SIZE] = iv.try_into().expect("checked length above");
    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| anyhow::anyhow!("decryption failed - wrong passphrase or corrupted data: {e}"))
}

/// Whether a stored string is an encrypted value.
pub fn is_encrypted(stored: &str) -> bool {
    stored.starts_with(ENCRYPTED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let plaintext = b"super-secret-bearer-token";
        let encrypted = encrypt(plaintext, "passphrase", "agent-1").expect("encrypt");
        assert!(is_encrypted(&encrypted));

        let decrypted = decrypt(&encrypted, "passphrase", "agent-1").expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_passphrase_fails_to_decrypt() {
        let encrypted = encrypt(b"data", "right", "agent-1").expect("encrypt");
        let err = decrypt(&encrypted, "wrong", "agent-1").unwrap_err();
        assert!(format!("{err:#}").contains("decryption failed"));
    }

    #[test]
    fn different_agent_id_changes_the_derived_key() {
        let encrypted = encrypt(b"data", "pass", "agent-1").expect("encrypt");
        assert!(decrypt(&encrypted, "pass", "agent-2").is_err());
    }

    #[test]
    fn unprefixed_value_is_rejected() {
        let err = decrypt("plain-value", "pass", "agent-1").unwrap_err();
        assert!(format!("{err:#}").contains("missing"));
    }

    #[test]
    fn same_plaintext_encrypts_differently_each_time_due_to_random_iv() {
        let a = encrypt(b"data", "pass", "agent-1").expect("encrypt");
        let b = encrypt(b"data", "pass", "agent-1").expect("encrypt");
        assert_ne!(a, b);
    }
}
