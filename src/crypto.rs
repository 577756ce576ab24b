use crypto_secretbox::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Key, Nonce, XSalsa20Poly1305,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::{KEY_SIZE, NONCE_SIZE};

/// Derives a 32-byte key from a secret using HKDF-SHA256.
///
/// The derivation is a pure function: identical inputs always produce the
/// identical key. Distinct `info` labels yield independent keys from the
/// same secret, which is how per-purpose subkeys (e.g. the transit
/// verification tags) are separated.
///
/// # Arguments
/// * `secret` - The input keying material
/// * `salt` - Optional salt (may be empty)
/// * `info` - Context label separating different uses of the same secret
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Encrypts a plaintext with XSalsa20-Poly1305 (NaCl secretbox).
///
/// A fresh 24-byte nonce is drawn from the system CSPRNG for every call and
/// prepended to the sealed box, so the output layout is
/// `nonce(24) || ciphertext || tag(16)`. Random nonces are collision-free
/// for the message counts a single session key ever sees.
///
/// # Arguments
/// * `key` - The 32-byte session key
/// * `plaintext` - The data to seal
///
/// # Returns
/// The nonce-prefixed sealed box, 40 bytes longer than the plaintext
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::AuthFail)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Opens a sealed box produced by [`encrypt`].
///
/// Verifies the Poly1305 tag before releasing any plaintext. A failed
/// verification means the data was tampered with or sealed under a
/// different key; either way the session cannot continue.
///
/// # Arguments
/// * `key` - The 32-byte session key
/// * `blob` - The nonce-prefixed sealed box
///
/// # Returns
/// The plaintext, or [`Error::AuthFail`] if authentication fails
pub fn decrypt(key: &[u8; KEY_SIZE], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return Err(Error::Protocol(format!(
            "sealed box of {} bytes is too short to carry a nonce",
            blob.len()
        )));
    }

    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);

    cipher.decrypt(nonce, &blob[NONCE_SIZE..]).map_err(|_| Error::AuthFail)
}

/// Returns `n` bytes from a cryptographically secure RNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TAG_SIZE;

    // ============================================================================
    // Seal/Open Round Trips
    // ============================================================================

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let plaintext = b"Hello, World! This is a test message.";

        let blob = encrypt(&key, plaintext).expect("Encryption should succeed");
        assert_eq!(blob.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let decrypted = decrypt(&key, &blob).expect("Decryption should succeed");
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn test_encrypt_empty_plaintext() {
        let key = [42u8; KEY_SIZE];

        let blob = encrypt(&key, b"").expect("Encryption of empty data should succeed");
        assert_eq!(blob.len(), NONCE_SIZE + TAG_SIZE);

        let decrypted = decrypt(&key, &blob).expect("Decryption should succeed");
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key1 = [0u8; KEY_SIZE];
        let key2 = [1u8; KEY_SIZE];

        let blob = encrypt(&key1, b"Secret message").expect("Encryption should succeed");

        let result = decrypt(&key2, &blob);
        assert!(matches!(result, Err(Error::AuthFail)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [9u8; KEY_SIZE];
        let mut blob = encrypt(&key, b"Important data").expect("Encryption should succeed");

        blob[NONCE_SIZE + 3] ^= 0xFF;

        assert!(matches!(decrypt(&key, &blob), Err(Error::AuthFail)));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = [9u8; KEY_SIZE];
        let mut blob = encrypt(&key, b"Authenticated data").expect("Encryption should succeed");

        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert!(matches!(decrypt(&key, &blob), Err(Error::AuthFail)));
    }

    #[test]
    fn test_blob_without_full_nonce_rejected() {
        let key = [3u8; KEY_SIZE];
        let result = decrypt(&key, &[0u8; NONCE_SIZE - 1]);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_nonces_are_fresh_per_call() {
        let key = [5u8; KEY_SIZE];
        let blob1 = encrypt(&key, b"same plaintext").expect("Encryption should succeed");
        let blob2 = encrypt(&key, b"same plaintext").expect("Encryption should succeed");

        assert_ne!(blob1[..NONCE_SIZE], blob2[..NONCE_SIZE], "Nonces must differ");
        assert_ne!(blob1, blob2, "Sealed boxes under fresh nonces must differ");
    }

    // ============================================================================
    // Key Derivation
    // ============================================================================

    #[test]
    fn test_derive_key_deterministic() {
        let k1 = derive_key(b"secret", b"salt", b"label");
        let k2 = derive_key(b"secret", b"salt", b"label");
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_derive_key_separates_labels() {
        let k1 = derive_key(b"secret", b"", b"label-one");
        let k2 = derive_key(b"secret", b"", b"label-two");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_derive_key_separates_salts() {
        let k1 = derive_key(b"secret", b"salt-one", b"label");
        let k2 = derive_key(b"secret", b"salt-two", b"label");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_derived_key_usable_for_encryption() {
        let key = derive_key(b"pake output", b"", b"session");
        let blob = encrypt(&key, b"payload").expect("Encryption should succeed");
        let decrypted = decrypt(&key, &blob).expect("Decryption should succeed");
        assert_eq!(&decrypted[..], b"payload");
    }

    // ============================================================================
    // Randomness
    // ============================================================================

    #[test]
    fn test_random_bytes_length_and_variability() {
        let a = random_bytes(8);
        let b = random_bytes(8);
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        assert_ne!(a, b, "Two 64-bit draws should not collide");
    }
}
