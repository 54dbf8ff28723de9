//! Shared-secret primitives used by the controller firmware.
//!
//! Every key is derived from a fixed vendor secret and the device's hardware
//! address; the derived key drives an RC4 keystream. The same construction
//! protects Wi-Fi credentials in transit and lets a client check that a device
//! answered the login challenge like a genuine unit would.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use rc4::consts::{U16, U48};
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Secret mixed into the challenge-response digest.
pub const SHARED_KEY_CHALLENGE: &[u8; 16] = b"evenmoresecret!!";

/// Secret used to encrypt the station-mode Wi-Fi password (firmware before 2.4.25).
pub const SHARED_KEY_WIFI: &[u8] = b"supersecretkey!!";

/// Secret used to encrypt Wi-Fi password and SSID since firmware 2.4.25.
pub const SHARED_KEY_WIFI_V2: &[u8] = &[
    0x26, 0x80, 0xf5, 0x87, 0x9f, 0xee, 0x2c, 0x75, 0x11, 0xaa, 0x08, 0x15, 0x47, 0x44, 0x8e,
    0x04, 0x99, 0xcd, 0x68, 0x07, 0x6e, 0x09, 0x32, 0x62, 0x5d, 0xc4, 0xde, 0x7c, 0x38, 0x98,
    0x9e, 0x88, 0x80, 0xee, 0x2a, 0xb7, 0x33, 0x67, 0x8f, 0xa2, 0x0d, 0xcc, 0x85, 0xd8, 0x94,
    0xcd, 0x94, 0x4f,
];

/// Credentials are zero-padded to this many bytes before encryption.
pub const CREDENTIAL_BLOCK_LEN: usize = 64;

/// Length of a login challenge in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Errors produced before any cipher work is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("value is {len} bytes long, at most {max} bytes fit the credential block")]
    ValueTooLong { len: usize, max: usize },
    #[error("ciphertext is not valid base64: {0}")]
    Encoding(String),
    #[error("transport secret is {len} bytes; only 16- and 48-byte secrets are supported")]
    UnsupportedSecret { len: usize },
}

/// Repeats `mac` to the length of `secret` and XORs the two byte-wise.
pub fn derive_key(secret: &[u8], mac: &[u8; 6]) -> Vec<u8> {
    secret
        .iter()
        .zip(mac.iter().cycle())
        .map(|(s, m)| s ^ m)
        .collect()
}

/// Encrypts the station-mode password with the legacy transport secret.
///
/// The result is the base64 text sent as `encpassword`.
pub fn encrypt_password(password: &str, mac: &[u8; 6]) -> Result<String, CryptoError> {
    encrypt_credential(password.as_bytes(), mac, SHARED_KEY_WIFI)
}

/// Encrypts a password or SSID with an arbitrary transport secret.
pub fn encrypt_credential(
    credential: &[u8],
    mac: &[u8; 6],
    secret: &[u8],
) -> Result<String, CryptoError> {
    if credential.len() > CREDENTIAL_BLOCK_LEN {
        return Err(CryptoError::ValueTooLong {
            len: credential.len(),
            max: CREDENTIAL_BLOCK_LEN,
        });
    }
    let mut block = [0u8; CREDENTIAL_BLOCK_LEN];
    block[..credential.len()].copy_from_slice(credential);
    apply_keystream(&derive_key(secret, mac), &mut block)?;
    Ok(STANDARD.encode(block))
}

/// Reverses [`encrypt_credential`], returning the zero-padded block.
pub fn decrypt_credential(
    ciphertext: &str,
    mac: &[u8; 6],
    secret: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut block = STANDARD
        .decode(ciphertext)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    apply_keystream(&derive_key(secret, mac), &mut block)?;
    Ok(block)
}

/// Recomputes the `challenge-response` a genuine device returns for `challenge`.
///
/// Output is 40 lowercase hex characters (SHA-1 over the RC4 ciphertext).
pub fn compute_challenge_digest(challenge: &[u8], mac: &[u8; 6]) -> String {
    let key: [u8; 16] = core::array::from_fn(|i| SHARED_KEY_CHALLENGE[i] ^ mac[i % mac.len()]);
    let mut buf = challenge.to_vec();
    Rc4::<U16>::new(&key.into()).apply_keystream(&mut buf);
    let digest = Sha1::digest(&buf);
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Fresh 32-byte challenge from the operating system RNG.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// XORs `buf` with the RC4 keystream of `key`; encryption and decryption are
/// the same operation.
fn apply_keystream(key: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
    let unsupported = |_| CryptoError::UnsupportedSecret { len: key.len() };
    match key.len() {
        16 => Rc4::<U16>::new_from_slice(key)
            .map_err(unsupported)?
            .apply_keystream(buf),
        48 => Rc4::<U48>::new_from_slice(key)
            .map_err(unsupported)?
            .apply_keystream(buf),
        len => return Err(CryptoError::UnsupportedSecret { len }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x5c, 0xcf, 0x7f, 0x33, 0xaa, 0xff];

    #[test]
    fn derive_key_xors_repeated_mac() {
        let key = derive_key(SHARED_KEY_WIFI, &MAC);
        assert_eq!(key.len(), SHARED_KEY_WIFI.len());
        for (idx, byte) in key.iter().enumerate() {
            assert_eq!(*byte, SHARED_KEY_WIFI[idx] ^ MAC[idx % 6]);
        }
        assert_eq!(
            key,
            b"/\xba\x0fV\xd8\x8c9\xac\rV\xde\x949\xb6^\x12".to_vec()
        );
    }

    #[test]
    fn derive_challenge_key_matches_known_vector() {
        assert_eq!(
            derive_key(SHARED_KEY_CHALLENGE, &MAC),
            b"9\xb9\x1a]\xc7\x90.\xaa\x0cV\xc9\x8d9\xbb^\x12".to_vec()
        );
    }

    #[test]
    fn derive_key_depends_on_every_mac_byte() {
        let base = derive_key(SHARED_KEY_WIFI, &[0u8; 6]);
        for pos in 0..6 {
            let mut mac = [0u8; 6];
            mac[pos] = 0x01;
            assert_ne!(derive_key(SHARED_KEY_WIFI, &mac), base, "byte {pos}");
        }
        assert_ne!(derive_key(SHARED_KEY_WIFI, &MAC), SHARED_KEY_WIFI.to_vec());
    }

    #[test]
    fn derive_key_covers_long_secret() {
        let key = derive_key(SHARED_KEY_WIFI_V2, &MAC);
        assert_eq!(key.len(), 48);
        assert_eq!(key[47], SHARED_KEY_WIFI_V2[47] ^ MAC[5]);
    }

    #[test]
    fn encrypt_password_matches_known_vector() {
        let cipher = encrypt_password("Twinkly", &MAC).unwrap();
        assert_eq!(
            cipher,
            "e4XXiiUhg4J1FnJEfUQ0BhIji2HGVk1NHU5vGCHfyclFdX6R8Nd9BSXVKS5nj2FXGU6SWv9CIzztfAvGgTGLUw=="
        );
    }

    #[test]
    fn encrypt_credential_with_v2_key_matches_known_vector() {
        let cipher = encrypt_credential(b"Twinkly", &MAC, SHARED_KEY_WIFI_V2).unwrap();
        assert_eq!(
            cipher,
            "R8/Wb0N52RLRU9HAqutebsmJZrNwdMJPOzmXLk4+0cjUTgXS/J+nZ9icDcTNb5P2Kb6TZP2TCNxpQGtnjetMrg=="
        );
    }

    #[test]
    fn decrypting_password_recovers_padded_block() {
        let cipher = encrypt_password("hunter2", &MAC).unwrap();
        let plain = decrypt_credential(&cipher, &MAC, SHARED_KEY_WIFI).unwrap();
        let mut expected = b"hunter2".to_vec();
        expected.resize(CREDENTIAL_BLOCK_LEN, 0);
        assert_eq!(plain, expected);
    }

    #[test]
    fn password_of_exactly_64_bytes_is_accepted() {
        let password = "p".repeat(64);
        let cipher = encrypt_password(&password, &MAC).unwrap();
        let plain = decrypt_credential(&cipher, &MAC, SHARED_KEY_WIFI).unwrap();
        assert_eq!(plain, password.as_bytes());
    }

    #[test]
    fn oversized_password_is_rejected() {
        let err = encrypt_password(&"x".repeat(65), &MAC).unwrap_err();
        assert_eq!(err, CryptoError::ValueTooLong { len: 65, max: 64 });
    }

    #[test]
    fn challenge_digest_is_deterministic() {
        let challenge = [7u8; CHALLENGE_LEN];
        let first = compute_challenge_digest(&challenge, &MAC);
        let second = compute_challenge_digest(&challenge, &MAC);
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn challenge_digest_reproduces_reference_login() {
        let challenge = STANDARD
            .decode("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=")
            .unwrap();
        assert_eq!(
            compute_challenge_digest(&challenge, &MAC),
            "97a63e2c1ac34b6948cec8badb60a59ab36ff6e9"
        );
    }

    #[test]
    fn secret_of_unsupported_length_is_rejected() {
        let err = encrypt_credential(b"Twinkly", &MAC, b"short").unwrap_err();
        assert_eq!(err, CryptoError::UnsupportedSecret { len: 5 });
    }

    #[test]
    fn keystream_matches_rc4_reference_vector() {
        // RFC 6229, 128-bit key 0x0102..0x10, keystream offset 0.
        let key: Vec<u8> = (1..=16).collect();
        let mut buf = [0u8; 16];
        apply_keystream(&key, &mut buf).unwrap();
        assert_eq!(
            buf,
            [
                0x9a, 0xc7, 0xcc, 0x9a, 0x60, 0x9d, 0x1e, 0xf7, 0xb2, 0x93, 0x28, 0x99, 0xcd, 0xe4,
                0x1b, 0x97
            ]
        );
    }

    #[test]
    fn generated_challenges_differ() {
        assert_ne!(generate_challenge(), generate_challenge());
    }
}
