//! Key derivation, keystream and authentication primitives for the
//! encrypted backend.
//!
//! The password never touches the data key directly: Argon2id stretches
//! it (with a per-image salt) into a wrapping key and a header-MAC key,
//! and the random 256-bit file key is stored XOR-encrypted under the
//! wrapping key with a truncated HMAC binding it to the header. Block
//! contents are ChaCha20 keystream XOR under the file key, one nonce
//! per block; a whole-disk HMAC-SHA-256 over the ciphertexts makes the
//! image tamper-evident.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{FsError, Result};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const KDF_ID_ARGON2ID: u16 = 1;
pub(crate) const WRAP_TAG_LEN: usize = 16;

/// Argon2id cost parameters, persisted in the image header so old
/// images stay readable when the defaults move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KdfParams {
    pub(crate) fn recommended() -> Self {
        KdfParams {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }

    pub(crate) fn encode(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..4].copy_from_slice(&self.m_cost.to_le_bytes());
        out[4..8].copy_from_slice(&self.t_cost.to_le_bytes());
        out[8..12].copy_from_slice(&self.p_cost.to_le_bytes());
        out
    }

    pub(crate) fn decode(bytes: &[u8; 32]) -> Self {
        KdfParams {
            m_cost: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            t_cost: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            p_cost: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// The two subkeys stretched out of a password.
pub(crate) struct PasswordKeys {
    pub wrap_key: [u8; 32],
    pub mac_key: [u8; 32],
}

pub(crate) fn derive_password_keys(
    password: &[u8],
    salt: &[u8; 16],
    params: &KdfParams,
) -> Result<PasswordKeys> {
    let params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(64))
        .map_err(|e| FsError::Format(format!("bad KDF parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut okm = [0u8; 64];
    argon2
        .hash_password_into(password, salt, &mut okm)
        .map_err(|e| FsError::Format(format!("key derivation failed: {e}")))?;
    let mut keys = PasswordKeys { wrap_key: [0u8; 32], mac_key: [0u8; 32] };
    keys.wrap_key.copy_from_slice(&okm[..32]);
    keys.mac_key.copy_from_slice(&okm[32..]);
    Ok(keys)
}

/// Nonce for logical block `block`: the base nonce with the block
/// number XORed into its low eight bytes. Injective for any device we
/// can address, so no (key, nonce) pair ever repeats.
pub(crate) fn block_nonce(base: &[u8; 12], block: u64) -> [u8; 12] {
    let mut nonce = *base;
    for (b, k) in nonce[..8].iter_mut().zip(block.to_le_bytes()) {
        *b ^= k;
    }
    nonce
}

pub(crate) fn apply_keystream(key: &[u8; 32], nonce: &[u8; 12], data: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// En/decrypts one logical block in place (XOR keystream, so the same
/// call goes both ways).
pub(crate) fn apply_block_keystream(key: &[u8; 32], base: &[u8; 12], block: u64, data: &mut [u8]) {
    apply_keystream(key, &block_nonce(base, block), data);
}

fn wrap_mac(keys: &PasswordKeys, salt: &[u8; 16], base_nonce: &[u8; 12], ct: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(&keys.mac_key).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(base_nonce);
    mac.update(ct);
    mac
}

/// `ciphertext[32] || tag[16]`: the file key under the wrapping key,
/// bound to this header's salt and nonce.
pub(crate) fn wrap_file_key(
    file_key: &[u8; 32],
    keys: &PasswordKeys,
    salt: &[u8; 16],
    base_nonce: &[u8; 12],
) -> [u8; 48] {
    let mut ct = *file_key;
    apply_keystream(&keys.wrap_key, base_nonce, &mut ct);
    let tag = wrap_mac(keys, salt, base_nonce, &ct).finalize().into_bytes();
    let mut out = [0u8; 48];
    out[..32].copy_from_slice(&ct);
    out[32..].copy_from_slice(&tag[..WRAP_TAG_LEN]);
    out
}

/// Verifies the password binding and recovers the file key. Tag
/// comparison is constant-time; a mismatch is `Auth`, reported before
/// any data block is read.
pub(crate) fn unwrap_file_key(
    wrapped: &[u8; 48],
    keys: &PasswordKeys,
    salt: &[u8; 16],
    base_nonce: &[u8; 12],
) -> Result<[u8; 32]> {
    let ct: [u8; 32] = wrapped[..32].try_into().unwrap();
    wrap_mac(keys, salt, base_nonce, &ct)
        .verify_truncated_left(&wrapped[32..])
        .map_err(|_| FsError::Auth)?;
    let mut file_key = ct;
    apply_keystream(&keys.wrap_key, base_nonce, &mut file_key);
    Ok(file_key)
}

/// The whole-disk MAC is keyed independently of the keystream.
pub(crate) fn disk_mac_key(file_key: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(file_key).expect("hmac accepts any key length");
    mac.update(b"vaultfs whole-disk mac");
    mac.finalize().into_bytes().into()
}

pub(crate) fn compute_disk_mac(mac_key: &[u8; 32], ciphertext: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

pub(crate) fn verify_disk_mac(mac_key: &[u8; 32], ciphertext: &[u8], stored: &[u8; 32]) -> bool {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(ciphertext);
    mac.verify_slice(stored).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chacha20_known_answer() {
        // RFC 8439 §2.4.2: key 00..1f, nonce 000000009000000000000004a,
        // counter 1. Our streams start at counter 0, so skip one block.
        let key: [u8; 32] = hex::decode(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .unwrap()
        .try_into()
        .unwrap();
        let nonce: [u8; 12] = hex::decode("000000000000004a00000000").unwrap().try_into().unwrap();
        let mut buf = [0u8; 96];
        apply_keystream(&key, &nonce, &mut buf);
        let expected_second_block = hex::decode(
            "224f51f3401bd9e12fde276fb8631ded8c131f823d2c06e27e4fcaec9ef3cf78",
        )
        .unwrap();
        assert_eq!(&buf[64..], &expected_second_block[..]);
    }

    #[test]
    fn test_keystream_is_involutive() {
        let key = [7u8; 32];
        let nonce = [9u8; 12];
        let mut data = b"attack at dawn".to_vec();
        apply_keystream(&key, &nonce, &mut data);
        assert_ne!(&data, b"attack at dawn");
        apply_keystream(&key, &nonce, &mut data);
        assert_eq!(&data, b"attack at dawn");
    }

    #[test]
    fn test_block_nonce_is_injective_over_low_blocks() {
        let base = [0xABu8; 12];
        let a = block_nonce(&base, 0);
        let b = block_nonce(&base, 1);
        let c = block_nonce(&base, 1 << 40);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        // High four bytes are untouched.
        assert_eq!(a[8..], base[8..]);
    }

    #[test]
    fn test_wrap_round_trip_and_wrong_password() {
        let params = KdfParams { m_cost: 32, t_cost: 1, p_cost: 1 };
        let salt = [3u8; 16];
        let base_nonce = [4u8; 12];
        let file_key = [0x42u8; 32];

        let keys = derive_password_keys(b"hunter2", &salt, &params).unwrap();
        let wrapped = wrap_file_key(&file_key, &keys, &salt, &base_nonce);
        assert_eq!(unwrap_file_key(&wrapped, &keys, &salt, &base_nonce).unwrap(), file_key);

        let wrong = derive_password_keys(b"hunter3", &salt, &params).unwrap();
        assert!(matches!(
            unwrap_file_key(&wrapped, &wrong, &salt, &base_nonce),
            Err(FsError::Auth)
        ));
    }

    #[test]
    fn test_kdf_params_round_trip() {
        let params = KdfParams { m_cost: 65536, t_cost: 3, p_cost: 4 };
        assert_eq!(KdfParams::decode(&params.encode()), params);
    }

    #[test]
    fn test_disk_mac_detects_flip() {
        let mac_key = disk_mac_key(&[1u8; 32]);
        let mut ct = vec![0xEEu8; 4096];
        let tag = compute_disk_mac(&mac_key, &ct);
        assert!(verify_disk_mac(&mac_key, &ct, &tag));
        ct[1234] ^= 0x01;
        assert!(!verify_disk_mac(&mac_key, &ct, &tag));
    }
}
