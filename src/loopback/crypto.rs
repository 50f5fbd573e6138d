//! Key derivation and the AES256-CTS-HMAC-SHA1-96 primitives every loopback mechanism uses.

use picky_krb::crypto::{CipherSuite, KerberosCryptoError};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::Secret;

const KEY_LEN: usize = 32;

fn suite() -> CipherSuite {
    CipherSuite::Aes256CtsHmacSha196
}

pub(super) fn etype() -> u8 {
    u8::from(suite())
}

pub(super) fn string_to_key(password: &str, salt: &str) -> Result<Secret<Vec<u8>>, KerberosCryptoError> {
    let key = suite()
        .cipher()
        .generate_key_from_password(password.as_bytes(), salt.as_bytes())?;

    Ok(Secret::new(key))
}

pub(super) fn random_key() -> Secret<Vec<u8>> {
    let mut key = vec![0; KEY_LEN];
    OsRng.fill_bytes(&mut key);

    Secret::new(key)
}

pub(super) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut data = [0; N];
    OsRng.fill_bytes(&mut data);

    data
}

pub(super) fn encrypt(key: &Secret<Vec<u8>>, usage: i32, data: &[u8]) -> Result<Vec<u8>, KerberosCryptoError> {
    suite().cipher().encrypt(key.as_ref(), usage, data)
}

pub(super) fn decrypt(key: &Secret<Vec<u8>>, usage: i32, data: &[u8]) -> Result<Vec<u8>, KerberosCryptoError> {
    suite().cipher().decrypt(key.as_ref(), usage, data)
}

pub(super) fn checksum(key: &Secret<Vec<u8>>, usage: i32, data: &[u8]) -> Result<Vec<u8>, KerberosCryptoError> {
    suite().cipher().checksum_type().hasher().checksum(key.as_ref(), usage, data)
}
