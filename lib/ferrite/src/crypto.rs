use byteorder::{LittleEndian, WriteBytesExt};
use ctor::ctor;
use libsodium_sys;
use std::fmt;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Opaque cryptographic failure: forged data, or material that does not match.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CryptoError;

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cryptographic operation failed")
    }
}

impl std::error::Error for CryptoError {}

#[inline]
fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    (&mut nonce[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(counter)
        .expect("Error building nonce");
    nonce
}

/// Encrypts and authenticates `plain` into `cipher`. The destination must be exactly
/// `plain.len() + MAC_SIZE` bytes. The additional data, counter and key must be presented
/// unchanged on the receiving side for `open` to succeed.
#[inline]
pub fn seal(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    counter: u64,
    key: &[u8; KEY_SIZE],
) -> Result<(), CryptoError> {
    if cipher.len() != plain.len() + MAC_SIZE {
        return Err(CryptoError);
    }

    let nonce = counter_nonce(counter);

    let result = unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        )
    };

    if result < 0 {
        return Err(CryptoError);
    }

    Ok(())
}

/// Verifies and decrypts `cipher` into `plain`. The destination must be exactly
/// `cipher.len() - MAC_SIZE` bytes. Fails when the authentication tag does not verify
/// under the supplied additional data, counter and key.
#[inline]
pub fn open(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    counter: u64,
    key: &[u8; KEY_SIZE],
) -> Result<(), CryptoError> {
    if cipher.len() < MAC_SIZE || plain.len() != cipher.len() - MAC_SIZE {
        return Err(CryptoError);
    }

    let nonce = counter_nonce(counter);

    let result = unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        )
    };

    if result < 0 {
        return Err(CryptoError);
    }

    Ok(())
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let plain = b"the quick brown fox";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        seal(&mut cipher, &plain[..], b"aad", 42, &key).unwrap();

        let mut recovered = vec![0u8; plain.len()];
        open(&mut recovered, &cipher, b"aad", 42, &key).unwrap();

        assert_eq!(&recovered[..], &plain[..]);
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let key = [7u8; KEY_SIZE];
        let other = [8u8; KEY_SIZE];
        let plain = b"telemetry";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        seal(&mut cipher, &plain[..], b"", 1, &key).unwrap();

        let mut recovered = vec![0u8; plain.len()];
        assert_eq!(open(&mut recovered, &cipher, b"", 1, &other), Err(CryptoError));
    }

    #[test]
    fn test_open_rejects_wrong_counter() {
        let key = [7u8; KEY_SIZE];
        let plain = b"telemetry";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        seal(&mut cipher, &plain[..], b"", 1, &key).unwrap();

        let mut recovered = vec![0u8; plain.len()];
        assert_eq!(open(&mut recovered, &cipher, b"", 2, &key), Err(CryptoError));
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let key = [7u8; KEY_SIZE];
        let plain = b"telemetry";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        seal(&mut cipher, &plain[..], b"001", 1, &key).unwrap();

        let mut recovered = vec![0u8; plain.len()];
        assert_eq!(open(&mut recovered, &cipher, b"002", 1, &key), Err(CryptoError));
    }

    #[test]
    fn test_size_mismatch() {
        let key = [0u8; KEY_SIZE];
        let mut cipher = vec![0u8; 4];
        assert_eq!(seal(&mut cipher, b"too long for that", b"", 0, &key), Err(CryptoError));

        let mut plain = vec![0u8; 64];
        assert_eq!(open(&mut plain, &cipher, b"", 0, &key), Err(CryptoError));
    }

    #[test]
    fn test_random_bytes_fills() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a);
        random_bytes(&mut b);
        assert_ne!(a, b);
    }
}
