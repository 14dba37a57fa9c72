//! Thin wrappers over the OpenSSL primitives used by pairing and client
//! identity checks.
//!
//! Paired-client identity is certificate *verification* equality: a
//! presented certificate matches a stored one when it verifies against the
//! stored certificate's public key. PEM byte comparison is never used.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private};
use openssl::sha::Sha256;
use openssl::sign::{Signer, Verifier};
use openssl::symm::{Cipher, Crypter, Mode};
use openssl::x509::X509Ref;

use crate::error::Result;

pub const AES_BLOCK_SIZE: usize = 16;

/// AES-128-ECB without padding; `data` must be a whole number of blocks.
pub fn aes_ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    aes_ecb(Mode::Encrypt, key, data)
}

/// Inverse of [`aes_ecb_encrypt`].
pub fn aes_ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    aes_ecb(Mode::Decrypt, key, data)
}

fn aes_ecb(mode: Mode, key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::aes_128_ecb();
    let mut crypter = Crypter::new(cipher, mode, key, None)?;
    crypter.pad(false);
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut out)?;
    written += crypter.finalize(&mut out[written..])?;
    out.truncate(written);
    Ok(out)
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finish()
}

/// RSA-SHA256 signature with the host private key.
pub fn sign_sha256(key: &PKeyRef<Private>, data: &[u8]) -> Result<Vec<u8>> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    Ok(signer.sign_oneshot_to_vec(data)?)
}

/// Verify an RSA-SHA256 signature against the certificate's public key.
pub fn verify_sha256(cert: &X509Ref, data: &[u8], signature: &[u8]) -> bool {
    let Ok(pubkey) = cert.public_key() else {
        return false;
    };
    Verifier::new(MessageDigest::sha256(), &pubkey)
        .and_then(|mut v| v.verify_oneshot(signature, data))
        .unwrap_or(false)
}

/// The raw signature bitstring of a certificate, as mixed into the
/// pairing hashes on both sides of the handshake.
pub fn cert_signature(cert: &X509Ref) -> Vec<u8> {
    cert.signature().as_slice().to_vec()
}

/// X.509 verification equality: does `presented` verify against the key of
/// `stored`? This is the only identity used for paired clients.
pub fn certs_match(presented: &X509Ref, stored: &X509Ref) -> bool {
    stored
        .public_key()
        .and_then(|key| presented.verify(&key))
        .unwrap_or(false)
}

/// Hex SHA-256 fingerprint, used to key in-flight pairing state.
pub fn cert_fingerprint(cert: &X509Ref) -> Result<String> {
    let digest = cert.digest(MessageDigest::sha256())?;
    Ok(hex::encode(&digest[..]))
}

/// Cryptographically random byte array (keys, salts, challenges).
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(buf)
}
