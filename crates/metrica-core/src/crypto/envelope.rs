//! RSA-OAEP body envelope.
//!
//! Bodies longer than one OAEP block are split into chunks of at most
//! `key_size - 66` bytes; each chunk encrypts to exactly `key_size` bytes
//! and the ciphertexts are concatenated.

use std::path::Path;

use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};

use super::CryptoError;

/// OAEP overhead with SHA-256: two digests plus two bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

fn read_key(path: &Path) -> Result<Vec<u8>, CryptoError> {
    std::fs::read(path).map_err(|source| CryptoError::KeyFile {
        path: path.display().to_string(),
        source,
    })
}

/// Encrypts outbound bodies with the collector's public key.
#[derive(Clone)]
pub struct Encryptor {
    key: PKey<Public>,
}

impl Encryptor {
    /// Accepts a PKCS#1 (`RSA PUBLIC KEY`) or SubjectPublicKeyInfo (`PUBLIC KEY`) PEM.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CryptoError> {
        let rsa = Rsa::public_key_from_pem_pkcs1(pem).or_else(|_| Rsa::public_key_from_pem(pem))?;
        Ok(Self {
            key: PKey::from_rsa(rsa)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_key(path.as_ref())?)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.key.size();
        let chunk = block.saturating_sub(OAEP_SHA256_OVERHEAD).max(1);
        let mut out = Vec::with_capacity(plaintext.len().div_ceil(chunk) * block);

        for part in plaintext.chunks(chunk) {
            let mut encrypter = Encrypter::new(&self.key)?;
            encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
            encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
            encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
            let mut buf = vec![0; encrypter.encrypt_len(part)?];
            let n = encrypter.encrypt(part, &mut buf)?;
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

/// Decrypts inbound bodies with the collector's private key.
#[derive(Clone)]
pub struct Decryptor {
    key: PKey<Private>,
}

impl Decryptor {
    /// Accepts a PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CryptoError> {
        let rsa = Rsa::private_key_from_pem(pem)?;
        Ok(Self {
            key: PKey::from_rsa(rsa)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_key(path.as_ref())?)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.key.size();
        if ciphertext.len() % block != 0 {
            return Err(CryptoError::BadCiphertext(ciphertext.len()));
        }

        let mut out = Vec::with_capacity(ciphertext.len());
        for part in ciphertext.chunks(block) {
            let mut decrypter = Decrypter::new(&self.key)?;
            decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
            decrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
            decrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
            let mut buf = vec![0; decrypter.decrypt_len(part)?];
            let n = decrypter.decrypt(part, &mut buf)?;
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key_pair() -> (Encryptor, Decryptor) {
        let rsa = Rsa::generate(2048).unwrap();
        let public = Encryptor::from_pem(&rsa.public_key_to_pem_pkcs1().unwrap()).unwrap();
        let private = Decryptor::from_pem(&rsa.private_key_to_pem().unwrap()).unwrap();
        (public, private)
    }

    #[test]
    fn short_body_round_trip() {
        let (public, private) = key_pair();
        let body = br#"{"id":"temp","type":"gauge","value":3.5}"#;
        let sealed = public.encrypt(body).unwrap();
        assert_eq!(sealed.len(), 256);
        assert_eq!(private.decrypt(&sealed).unwrap(), body);
    }

    #[test]
    fn long_body_is_chunked() {
        let (public, private) = key_pair();
        let body: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let sealed = public.encrypt(&body).unwrap();
        // 190-byte chunks: 11 blocks of 256 bytes.
        assert_eq!(sealed.len(), 11 * 256);
        assert_eq!(private.decrypt(&sealed).unwrap(), body);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let (public, private) = key_pair();
        let sealed = public.encrypt(b"hello").unwrap();
        assert!(matches!(
            private.decrypt(&sealed[..100]),
            Err(CryptoError::BadCiphertext(100))
        ));
    }

    #[test]
    fn keys_load_from_files() {
        let dir = tempdir().unwrap();
        let rsa = Rsa::generate(2048).unwrap();
        let pub_path = dir.path().join("public.pem");
        let priv_path = dir.path().join("private.pem");
        std::fs::write(&pub_path, rsa.public_key_to_pem_pkcs1().unwrap()).unwrap();
        std::fs::write(&priv_path, rsa.private_key_to_pem().unwrap()).unwrap();

        let sealed = Encryptor::from_file(&pub_path)
            .unwrap()
            .encrypt(b"payload")
            .unwrap();
        assert_eq!(
            Decryptor::from_file(&priv_path)
                .unwrap()
                .decrypt(&sealed)
                .unwrap(),
            b"payload"
        );
        assert!(matches!(
            Encryptor::from_file(dir.path().join("missing.pem")),
            Err(CryptoError::KeyFile { .. })
        ));
    }
}
