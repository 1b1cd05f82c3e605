//! HMAC-SHA256 body signatures.

use constant_time_eq::constant_time_eq;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;

use super::CryptoError;

/// Header carrying the hex-encoded HMAC of the body (`HashSHA256` on the wire).
pub const HASH_HEADER: &str = "hashsha256";

/// Signs and verifies bodies with a shared secret.
#[derive(Clone)]
pub struct BodySigner {
    key: PKey<Private>,
}

impl std::fmt::Debug for BodySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BodySigner { key: <redacted> }")
    }
}

impl BodySigner {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            key: PKey::hmac(key)?,
        })
    }

    fn digest(&self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.update(body)?;
        Ok(signer.sign_to_vec()?)
    }

    /// Returns `hex(HMAC-SHA256(key, body))`.
    pub fn sign(&self, body: &[u8]) -> Result<String, CryptoError> {
        Ok(hex::encode(self.digest(body)?))
    }

    /// Compares the body's HMAC with a hex signature in constant time.
    ///
    /// A signature that is not valid hex is an error, a mismatch is `Ok(false)`.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<bool, CryptoError> {
        let given = hex::decode(signature.trim()).map_err(|_| CryptoError::BadSignature)?;
        let expected = self.digest(body)?;
        Ok(constant_time_eq(&expected, &given))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let signer = BodySigner::new(b"Jefe").unwrap();
        assert_eq!(
            signer.sign(b"what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_accepts_own_signature() {
        let signer = BodySigner::new(b"secret").unwrap();
        let body = br#"[{"id":"a","type":"gauge","value":2.5}]"#;
        let sig = signer.sign(body).unwrap();
        assert!(signer.verify(body, &sig).unwrap());
        assert!(signer.verify(body, &sig.to_uppercase()).unwrap());
    }

    #[test]
    fn any_single_byte_mutation_is_rejected() {
        let signer = BodySigner::new(b"secret").unwrap();
        let body = b"{\"id\":\"hits\",\"type\":\"counter\",\"delta\":2}".to_vec();
        let sig = signer.sign(&body).unwrap();
        for i in 0..body.len() {
            let mut mutated = body.clone();
            mutated[i] ^= 0x01;
            assert!(!signer.verify(&mutated, &sig).unwrap(), "byte {i}");
        }
    }

    #[test]
    fn different_key_is_rejected() {
        let body = b"payload";
        let sig = BodySigner::new(b"one").unwrap().sign(body).unwrap();
        assert!(!BodySigner::new(b"two").unwrap().verify(body, &sig).unwrap());
    }

    #[test]
    fn malformed_signature_is_an_error() {
        let signer = BodySigner::new(b"secret").unwrap();
        assert!(matches!(
            signer.verify(b"x", "not-hex"),
            Err(CryptoError::BadSignature)
        ));
    }
}
