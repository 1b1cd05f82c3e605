//! Request protections shared by the agent and the collector.
//!
//! - `signer` - HMAC-SHA256 body signatures carried in the `HashSHA256` header
//! - `envelope` - RSA-OAEP (SHA-256) body encryption with PKCS#1 key files
//! - `subnet` - trusted subnet check on the `X-Real-IP` header

mod envelope;
mod signer;
mod subnet;

pub use envelope::{Decryptor, Encryptor};
pub use signer::{BodySigner, HASH_HEADER};
pub use subnet::{REAL_IP_HEADER, SubnetError, TrustedSubnet};

/// Error type for key loading and crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("openssl: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("ciphertext length {0} is not a multiple of the key size")]
    BadCiphertext(usize),
    #[error("invalid signature encoding")]
    BadSignature,
}
