//! The crypto-backend interface.

use crate::Result;
use crate::crypto::Protected;
use crate::types::{HashAlgorithm, PublicKeyAlgorithm, SymmetricAlgorithm};

/// Abstracts over the cryptographic backends.
pub trait Backend: Digest + Symmetric + Asymmetric + Kdf {
    /// Returns a short, human-readable description of the backend.
    ///
    /// This starts with the name of the backend, possibly a version,
    /// and any optional features that are available.  This is meant
    /// for inclusion in version strings to improve bug reports.
    fn backend() -> String;

    /// Fills the given buffer with random data.
    ///
    /// Fills the given buffer with random data produced by a
    /// cryptographically secure pseudorandom number generator
    /// (CSPRNG).  The output may be used as session keys or to derive
    /// long-term cryptographic keys from.
    fn random(buf: &mut [u8]) -> Result<()>;

    /// Runs the backend's known-answer self-tests.
    ///
    /// Exercises the digest, MAC, cipher, and signature mechanisms
    /// against fixed vectors.  A failure means the backend must not
    /// be used.
    fn self_test() -> Result<()>;
}

/// Message digest interface.
pub trait Digest {
    /// Returns a fresh digest context.
    fn hasher(algo: HashAlgorithm) -> Box<dyn DigestContext>;

    /// Returns a fresh HMAC context keyed with `key`.  The MAC's
    /// underlying hash is `algo`.
    fn mac(algo: HashAlgorithm, key: &[u8]) -> Result<Box<dyn MacContext>>;
}

/// An incremental digest computation.
pub trait DigestContext: Send {
    /// Feeds data into the digest.
    fn update(&mut self, data: &[u8]);

    /// Finalises the digest.
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// An incremental MAC computation.
pub trait MacContext: Send {
    /// Feeds data into the MAC.
    fn update(&mut self, data: &[u8]);

    /// Finalises the MAC tag.
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// The direction a cipher context operates in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherDirection {
    /// Encryption.
    Encrypt,
    /// Decryption.
    Decrypt,
}

/// Symmetric cipher interface.
pub trait Symmetric {
    /// Returns whether the given symmetric algorithm is supported by
    /// this backend.
    ///
    /// Note: when implementing this function, match exhaustively on
    /// `algo`, do not use a catch-all.  This way, when new algorithms
    /// are introduced, we will see where we may need to add support.
    fn supports_symmetric(algo: SymmetricAlgorithm) -> bool;

    /// Returns a streaming cipher context.
    ///
    /// The context transforms data in place and may be fed any number
    /// of chunks of any size.
    fn cipher(algo: SymmetricAlgorithm, key: &[u8], iv: &[u8],
              direction: CipherDirection) -> Result<Box<dyn CipherContext>>;
}

/// An incremental cipher transformation.
pub trait CipherContext: Send {
    /// Transforms the given chunk in place.
    fn process(&mut self, data: &mut [u8]);
}

/// The components of an RSA key pair.
///
/// The modulus and public exponent are public; the remaining
/// components are secret.
#[derive(Clone, Debug)]
pub struct RsaKeyParts {
    /// The modulus.
    pub n: Vec<u8>,
    /// The public exponent.
    pub e: Vec<u8>,
    /// The private exponent.
    pub d: Protected,
    /// The first prime factor.
    pub p: Protected,
    /// The second prime factor.
    pub q: Protected,
}

/// Public-key cryptography interface.
pub trait Asymmetric {
    /// Returns whether the given public key cryptography algorithm is
    /// supported by this backend.
    ///
    /// Note: when implementing this function, match exhaustively on
    /// `algo`, do not use a catch-all.  This way, when new algorithms
    /// are introduced, we will see where we may need to add support.
    fn supports_algo(algo: PublicKeyAlgorithm) -> bool;

    /// Generates an RSA key pair of the given modulus size in bits.
    fn rsa_generate_key(bits: usize) -> Result<RsaKeyParts>;

    /// Signs a SHA-256 digest with RSASSA-PKCS1-v1_5.
    fn rsa_sign_pkcs1_sha256(parts: &RsaKeyParts, digest: &[u8])
                             -> Result<Vec<u8>>;

    /// Verifies an RSASSA-PKCS1-v1_5 signature over a SHA-256 digest.
    fn rsa_verify_pkcs1_sha256(n: &[u8], e: &[u8], digest: &[u8],
                               signature: &[u8]) -> Result<bool>;

    /// Encrypts a short message (usually a session key) with
    /// RSAES-PKCS1-v1_5.
    fn rsa_encrypt_pkcs1(n: &[u8], e: &[u8], message: &[u8])
                         -> Result<Vec<u8>>;

    /// Decrypts an RSAES-PKCS1-v1_5 ciphertext.
    fn rsa_decrypt_pkcs1(parts: &RsaKeyParts, ciphertext: &[u8])
                         -> Result<Protected>;

    /// Generates an Ed25519 key pair.
    ///
    /// Returns a tuple containing the secret and public key.
    fn ed25519_generate_key() -> Result<(Protected, [u8; 32])>;

    /// Computes the public key for a given secret key.
    fn ed25519_derive_public(secret: &Protected) -> Result<[u8; 32]>;

    /// Creates an Ed25519 signature.
    fn ed25519_sign(secret: &Protected, public: &[u8; 32], digest: &[u8])
                    -> Result<[u8; 64]>;

    /// Verifies an Ed25519 signature.
    fn ed25519_verify(public: &[u8; 32], digest: &[u8], signature: &[u8; 64])
                      -> Result<bool>;
}

/// Key-derivation functions.
pub trait Kdf {
    /// HKDF instantiated with SHA256.
    ///
    /// Used to derive message keys from session keys.  Using a KDF
    /// that includes algorithm information in the given `info`
    /// provides key space separation between cipher algorithms and
    /// modes.
    ///
    /// `salt`, if given, SHOULD be 32 bytes of salt matching the
    /// digest size of the hash function.  If it is not given, 32
    /// zeros are used instead.
    fn hkdf_sha256(ikm: &[u8], salt: Option<&[u8]>, info: &[u8],
                   okm: &mut [u8]) -> Result<()>;

    /// Derives a key from a password and salt.
    ///
    /// This is the memory-hard string-to-key mechanism used for
    /// password-based envelope encryption and user-store protection.
    fn s2k(password: &[u8], salt: &[u8], key_len: usize)
           -> Result<Protected>;
}
