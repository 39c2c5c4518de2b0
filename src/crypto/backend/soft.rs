//! The default software backend.
//!
//! This is the only module in the crate that names a primitive
//! implementation directly.

use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use ed25519_dalek::{Signer as _, Verifier as _};
use hmac::Mac as _;
use rand::rngs::OsRng;
use rand::RngCore as _;
use rsa::traits::{PrivateKeyParts as _, PublicKeyParts as _};
use sha2::Digest as _;

use super::interface::*;
use crate::crypto::Protected;
use crate::types::{HashAlgorithm, PublicKeyAlgorithm, SymmetricAlgorithm};
use crate::{Error, Result};

/// The software backend.
#[derive(Debug)]
pub struct Soft(());

impl Backend for Soft {
    fn backend() -> String {
        "Soft (RustCrypto)".to_string()
    }

    fn random(buf: &mut [u8]) -> Result<()> {
        OsRng.try_fill_bytes(buf)
            .map_err(|e| Error::Internal(format!("rng failure: {}", e)).into())
    }

    fn self_test() -> Result<()> {
        // SHA-256("abc"), FIPS 180-2 appendix B.1.
        let mut h = Self::hasher(HashAlgorithm::Sha256);
        h.update(b"abc");
        let digest = h.finish();
        let expect = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea,
            0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22, 0x23,
            0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c,
            0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00, 0x15, 0xad,
        ];
        if digest != expect {
            return Err(Error::Internal("SHA-256 self-test failed".into())
                       .into());
        }

        // HMAC-SHA-256, RFC 4231 test case 2.
        let mut m = Self::mac(HashAlgorithm::Sha256, b"Jefe")?;
        m.update(b"what do ya want for nothing?");
        let tag = m.finish();
        let expect = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e,
            0x6a, 0x04, 0x24, 0x26, 0x08, 0x95, 0x75, 0xc7,
            0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83,
            0x9d, 0xec, 0x58, 0xb9, 0x64, 0xec, 0x38, 0x43,
        ];
        if tag != expect {
            return Err(Error::Internal("HMAC self-test failed".into()).into());
        }

        // Cipher consistency.
        let key = [0x42; 32];
        let iv = [0x24; 16];
        let mut buf = *b"sixteen byte blk";
        Self::cipher(SymmetricAlgorithm::Aes256Cfb, &key, &iv,
                     CipherDirection::Encrypt)?.process(&mut buf);
        Self::cipher(SymmetricAlgorithm::Aes256Cfb, &key, &iv,
                     CipherDirection::Decrypt)?.process(&mut buf);
        if &buf != b"sixteen byte blk" {
            return Err(Error::Internal("cipher self-test failed".into())
                       .into());
        }

        // Signature consistency.
        let (secret, public) = Self::ed25519_generate_key()?;
        let sig = Self::ed25519_sign(&secret, &public, &digest)?;
        if !Self::ed25519_verify(&public, &digest, &sig)? {
            return Err(Error::Internal("signature self-test failed".into())
                       .into());
        }

        Ok(())
    }
}

struct Sha256Context(sha2::Sha256);
struct Sha512Context(sha2::Sha512);

impl DigestContext for Sha256Context {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

impl DigestContext for Sha512Context {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

struct HmacSha256Context(hmac::Hmac<sha2::Sha256>);
struct HmacSha512Context(hmac::Hmac<sha2::Sha512>);

impl MacContext for HmacSha256Context {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }
}

impl MacContext for HmacSha512Context {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }
}

impl Digest for Soft {
    fn hasher(algo: HashAlgorithm) -> Box<dyn DigestContext> {
        match algo {
            HashAlgorithm::Sha256 =>
                Box::new(Sha256Context(sha2::Sha256::new())),
            HashAlgorithm::Sha512 =>
                Box::new(Sha512Context(sha2::Sha512::new())),
        }
    }

    fn mac(algo: HashAlgorithm, key: &[u8]) -> Result<Box<dyn MacContext>> {
        match algo {
            HashAlgorithm::Sha256 => {
                let mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(key)
                    .map_err(|_| anyhow::Error::from(
                        Error::ArgumentValue("bad MAC key length".into())))?;
                Ok(Box::new(HmacSha256Context(mac)))
            }
            HashAlgorithm::Sha512 => {
                let mac = hmac::Hmac::<sha2::Sha512>::new_from_slice(key)
                    .map_err(|_| anyhow::Error::from(
                        Error::ArgumentValue("bad MAC key length".into())))?;
                Ok(Box::new(HmacSha512Context(mac)))
            }
        }
    }
}

struct CfbEncryptContext(BufEncryptor<Aes256>);
struct CfbDecryptContext(BufDecryptor<Aes256>);

impl CipherContext for CfbEncryptContext {
    fn process(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

impl CipherContext for CfbDecryptContext {
    fn process(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

impl Symmetric for Soft {
    fn supports_symmetric(algo: SymmetricAlgorithm) -> bool {
        match algo {
            SymmetricAlgorithm::Aes256Cfb => true,
        }
    }

    fn cipher(algo: SymmetricAlgorithm, key: &[u8], iv: &[u8],
              direction: CipherDirection) -> Result<Box<dyn CipherContext>> {
        if key.len() != algo.key_size() || iv.len() != algo.block_size() {
            return Err(Error::ArgumentValue(
                format!("bad key or IV length for {}", algo)).into());
        }
        match algo {
            SymmetricAlgorithm::Aes256Cfb => match direction {
                CipherDirection::Encrypt => {
                    let c = BufEncryptor::<Aes256>::new_from_slices(key, iv)
                        .map_err(|_| anyhow::Error::from(Error::Internal(
                            "cipher init failed".into())))?;
                    Ok(Box::new(CfbEncryptContext(c)))
                }
                CipherDirection::Decrypt => {
                    let c = BufDecryptor::<Aes256>::new_from_slices(key, iv)
                        .map_err(|_| anyhow::Error::from(Error::Internal(
                            "cipher init failed".into())))?;
                    Ok(Box::new(CfbDecryptContext(c)))
                }
            },
        }
    }
}

fn rsa_private_key(parts: &RsaKeyParts) -> Result<rsa::RsaPrivateKey> {
    let key = rsa::RsaPrivateKey::from_components(
        rsa::BigUint::from_bytes_be(&parts.n),
        rsa::BigUint::from_bytes_be(&parts.e),
        rsa::BigUint::from_bytes_be(&parts.d),
        vec![rsa::BigUint::from_bytes_be(&parts.p),
             rsa::BigUint::from_bytes_be(&parts.q)],
    ).map_err(|e| anyhow::Error::from(
        Error::BadData(format!("bad RSA key: {}", e))))?;
    Ok(key)
}

fn rsa_public_key(n: &[u8], e: &[u8]) -> Result<rsa::RsaPublicKey> {
    rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(n),
        rsa::BigUint::from_bytes_be(e),
    ).map_err(|e| Error::BadData(format!("bad RSA public key: {}", e)).into())
}

impl Asymmetric for Soft {
    fn supports_algo(algo: PublicKeyAlgorithm) -> bool {
        match algo {
            PublicKeyAlgorithm::Rsa => true,
            PublicKeyAlgorithm::Ed25519 => true,
        }
    }

    fn rsa_generate_key(bits: usize) -> Result<RsaKeyParts> {
        let key = rsa::RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| anyhow::Error::from(
                Error::Internal(format!("RSA generation failed: {}", e))))?;
        let primes = key.primes();
        if primes.len() != 2 {
            return Err(Error::Internal("unexpected prime count".into())
                       .into());
        }
        Ok(RsaKeyParts {
            n: key.n().to_bytes_be(),
            e: key.e().to_bytes_be(),
            d: key.d().to_bytes_be().into(),
            p: primes[0].to_bytes_be().into(),
            q: primes[1].to_bytes_be().into(),
        })
    }

    fn rsa_sign_pkcs1_sha256(parts: &RsaKeyParts, digest: &[u8])
                             -> Result<Vec<u8>> {
        let key = rsa_private_key(parts)?;
        key.sign(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(), digest)
            .map_err(|e| Error::Internal(
                format!("RSA signing failed: {}", e)).into())
    }

    fn rsa_verify_pkcs1_sha256(n: &[u8], e: &[u8], digest: &[u8],
                               signature: &[u8]) -> Result<bool> {
        let key = rsa_public_key(n, e)?;
        Ok(key.verify(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                      digest, signature).is_ok())
    }

    fn rsa_encrypt_pkcs1(n: &[u8], e: &[u8], message: &[u8])
                         -> Result<Vec<u8>> {
        let key = rsa_public_key(n, e)?;
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, message)
            .map_err(|e| Error::Internal(
                format!("RSA encryption failed: {}", e)).into())
    }

    fn rsa_decrypt_pkcs1(parts: &RsaKeyParts, ciphertext: &[u8])
                         -> Result<Protected> {
        let key = rsa_private_key(parts)?;
        key.decrypt(rsa::Pkcs1v15Encrypt, ciphertext)
            .map(Protected::from)
            .map_err(|_| Error::WrongKey.into())
    }

    fn ed25519_generate_key() -> Result<(Protected, [u8; 32])> {
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        Ok((key.to_bytes().into(), public))
    }

    fn ed25519_derive_public(secret: &Protected) -> Result<[u8; 32]> {
        let secret: &[u8; 32] = secret.as_ref().try_into()
            .map_err(|_| anyhow::Error::from(
                Error::BadData("bad Ed25519 secret length".into())))?;
        let key = ed25519_dalek::SigningKey::from_bytes(secret);
        Ok(key.verifying_key().to_bytes())
    }

    fn ed25519_sign(secret: &Protected, public: &[u8; 32], digest: &[u8])
                    -> Result<[u8; 64]> {
        let secret: &[u8; 32] = secret.as_ref().try_into()
            .map_err(|_| anyhow::Error::from(
                Error::BadData("bad Ed25519 secret length".into())))?;
        let key = ed25519_dalek::SigningKey::from_bytes(secret);
        if &key.verifying_key().to_bytes() != public {
            return Err(Error::WrongKey.into());
        }
        Ok(key.sign(digest).to_bytes())
    }

    fn ed25519_verify(public: &[u8; 32], digest: &[u8], signature: &[u8; 64])
                      -> Result<bool> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(public)
            .map_err(|_| anyhow::Error::from(
                Error::BadData("bad Ed25519 public key".into())))?;
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        Ok(key.verify(digest, &sig).is_ok())
    }
}

impl Kdf for Soft {
    fn hkdf_sha256(ikm: &[u8], salt: Option<&[u8]>, info: &[u8],
                   okm: &mut [u8]) -> Result<()> {
        hkdf::Hkdf::<sha2::Sha256>::new(salt, ikm)
            .expand(info, okm)
            .map_err(|e| Error::ArgumentValue(
                format!("HKDF expansion failed: {}", e)).into())
    }

    fn s2k(password: &[u8], salt: &[u8], key_len: usize)
           -> Result<Protected> {
        let config = argon2::Config {
            hash_length: key_len as u32,
            ..argon2::Config::default()
        };
        argon2::hash_raw(password, salt, &config)
            .map(Protected::from)
            .map_err(|e| Error::ArgumentValue(
                format!("password derivation failed: {}", e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_passes() {
        Soft::self_test().unwrap();
    }

    #[test]
    fn cipher_streams_across_chunks() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let plain: Vec<u8> = (0..100u8).collect();

        // Encrypting in one piece and in ragged chunks must agree.
        let mut whole = plain.clone();
        Soft::cipher(SymmetricAlgorithm::Aes256Cfb, &key, &iv,
                     CipherDirection::Encrypt).unwrap()
            .process(&mut whole);

        let mut chunked = plain.clone();
        let mut c = Soft::cipher(SymmetricAlgorithm::Aes256Cfb, &key, &iv,
                                 CipherDirection::Encrypt).unwrap();
        for chunk in chunked.chunks_mut(7) {
            c.process(chunk);
        }
        assert_eq!(whole, chunked);

        let mut back = whole;
        Soft::cipher(SymmetricAlgorithm::Aes256Cfb, &key, &iv,
                     CipherDirection::Decrypt).unwrap()
            .process(&mut back);
        assert_eq!(back, plain);
    }

    #[test]
    fn rsa_roundtrip() {
        let parts = Soft::rsa_generate_key(1024).unwrap();
        let digest = {
            let mut h = Soft::hasher(HashAlgorithm::Sha256);
            h.update(b"message");
            h.finish()
        };
        let sig = Soft::rsa_sign_pkcs1_sha256(&parts, &digest).unwrap();
        assert!(Soft::rsa_verify_pkcs1_sha256(&parts.n, &parts.e,
                                              &digest, &sig).unwrap());
        let mut bad = digest.clone();
        bad[0] ^= 1;
        assert!(!Soft::rsa_verify_pkcs1_sha256(&parts.n, &parts.e,
                                               &bad, &sig).unwrap());

        let cipher = Soft::rsa_encrypt_pkcs1(&parts.n, &parts.e,
                                             b"session key").unwrap();
        let plain = Soft::rsa_decrypt_pkcs1(&parts, &cipher).unwrap();
        assert_eq!(&plain[..], b"session key");
    }

    #[test]
    fn ed25519_roundtrip() {
        let (secret, public) = Soft::ed25519_generate_key().unwrap();
        assert_eq!(Soft::ed25519_derive_public(&secret).unwrap(), public);
        let sig = Soft::ed25519_sign(&secret, &public, b"digest").unwrap();
        assert!(Soft::ed25519_verify(&public, b"digest", &sig).unwrap());
        assert!(!Soft::ed25519_verify(&public, b"digess", &sig).unwrap());
    }
}
