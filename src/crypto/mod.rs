//! Cryptographic capability abstraction.
//!
//! The kernel never implements a primitive itself.  Algorithms are
//! reached through the [`backend`] interface, and key material is
//! held in typed [`KeyContext`](context::KeyContext) payloads behind
//! kernel context objects.  Secrets live in [`Protected`] buffers
//! that are zeroed on drop.

pub mod backend;
pub(crate) mod context;
mod mem;
pub use context::{KeyContext, KeyMaterial};
pub use mem::{secure_cmp, Protected};

use backend::interface::{Backend as _, Kdf as _};
use backend::Soft;
use crate::{Error, Result};

/// Holds a session key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey(Protected);

impl SessionKey {
    /// Generates a fresh random session key of the given size.
    pub fn new(size: usize) -> Result<Self> {
        let mut key = Protected::zeroed(size);
        Soft::random(key.as_mut())?;
        Ok(SessionKey(key))
    }

    /// Derives a message key from this session key, separating key
    /// space by the given context string.
    pub fn derive(&self, info: &[u8], size: usize) -> Result<SessionKey> {
        let mut okm = Protected::zeroed(size);
        Soft::hkdf_sha256(&self.0, None, info, okm.as_mut())?;
        Ok(SessionKey(okm))
    }
}

impl AsRef<[u8]> for SessionKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Protected> for SessionKey {
    fn from(p: Protected) -> Self {
        SessionKey(p)
    }
}

impl From<Vec<u8>> for SessionKey {
    fn from(v: Vec<u8>) -> Self {
        SessionKey(v.into())
    }
}

/// Holds a password.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Password(Protected);

impl Password {
    /// Derives a key-encryption key of the given size.
    pub fn derive_key(&self, salt: &[u8], size: usize) -> Result<SessionKey> {
        if self.0.is_empty() {
            return Err(Error::ArgumentValue("empty password".into()).into());
        }
        Ok(SessionKey(Soft::s2k(&self.0, salt, size)?))
    }
}

impl AsRef<[u8]> for Password {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Password(s.as_bytes().into())
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Password(s.into_bytes().into())
    }
}

impl From<Vec<u8>> for Password {
    fn from(v: Vec<u8>) -> Self {
        Password(v.into())
    }
}

use crate::kernel::{Message, ObjectPayload, ObjectSubtype};
use crate::types::{HashAlgorithm, ObjectType, PublicKeyAlgorithm};
use crate::{Handle, Kernel};

/// Creates a ready-to-use hash context.
pub fn create_hash_context(kernel: &Kernel, algo: HashAlgorithm)
                           -> Result<Handle> {
    let handle = kernel.create_object(
        ObjectType::Context, ObjectSubtype::None,
        Some(kernel.default_user()),
        ObjectPayload::Context(KeyContext::new_hash(algo)))?;
    kernel.mark_ready(handle)?;
    Ok(handle)
}

/// Creates an unkeyed context, ready for a `generate-key` message.
pub fn create_context(kernel: &Kernel) -> Result<Handle> {
    kernel.create_object(
        ObjectType::Context, ObjectSubtype::None,
        Some(kernel.default_user()),
        ObjectPayload::Context(KeyContext::from_material(
            KeyMaterial::Unkeyed)))
}

/// Creates a context and generates a key pair into it.
pub fn generate_keypair(kernel: &Kernel, algo: PublicKeyAlgorithm,
                        bits: usize) -> Result<Handle> {
    let handle = create_context(kernel)?;
    kernel.send(handle, Message::GenerateKey { algo, bits })?;
    Ok(handle)
}

/// Creates a ready context holding a conventional secret key.
pub fn create_secret_context(kernel: &Kernel, key: SessionKey)
                             -> Result<Handle> {
    let handle = kernel.create_object(
        ObjectType::Context, ObjectSubtype::None,
        Some(kernel.default_user()),
        ObjectPayload::Context(KeyContext::new_secret(key)))?;
    kernel.mark_ready(handle)?;
    Ok(handle)
}

/// Wraps existing key material in a ready context.
pub(crate) fn import_material(kernel: &Kernel, material: KeyMaterial)
                              -> Result<Handle> {
    let handle = kernel.create_object(
        ObjectType::Context, ObjectSubtype::None,
        Some(kernel.default_user()),
        ObjectPayload::Context(KeyContext::from_material(material)))?;
    kernel.mark_ready(handle)?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_object_lifecycle() {
        use crate::attr::Attribute;
        let kernel = Kernel::new().unwrap();
        let h = generate_keypair(&kernel, PublicKeyAlgorithm::Ed25519, 0)
            .unwrap();
        let bits = kernel.send(h, Message::GetAttribute(
            Attribute::ContextKeySize)).unwrap().into_int().unwrap();
        assert_eq!(bits, 256);
        // A second generation into the same context is rejected.
        let err = kernel.send(h, Message::GenerateKey {
            algo: PublicKeyAlgorithm::Ed25519, bits: 0 }).unwrap_err();
        assert!(Error::matches(&err,
            |e| matches!(e, Error::AlreadyInitialised(_))));
        kernel.destroy(h).unwrap();
    }

    #[test]
    fn hash_context_compare() {
        use crate::kernel::{CompareType, Reply};
        let kernel = Kernel::new().unwrap();
        let h = create_hash_context(&kernel, HashAlgorithm::Sha256).unwrap();
        kernel.send(h, Message::HashData(b"abc".to_vec())).unwrap();
        kernel.send(h, Message::HashData(Vec::new())).unwrap();
        let digest = kernel.send(h, Message::GetAttribute(
            crate::attr::Attribute::ContextHashValue))
            .unwrap().into_bytes().unwrap();
        let ok = kernel.send(h, Message::Compare(
            CompareType::HashValue, digest)).unwrap();
        assert!(matches!(ok, Reply::Truth(true)));
        kernel.destroy(h).unwrap();
    }

    #[test]
    fn session_keys_are_random() {
        let a = SessionKey::new(32).unwrap();
        let b = SessionKey::new(32).unwrap();
        assert_eq!(a.as_ref().len(), 32);
        assert!(a != b);
    }

    #[test]
    fn derived_keys_separate_by_info() {
        let k = SessionKey::new(32).unwrap();
        let a = k.derive(b"content", 32).unwrap();
        let b = k.derive(b"integrity", 32).unwrap();
        assert!(a != b);
        assert_eq!(a, k.derive(b"content", 32).unwrap());
    }

    #[test]
    fn password_derivation_is_salted() {
        let p = Password::from("correct horse");
        let a = p.derive_key(b"salt one.........", 32).unwrap();
        let b = p.derive_key(b"salt two.........", 32).unwrap();
        assert!(a != b);
        assert_eq!(a, p.derive_key(b"salt one.........", 32).unwrap());
    }
}
