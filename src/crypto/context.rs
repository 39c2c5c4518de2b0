//! Key and digest contexts.
//!
//! A context is the payload of a kernel context object: an algorithm
//! capability plus, usually, key material.  Contexts are what the
//! rest of the crate passes around when it needs "something that can
//! sign" or "something that can decrypt" without caring which
//! primitive is behind it.

use std::fmt;

use super::backend::interface::{
    Asymmetric as _, Digest as _, DigestContext, RsaKeyParts,
};
use super::backend::Soft;
use super::{Protected, SessionKey};
use crate::types::{CheckType, HashAlgorithm, PublicKeyAlgorithm};
use crate::{Error, Result};

/// The smallest RSA modulus the kernel will generate or load.
pub const MIN_RSA_BITS: usize = 1024;
/// The largest RSA modulus the kernel will generate or load.
pub const MAX_RSA_BITS: usize = 8192;

/// The material held by a context.
pub enum KeyMaterial {
    /// No material yet; awaiting key generation or load.
    Unkeyed,
    /// An incremental digest computation.
    Hash {
        /// The digest algorithm.
        algo: HashAlgorithm,
        /// The running state; `None` once completed.
        state: Option<Box<dyn DigestContext>>,
        /// The completed digest.
        value: Option<Vec<u8>>,
    },
    /// An RSA public key.
    RsaPublic {
        /// The modulus.
        n: Vec<u8>,
        /// The public exponent.
        e: Vec<u8>,
    },
    /// An RSA key pair.
    RsaPrivate(RsaKeyParts),
    /// An Ed25519 public key.
    Ed25519Public([u8; 32]),
    /// An Ed25519 key pair.
    Ed25519Private {
        /// The secret scalar seed.
        secret: Protected,
        /// The matching public key.
        public: [u8; 32],
    },
    /// A conventional secret key, used for MACs and session keys.
    Secret(SessionKey),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyMaterial::Unkeyed => f.write_str("Unkeyed"),
            KeyMaterial::Hash { algo, value, .. } =>
                f.debug_struct("Hash")
                    .field("algo", algo)
                    .field("completed", &value.is_some())
                    .finish(),
            KeyMaterial::RsaPublic { n, .. } =>
                f.debug_struct("RsaPublic")
                    .field("bits", &(n.len() * 8)).finish(),
            KeyMaterial::RsaPrivate(parts) =>
                f.debug_struct("RsaPrivate")
                    .field("bits", &(parts.n.len() * 8)).finish(),
            KeyMaterial::Ed25519Public(_) =>
                f.write_str("Ed25519Public"),
            KeyMaterial::Ed25519Private { .. } =>
                f.write_str("Ed25519Private"),
            KeyMaterial::Secret(_) =>
                f.write_str("Secret"),
        }
    }
}

/// A key or digest context.
#[derive(Debug)]
pub struct KeyContext {
    label: Option<String>,
    material: KeyMaterial,
}

impl KeyContext {
    /// Returns a fresh digest context.
    pub fn new_hash(algo: HashAlgorithm) -> Self {
        KeyContext {
            label: None,
            material: KeyMaterial::Hash {
                algo,
                state: Some(Soft::hasher(algo)),
                value: None,
            },
        }
    }

    /// Returns a context holding a conventional secret key.
    pub fn new_secret(key: SessionKey) -> Self {
        KeyContext { label: None, material: KeyMaterial::Secret(key) }
    }

    /// Wraps existing key material.
    pub fn from_material(material: KeyMaterial) -> Self {
        KeyContext { label: None, material }
    }

    /// Generates an RSA key pair.
    ///
    /// This can take a noticeable amount of time; the kernel runs it
    /// under the busy protocol.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
            return Err(Error::ArgumentRange(
                format!("{}-bit RSA key", bits)).into());
        }
        let parts = Soft::rsa_generate_key(bits)?;
        Ok(KeyContext {
            label: None,
            material: KeyMaterial::RsaPrivate(parts),
        })
    }

    /// Generates an Ed25519 key pair.
    pub fn generate_ed25519() -> Result<Self> {
        let (secret, public) = Soft::ed25519_generate_key()?;
        Ok(KeyContext {
            label: None,
            material: KeyMaterial::Ed25519Private { secret, public },
        })
    }

    /// Returns the context's label, if one has been set.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Sets the context's label.
    pub fn set_label(&mut self, label: String) {
        self.label = Some(label);
    }

    /// Returns the material.
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// Returns the public-key algorithm, if this is a public-key
    /// context.
    pub fn pkc_algorithm(&self) -> Option<PublicKeyAlgorithm> {
        match &self.material {
            KeyMaterial::RsaPublic { .. } | KeyMaterial::RsaPrivate(_) =>
                Some(PublicKeyAlgorithm::Rsa),
            KeyMaterial::Ed25519Public(_)
            | KeyMaterial::Ed25519Private { .. } =>
                Some(PublicKeyAlgorithm::Ed25519),
            _ => None,
        }
    }

    /// Returns a stable algorithm identifier for attribute reads.
    pub fn algorithm_id(&self) -> i64 {
        match &self.material {
            KeyMaterial::Unkeyed => 0,
            KeyMaterial::Hash { algo: HashAlgorithm::Sha256, .. } => 1,
            KeyMaterial::Hash { algo: HashAlgorithm::Sha512, .. } => 2,
            KeyMaterial::Secret(_) => 10,
            KeyMaterial::RsaPublic { .. }
            | KeyMaterial::RsaPrivate(_) => 100,
            KeyMaterial::Ed25519Public(_)
            | KeyMaterial::Ed25519Private { .. } => 101,
        }
    }

    /// Returns the key size in bits.
    pub fn key_bits(&self) -> i64 {
        match &self.material {
            KeyMaterial::Unkeyed => 0,
            KeyMaterial::Hash { algo, .. } =>
                (algo.digest_size() * 8) as i64,
            KeyMaterial::Secret(key) => (key.as_ref().len() * 8) as i64,
            KeyMaterial::RsaPublic { n, .. } => (n.len() * 8) as i64,
            KeyMaterial::RsaPrivate(parts) => (parts.n.len() * 8) as i64,
            KeyMaterial::Ed25519Public(_)
            | KeyMaterial::Ed25519Private { .. } => 256,
        }
    }

    /// Returns whether the context holds private key material.
    pub fn is_private(&self) -> bool {
        matches!(&self.material,
                 KeyMaterial::RsaPrivate(_)
                 | KeyMaterial::Ed25519Private { .. }
                 | KeyMaterial::Secret(_))
    }

    /// Answers a capability query.
    pub fn can(&self, check: CheckType) -> bool {
        match check {
            CheckType::Sign | CheckType::CertSign | CheckType::CrlSign =>
                matches!(&self.material,
                         KeyMaterial::RsaPrivate(_)
                         | KeyMaterial::Ed25519Private { .. }),
            CheckType::SigCheck =>
                matches!(&self.material,
                         KeyMaterial::RsaPublic { .. }
                         | KeyMaterial::RsaPrivate(_)
                         | KeyMaterial::Ed25519Public(_)
                         | KeyMaterial::Ed25519Private { .. }),
            CheckType::Encrypt =>
                matches!(&self.material,
                         KeyMaterial::RsaPublic { .. }
                         | KeyMaterial::RsaPrivate(_)
                         | KeyMaterial::Secret(_)),
            CheckType::Decrypt =>
                matches!(&self.material,
                         KeyMaterial::RsaPrivate(_)
                         | KeyMaterial::Secret(_)),
            CheckType::Mac =>
                matches!(&self.material, KeyMaterial::Secret(_)),
        }
    }

    /// Signs a SHA-256 content digest.
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>> {
        match &self.material {
            KeyMaterial::RsaPrivate(parts) =>
                Soft::rsa_sign_pkcs1_sha256(parts, digest),
            KeyMaterial::Ed25519Private { secret, public } =>
                Ok(Soft::ed25519_sign(secret, public, digest)?.to_vec()),
            _ => Err(Error::Permission(
                "context cannot sign".into()).into()),
        }
    }

    /// Verifies a signature over a SHA-256 content digest.
    pub fn verify_digest(&self, digest: &[u8], signature: &[u8])
                         -> Result<bool> {
        match &self.material {
            KeyMaterial::RsaPublic { n, e } =>
                Soft::rsa_verify_pkcs1_sha256(n, e, digest, signature),
            KeyMaterial::RsaPrivate(parts) =>
                Soft::rsa_verify_pkcs1_sha256(&parts.n, &parts.e,
                                              digest, signature),
            KeyMaterial::Ed25519Public(public) => {
                let sig: &[u8; 64] = signature.try_into()
                    .map_err(|_| anyhow::Error::from(Error::BadSignature(
                        "bad Ed25519 signature length".into())))?;
                Soft::ed25519_verify(public, digest, sig)
            }
            KeyMaterial::Ed25519Private { public, .. } => {
                let sig: &[u8; 64] = signature.try_into()
                    .map_err(|_| anyhow::Error::from(Error::BadSignature(
                        "bad Ed25519 signature length".into())))?;
                Soft::ed25519_verify(public, digest, sig)
            }
            _ => Err(Error::Permission(
                "context cannot verify".into()).into()),
        }
    }

    /// Encrypts a short message, usually a session key.
    pub fn encrypt_key(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.material {
            KeyMaterial::RsaPublic { n, e } =>
                Soft::rsa_encrypt_pkcs1(n, e, message),
            KeyMaterial::RsaPrivate(parts) =>
                Soft::rsa_encrypt_pkcs1(&parts.n, &parts.e, message),
            _ => Err(Error::Permission(
                "context cannot encrypt keys".into()).into()),
        }
    }

    /// Decrypts a short message, usually a session key.
    pub fn decrypt_key(&self, ciphertext: &[u8]) -> Result<Protected> {
        match &self.material {
            KeyMaterial::RsaPrivate(parts) =>
                Soft::rsa_decrypt_pkcs1(parts, ciphertext),
            _ => Err(Error::Permission(
                "context cannot decrypt keys".into()).into()),
        }
    }

    /// Feeds data into a digest context.  An empty chunk completes
    /// the digest; further updates are rejected.
    pub fn hash_update(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.material {
            KeyMaterial::Hash { state, value, .. } => {
                if data.is_empty() {
                    match state.take() {
                        Some(ctx) => {
                            *value = Some(ctx.finish());
                            Ok(())
                        }
                        None => Err(Error::Complete.into()),
                    }
                } else {
                    match state.as_mut() {
                        Some(ctx) => {
                            ctx.update(data);
                            Ok(())
                        }
                        None => Err(Error::Complete.into()),
                    }
                }
            }
            _ => Err(Error::Permission(
                "context cannot hash".into()).into()),
        }
    }

    /// Returns the completed digest value.
    pub fn hash_value(&self) -> Result<Vec<u8>> {
        match &self.material {
            KeyMaterial::Hash { value: Some(v), .. } => Ok(v.clone()),
            KeyMaterial::Hash { .. } => Err(Error::NotInitialised(
                "digest not yet completed".into()).into()),
            _ => Err(Error::Permission(
                "context has no digest value".into()).into()),
        }
    }

    /// Clones the context's key material.  Digest state cannot be
    /// cloned.
    pub(crate) fn clone_key_material(&self) -> Result<KeyMaterial> {
        let material = match &self.material {
            KeyMaterial::Unkeyed => KeyMaterial::Unkeyed,
            KeyMaterial::Hash { .. } => return Err(Error::Permission(
                "digest state cannot be shared".into()).into()),
            KeyMaterial::RsaPublic { n, e } =>
                KeyMaterial::RsaPublic { n: n.clone(), e: e.clone() },
            KeyMaterial::RsaPrivate(parts) =>
                KeyMaterial::RsaPrivate(parts.clone()),
            KeyMaterial::Ed25519Public(public) =>
                KeyMaterial::Ed25519Public(*public),
            KeyMaterial::Ed25519Private { secret, public } =>
                KeyMaterial::Ed25519Private {
                    secret: secret.clone(),
                    public: *public,
                },
            KeyMaterial::Secret(key) => KeyMaterial::Secret(key.clone()),
        };
        Ok(material)
    }

    /// Returns a context holding only the public half of this
    /// context's key material.
    pub fn public_half(&self) -> Result<KeyContext> {
        let material = match &self.material {
            KeyMaterial::RsaPublic { n, e } =>
                KeyMaterial::RsaPublic { n: n.clone(), e: e.clone() },
            KeyMaterial::RsaPrivate(parts) =>
                KeyMaterial::RsaPublic {
                    n: parts.n.clone(),
                    e: parts.e.clone(),
                },
            KeyMaterial::Ed25519Public(public) =>
                KeyMaterial::Ed25519Public(*public),
            KeyMaterial::Ed25519Private { public, .. } =>
                KeyMaterial::Ed25519Public(*public),
            _ => return Err(Error::Permission(
                "context has no public half".into()).into()),
        };
        Ok(KeyContext { label: self.label.clone(), material })
    }
}

/// Handles a kernel message addressed to a context object.
///
/// The dispatcher has already validated the handle, the attribute
/// tables, and the action mask; `object` is only used for the busy
/// protocol around key generation.
pub(crate) fn dispatch(kernel: &crate::Kernel, handle: crate::Handle,
                       object: &std::sync::Arc<crate::kernel::Object>,
                       ctx: &mut KeyContext,
                       msg: crate::kernel::Message)
                       -> Result<crate::kernel::Reply> {
    use crate::attr::{Attribute, AttributeValue};
    use crate::kernel::{Message, Reply};
    use crate::types::ObjectState;

    match msg {
        Message::GetAttribute(attr) => {
            let value = match attr {
                Attribute::ContextAlgorithm =>
                    AttributeValue::Int(ctx.algorithm_id()),
                Attribute::ContextKeySize =>
                    AttributeValue::Int(ctx.key_bits()),
                Attribute::ContextLabel => match ctx.label() {
                    Some(label) => AttributeValue::Str(label.to_string()),
                    None => return Err(Error::NotFound(
                        "no label set".into()).into()),
                },
                Attribute::ContextHashValue =>
                    AttributeValue::Bytes(ctx.hash_value()?),
                _ => return Err(Error::NotAvailable(
                    format!("{} on a context", attr)).into()),
            };
            Ok(Reply::Value(value))
        }
        Message::SetAttribute(attr, value) => match attr {
            Attribute::ContextLabel => {
                ctx.set_label(value.into_string()?);
                Ok(Reply::Unit)
            }
            _ => Err(Error::NotAvailable(
                format!("{} on a context", attr)).into()),
        },
        Message::DeleteAttribute(attr) => match attr {
            Attribute::ContextLabel if ctx.label().is_some() => {
                ctx.label = None;
                Ok(Reply::Unit)
            }
            Attribute::ContextLabel => Err(Error::NotFound(
                "no label set".into()).into()),
            _ => Err(Error::NotAvailable(
                format!("{} on a context", attr)).into()),
        },
        Message::Compare(crate::kernel::CompareType::HashValue, bytes) => {
            let value = ctx.hash_value()?;
            Ok(Reply::Truth(super::secure_cmp(&value, &bytes)))
        }
        Message::Compare(..) => Err(Error::NotAvailable(
            "contexts only compare hash values".into()).into()),
        Message::Check(check) => Ok(Reply::Truth(ctx.can(check))),
        Message::HashData(data) => {
            ctx.hash_update(&data)?;
            Ok(Reply::Unit)
        }
        Message::GenerateKey { algo, bits } => {
            if !matches!(ctx.material, KeyMaterial::Unkeyed) {
                return Err(Error::AlreadyInitialised(
                    "context already holds a key".into()).into());
            }
            // Generation can take a while; the busy flag lets a
            // concurrent destroy fail fast instead of queueing.
            kernel.enter_busy(object)?;
            let generated = match algo {
                crate::types::PublicKeyAlgorithm::Rsa =>
                    KeyContext::generate_rsa(bits),
                crate::types::PublicKeyAlgorithm::Ed25519 =>
                    KeyContext::generate_ed25519(),
            };
            match generated {
                Ok(fresh) => {
                    ctx.material = fresh.material;
                    kernel.leave_busy(object, ObjectState::Ready)?;
                    tracing::debug!(%handle, %algo, "generated key pair");
                    Ok(Reply::Unit)
                }
                Err(err) => {
                    kernel.leave_busy(
                        object, ObjectState::PartiallyInitialised)?;
                    Err(err)
                }
            }
        }
        _ => Err(Error::NotAvailable(
            "contexts accept no such message".into()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_lifecycle() {
        let mut ctx = KeyContext::new_hash(HashAlgorithm::Sha256);
        assert!(ctx.hash_value().is_err());
        ctx.hash_update(b"ab").unwrap();
        ctx.hash_update(b"c").unwrap();
        ctx.hash_update(b"").unwrap();
        let v = ctx.hash_value().unwrap();
        assert_eq!(v[..4], [0xba, 0x78, 0x16, 0xbf]);
        // A completed digest rejects further data.
        let err = ctx.hash_update(b"more").unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Complete)));
    }

    #[test]
    fn capabilities() {
        let signer = KeyContext::generate_ed25519().unwrap();
        assert!(signer.can(CheckType::Sign));
        assert!(signer.can(CheckType::SigCheck));
        assert!(!signer.can(CheckType::Mac));

        let public = signer.public_half().unwrap();
        assert!(!public.can(CheckType::Sign));
        assert!(public.can(CheckType::SigCheck));
        assert!(!public.is_private());

        let secret = KeyContext::new_secret(
            SessionKey::new(32).unwrap());
        assert!(secret.can(CheckType::Mac));
        assert!(!secret.can(CheckType::Sign));
    }

    #[test]
    fn sign_verify_through_context() {
        let signer = KeyContext::generate_ed25519().unwrap();
        let sig = signer.sign_digest(&[7; 32]).unwrap();
        assert!(signer.public_half().unwrap()
                .verify_digest(&[7; 32], &sig).unwrap());
        assert!(!signer.verify_digest(&[8; 32], &sig).unwrap());
    }

    #[test]
    fn rsa_bits_range() {
        assert!(KeyContext::generate_rsa(512).is_err());
        assert!(KeyContext::generate_rsa(16384).is_err());
    }
}
