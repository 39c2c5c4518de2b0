//! Keysets: persistent stores of keys and certificates.
//!
//! The kernel sees every backend through one facade: typed get, set,
//! delete, and query operations keyed by key-identifier type, plus a
//! handful of opaque blob slots the user machinery uses for its
//! configuration, index, and trust snapshots.  The file-resident
//! backend lives in [`file`]; database, directory, and device
//! backends are external collaborators implementing the same trait.

use std::fmt;

use tracing::debug;

use crate::attr::{Attribute, AttributeValue};
use crate::cert::{CertObject, Certificate, PublicKeyInfo};
use crate::crypto::backend::interface::RsaKeyParts;
use crate::crypto::{KeyMaterial, Protected};
use crate::kernel::{Handle, Kernel, Message, ObjectPayload,
                    ObjectSubtype, Reply};
use crate::types::{KeyId, ObjectType};
use crate::{ber, Error, Result};

pub mod file;
pub use file::FileKeyset;

/// How a keyset is opened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeysetOptions {
    /// Existing store, reads only.
    ReadOnly,
    /// Existing store, reads and writes.
    ReadWrite,
    /// Create a fresh store, clobbering an existing one.
    Create,
}

/// The opaque blob slots a keyset carries for the user machinery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlobKind {
    /// A per-user configuration snapshot.
    Config,
    /// The user index.
    UserIndex,
    /// The trusted-certificate list.
    TrustedCerts,
}

impl BlobKind {
    fn code(&self) -> i64 {
        match self {
            BlobKind::Config => 1,
            BlobKind::UserIndex => 2,
            BlobKind::TrustedCerts => 3,
        }
    }

    fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(BlobKind::Config),
            2 => Ok(BlobKind::UserIndex),
            3 => Ok(BlobKind::TrustedCerts),
            n => Err(Error::BadData(
                format!("unknown blob slot {}", n)).into()),
        }
    }
}

/// One stored item: any subset of a certificate, a bare public key,
/// and a private key.
#[derive(Clone, Debug, Default)]
pub struct StoredItem {
    /// A human-readable label.
    pub label: Option<String>,
    /// An encoded certificate.
    pub cert: Option<Vec<u8>>,
    /// An encoded public key, for keys without certificates.
    pub public: Option<Vec<u8>>,
    /// The private key, possibly password-protected.
    pub private: Option<PrivateBlob>,
}

/// Stored private-key material.
#[derive(Clone, Debug)]
pub enum PrivateBlob {
    /// Stored in the clear; acceptable only for ephemeral stores.
    Plain(Vec<u8>),
    /// Encrypted under a password-derived key.
    Protected {
        /// The derivation salt.
        salt: Vec<u8>,
        /// The cipher IV.
        iv: Vec<u8>,
        /// The encrypted encoding.
        data: Vec<u8>,
    },
}

impl StoredItem {
    /// Returns whether the item matches the given identifier.
    pub fn matches(&self, id: &KeyId) -> bool {
        match id {
            KeyId::Name(name) => {
                if self.label.as_deref() == Some(name.as_str()) {
                    return true;
                }
                self.decoded_cert().map(|cert| {
                    cert.subject()
                        .get(crate::cert::DnAttribute::CommonName)
                        == Some(name.as_str())
                }).unwrap_or(false)
            }
            KeyId::IssuerSerial(issuer, serial) => {
                self.decoded_cert().map(|cert| {
                    let mut w = ber::Writer::new();
                    cert.issuer().serialize(&mut w).is_ok()
                        && w.as_bytes() == &issuer[..]
                        && cert.serial() == &serial[..]
                }).unwrap_or(false)
            }
            KeyId::SubjectKeyId(skid) => {
                if let Some(cert) = self.decoded_cert() {
                    return cert.subject_key_id() == *skid;
                }
                self.spki_digest().as_deref() == Some(&skid[..])
            }
            KeyId::Fingerprint(fp) => {
                if let Some(cert) = self.decoded_cert() {
                    return cert.fingerprint() == *fp;
                }
                self.spki_digest().as_deref() == Some(&fp[..])
            }
        }
    }

    fn decoded_cert(&self) -> Option<Certificate> {
        self.cert.as_deref()
            .and_then(|bytes| Certificate::decode(bytes).ok())
    }

    /// Digest of the stored bare public key.
    fn spki_digest(&self) -> Option<Vec<u8>> {
        use crate::crypto::backend::interface::Digest as _;
        let spki = self.public.as_deref()?;
        let mut h = crate::crypto::backend::Soft::hasher(
            crate::types::HashAlgorithm::Sha256);
        h.update(spki);
        Some(h.finish())
    }

    /// The public key of the item, from either the certificate or
    /// the bare key.
    pub fn public_key(&self) -> Result<PublicKeyInfo> {
        if let Some(cert) = self.decoded_cert() {
            return Ok(cert.public_key().clone());
        }
        match self.public.as_deref() {
            Some(spki) => PublicKeyInfo::parse(
                &mut ber::Reader::new(spki)),
            None => Err(Error::NotFound(
                "item carries no public key".into()).into()),
        }
    }
}

/// The uniform contract every backend honours.
pub trait KeysetBackend: fmt::Debug + Send {
    /// Returns whether writes are permitted.
    fn writable(&self) -> bool;

    /// Returns the item matching the identifier.
    fn get(&self, id: &KeyId) -> Result<&StoredItem>;

    /// Adds or replaces an item.
    fn set(&mut self, item: StoredItem) -> Result<()>;

    /// Deletes the item matching the identifier.
    fn delete(&mut self, id: &KeyId) -> Result<()>;

    /// Counts items matching the identifier.
    fn query(&self, id: &KeyId) -> usize;

    /// Reads an opaque blob slot.
    fn get_blob(&self, kind: BlobKind) -> Option<&[u8]>;

    /// Writes an opaque blob slot.
    fn set_blob(&mut self, kind: BlobKind, data: Vec<u8>) -> Result<()>;

    /// Persists outstanding changes.
    fn commit(&mut self) -> Result<()>;

    /// Erases every item and blob.  Part of the zeroisation
    /// sequence.
    fn clear(&mut self) -> Result<()>;
}

/// The payload of a keyset object.
#[derive(Debug)]
pub(crate) struct KeysetObject {
    backend: Box<dyn KeysetBackend>,
}

impl KeysetObject {
    pub(crate) fn backend(&self) -> &dyn KeysetBackend {
        self.backend.as_ref()
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn KeysetBackend {
        self.backend.as_mut()
    }
}

/// Opens a file keyset, returning a ready object.
pub fn open(kernel: &Kernel, path: Option<&std::path::Path>,
            options: KeysetOptions) -> Result<Handle> {
    let backend = FileKeyset::open(path, options)?;
    let handle = kernel.create_object(
        ObjectType::Keyset, ObjectSubtype::None,
        Some(kernel.default_user()),
        ObjectPayload::Keyset(KeysetObject {
            backend: Box::new(backend),
        }))?;
    kernel.mark_ready(handle)?;
    debug!(%handle, ?options, "opened keyset");
    Ok(handle)
}

// Private-key encodings: RSA as a component sequence, Ed25519 as the
// raw seed.

fn encode_private(material: &KeyMaterial) -> Result<Vec<u8>> {
    let mut w = ber::Writer::new();
    match material {
        KeyMaterial::RsaPrivate(parts) => {
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_integer(0);
                w.write_integer_bytes(&parts.n);
                w.write_integer_bytes(&parts.e);
                w.write_integer_bytes(&parts.d);
                w.write_integer_bytes(&parts.p);
                w.write_integer_bytes(&parts.q);
                Ok(())
            })?;
        }
        KeyMaterial::Ed25519Private { secret, .. } => {
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_integer(1);
                w.write_octet_string(secret);
                Ok(())
            })?;
        }
        _ => return Err(Error::ArgumentValue(
            "no private key to store".into()).into()),
    }
    Ok(w.into_vec())
}

fn decode_private(data: &[u8]) -> Result<KeyMaterial> {
    use crate::crypto::backend::interface::Asymmetric as _;
    let mut r = ber::Reader::new(data);
    r.read_constructed(ber::TAG_SEQUENCE, |r| {
        match r.read_integer()? {
            0 => {
                let n = r.read_integer_bytes()?;
                let e = r.read_integer_bytes()?;
                let d: Protected = r.read_integer_bytes()?.into();
                let p: Protected = r.read_integer_bytes()?.into();
                let q: Protected = r.read_integer_bytes()?.into();
                Ok(KeyMaterial::RsaPrivate(RsaKeyParts {
                    n, e, d, p, q,
                }))
            }
            1 => {
                let secret: Protected = r.read_octet_string()?.into();
                let public = crate::crypto::backend::Soft::
                    ed25519_derive_public(&secret)?;
                Ok(KeyMaterial::Ed25519Private { secret, public })
            }
            n => Err(Error::BadData(
                format!("unknown private key form {}", n)).into()),
        }
    })
}

pub(crate) fn seal_private(material: &KeyMaterial, password: Option<&str>)
                           -> Result<PrivateBlob> {
    use crate::crypto::backend::interface::{
        Backend as _, CipherDirection, Symmetric as _,
    };
    use crate::crypto::backend::Soft;
    let encoded = encode_private(material)?;
    match password {
        None => Ok(PrivateBlob::Plain(encoded)),
        Some(password) => {
            let mut salt = vec![0u8; 16];
            Soft::random(&mut salt)?;
            let mut iv = vec![0u8; 16];
            Soft::random(&mut iv)?;
            let key = crate::crypto::Password::from(password)
                .derive_key(&salt, 32)?;
            let mut data = encoded;
            Soft::cipher(crate::types::SymmetricAlgorithm::Aes256Cfb,
                         key.as_ref(), &iv, CipherDirection::Encrypt)?
                .process(&mut data);
            Ok(PrivateBlob::Protected { salt, iv, data })
        }
    }
}

pub(crate) fn unseal_private(blob: &PrivateBlob, password: Option<&str>)
                             -> Result<KeyMaterial> {
    use crate::crypto::backend::interface::{
        CipherDirection, Symmetric as _,
    };
    use crate::crypto::backend::Soft;
    match blob {
        PrivateBlob::Plain(data) => decode_private(data),
        PrivateBlob::Protected { salt, iv, data } => {
            let password = password.ok_or_else(
                || anyhow::Error::from(Error::WrongKey))?;
            let key = crate::crypto::Password::from(password)
                .derive_key(salt, 32)?;
            let mut plain = data.clone();
            Soft::cipher(crate::types::SymmetricAlgorithm::Aes256Cfb,
                         key.as_ref(), iv, CipherDirection::Decrypt)?
                .process(&mut plain);
            decode_private(&plain).map_err(|_| Error::WrongKey.into())
        }
    }
}

/// Captures a storable item from a certificate or context object.
fn item_from_object(kernel: &Kernel, handle: Handle,
                    password: Option<&str>) -> Result<StoredItem> {
    let (object_type, _) = kernel.object_kind(handle)?;
    match object_type {
        ObjectType::Certificate => {
            let cert = kernel.with_payload(handle, |payload| {
                match payload {
                    ObjectPayload::Certificate(
                        CertObject::Single(data)) =>
                        data.cert.clone().ok_or_else(
                            || anyhow::Error::from(Error::NotInitialised(
                                "certificate is unsigned".into()))),
                    _ => Err(Error::ArgumentValue(
                        "not a storable certificate".into()).into()),
                }
            })?;
            // A bound private key travels with the certificate.
            let private = match kernel.dependent_of(handle)? {
                Some(ctx) => {
                    let material = kernel.with_payload(
                        ctx, |payload| match payload {
                            ObjectPayload::Context(c) =>
                                c.clone_key_material(),
                            _ => Err(Error::Internal(
                                "dangling dependency".into()).into()),
                        })?;
                    if matches!(material,
                                KeyMaterial::RsaPrivate(_)
                                | KeyMaterial::Ed25519Private { .. })
                    {
                        Some(seal_private(&material, password)?)
                    } else {
                        None
                    }
                }
                None => None,
            };
            Ok(StoredItem {
                label: None,
                cert: Some(cert.encoded().to_vec()),
                public: None,
                private,
            })
        }
        ObjectType::Context => {
            kernel.with_payload(handle, |payload| match payload {
                ObjectPayload::Context(ctx) => {
                    let material = ctx.clone_key_material()?;
                    let public = PublicKeyInfo::from_material(&material)?;
                    let mut w = ber::Writer::new();
                    public.serialize(&mut w)?;
                    let private = if ctx.is_private() {
                        Some(seal_private(&material, password)?)
                    } else {
                        None
                    };
                    Ok(StoredItem {
                        label: ctx.label().map(String::from),
                        cert: None,
                        public: Some(w.into_vec()),
                        private,
                    })
                }
                _ => Err(Error::ArgumentValue(
                    "not a storable object".into()).into()),
            })
        }
        _ => Err(Error::ArgumentValue(
            "only certificates and keys are storable".into()).into()),
    }
}

/// Handles a kernel message addressed to a keyset object.
pub(crate) fn dispatch(kernel: &Kernel, handle: Handle,
                       keyset: &mut KeysetObject, msg: Message,
                       _internal: bool) -> Result<Reply> {
    match msg {
        Message::GetAttribute(attr) => {
            let kind = blob_kind_of(attr)?;
            match keyset.backend().get_blob(kind) {
                Some(data) => Ok(Reply::Value(
                    AttributeValue::Bytes(data.to_vec()))),
                None => Err(Error::NotFound(
                    format!("no {:?} blob stored", kind)).into()),
            }
        }
        Message::SetAttribute(attr, value) => {
            let kind = blob_kind_of(attr)?;
            keyset.backend_mut().set_blob(kind, value.into_bytes()?)?;
            keyset.backend_mut().commit()?;
            Ok(Reply::Unit)
        }
        Message::KeyGet(id) => {
            let item = keyset.backend().get(&id)?.clone();
            materialise_public(kernel, &item)
        }
        Message::KeyGetPrivate(id, password) => {
            let item = keyset.backend().get(&id)?.clone();
            let blob = item.private.as_ref().ok_or_else(
                || anyhow::Error::from(Error::NotFound(
                    "item carries no private key".into())))?;
            let material = unseal_private(blob, password.as_deref())?;
            let context = crate::crypto::import_material(
                kernel, material)?;
            Ok(Reply::Object(context))
        }
        Message::KeySet(object, password) => {
            if !keyset.backend().writable() {
                return Err(Error::Permission(
                    "keyset is read-only".into()).into());
            }
            let item = item_from_object(
                kernel, object, password.as_deref())?;
            keyset.backend_mut().set(item)?;
            keyset.backend_mut().commit()?;
            debug!(%handle, "stored item");
            Ok(Reply::Unit)
        }
        Message::KeyDelete(id) => {
            if !keyset.backend().writable() {
                return Err(Error::Permission(
                    "keyset is read-only".into()).into());
            }
            keyset.backend_mut().delete(&id)?;
            keyset.backend_mut().commit()?;
            Ok(Reply::Unit)
        }
        Message::KeyQuery(id) => {
            Ok(Reply::Count(keyset.backend().query(&id)))
        }
        Message::CaCertManagement { .. } => {
            // The CA paths are enumerated but not yet wired up.
            Err(Error::NotAvailable(
                "CA management is not yet operational".into()).into())
        }
        _ => Err(Error::NotAvailable(
            "keysets accept no such message".into()).into()),
    }
}

fn blob_kind_of(attr: Attribute) -> Result<BlobKind> {
    match attr {
        Attribute::KeysetConfigData => Ok(BlobKind::Config),
        Attribute::KeysetUserIndex => Ok(BlobKind::UserIndex),
        Attribute::KeysetTrustedCerts => Ok(BlobKind::TrustedCerts),
        _ => Err(Error::NotAvailable(
            format!("{} on a keyset", attr)).into()),
    }
}

fn materialise_public(kernel: &Kernel, item: &StoredItem)
                      -> Result<Reply> {
    if let Some(cert) = &item.cert {
        return Ok(Reply::Object(crate::cert::import(kernel, cert)?));
    }
    let key = item.public_key()?;
    let context = crate::crypto::import_material(
        kernel, key.to_material())?;
    Ok(Reply::Object(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::tests::self_signed;
    use crate::types::PublicKeyAlgorithm;

    #[test]
    fn store_and_fetch_certificate() {
        let kernel = Kernel::new().unwrap();
        let (cert, parsed) = self_signed(&kernel, "Stored", false);
        let keyset = open(&kernel, None, KeysetOptions::Create).unwrap();
        kernel.send(keyset, Message::KeySet(cert, None)).unwrap();

        let fetched = kernel.send(keyset, Message::KeyGet(
            KeyId::Name("Stored".into())))
            .unwrap().into_object().unwrap();
        let encoded = kernel.send(fetched, Message::GetAttribute(
            Attribute::CertEncoded)).unwrap().into_bytes().unwrap();
        assert_eq!(encoded, parsed.encoded());

        let count = kernel.send(keyset, Message::KeyQuery(
            KeyId::Name("Stored".into())))
            .unwrap().into_count().unwrap();
        assert_eq!(count, 1);

        kernel.send(keyset, Message::KeyDelete(
            KeyId::Name("Stored".into()))).unwrap();
        let err = kernel.send(keyset, Message::KeyGet(
            KeyId::Name("Stored".into()))).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
    }

    #[test]
    fn private_keys_round_trip_under_password() {
        let kernel = Kernel::new().unwrap();
        let key = crate::crypto::generate_keypair(
            &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
        kernel.send(key, Message::SetAttribute(
            Attribute::ContextLabel,
            AttributeValue::Str("mykey".into()))).unwrap();

        let keyset = open(&kernel, None, KeysetOptions::Create).unwrap();
        kernel.send(keyset, Message::KeySet(
            key, Some("hunter2".into()))).unwrap();

        // The right password unlocks a working signing context.
        let fetched = kernel.send(keyset, Message::KeyGetPrivate(
            KeyId::Name("mykey".into()), Some("hunter2".into())))
            .unwrap().into_object().unwrap();
        let can_sign = kernel.send(fetched, Message::Check(
            crate::types::CheckType::Sign))
            .unwrap().into_truth().unwrap();
        assert!(can_sign);

        // The wrong one does not.
        let err = kernel.send(keyset, Message::KeyGetPrivate(
            KeyId::Name("mykey".into()), Some("wrong".into())))
            .unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::WrongKey)));
        let err = kernel.send(keyset, Message::KeyGetPrivate(
            KeyId::Name("mykey".into()), None)).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::WrongKey)));
    }
}
