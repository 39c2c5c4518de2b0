//! Certificates and related objects.
//!
//! The certificate-family objects cover single certificates, chains,
//! and CRLs, with the remaining subtypes enumerated but not yet
//! operational.  A certificate object starts out mutable: the caller
//! writes name components, validity, extensions, and a bound
//! public-key context, then sends a `sign` message.  Signing freezes
//! the object; from then on the encoded form is authoritative and
//! re-exporting returns byte-identical data.
//!
//! Trust management and chain validation live in the [`trust`] and
//! [`validate`] submodules and are reached through the owning user
//! object and the chain object respectively.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::attr::{Attribute, AttributeValue, CURSOR_FIRST, CURSOR_LAST,
                  CURSOR_NEXT, CURSOR_PREVIOUS};
use crate::ber::{self, Oid, Reader, Writer};
use crate::crypto::backend::interface::{Asymmetric as _, Backend as _,
                                        Digest as _};
use crate::crypto::backend::Soft;
use crate::crypto::{secure_cmp, KeyMaterial};
use crate::kernel::{lock_meta, Fault, Handle, Kernel, Message, Object,
                    ObjectPayload, ObjectSubtype, Reply};
use crate::types::{CertificateType, CheckType, ErrorType, KeyUsage,
                   ObjectState, ObjectType, PublicKeyAlgorithm,
                   RevocationReason};
use crate::{Error, Result};

pub mod dn;
pub mod ext;
pub mod trust;
pub mod validate;

pub use dn::{DistinguishedName, DnAttribute};
pub use ext::{BasicConstraints, Extensions, NameConstraints,
              RevocationEntry};

fn oid_rsa_encryption() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 1, 1])
}

fn oid_sha256_with_rsa() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 1, 11])
}

fn oid_ed25519() -> Oid {
    Oid::from_arcs(&[1, 3, 101, 112])
}

/// The public key carried in a certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKeyInfo {
    /// An RSA public key.
    Rsa {
        /// The modulus.
        n: Vec<u8>,
        /// The public exponent.
        e: Vec<u8>,
    },
    /// An Ed25519 public key.
    Ed25519([u8; 32]),
}

impl PublicKeyInfo {
    /// Returns the algorithm.
    pub fn algorithm(&self) -> PublicKeyAlgorithm {
        match self {
            PublicKeyInfo::Rsa { .. } => PublicKeyAlgorithm::Rsa,
            PublicKeyInfo::Ed25519(_) => PublicKeyAlgorithm::Ed25519,
        }
    }

    /// Extracts the public half of a context's key material.
    pub fn from_material(material: &KeyMaterial)
                         -> Result<Self> {
        match material {
            KeyMaterial::RsaPublic { n, e } =>
                Ok(PublicKeyInfo::Rsa { n: n.clone(), e: e.clone() }),
            KeyMaterial::RsaPrivate(parts) =>
                Ok(PublicKeyInfo::Rsa {
                    n: parts.n.clone(),
                    e: parts.e.clone(),
                }),
            KeyMaterial::Ed25519Public(public) =>
                Ok(PublicKeyInfo::Ed25519(*public)),
            KeyMaterial::Ed25519Private { public, .. } =>
                Ok(PublicKeyInfo::Ed25519(*public)),
            _ => Err(Error::ArgumentValue(
                "context carries no public key".into()).into()),
        }
    }

    /// Converts back into context key material.
    pub fn to_material(&self) -> KeyMaterial {
        match self {
            PublicKeyInfo::Rsa { n, e } =>
                KeyMaterial::RsaPublic { n: n.clone(), e: e.clone() },
            PublicKeyInfo::Ed25519(public) =>
                KeyMaterial::Ed25519Public(*public),
        }
    }

    /// Serialises the subject-public-key-info structure.
    pub fn serialize(&self, w: &mut Writer) -> Result<()> {
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            match self {
                PublicKeyInfo::Rsa { n, e } => {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_oid(&oid_rsa_encryption());
                        w.write_null();
                        Ok(())
                    })?;
                    let mut key = Writer::new();
                    key.write_constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_integer_bytes(n);
                        w.write_integer_bytes(e);
                        Ok(())
                    })?;
                    w.write_bit_string(0, key.as_bytes());
                }
                PublicKeyInfo::Ed25519(public) => {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_oid(&oid_ed25519());
                        Ok(())
                    })?;
                    w.write_bit_string(0, public);
                }
            }
            Ok(())
        })
    }

    /// Parses a subject-public-key-info structure.
    pub fn parse(r: &mut Reader) -> Result<Self> {
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let algo = r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let oid = r.read_oid()?;
                if !r.is_empty() {
                    r.read_null()?;
                }
                Ok(oid)
            })?;
            let (unused, key) = r.read_bit_string()?;
            if unused != 0 {
                return Err(Error::BadData(
                    "ragged public key".into()).into());
            }
            if algo == oid_rsa_encryption() {
                let mut kr = Reader::new(&key);
                kr.read_constructed(ber::TAG_SEQUENCE, |r| {
                    Ok(PublicKeyInfo::Rsa {
                        n: r.read_integer_bytes()?,
                        e: r.read_integer_bytes()?,
                    })
                })
            } else if algo == oid_ed25519() {
                let public: [u8; 32] = key.as_slice().try_into()
                    .map_err(|_| anyhow::Error::from(Error::BadData(
                        "bad Ed25519 key length".into())))?;
                Ok(PublicKeyInfo::Ed25519(public))
            } else {
                Err(Error::NotAvailable(
                    "unsupported public key algorithm".into()).into())
            }
        })
    }

    /// Verifies a signature over a SHA-256 digest under this key.
    pub fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<bool> {
        match self {
            PublicKeyInfo::Rsa { n, e } =>
                Soft::rsa_verify_pkcs1_sha256(n, e, digest, signature),
            PublicKeyInfo::Ed25519(public) => {
                let sig: &[u8; 64] = match signature.try_into() {
                    Ok(sig) => sig,
                    Err(_) => return Ok(false),
                };
                Soft::ed25519_verify(public, digest, sig)
            }
        }
    }
}

fn write_signature_algorithm(w: &mut Writer, algo: PublicKeyAlgorithm)
                             -> Result<()> {
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        match algo {
            PublicKeyAlgorithm::Rsa => {
                w.write_oid(&oid_sha256_with_rsa());
                w.write_null();
            }
            PublicKeyAlgorithm::Ed25519 => {
                w.write_oid(&oid_ed25519());
            }
        }
        Ok(())
    })
}

fn read_signature_algorithm(r: &mut Reader) -> Result<PublicKeyAlgorithm> {
    r.read_constructed(ber::TAG_SEQUENCE, |r| {
        let oid = r.read_oid()?;
        if !r.is_empty() {
            r.read_null()?;
        }
        if oid == oid_sha256_with_rsa() {
            Ok(PublicKeyAlgorithm::Rsa)
        } else if oid == oid_ed25519() {
            Ok(PublicKeyAlgorithm::Ed25519)
        } else {
            Err(Error::NotAvailable(
                "unsupported signature algorithm".into()).into())
        }
    })
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut h = Soft::hasher(crate::types::HashAlgorithm::Sha256);
    h.update(data);
    h.finish()
}

/// A signed certificate: the parsed representation plus the original
/// encoded bytes.
///
/// Once constructed the pair never diverges; re-encoding returns the
/// original bytes unchanged.
#[derive(Clone, Debug)]
pub struct Certificate {
    encoded: Vec<u8>,
    tbs: Vec<u8>,
    serial: Vec<u8>,
    issuer: DistinguishedName,
    subject: DistinguishedName,
    valid_from: SystemTime,
    valid_to: SystemTime,
    public_key: PublicKeyInfo,
    extensions: Extensions,
    signature: Vec<u8>,
    self_signed: bool,
}

impl Certificate {
    /// Parses an encoded certificate.
    pub fn decode(data: &[u8]) -> Result<Certificate> {
        let mut outer = Reader::new(data);
        let body = outer.read_value(ber::TAG_SEQUENCE)?;
        if !outer.is_empty() {
            return Err(Error::BadData(
                "trailing bytes after certificate".into()).into());
        }

        // Remember the raw to-be-signed span for signature checks.
        let tbs = {
            let mut probe = Reader::new(body);
            probe.skip_value()?;
            body[..probe.position()].to_vec()
        };

        let mut r = Reader::new(body);
        let (serial, issuer, valid_from, valid_to, subject, public_key,
             extensions) =
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                // Version, explicitly tagged.
                r.read_constructed(ber::tag_context(0), |r| {
                    let version = r.read_integer()?;
                    if version != 2 {
                        return Err(Error::NotAvailable(format!(
                            "certificate version {}", version + 1)).into());
                    }
                    Ok(())
                })?;
                let serial = r.read_integer_bytes()?;
                read_signature_algorithm(r)?;
                let issuer = DistinguishedName::parse(r)?;
                let (valid_from, valid_to) =
                    r.read_constructed(ber::TAG_SEQUENCE, |r| {
                        Ok((r.read_time()?, r.read_time()?))
                    })?;
                let subject = DistinguishedName::parse(r)?;
                let public_key = PublicKeyInfo::parse(r)?;
                let extensions = if !r.is_empty() {
                    r.read_constructed(ber::tag_context(3),
                                       Extensions::parse)?
                } else {
                    Extensions::default()
                };
                Ok((serial, issuer, valid_from, valid_to, subject,
                    public_key, extensions))
            })?;
        read_signature_algorithm(&mut r)?;
        let (unused, signature) = r.read_bit_string()?;
        if unused != 0 {
            return Err(Error::BadData("ragged signature".into()).into());
        }
        if !r.is_empty() {
            return Err(Error::BadData(
                "trailing bytes after signature".into()).into());
        }

        let mut cert = Certificate {
            encoded: data.to_vec(),
            tbs,
            serial,
            issuer,
            subject,
            valid_from,
            valid_to,
            public_key,
            extensions,
            signature,
            self_signed: false,
        };
        cert.self_signed = cert.issuer.matches(&cert.subject)
            && cert.verify_signature(&cert.public_key).unwrap_or(false);
        Ok(cert)
    }

    /// Returns the original encoded bytes.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Returns the serial number.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Returns the issuer name.
    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    /// Returns the subject name.
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    /// Returns the validity window.
    pub fn validity(&self) -> (SystemTime, SystemTime) {
        (self.valid_from, self.valid_to)
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.public_key
    }

    /// Returns the extensions.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Returns whether the certificate is self-signed.
    pub fn is_self_signed(&self) -> bool {
        self.self_signed
    }

    /// Returns the SHA-256 fingerprint of the encoding.
    pub fn fingerprint(&self) -> Vec<u8> {
        sha256(&self.encoded)
    }

    /// Returns the subject key identifier: the extension value if
    /// present, the digest of the public key otherwise.
    pub fn subject_key_id(&self) -> Vec<u8> {
        if let Some(skid) = &self.extensions.subject_key_id {
            return skid.clone();
        }
        let mut w = Writer::new();
        // Infallible: writing into a fresh buffer.
        let _ = self.public_key.serialize(&mut w);
        sha256(w.as_bytes())
    }

    /// Verifies the certificate's signature under the given key.
    pub fn verify_signature(&self, key: &PublicKeyInfo) -> Result<bool> {
        key.verify(&sha256(&self.tbs), &self.signature)
    }
}

/// The accumulating state of a certificate under construction.
#[derive(Debug, Default)]
pub(crate) struct CertTemplate {
    pub serial: Option<Vec<u8>>,
    pub subject: DistinguishedName,
    pub valid_from: Option<SystemTime>,
    pub valid_to: Option<SystemTime>,
    pub key_usage: Option<KeyUsage>,
    pub ca: Option<bool>,
    pub path_len: Option<u32>,
    pub alt_names: Vec<String>,
    pub policies: Vec<String>,
    pub nc_permitted: Vec<String>,
    pub nc_excluded: Vec<String>,
    pub subject_key_id: Option<Vec<u8>>,
    pub public_key: Option<Handle>,
}

impl CertTemplate {
    fn extensions(&self) -> Extensions {
        Extensions {
            key_usage: self.key_usage,
            basic_constraints: self.ca.map(|ca| BasicConstraints {
                ca,
                path_len: self.path_len,
            }),
            subject_alt_names: self.alt_names.clone(),
            policies: self.policies.clone(),
            name_constraints: if self.nc_permitted.is_empty()
                && self.nc_excluded.is_empty()
            {
                None
            } else {
                Some(NameConstraints {
                    permitted: self.nc_permitted.clone(),
                    excluded: self.nc_excluded.clone(),
                })
            },
            subject_key_id: self.subject_key_id.clone(),
            unknown_critical: false,
        }
    }
}

/// A single-certificate object: template while mutable, certificate
/// once signed or imported.
#[derive(Debug, Default)]
pub(crate) struct CertData {
    pub template: CertTemplate,
    pub cert: Option<Certificate>,
    pub trusted_implicit: bool,
    /// Revocation detail recorded by the last CRL check.
    pub revocation: Option<RevocationEntry>,
}

/// A certificate chain, leaf first.
#[derive(Debug)]
pub(crate) struct ChainData {
    pub certs: Vec<Certificate>,
    pub cursor: usize,
    pub trusted_implicit: bool,
}

/// A CRL object.
#[derive(Debug, Default)]
pub(crate) struct CrlData {
    pub entries: Vec<RevocationEntry>,
    pub cursor: usize,
    pub issuer: Option<DistinguishedName>,
    pub this_update: Option<SystemTime>,
    pub encoded: Option<Vec<u8>>,
}

/// The payload of a certificate-family object.
#[derive(Debug)]
pub(crate) enum CertObject {
    Single(CertData),
    Chain(ChainData),
    Crl(CrlData),
    /// Enumerated subtypes whose operations are not yet wired up.
    Stub(CertificateType),
}

impl CertObject {
    /// Reports whether an attribute is set, for the ACL engine's
    /// dependency checks.
    pub(crate) fn attr_present(&self, attr: Attribute) -> bool {
        let data = match self {
            CertObject::Single(data) => data,
            _ => return false,
        };
        if let Some(cert) = &data.cert {
            let ext = &cert.extensions;
            return match attr {
                Attribute::CertSerialNumber => true,
                Attribute::CertKeyUsage => ext.key_usage.is_some(),
                Attribute::CertCa => ext.basic_constraints.is_some(),
                Attribute::CertPathLenConstraint =>
                    ext.basic_constraints
                        .map(|bc| bc.path_len.is_some()).unwrap_or(false),
                Attribute::CertNameConstraintPermitted =>
                    ext.name_constraints.as_ref()
                        .map(|nc| !nc.permitted.is_empty()).unwrap_or(false),
                Attribute::CertNameConstraintExcluded =>
                    ext.name_constraints.as_ref()
                        .map(|nc| !nc.excluded.is_empty()).unwrap_or(false),
                _ => false,
            };
        }
        let t = &data.template;
        match attr {
            Attribute::CertSerialNumber => t.serial.is_some(),
            Attribute::CertValidFrom => t.valid_from.is_some(),
            Attribute::CertValidTo => t.valid_to.is_some(),
            Attribute::CertKeyUsage => t.key_usage.is_some(),
            Attribute::CertCa => t.ca.is_some(),
            Attribute::CertPathLenConstraint => t.path_len.is_some(),
            Attribute::CertAltNameDns => !t.alt_names.is_empty(),
            Attribute::CertPolicy => !t.policies.is_empty(),
            Attribute::CertNameConstraintPermitted =>
                !t.nc_permitted.is_empty(),
            Attribute::CertNameConstraintExcluded =>
                !t.nc_excluded.is_empty(),
            Attribute::CertPublicKey => t.public_key.is_some(),
            Attribute::CertSubjectKeyId => t.subject_key_id.is_some(),
            Attribute::CertCountry =>
                t.subject.get(DnAttribute::Country).is_some(),
            Attribute::CertOrganization =>
                t.subject.get(DnAttribute::Organization).is_some(),
            Attribute::CertOrgUnit =>
                t.subject.get(DnAttribute::OrganizationalUnit).is_some(),
            Attribute::CertCommonName =>
                t.subject.get(DnAttribute::CommonName).is_some(),
            _ => false,
        }
    }
}

/// Creates an empty certificate-family object.
pub fn create(kernel: &Kernel, cert_type: CertificateType)
              -> Result<Handle> {
    let payload = match cert_type {
        CertificateType::Certificate =>
            CertObject::Single(CertData::default()),
        CertificateType::Crl => CertObject::Crl(CrlData::default()),
        CertificateType::Chain => return Err(Error::ArgumentValue(
            "chains are created from certificates".into()).into()),
        other => CertObject::Stub(other),
    };
    kernel.create_object(
        ObjectType::Certificate,
        ObjectSubtype::Certificate(cert_type),
        Some(kernel.default_user()),
        ObjectPayload::Certificate(payload))
}

/// Imports an encoded certificate or chain, returning a ready
/// object.
pub fn import(kernel: &Kernel, data: &[u8]) -> Result<Handle> {
    match Certificate::decode(data) {
        Ok(cert) => {
            let handle = kernel.create_object(
                ObjectType::Certificate,
                ObjectSubtype::Certificate(CertificateType::Certificate),
                Some(kernel.default_user()),
                ObjectPayload::Certificate(CertObject::Single(CertData {
                    cert: Some(cert),
                    ..CertData::default()
                })))?;
            kernel.mark_ready(handle)?;
            Ok(handle)
        }
        Err(first) => {
            // Not a single certificate; try a chain.
            let certs = decode_chain(data).map_err(|_| first)?;
            let handle = kernel.create_object(
                ObjectType::Certificate,
                ObjectSubtype::Certificate(CertificateType::Chain),
                Some(kernel.default_user()),
                ObjectPayload::Certificate(CertObject::Chain(ChainData {
                    certs,
                    cursor: 0,
                    trusted_implicit: false,
                })))?;
            kernel.mark_ready(handle)?;
            Ok(handle)
        }
    }
}

/// Builds a chain object from signed certificate objects, leaf
/// first.
pub fn create_chain(kernel: &Kernel, handles: &[Handle]) -> Result<Handle> {
    if handles.is_empty() {
        return Err(Error::ArgumentValue("empty chain".into()).into());
    }
    let mut certs = Vec::with_capacity(handles.len());
    for &h in handles {
        let cert = kernel.with_payload(h, |payload| match payload {
            ObjectPayload::Certificate(CertObject::Single(data)) =>
                data.cert.clone().ok_or_else(|| {
                    Error::NotInitialised(
                        "certificate is not signed".into()).into()
                }),
            _ => Err(Error::ArgumentValue(
                "not a certificate".into()).into()),
        })?;
        certs.push(cert);
    }
    // Parent links must hold pairwise.
    for window in certs.windows(2) {
        if !window[1].subject().matches(window[0].issuer()) {
            return Err(Error::Invalid(
                "chain is not parent-linked".into()).into());
        }
    }
    let handle = kernel.create_object(
        ObjectType::Certificate,
        ObjectSubtype::Certificate(CertificateType::Chain),
        Some(kernel.default_user()),
        ObjectPayload::Certificate(CertObject::Chain(ChainData {
            certs,
            cursor: 0,
            trusted_implicit: false,
        })))?;
    kernel.mark_ready(handle)?;
    Ok(handle)
}

fn decode_chain(data: &[u8]) -> Result<Vec<Certificate>> {
    let mut outer = Reader::new(data);
    let body = outer.read_value(ber::TAG_SEQUENCE)?;
    let mut r = Reader::new(body);
    let mut certs = Vec::new();
    while !r.is_empty() {
        let start = r.position();
        r.skip_value()?;
        certs.push(Certificate::decode(&body[start..r.position()])?);
    }
    if certs.is_empty() {
        return Err(Error::BadData("empty chain".into()).into());
    }
    Ok(certs)
}

fn encode_chain(certs: &[Certificate]) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        for cert in certs {
            w.write_raw(cert.encoded());
        }
        Ok(())
    })?;
    Ok(w.into_vec())
}

/// Resolves the signer argument of a `sign` message: the issuer name
/// to use, the signing context material, and the signer's key usage
/// if it came from a certificate.
fn resolve_signer(kernel: &Kernel, own: Handle, signer: Handle,
                  subject: &DistinguishedName)
                  -> Result<(DistinguishedName, Handle,
                             Option<KeyUsage>)> {
    let (object_type, _) = kernel.object_kind(signer)?;
    match object_type {
        ObjectType::Context => {
            // Bare key: a self-signature, the issuer is the subject.
            Ok((subject.clone(), signer, None))
        }
        ObjectType::Certificate if signer != own => {
            let (issuer, usage) =
                kernel.with_payload(signer, |payload| match payload {
                    ObjectPayload::Certificate(CertObject::Single(data)) => {
                        let cert = data.cert.as_ref().ok_or_else(
                            || anyhow::Error::from(Error::NotInitialised(
                                "signing certificate is unsigned".into())))?;
                        Ok((cert.subject().clone(),
                            cert.extensions().key_usage))
                    }
                    _ => Err(Error::ArgumentValue(
                        "signer is not a certificate".into()).into()),
                })?;
            let key = kernel.dependent_of(signer)?
                .ok_or_else(|| anyhow::Error::from(Error::NotInitialised(
                    "signing certificate has no bound key".into())))?;
            Ok((issuer, key, usage))
        }
        _ => Err(Error::ArgumentValue(
            "signer must be a context or certificate".into()).into()),
    }
}

fn signing_algorithm(kernel: &Kernel, key: Handle)
                     -> Result<PublicKeyAlgorithm> {
    kernel.with_payload(key, |payload| match payload {
        ObjectPayload::Context(ctx) => ctx.pkc_algorithm()
            .ok_or_else(|| anyhow::Error::from(Error::ArgumentValue(
                "context carries no signing key".into()))),
        _ => Err(Error::ArgumentValue("not a context".into()).into()),
    })
}

fn sign_with(kernel: &Kernel, key: Handle, digest: &[u8])
             -> Result<Vec<u8>> {
    kernel.with_payload(key, |payload| match payload {
        ObjectPayload::Context(ctx) => ctx.sign_digest(digest),
        _ => Err(Error::ArgumentValue("not a context".into()).into()),
    })
}

/// Assembles and signs a certificate from its template.
fn sign_certificate(kernel: &Kernel, own: Handle, data: &mut CertData,
                    signer: Handle) -> Result<Certificate> {
    if data.cert.is_some() {
        return Err(Error::AlreadyInitialised(
            "certificate is already signed".into()).into());
    }
    let template = &data.template;
    if template.subject.is_empty() {
        return Err(Fault::new(Attribute::CertCommonName,
                              ErrorType::AttributeAbsent,
                              Error::NotInitialised(
                                  "certificate has no subject".into())));
    }
    let pk_handle = template.public_key.ok_or_else(|| Fault::new(
        Attribute::CertPublicKey, ErrorType::AttributeAbsent,
        Error::NotInitialised("certificate has no public key".into())))?;
    let spki = kernel.with_payload(pk_handle, |payload| match payload {
        ObjectPayload::Context(ctx) =>
            PublicKeyInfo::from_material(ctx.material()),
        _ => Err(Error::ArgumentValue("not a context".into()).into()),
    })?;

    let (issuer, key, signer_usage) =
        resolve_signer(kernel, own, signer, &template.subject)?;
    if let Some(usage) = signer_usage {
        if !usage.for_certification() {
            return Err(Fault::new(Attribute::CertKeyUsage,
                                  ErrorType::Constraint,
                                  Error::Invalid(
                "signer's key usage does not permit certificate signing"
                    .into())));
        }
    }
    let sig_algo = signing_algorithm(kernel, key)?;

    let valid_from = template.valid_from
        .unwrap_or_else(SystemTime::now);
    let valid_to = template.valid_to.unwrap_or_else(
        // A year, as a round number of days.
        || valid_from + Duration::from_secs(365 * 86400));
    if valid_to <= valid_from {
        return Err(Fault::new(Attribute::CertValidTo,
                              ErrorType::ValueRange,
                              Error::ArgumentRange(
                                  "validity window is empty".into())));
    }
    let serial = match &template.serial {
        Some(serial) => serial.clone(),
        None => {
            let mut serial = vec![0u8; 16];
            Soft::random(&mut serial)?;
            // Serials are positive integers.
            serial[0] &= 0x7f;
            if serial[0] == 0 {
                serial[0] = 1;
            }
            serial
        }
    };

    let mut tbs = Writer::new();
    tbs.write_constructed(ber::TAG_SEQUENCE, |w| {
        w.write_constructed(ber::tag_context(0), |w| {
            w.write_integer(2);
            Ok(())
        })?;
        w.write_integer_bytes(&serial);
        write_signature_algorithm(w, sig_algo)?;
        issuer.serialize(w)?;
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_time(valid_from)?;
            w.write_time(valid_to)
        })?;
        template.subject.serialize(w)?;
        spki.serialize(w)?;
        let extensions = template.extensions();
        if !extensions.is_empty() {
            w.write_constructed(ber::tag_context(3),
                                |w| extensions.serialize(w))?;
        }
        Ok(())
    })?;

    let signature = sign_with(kernel, key, &sha256(tbs.as_bytes()))?;
    let mut w = Writer::new();
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        w.write_raw(tbs.as_bytes());
        write_signature_algorithm(w, sig_algo)?;
        w.write_bit_string(0, &signature);
        Ok(())
    })?;

    // Parsing our own encoding both checks the codec and yields the
    // canonical in-memory form.
    let cert = Certificate::decode(&w.into_vec())?;
    debug!(subject = %cert.subject(), issuer = %cert.issuer(),
           "signed certificate");
    Ok(cert)
}

/// Assembles and signs a CRL.
fn sign_crl(kernel: &Kernel, own: Handle, crl: &mut CrlData,
            signer: Handle) -> Result<()> {
    if crl.encoded.is_some() {
        return Err(Error::AlreadyInitialised(
            "CRL is already signed".into()).into());
    }
    let (issuer, key, signer_usage) = resolve_signer(
        kernel, own, signer, &DistinguishedName::new())?;
    if issuer.is_empty() {
        return Err(Error::ArgumentValue(
            "CRLs must be signed with a certificate".into()).into());
    }
    if let Some(usage) = signer_usage {
        if !usage.for_crl_signing() {
            return Err(Fault::new(Attribute::CertKeyUsage,
                                  ErrorType::Constraint,
                                  Error::Invalid(
                "signer's key usage does not permit CRL signing".into())));
        }
    }
    let sig_algo = signing_algorithm(kernel, key)?;
    let this_update = SystemTime::now();

    let mut tbs = Writer::new();
    tbs.write_constructed(ber::TAG_SEQUENCE, |w| {
        w.write_integer(1); // v2
        write_signature_algorithm(w, sig_algo)?;
        issuer.serialize(w)?;
        w.write_time(this_update)?;
        if !crl.entries.is_empty() {
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                for entry in &crl.entries {
                    entry.serialize(w)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    })?;

    let signature = sign_with(kernel, key, &sha256(tbs.as_bytes()))?;
    let mut w = Writer::new();
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        w.write_raw(tbs.as_bytes());
        write_signature_algorithm(w, sig_algo)?;
        w.write_bit_string(0, &signature);
        Ok(())
    })?;

    crl.issuer = Some(issuer);
    crl.this_update = Some(this_update);
    crl.encoded = Some(w.into_vec());
    debug!(entries = crl.entries.len(), "signed CRL");
    Ok(())
}

fn move_cursor(cursor: &mut usize, len: usize, command: i64)
               -> Result<()> {
    if len == 0 {
        return Err(Error::NotFound("no entries".into()).into());
    }
    let new = match command {
        CURSOR_FIRST => 0,
        CURSOR_LAST => len - 1,
        CURSOR_NEXT => {
            if *cursor + 1 >= len {
                return Err(Error::NotFound(
                    "no next entry".into()).into());
            }
            *cursor + 1
        }
        CURSOR_PREVIOUS => {
            if *cursor == 0 {
                return Err(Error::NotFound(
                    "no previous entry".into()).into());
            }
            *cursor - 1
        }
        _ => return Err(Error::ArgumentValue(
            format!("bad cursor command {}", command)).into()),
    };
    *cursor = new;
    Ok(())
}

/// Handles a kernel message addressed to a certificate-family
/// object.
pub(crate) fn dispatch(kernel: &Kernel, handle: Handle,
                       object: &Arc<Object>, payload: &mut CertObject,
                       msg: Message, _internal: bool) -> Result<Reply> {
    match payload {
        CertObject::Single(data) =>
            dispatch_single(kernel, handle, object, data, msg),
        CertObject::Chain(chain) =>
            dispatch_chain(kernel, handle, chain, msg),
        CertObject::Crl(crl) =>
            dispatch_crl(kernel, handle, object, crl, msg),
        CertObject::Stub(t) => Err(Error::NotAvailable(
            format!("{} objects are not yet operational", t)).into()),
    }
}

fn dispatch_single(kernel: &Kernel, handle: Handle, object: &Arc<Object>,
                   data: &mut CertData, msg: Message) -> Result<Reply> {
    match msg {
        Message::GetAttribute(attr) =>
            get_single(data, attr).map(Reply::Value),
        Message::SetAttribute(attr, value) =>
            set_single(kernel, object, data, attr, value),
        Message::DeleteAttribute(attr) =>
            delete_single(data, attr),
        Message::Compare(crate::kernel::CompareType::Fingerprint, bytes) => {
            let cert = require_cert(data)?;
            Ok(Reply::Truth(secure_cmp(&cert.fingerprint(), &bytes)))
        }
        Message::Compare(..) => Err(Error::NotAvailable(
            "certificates only compare fingerprints".into()).into()),
        Message::Check(check) => {
            let cert = require_cert(data)?;
            let usage = cert.extensions().key_usage
                .unwrap_or_else(KeyUsage::empty);
            let ok = match check {
                CheckType::Sign => usage.for_signing(),
                CheckType::SigCheck => true,
                CheckType::Encrypt => usage.for_key_encipherment(),
                CheckType::Decrypt => false,
                CheckType::Mac => false,
                CheckType::CertSign => usage.for_certification()
                    && cert.extensions().basic_constraints
                        .map(|bc| bc.ca).unwrap_or(false),
                CheckType::CrlSign => usage.for_crl_signing(),
            };
            Ok(Reply::Truth(ok))
        }
        Message::SignCert(signer) => {
            let cert = sign_certificate(kernel, handle, data, signer)?;
            data.cert = Some(cert);
            lock_meta(object)?.state = ObjectState::Ready;
            Ok(Reply::Unit)
        }
        Message::SigCheck(issuer) => {
            let cert = require_cert(data)?;
            let ok = if issuer == handle {
                if !cert.is_self_signed() {
                    return Err(Error::BadSignature(
                        "certificate is not self-signed".into()).into());
                }
                true
            } else {
                let key = issuer_public_key(kernel, issuer)?;
                cert.verify_signature(&key)?
            };
            if ok {
                Ok(Reply::Unit)
            } else {
                Err(Error::BadSignature(
                    "certificate signature does not verify".into()).into())
            }
        }
        Message::CheckAgainst(crl_handle) => {
            let cert = require_cert(data)?;
            let entry = kernel.with_payload(crl_handle, |payload| {
                match payload {
                    ObjectPayload::Certificate(CertObject::Crl(crl)) => {
                        if crl.encoded.is_none() {
                            return Err(Error::NotInitialised(
                                "CRL is not signed".into()).into());
                        }
                        if let Some(issuer) = &crl.issuer {
                            if !issuer.matches(cert.issuer()) {
                                return Err(Error::ArgumentValue(
                                    "CRL is from a different issuer"
                                        .into()).into());
                            }
                        }
                        Ok(crl.entries.iter()
                           .find(|e| e.serial == cert.serial())
                           .cloned())
                    }
                    _ => Err(Error::ArgumentValue(
                        "not a CRL".into()).into()),
                }
            })?;
            match entry {
                Some(entry) => {
                    data.revocation = Some(entry);
                    Err(Fault::new(Attribute::CertRevocationReason,
                                   ErrorType::Constraint,
                                   Error::Invalid(
                                       "certificate is revoked".into())))
                }
                None => Ok(Reply::Unit),
            }
        }
        _ => Err(Error::NotAvailable(
            "certificates accept no such message".into()).into()),
    }
}

fn require_cert(data: &CertData) -> Result<&Certificate> {
    data.cert.as_ref().ok_or_else(|| Error::NotInitialised(
        "certificate is not signed".into()).into())
}

fn issuer_public_key(kernel: &Kernel, issuer: Handle)
                     -> Result<PublicKeyInfo> {
    let (object_type, _) = kernel.object_kind(issuer)?;
    kernel.with_payload(issuer, |payload| match (object_type, payload) {
        (ObjectType::Certificate,
         ObjectPayload::Certificate(CertObject::Single(data))) => {
            let cert = data.cert.as_ref().ok_or_else(
                || anyhow::Error::from(Error::NotInitialised(
                    "issuer certificate is unsigned".into())))?;
            Ok(cert.public_key().clone())
        }
        (ObjectType::Context, ObjectPayload::Context(ctx)) =>
            PublicKeyInfo::from_material(ctx.material()),
        _ => Err(Error::ArgumentValue(
            "issuer must be a certificate or context".into()).into()),
    })
}

fn get_single(data: &CertData, attr: Attribute) -> Result<AttributeValue> {
    use AttributeValue as V;
    if let Some(cert) = &data.cert {
        let ext = cert.extensions();
        let value = match attr {
            Attribute::CertSelfSigned => V::Bool(cert.is_self_signed()),
            Attribute::CertImmutable => V::Bool(true),
            Attribute::CertTrustedImplicit => V::Bool(data.trusted_implicit),
            Attribute::CertSerialNumber => V::Bytes(cert.serial().to_vec()),
            Attribute::CertValidFrom => V::Time(cert.validity().0),
            Attribute::CertValidTo => V::Time(cert.validity().1),
            Attribute::CertCountry => subject_part(
                cert.subject(), DnAttribute::Country)?,
            Attribute::CertOrganization => subject_part(
                cert.subject(), DnAttribute::Organization)?,
            Attribute::CertOrgUnit => subject_part(
                cert.subject(), DnAttribute::OrganizationalUnit)?,
            Attribute::CertCommonName => subject_part(
                cert.subject(), DnAttribute::CommonName)?,
            Attribute::CertKeyUsage => V::Int(
                ext.key_usage.map(|u| u.bits() as i64).unwrap_or(0)),
            Attribute::CertCa => V::Bool(
                ext.basic_constraints.map(|bc| bc.ca).unwrap_or(false)),
            Attribute::CertPathLenConstraint => match ext.basic_constraints
                .and_then(|bc| bc.path_len)
            {
                Some(len) => V::Int(len as i64),
                None => return Err(Error::NotFound(
                    "no path-length constraint".into()).into()),
            },
            Attribute::CertAltNameDns => match ext.subject_alt_names.first() {
                Some(name) => V::Str(name.clone()),
                None => return Err(Error::NotFound(
                    "no alternative names".into()).into()),
            },
            Attribute::CertPolicy => match ext.policies.first() {
                Some(policy) => V::Str(policy.clone()),
                None => return Err(Error::NotFound(
                    "no policies".into()).into()),
            },
            Attribute::CertNameConstraintPermitted =>
                match ext.name_constraints.as_ref()
                    .and_then(|nc| nc.permitted.first())
            {
                Some(name) => V::Str(name.clone()),
                None => return Err(Error::NotFound(
                    "no permitted subtrees".into()).into()),
            },
            Attribute::CertNameConstraintExcluded =>
                match ext.name_constraints.as_ref()
                    .and_then(|nc| nc.excluded.first())
            {
                Some(name) => V::Str(name.clone()),
                None => return Err(Error::NotFound(
                    "no excluded subtrees".into()).into()),
            },
            Attribute::CertPublicKey => match data.template.public_key {
                Some(h) => V::Object(h),
                None => return Err(Error::NotFound(
                    "no bound public-key context".into()).into()),
            },
            Attribute::CertFingerprint => V::Bytes(cert.fingerprint()),
            Attribute::CertSubjectKeyId => V::Bytes(cert.subject_key_id()),
            Attribute::CertIssuerName => V::Str(cert.issuer().to_string()),
            Attribute::CertSubjectName => V::Str(cert.subject().to_string()),
            Attribute::CertEncoded => V::Bytes(cert.encoded().to_vec()),
            Attribute::CertRevocationReason => match &data.revocation {
                Some(entry) => V::Int(entry.reason
                    .unwrap_or(RevocationReason::Unspecified).code() as i64),
                None => return Err(Error::NotFound(
                    "certificate is not known to be revoked".into()).into()),
            },
            Attribute::CertRevocationDate => match &data.revocation {
                Some(entry) => V::Time(entry.revocation_date),
                None => return Err(Error::NotFound(
                    "certificate is not known to be revoked".into()).into()),
            },
            Attribute::CertInvalidityDate => match &data.revocation {
                Some(entry) => match entry.invalidity_date {
                    Some(date) => V::Time(date),
                    None => return Err(Error::NotFound(
                        "no invalidity date recorded".into()).into()),
                },
                None => return Err(Error::NotFound(
                    "certificate is not known to be revoked".into()).into()),
            },
            _ => return Err(Error::NotAvailable(
                format!("{} on a certificate", attr)).into()),
        };
        return Ok(value);
    }

    // Unsigned: read back the template.
    let t = &data.template;
    let value = match attr {
        Attribute::CertSelfSigned => V::Bool(false),
        Attribute::CertImmutable => V::Bool(false),
        Attribute::CertTrustedImplicit => V::Bool(data.trusted_implicit),
        Attribute::CertSerialNumber => match &t.serial {
            Some(serial) => V::Bytes(serial.clone()),
            None => return Err(Error::NotFound(
                "no serial number set".into()).into()),
        },
        Attribute::CertValidFrom => match t.valid_from {
            Some(time) => V::Time(time),
            None => return Err(Error::NotFound(
                "validity start not set".into()).into()),
        },
        Attribute::CertValidTo => match t.valid_to {
            Some(time) => V::Time(time),
            None => return Err(Error::NotFound(
                "validity end not set".into()).into()),
        },
        Attribute::CertCountry => subject_part(
            &t.subject, DnAttribute::Country)?,
        Attribute::CertOrganization => subject_part(
            &t.subject, DnAttribute::Organization)?,
        Attribute::CertOrgUnit => subject_part(
            &t.subject, DnAttribute::OrganizationalUnit)?,
        Attribute::CertCommonName => subject_part(
            &t.subject, DnAttribute::CommonName)?,
        Attribute::CertKeyUsage => V::Int(
            t.key_usage.map(|u| u.bits() as i64).unwrap_or(0)),
        Attribute::CertCa => V::Bool(t.ca.unwrap_or(false)),
        Attribute::CertSubjectName => V::Str(t.subject.to_string()),
        Attribute::CertPublicKey => match t.public_key {
            Some(h) => V::Object(h),
            None => return Err(Error::NotFound(
                "no bound public-key context".into()).into()),
        },
        _ => return Err(Error::NotFound(
            format!("{} not set", attr)).into()),
    };
    Ok(value)
}

fn subject_part(dn: &DistinguishedName, part: DnAttribute)
                -> Result<AttributeValue> {
    dn.get(part)
        .map(|v| AttributeValue::Str(v.to_string()))
        .ok_or_else(|| Error::NotFound(
            format!("{:?} not present in name", part)).into())
}

fn set_single(kernel: &Kernel, object: &Arc<Object>, data: &mut CertData,
              attr: Attribute, value: AttributeValue) -> Result<Reply> {
    // Trust is external to the signed blob and stays writable.
    if attr == Attribute::CertTrustedImplicit {
        data.trusted_implicit = value.into_bool()?;
        return Ok(Reply::Unit);
    }
    if data.cert.is_some() {
        return Err(Error::Permission(
            "certificate is immutable once signed".into()).into());
    }
    let t = &mut data.template;
    match attr {
        Attribute::CertSerialNumber => t.serial = Some(value.into_bytes()?),
        Attribute::CertValidFrom => t.valid_from = Some(value.into_time()?),
        Attribute::CertValidTo => t.valid_to = Some(value.into_time()?),
        Attribute::CertCountry =>
            t.subject.set(DnAttribute::Country, value.into_string()?),
        Attribute::CertOrganization =>
            t.subject.set(DnAttribute::Organization, value.into_string()?),
        Attribute::CertOrgUnit =>
            t.subject.set(DnAttribute::OrganizationalUnit,
                          value.into_string()?),
        Attribute::CertCommonName =>
            t.subject.set(DnAttribute::CommonName, value.into_string()?),
        Attribute::CertKeyUsage => {
            let bits = value.into_int()?;
            t.key_usage = Some(KeyUsage::from_bits(bits as u16)?);
        }
        Attribute::CertCa => t.ca = Some(value.into_bool()?),
        Attribute::CertPathLenConstraint =>
            t.path_len = Some(value.into_int()? as u32),
        Attribute::CertAltNameDns =>
            t.alt_names.push(value.into_string()?),
        Attribute::CertPolicy => {
            let policy = value.into_string()?;
            ext::parse_dotted_oid(&policy)?;
            t.policies.push(policy);
        }
        Attribute::CertNameConstraintPermitted =>
            t.nc_permitted.push(value.into_string()?),
        Attribute::CertNameConstraintExcluded =>
            t.nc_excluded.push(value.into_string()?),
        Attribute::CertSubjectKeyId =>
            t.subject_key_id = Some(value.into_bytes()?),
        Attribute::CertPublicKey => {
            let h = value.into_object()?;
            kernel.bind_dependent(object, h)?;
            t.public_key = Some(h);
        }
        _ => return Err(Error::NotAvailable(
            format!("{} on a certificate", attr)).into()),
    }
    Ok(Reply::Unit)
}

fn delete_single(data: &mut CertData, attr: Attribute) -> Result<Reply> {
    if data.cert.is_some() {
        return Err(Error::Permission(
            "certificate is immutable once signed".into()).into());
    }
    let t = &mut data.template;
    let deleted = match attr {
        Attribute::CertSerialNumber => t.serial.take().is_some(),
        Attribute::CertValidFrom => t.valid_from.take().is_some(),
        Attribute::CertValidTo => t.valid_to.take().is_some(),
        _ => return Err(Error::NotAvailable(
            format!("{} cannot be deleted", attr)).into()),
    };
    if deleted {
        Ok(Reply::Unit)
    } else {
        Err(Error::NotFound(format!("{} not set", attr)).into())
    }
}

fn dispatch_chain(kernel: &Kernel, handle: Handle, chain: &mut ChainData,
                  msg: Message) -> Result<Reply> {
    match msg {
        Message::GetAttribute(Attribute::CertCursor) =>
            Ok(Reply::Value(AttributeValue::Int(chain.cursor as i64))),
        Message::SetAttribute(Attribute::CertCursor, value) => {
            move_cursor(&mut chain.cursor, chain.certs.len(),
                        value.into_int()?)?;
            Ok(Reply::Unit)
        }
        Message::SetAttribute(Attribute::CertTrustedImplicit, value) => {
            chain.trusted_implicit = value.into_bool()?;
            Ok(Reply::Unit)
        }
        Message::GetAttribute(Attribute::CertEncoded) =>
            Ok(Reply::Value(AttributeValue::Bytes(
                encode_chain(&chain.certs)?))),
        Message::GetAttribute(attr) => {
            // Reads go to the certificate under the cursor.
            let data = CertData {
                cert: Some(chain.certs[chain.cursor].clone()),
                trusted_implicit: chain.trusted_implicit,
                ..CertData::default()
            };
            get_single(&data, attr).map(Reply::Value)
        }
        Message::ValidateChain(user) =>
            validate::validate_chain(kernel, user, chain)
                .map(|_| Reply::Unit),
        Message::Check(_) => Ok(Reply::Truth(false)),
        _ => Err(Error::NotAvailable(
            format!("chains accept no such message (object {})", handle))
            .into()),
    }
}

fn dispatch_crl(kernel: &Kernel, handle: Handle, object: &Arc<Object>,
                crl: &mut CrlData, msg: Message) -> Result<Reply> {
    use AttributeValue as V;
    match msg {
        Message::GetAttribute(attr) => {
            let value = match attr {
                Attribute::CertCursor => V::Int(crl.cursor as i64),
                Attribute::CertImmutable => V::Bool(crl.encoded.is_some()),
                Attribute::CertIssuerName => match &crl.issuer {
                    Some(issuer) => V::Str(issuer.to_string()),
                    None => return Err(Error::NotFound(
                        "CRL is not signed".into()).into()),
                },
                Attribute::CertEncoded => match &crl.encoded {
                    Some(encoded) => V::Bytes(encoded.clone()),
                    None => return Err(Error::NotInitialised(
                        "CRL is not signed".into()).into()),
                },
                Attribute::CertSerialNumber
                | Attribute::CertRevocationReason
                | Attribute::CertRevocationDate
                | Attribute::CertInvalidityDate => {
                    let entry = crl.entries.get(crl.cursor)
                        .ok_or_else(|| anyhow::Error::from(
                            Error::NotFound("no CRL entries".into())))?;
                    match attr {
                        Attribute::CertSerialNumber =>
                            V::Bytes(entry.serial.clone()),
                        Attribute::CertRevocationReason =>
                            V::Int(entry.reason
                                   .unwrap_or(RevocationReason::Unspecified)
                                   .code() as i64),
                        Attribute::CertRevocationDate =>
                            V::Time(entry.revocation_date),
                        Attribute::CertInvalidityDate =>
                            match entry.invalidity_date {
                                Some(date) => V::Time(date),
                                None => return Err(Error::NotFound(
                                    "no invalidity date".into()).into()),
                            },
                        _ => unreachable!(),
                    }
                }
                _ => return Err(Error::NotAvailable(
                    format!("{} on a CRL", attr)).into()),
            };
            Ok(Reply::Value(value))
        }
        Message::SetAttribute(attr, value) => {
            if crl.encoded.is_some() {
                return Err(Error::Permission(
                    "CRL is immutable once signed".into()).into());
            }
            match attr {
                Attribute::CertCursor => {
                    move_cursor(&mut crl.cursor, crl.entries.len(),
                                value.into_int()?)?;
                }
                Attribute::CertRevokedCert => {
                    let cert_handle = value.into_object()?;
                    let serial = kernel.with_payload(
                        cert_handle, |payload| match payload {
                            ObjectPayload::Certificate(
                                CertObject::Single(data)) =>
                                Ok(require_cert(data)?.serial().to_vec()),
                            _ => Err(Error::ArgumentValue(
                                "not a certificate".into()).into()),
                        })?;
                    if crl.entries.iter().any(|e| e.serial == serial) {
                        return Err(Error::Duplicate(
                            "certificate is already listed".into()).into());
                    }
                    crl.entries.push(RevocationEntry {
                        serial,
                        revocation_date: SystemTime::now(),
                        reason: None,
                        invalidity_date: None,
                    });
                    crl.cursor = crl.entries.len() - 1;
                }
                Attribute::CertRevocationReason => {
                    let entry = current_entry(crl)?;
                    entry.reason = Some(RevocationReason::from_code(
                        value.into_int()? as u8)?);
                }
                Attribute::CertRevocationDate => {
                    let entry = current_entry(crl)?;
                    entry.revocation_date = value.into_time()?;
                }
                Attribute::CertInvalidityDate => {
                    let entry = current_entry(crl)?;
                    entry.invalidity_date = Some(value.into_time()?);
                }
                _ => return Err(Error::NotAvailable(
                    format!("{} on a CRL", attr)).into()),
            }
            Ok(Reply::Unit)
        }
        Message::SignCert(signer) => {
            sign_crl(kernel, handle, crl, signer)?;
            lock_meta(object)?.state = ObjectState::Ready;
            Ok(Reply::Unit)
        }
        Message::Check(_) => Ok(Reply::Truth(false)),
        _ => Err(Error::NotAvailable(
            "CRLs accept no such message".into()).into()),
    }
}

fn current_entry(crl: &mut CrlData) -> Result<&mut RevocationEntry> {
    let cursor = crl.cursor;
    crl.entries.get_mut(cursor)
        .ok_or_else(|| Error::NotFound(
            "no CRL entry under the cursor".into()).into())
}

#[cfg(test)]
pub(crate) mod tests;
