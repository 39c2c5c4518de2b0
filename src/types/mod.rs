//! Primitive types shared across the crate.
//!
//! This module houses the enumerations that the kernel, the
//! certificate machinery, and the envelope engines all agree on:
//! object and certificate types, object lifecycle states, algorithm
//! identifiers, compliance levels, key-usage flags, and the structured
//! error loci recorded on object records.

use std::fmt;

#[cfg(test)]
use quickcheck::{Arbitrary, Gen};

use crate::Error;
use crate::Result;

/// The type of a kernel-managed object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// An algorithm capability context carrying key material or
    /// digest state.
    Context,
    /// A certificate-family object, see [`CertificateType`].
    Certificate,
    /// A persistent store of keys and certificates.
    Keyset,
    /// A streaming message processor.
    Envelope,
    /// A wire-protocol session.  Sessions are external collaborators;
    /// the kernel carries the type but instantiates none itself.
    Session,
    /// A crypto device.  Like sessions, enumerated but externally
    /// provided.
    Device,
    /// A user identity binding configuration, trust, and key storage.
    User,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectType::Context => f.write_str("context"),
            ObjectType::Certificate => f.write_str("certificate"),
            ObjectType::Keyset => f.write_str("keyset"),
            ObjectType::Envelope => f.write_str("envelope"),
            ObjectType::Session => f.write_str("session"),
            ObjectType::Device => f.write_str("device"),
            ObjectType::User => f.write_str("user"),
        }
    }
}

/// The subtype of a certificate-family object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CertificateType {
    /// A single certificate.
    Certificate,
    /// A certificate chain, leaf first.
    Chain,
    /// A certification request.
    Request,
    /// A certificate revocation list.
    Crl,
    /// An attribute certificate.
    AttributeCert,
    /// A real-time certificate status request.
    RtcsRequest,
    /// A real-time certificate status response.
    RtcsResponse,
    /// An OCSP request.
    OcspRequest,
    /// An OCSP response.
    OcspResponse,
    /// A bundle of CMS attributes.
    CmsAttributes,
    /// PKI user information for certificate-management protocols.
    PkiUser,
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CertificateType::Certificate => f.write_str("certificate"),
            CertificateType::Chain => f.write_str("certificate chain"),
            CertificateType::Request => f.write_str("certification request"),
            CertificateType::Crl => f.write_str("CRL"),
            CertificateType::AttributeCert => f.write_str("attribute certificate"),
            CertificateType::RtcsRequest => f.write_str("RTCS request"),
            CertificateType::RtcsResponse => f.write_str("RTCS response"),
            CertificateType::OcspRequest => f.write_str("OCSP request"),
            CertificateType::OcspResponse => f.write_str("OCSP response"),
            CertificateType::CmsAttributes => f.write_str("CMS attributes"),
            CertificateType::PkiUser => f.write_str("PKI user"),
        }
    }
}

/// The lifecycle state of a kernel object.
///
/// Transitions are monotonic except for `Ready` <-> `Busy`: an object
/// never returns to an earlier initialisation state, and `Destroyed`
/// is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectState {
    /// Created, handle not yet observable.
    Uninitialised,
    /// Observable, but a terminal initialisation write is still
    /// outstanding.
    PartiallyInitialised,
    /// Fully usable.
    Ready,
    /// A long-running operation holds the object.
    Busy,
    /// A data-dependent failure has latched; only reads and destroy
    /// are accepted.
    Signalled,
    /// Destroyed; the handle is dead.
    Destroyed,
}

/// The outer format of an envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeFormat {
    /// No outer framing; content passes through verbatim apart from
    /// optional compression.
    Raw,
    /// Cryptographic message syntax framing.
    Cms,
    /// OpenPGP framing.  Enumerated for completeness; constructing one
    /// currently returns [`Error::NotAvailable`].
    Pgp,
}

/// The direction of an envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The envelope assembles a blob from plaintext.
    Building,
    /// The envelope parses a blob back into plaintext.
    Parsing,
}

/// Certificate chain validation strictness.
///
/// Each level includes every check of the levels below it; see
/// [`cert::validate`](crate::cert::validate) for the exact ladder.
/// The level is a reducing-only configuration option: once lowered it
/// cannot be raised again for the lifetime of the owning user.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComplianceLevel {
    /// Tolerates expired certificates.  Intended for forensic import
    /// only; refused for signature verification unless explicitly
    /// selected.
    Oblivious,
    /// Tolerates unknown critical extensions.
    Reduced,
    /// Enforces validity windows, key usage, and basic constraints.
    Standard,
    /// Adds partial name- and policy-constraint evaluation.
    PkixPartial,
    /// Full PKIX name-constraint and policy-tree processing.
    PkixFull,
}

impl ComplianceLevel {
    /// Converts a configuration-option integer to a level.
    pub fn from_option(v: i64) -> Result<Self> {
        match v {
            0 => Ok(ComplianceLevel::Oblivious),
            1 => Ok(ComplianceLevel::Reduced),
            2 => Ok(ComplianceLevel::Standard),
            3 => Ok(ComplianceLevel::PkixPartial),
            4 => Ok(ComplianceLevel::PkixFull),
            _ => Err(Error::ArgumentRange(
                format!("compliance level {}", v)).into()),
        }
    }

    /// Converts the level to its configuration-option integer.
    pub fn to_option(self) -> i64 {
        match self {
            ComplianceLevel::Oblivious => 0,
            ComplianceLevel::Reduced => 1,
            ComplianceLevel::Standard => 2,
            ComplianceLevel::PkixPartial => 3,
            ComplianceLevel::PkixFull => 4,
        }
    }
}

impl fmt::Display for ComplianceLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComplianceLevel::Oblivious => f.write_str("oblivious"),
            ComplianceLevel::Reduced => f.write_str("reduced"),
            ComplianceLevel::Standard => f.write_str("standard"),
            ComplianceLevel::PkixPartial => f.write_str("pkix-partial"),
            ComplianceLevel::PkixFull => f.write_str("pkix-full"),
        }
    }
}

/// Describes the purposes a certified key may be used for.
///
/// The bit numbering follows the certificate key-usage extension: bit
/// 0 is digital-signature, bit 8 is decipher-only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct KeyUsage(u16);

impl KeyUsage {
    /// Digital signature bit.
    pub const DIGITAL_SIGNATURE: u16 = 1 << 0;
    /// Non-repudiation (content commitment) bit.
    pub const NON_REPUDIATION: u16 = 1 << 1;
    /// Key encipherment bit.
    pub const KEY_ENCIPHERMENT: u16 = 1 << 2;
    /// Data encipherment bit.
    pub const DATA_ENCIPHERMENT: u16 = 1 << 3;
    /// Key agreement bit.
    pub const KEY_AGREEMENT: u16 = 1 << 4;
    /// Certificate signing bit.
    pub const KEY_CERT_SIGN: u16 = 1 << 5;
    /// CRL signing bit.
    pub const CRL_SIGN: u16 = 1 << 6;
    /// Encipher-only bit.
    pub const ENCIPHER_ONLY: u16 = 1 << 7;
    /// Decipher-only bit.
    pub const DECIPHER_ONLY: u16 = 1 << 8;

    const ALL: u16 = (1 << 9) - 1;

    /// Returns an empty usage set.
    pub fn empty() -> Self {
        KeyUsage(0)
    }

    /// Constructs a usage set from raw bits.
    pub fn from_bits(bits: u16) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::ArgumentValue(
                format!("unknown key usage bits {:#x}", bits)).into());
        }
        Ok(KeyUsage(bits))
    }

    /// Returns the raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Returns whether no usage is asserted.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Adds the given bits.
    pub fn set(mut self, bits: u16) -> Self {
        self.0 |= bits & Self::ALL;
        self
    }

    /// Returns whether all of the given bits are asserted.
    pub fn permits(&self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    /// Returns whether the key may produce data signatures.
    pub fn for_signing(&self) -> bool {
        self.permits(Self::DIGITAL_SIGNATURE)
    }

    /// Returns whether the key may encipher keys.
    pub fn for_key_encipherment(&self) -> bool {
        self.permits(Self::KEY_ENCIPHERMENT)
    }

    /// Returns whether the key may perform key agreement.
    pub fn for_key_agreement(&self) -> bool {
        self.permits(Self::KEY_AGREEMENT)
    }

    /// Returns whether the key may sign certificates.
    pub fn for_certification(&self) -> bool {
        self.permits(Self::KEY_CERT_SIGN)
    }

    /// Returns whether the key may sign CRLs.
    pub fn for_crl_signing(&self) -> bool {
        self.permits(Self::CRL_SIGN)
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(u16, &str); 9] = [
            (KeyUsage::DIGITAL_SIGNATURE, "digitalSignature"),
            (KeyUsage::NON_REPUDIATION, "nonRepudiation"),
            (KeyUsage::KEY_ENCIPHERMENT, "keyEncipherment"),
            (KeyUsage::DATA_ENCIPHERMENT, "dataEncipherment"),
            (KeyUsage::KEY_AGREEMENT, "keyAgreement"),
            (KeyUsage::KEY_CERT_SIGN, "keyCertSign"),
            (KeyUsage::CRL_SIGN, "cRLSign"),
            (KeyUsage::ENCIPHER_ONLY, "encipherOnly"),
            (KeyUsage::DECIPHER_ONLY, "decipherOnly"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.permits(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Arbitrary for KeyUsage {
    fn arbitrary(g: &mut Gen) -> Self {
        KeyUsage(u16::arbitrary(g) & KeyUsage::ALL)
    }
}

/// Hash algorithm identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

impl HashAlgorithm {
    /// Returns the digest size in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("SHA-256"),
            HashAlgorithm::Sha512 => f.write_str("SHA-512"),
        }
    }
}

/// Symmetric cipher identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymmetricAlgorithm {
    /// AES with a 256-bit key in CFB mode.
    Aes256Cfb,
}

impl Default for SymmetricAlgorithm {
    fn default() -> Self {
        SymmetricAlgorithm::Aes256Cfb
    }
}

impl SymmetricAlgorithm {
    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            SymmetricAlgorithm::Aes256Cfb => 32,
        }
    }

    /// Returns the block (and IV) size in bytes.
    pub fn block_size(&self) -> usize {
        match self {
            SymmetricAlgorithm::Aes256Cfb => 16,
        }
    }
}

impl fmt::Display for SymmetricAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SymmetricAlgorithm::Aes256Cfb => f.write_str("AES-256-CFB"),
        }
    }
}

/// Public-key algorithm identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PublicKeyAlgorithm {
    /// RSA, signing with PKCS#1 v1.5 over SHA-256, encryption with
    /// PKCS#1 v1.5.
    Rsa,
    /// Ed25519 signatures.
    Ed25519,
}

impl fmt::Display for PublicKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublicKeyAlgorithm::Rsa => f.write_str("RSA"),
            PublicKeyAlgorithm::Ed25519 => f.write_str("Ed25519"),
        }
    }
}

/// The inner content type carried by an envelope's framing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// Plain data.
    Data,
    /// Signed data.
    SignedData,
    /// Encrypted data.
    EnvelopedData,
    /// Compressed data.
    CompressedData,
    /// MAC-authenticated data.
    AuthenticatedData,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Data
    }
}

/// Capability queries answerable through the kernel's `check`
/// message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckType {
    /// Can the object produce signatures?
    Sign,
    /// Can the object verify signatures?
    SigCheck,
    /// Can the object encrypt?
    Encrypt,
    /// Can the object decrypt?
    Decrypt,
    /// Can the object compute MACs?
    Mac,
    /// Can the object sign certificates?
    CertSign,
    /// Can the object sign CRLs?
    CrlSign,
}

/// Reasons a certificate may be revoked, with the standard wire
/// codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RevocationReason {
    /// No reason given.
    Unspecified,
    /// The subject's key was compromised.
    KeyCompromise,
    /// The issuing CA's key was compromised.
    CaCompromise,
    /// The subject's affiliation changed.
    AffiliationChanged,
    /// The certificate was superseded.
    Superseded,
    /// The subject ceased operation.
    CessationOfOperation,
    /// The certificate is on hold.
    CertificateHold,
}

impl RevocationReason {
    /// Returns the standard reason code.
    pub fn code(&self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
        }
    }

    /// Converts a standard reason code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(RevocationReason::Unspecified),
            1 => Ok(RevocationReason::KeyCompromise),
            2 => Ok(RevocationReason::CaCompromise),
            3 => Ok(RevocationReason::AffiliationChanged),
            4 => Ok(RevocationReason::Superseded),
            5 => Ok(RevocationReason::CessationOfOperation),
            6 => Ok(RevocationReason::CertificateHold),
            n => Err(Error::BadData(
                format!("unknown revocation reason {}", n)).into()),
        }
    }
}

/// The failure class recorded on an object record alongside the
/// failing attribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorType {
    /// No failure recorded.
    None,
    /// A required attribute is absent.
    AttributeAbsent,
    /// The attribute is already present and may not be set again.
    AttributePresent,
    /// The value is outside the attribute's permitted range.
    ValueRange,
    /// A cross-attribute constraint failed.
    Constraint,
    /// The object is in the wrong state for the operation.
    State,
    /// The access-control tables forbid the operation.
    Permission,
    /// The object is not initialised.
    NotInitialised,
}

/// The type of a user object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UserType {
    /// An ordinary user.
    Normal,
    /// A security officer, authorised to create and revoke users.
    SecurityOfficer,
    /// A certificate authority user.  The variant is carried but its
    /// keying and issuance operations are not yet wired up and return
    /// [`Error::NotAvailable`].
    CertificateAuthority,
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserType::Normal => f.write_str("user"),
            UserType::SecurityOfficer => f.write_str("security officer"),
            UserType::CertificateAuthority => f.write_str("certificate authority"),
        }
    }
}

/// The lifecycle state of a user object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UserState {
    /// Created but not initialised.
    PreInit,
    /// Initialised by a security officer; a password change is needed
    /// before use.
    SoInited,
    /// Fully initialised and usable.
    UserInited,
    /// Disabled.
    Locked,
}

/// The kind of identifier used to look a key up in a keyset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyId {
    /// A label or subject name.
    Name(String),
    /// Issuer distinguished name and serial number.
    IssuerSerial(Vec<u8>, Vec<u8>),
    /// A subject-key-identifier.
    SubjectKeyId(Vec<u8>),
    /// A public-key fingerprint.
    Fingerprint(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compliance_level_roundtrip() {
        for v in 0..=4 {
            assert_eq!(ComplianceLevel::from_option(v).unwrap().to_option(), v);
        }
        assert!(ComplianceLevel::from_option(5).is_err());
        assert!(ComplianceLevel::Oblivious < ComplianceLevel::Standard);
        assert!(ComplianceLevel::PkixPartial < ComplianceLevel::PkixFull);
    }

    #[test]
    fn key_usage_bits() {
        let u = KeyUsage::empty()
            .set(KeyUsage::DIGITAL_SIGNATURE)
            .set(KeyUsage::KEY_ENCIPHERMENT);
        assert!(u.for_signing());
        assert!(u.for_key_encipherment());
        assert!(!u.for_certification());
        assert_eq!(u.to_string(), "digitalSignature | keyEncipherment");
        assert!(KeyUsage::from_bits(0xffff).is_err());
        assert_eq!(KeyUsage::from_bits(u.bits()).unwrap(), u);
    }

    quickcheck! {
        fn key_usage_roundtrip(u: KeyUsage) -> bool {
            KeyUsage::from_bits(u.bits()).unwrap() == u
        }
    }

    #[test]
    fn revocation_reason_codes() {
        for code in 0..=6 {
            assert_eq!(RevocationReason::from_code(code).unwrap().code(), code);
        }
        assert!(RevocationReason::from_code(7).is_err());
    }

    #[test]
    fn object_state_order() {
        assert!(ObjectState::Uninitialised < ObjectState::PartiallyInitialised);
        assert!(ObjectState::PartiallyInitialised < ObjectState::Ready);
        assert!(ObjectState::Signalled < ObjectState::Destroyed);
    }
}
