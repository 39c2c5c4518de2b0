//! The attribute identifier space.
//!
//! Every named, typed property of a kernel object is an attribute.
//! Attribute identifiers are 32-bit integers partitioned by range into
//! groups: general, option, context, certificate, keyset, envelope,
//! session, user, device, and internal.  The internal range is
//! rejected for external callers at the dispatcher.
//!
//! The access rules for each attribute live in the kernel's tables
//! (see [`kernel::acl`](crate::kernel::acl)); this module only defines
//! the identifiers and the typed value union that crosses the message
//! bus.

use std::fmt;
use std::time::SystemTime;

use crate::kernel::Handle;
use crate::{Error, Result};

/// Cursor command: move to the first element of the current group.
pub const CURSOR_FIRST: i64 = -1;
/// Cursor command: move to the next element.
pub const CURSOR_NEXT: i64 = -2;
/// Cursor command: move to the previous element.
pub const CURSOR_PREVIOUS: i64 = -3;
/// Cursor command: move to the last element.
pub const CURSOR_LAST: i64 = -4;

/// The group an attribute identifier belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttributeGroup {
    /// Error reporting and other properties common to all objects.
    General,
    /// Per-user configuration options.
    Option,
    /// Key and digest contexts.
    Context,
    /// Certificate-family objects.
    Certificate,
    /// Keysets.
    Keyset,
    /// Envelopes.
    Envelope,
    /// Sessions.
    Session,
    /// Users.
    User,
    /// Devices.
    Device,
    /// Kernel-internal attributes, rejected for external callers.
    Internal,
}

/// A typed attribute identifier.
///
/// The discriminant is the wire identifier; [`Attribute::id`] and
/// [`Attribute::from_id`] convert between the two.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    // General, 0x0001..
    /// The attribute at which the last failure occurred.
    ErrorLocus = 0x0001,
    /// The class of the last failure.
    ErrorType = 0x0002,

    // Options, 0x0100..
    /// Certificate chain validation strictness.  Reducing-only.
    OptionComplianceLevel = 0x0101,
    /// Whether the power-on self-test passed.  Two-phase, reducing-only.
    OptionSelfTestOk = 0x0102,
    /// Whether unsaved configuration changes exist.  Writing true
    /// triggers a commit of the owning user's configuration.
    OptionConfigChanged = 0x0103,
    /// The default hash algorithm.
    OptionDefaultHash = 0x0104,
    /// The default symmetric algorithm.
    OptionDefaultCipher = 0x0105,
    /// The directory user store files are kept in.
    OptionStorePath = 0x0106,
    /// The default envelope buffer window in bytes.
    OptionEnvelopeBuffer = 0x0107,

    // Contexts, 0x1000..
    /// The context's algorithm identifier.
    ContextAlgorithm = 0x1001,
    /// The context's key size in bits.
    ContextKeySize = 0x1002,
    /// A human-readable label for the context's key.
    ContextLabel = 0x1003,
    /// The completed digest value of a hash context.
    ContextHashValue = 0x1004,

    // Certificates, 0x2000..
    /// Whether the certificate is self-signed.
    CertSelfSigned = 0x2001,
    /// Whether the certificate has been signed and is immutable.
    CertImmutable = 0x2002,
    /// Whether the certificate is implicitly trusted by the owning
    /// user.
    CertTrustedImplicit = 0x2003,
    /// The certificate serial number.
    CertSerialNumber = 0x2004,
    /// The start of the validity window.
    CertValidFrom = 0x2005,
    /// The end of the validity window.
    CertValidTo = 0x2006,
    /// Subject country name.
    CertCountry = 0x2007,
    /// Subject organization name.
    CertOrganization = 0x2008,
    /// Subject organizational unit.
    CertOrgUnit = 0x2009,
    /// Subject common name.
    CertCommonName = 0x200a,
    /// The key-usage extension, as [`KeyUsage`](crate::types::KeyUsage)
    /// bits.
    CertKeyUsage = 0x200b,
    /// The CA flag of the basic-constraints extension.
    CertCa = 0x200c,
    /// The path-length constraint of the basic-constraints extension.
    CertPathLenConstraint = 0x200d,
    /// A DNS subject-alternative-name component.
    CertAltNameDns = 0x200e,
    /// A certificate-policy identifier.
    CertPolicy = 0x200f,
    /// A permitted-subtree DNS name constraint.
    CertNameConstraintPermitted = 0x2010,
    /// An excluded-subtree DNS name constraint.
    CertNameConstraintExcluded = 0x2011,
    /// The bound public-key context.
    CertPublicKey = 0x2012,
    /// The certificate fingerprint (SHA-256 over the encoding).
    CertFingerprint = 0x2013,
    /// The subject-key-identifier.
    CertSubjectKeyId = 0x2014,
    /// The issuer name in display form.
    CertIssuerName = 0x2015,
    /// The subject name in display form.
    CertSubjectName = 0x2016,
    /// The revocation reason of the CRL entry under the cursor.
    CertRevocationReason = 0x2017,
    /// The revocation date of the CRL entry under the cursor.
    CertRevocationDate = 0x2018,
    /// The invalidity date of the CRL entry under the cursor.
    CertInvalidityDate = 0x2019,
    /// Writing a certificate handle to a CRL adds a revocation entry
    /// for it.
    CertRevokedCert = 0x201a,
    /// Cursor over the entries of a chain or CRL.
    CertCursor = 0x201b,
    /// The object's encoded form.
    CertEncoded = 0x201c,

    // Keysets, 0x3000..
    /// The per-user configuration blob.
    KeysetConfigData = 0x3001,
    /// The user index blob.
    KeysetUserIndex = 0x3002,
    /// The trusted-certificate list blob.
    KeysetTrustedCerts = 0x3003,

    // Envelopes, 0x4000..
    /// A password for encryption or decryption.
    EnvPassword = 0x4001,
    /// A signing-key context.
    EnvSigningKey = 0x4002,
    /// A recipient's public-key context or certificate.
    EnvRecipientKey = 0x4003,
    /// A raw session key.
    EnvSessionKey = 0x4004,
    /// A raw MAC key.
    EnvMacKey = 0x4005,
    /// The hash algorithm for signing or detached-signature
    /// verification.
    EnvHashAlgorithm = 0x4006,
    /// Whether to compress the content.
    EnvCompression = 0x4007,
    /// The inner content type.
    EnvContentType = 0x4008,
    /// The exact content size, if known ahead of time.  Enables
    /// definite-length framing.
    EnvDataSize = 0x4009,
    /// Whether the signature is detached from the content.
    EnvDetachedSignature = 0x400a,
    /// A pre-computed content hash for detached-signature
    /// verification.
    EnvDetachedHash = 0x400b,
    /// A keyset to look decryption keys up in.
    EnvKeysetDecrypt = 0x400c,
    /// The verification result for the signer under the cursor.
    EnvSignatureResult = 0x400d,
    /// The certificate of the signer under the cursor.
    EnvSignatureCert = 0x400e,
    /// The first outstanding required resource, as an attribute
    /// identifier.
    EnvResourceRequired = 0x400f,
    /// Cursor over the signers of a parsed envelope.
    EnvCurrentSigner = 0x4010,
    /// The envelope's internal buffer window in bytes.
    EnvBufferSize = 0x4011,
    /// A private-key context for decrypting a parsed envelope.
    EnvPrivateKey = 0x4012,

    // Users, 0x6000..
    /// The user's name.
    UserName = 0x6001,
    /// The user's role.
    UserRole = 0x6002,
    /// The user's password.  Writing it transitions an SO-initialised
    /// user to the initialised state.
    UserPassword = 0x6003,
    /// The keyset backing the user's persistent state.
    UserKeyset = 0x6004,
    /// The user's lifecycle state.
    UserState = 0x6005,

    // Internal, 0x8000..
    /// Terminal initialisation write; moves the object to the ready
    /// state.  Internal-only.
    Initialised = 0x8001,
}

impl Attribute {
    /// Returns the wire identifier.
    pub fn id(&self) -> u32 {
        *self as u32
    }

    /// Converts a wire identifier back to an attribute.
    pub fn from_id(id: u32) -> Result<Self> {
        use Attribute::*;
        let attr = match id {
            0x0001 => ErrorLocus,
            0x0002 => ErrorType,
            0x0101 => OptionComplianceLevel,
            0x0102 => OptionSelfTestOk,
            0x0103 => OptionConfigChanged,
            0x0104 => OptionDefaultHash,
            0x0105 => OptionDefaultCipher,
            0x0106 => OptionStorePath,
            0x0107 => OptionEnvelopeBuffer,
            0x1001 => ContextAlgorithm,
            0x1002 => ContextKeySize,
            0x1003 => ContextLabel,
            0x1004 => ContextHashValue,
            0x2001 => CertSelfSigned,
            0x2002 => CertImmutable,
            0x2003 => CertTrustedImplicit,
            0x2004 => CertSerialNumber,
            0x2005 => CertValidFrom,
            0x2006 => CertValidTo,
            0x2007 => CertCountry,
            0x2008 => CertOrganization,
            0x2009 => CertOrgUnit,
            0x200a => CertCommonName,
            0x200b => CertKeyUsage,
            0x200c => CertCa,
            0x200d => CertPathLenConstraint,
            0x200e => CertAltNameDns,
            0x200f => CertPolicy,
            0x2010 => CertNameConstraintPermitted,
            0x2011 => CertNameConstraintExcluded,
            0x2012 => CertPublicKey,
            0x2013 => CertFingerprint,
            0x2014 => CertSubjectKeyId,
            0x2015 => CertIssuerName,
            0x2016 => CertSubjectName,
            0x2017 => CertRevocationReason,
            0x2018 => CertRevocationDate,
            0x2019 => CertInvalidityDate,
            0x201a => CertRevokedCert,
            0x201b => CertCursor,
            0x201c => CertEncoded,
            0x3001 => KeysetConfigData,
            0x3002 => KeysetUserIndex,
            0x3003 => KeysetTrustedCerts,
            0x4001 => EnvPassword,
            0x4002 => EnvSigningKey,
            0x4003 => EnvRecipientKey,
            0x4004 => EnvSessionKey,
            0x4005 => EnvMacKey,
            0x4006 => EnvHashAlgorithm,
            0x4007 => EnvCompression,
            0x4008 => EnvContentType,
            0x4009 => EnvDataSize,
            0x400a => EnvDetachedSignature,
            0x400b => EnvDetachedHash,
            0x400c => EnvKeysetDecrypt,
            0x400d => EnvSignatureResult,
            0x400e => EnvSignatureCert,
            0x400f => EnvResourceRequired,
            0x4010 => EnvCurrentSigner,
            0x4011 => EnvBufferSize,
            0x4012 => EnvPrivateKey,
            0x6001 => UserName,
            0x6002 => UserRole,
            0x6003 => UserPassword,
            0x6004 => UserKeyset,
            0x6005 => UserState,
            0x8001 => Initialised,
            _ => return Err(Error::NotFound(
                format!("attribute {:#06x}", id)).into()),
        };
        Ok(attr)
    }

    /// Returns the group the attribute's identifier falls in.
    pub fn group(&self) -> AttributeGroup {
        match self.id() {
            0x0001..=0x00ff => AttributeGroup::General,
            0x0100..=0x0fff => AttributeGroup::Option,
            0x1000..=0x1fff => AttributeGroup::Context,
            0x2000..=0x2fff => AttributeGroup::Certificate,
            0x3000..=0x3fff => AttributeGroup::Keyset,
            0x4000..=0x4fff => AttributeGroup::Envelope,
            0x5000..=0x5fff => AttributeGroup::Session,
            0x6000..=0x6fff => AttributeGroup::User,
            0x7000..=0x7fff => AttributeGroup::Device,
            _ => AttributeGroup::Internal,
        }
    }

    /// Returns whether the attribute is in the kernel-internal range.
    pub fn is_internal(&self) -> bool {
        self.group() == AttributeGroup::Internal
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The kind of value an attribute carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    /// A signed integer.
    Numeric,
    /// A boolean.
    Boolean,
    /// A text string.
    String,
    /// A point in time.
    Time,
    /// An opaque byte blob.
    Bytes,
    /// A handle to another kernel object.
    Object,
}

/// A typed attribute value.
///
/// This is the only shape data takes when crossing the message bus:
/// strings and blobs are copied, never borrowed, and objects are
/// referred to by handle.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// A signed integer.
    Int(i64),
    /// A boolean.
    Bool(bool),
    /// A text string.
    Str(String),
    /// A point in time.
    Time(SystemTime),
    /// An opaque byte blob.
    Bytes(Vec<u8>),
    /// A handle to another kernel object.
    Object(Handle),
}

impl AttributeValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Int(_) => AttributeKind::Numeric,
            AttributeValue::Bool(_) => AttributeKind::Boolean,
            AttributeValue::Str(_) => AttributeKind::String,
            AttributeValue::Time(_) => AttributeKind::Time,
            AttributeValue::Bytes(_) => AttributeKind::Bytes,
            AttributeValue::Object(_) => AttributeKind::Object,
        }
    }

    /// Returns the integer payload.
    pub fn into_int(self) -> Result<i64> {
        match self {
            AttributeValue::Int(v) => Ok(v),
            v => Err(Error::ArgumentValue(
                format!("expected integer, got {:?}", v.kind())).into()),
        }
    }

    /// Returns the boolean payload.
    pub fn into_bool(self) -> Result<bool> {
        match self {
            AttributeValue::Bool(v) => Ok(v),
            v => Err(Error::ArgumentValue(
                format!("expected boolean, got {:?}", v.kind())).into()),
        }
    }

    /// Returns the string payload.
    pub fn into_string(self) -> Result<String> {
        match self {
            AttributeValue::Str(v) => Ok(v),
            v => Err(Error::ArgumentValue(
                format!("expected string, got {:?}", v.kind())).into()),
        }
    }

    /// Returns the time payload.
    pub fn into_time(self) -> Result<SystemTime> {
        match self {
            AttributeValue::Time(v) => Ok(v),
            v => Err(Error::ArgumentValue(
                format!("expected time, got {:?}", v.kind())).into()),
        }
    }

    /// Returns the byte payload.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            AttributeValue::Bytes(v) => Ok(v),
            v => Err(Error::ArgumentValue(
                format!("expected bytes, got {:?}", v.kind())).into()),
        }
    }

    /// Returns the handle payload.
    pub fn into_object(self) -> Result<Handle> {
        match self {
            AttributeValue::Object(v) => Ok(v),
            v => Err(Error::ArgumentValue(
                format!("expected object, got {:?}", v.kind())).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrip() {
        for attr in [
            Attribute::ErrorLocus,
            Attribute::OptionComplianceLevel,
            Attribute::ContextLabel,
            Attribute::CertKeyUsage,
            Attribute::KeysetConfigData,
            Attribute::EnvPassword,
            Attribute::UserName,
            Attribute::Initialised,
        ] {
            assert_eq!(Attribute::from_id(attr.id()).unwrap(), attr);
        }
        assert!(Attribute::from_id(0xdead_beef).is_err());
    }

    #[test]
    fn grouping() {
        assert_eq!(Attribute::ErrorLocus.group(), AttributeGroup::General);
        assert_eq!(Attribute::OptionSelfTestOk.group(), AttributeGroup::Option);
        assert_eq!(Attribute::CertCa.group(), AttributeGroup::Certificate);
        assert_eq!(Attribute::EnvPassword.group(), AttributeGroup::Envelope);
        assert_eq!(Attribute::UserName.group(), AttributeGroup::User);
        assert!(Attribute::Initialised.is_internal());
        assert!(!Attribute::EnvPassword.is_internal());
    }

    #[test]
    fn value_accessors() {
        assert_eq!(AttributeValue::Int(7).into_int().unwrap(), 7);
        assert!(AttributeValue::Int(7).into_bool().is_err());
        assert_eq!(AttributeValue::Str("x".into()).into_string().unwrap(), "x");
        assert_eq!(AttributeValue::Bytes(vec![1]).into_bytes().unwrap(), vec![1]);
    }
}
