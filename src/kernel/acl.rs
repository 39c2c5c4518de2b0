//! The attribute access-control tables.
//!
//! For every attribute the kernel knows, one row describes its value
//! constraints and, per object type, subtype, and state, the set of
//! permitted operations.  An attribute that has no row, or whose row
//! has no entry for the target, is rejected by default.
//!
//! The check functions here are pure: they return a decision and
//! never touch the object.  The dispatcher records the failure locus
//! and class onto the object's record when a check fails.

use std::collections::HashMap;

use crate::attr::{Attribute, AttributeKind, AttributeValue};
use crate::types::{CertificateType, ErrorType, ObjectState, ObjectType};
use crate::Error;
use super::message::Message;
use super::object::{ActionClass, ObjectMeta, ObjectSubtype};

/// Read, permitted for external callers.
pub const READ_EXT: u8 = 0x01;
/// Read, permitted for internal callers.
pub const READ_INT: u8 = 0x02;
/// Write, permitted for external callers.
pub const WRITE_EXT: u8 = 0x04;
/// Write, permitted for internal callers.
pub const WRITE_INT: u8 = 0x08;
/// Delete, permitted for external callers.
pub const DELETE: u8 = 0x10;
/// The write is a trigger rather than a stored value.
pub const TRIGGER: u8 = 0x20;

const READ: u8 = READ_EXT | READ_INT;
const WRITE: u8 = WRITE_EXT | WRITE_INT;
const RW: u8 = READ | WRITE;

/// State mask bit: uninitialised.
pub const ST_UNINIT: u8 = 0x01;
/// State mask bit: partially initialised.
pub const ST_PARTIAL: u8 = 0x02;
/// State mask bit: ready.
pub const ST_READY: u8 = 0x04;
/// State mask bit: busy.
pub const ST_BUSY: u8 = 0x08;
/// State mask bit: signalled.
pub const ST_SIGNALLED: u8 = 0x10;

const ST_ANY: u8 = 0xff;
const ST_USABLE: u8 = ST_PARTIAL | ST_READY;

fn state_bit(state: ObjectState) -> u8 {
    match state {
        ObjectState::Uninitialised => ST_UNINIT,
        ObjectState::PartiallyInitialised => ST_PARTIAL,
        ObjectState::Ready => ST_READY,
        ObjectState::Busy => ST_BUSY,
        ObjectState::Signalled => ST_SIGNALLED,
        ObjectState::Destroyed => 0,
    }
}

/// Subtype mask bit: certificate.
pub const SUB_CERT: u16 = 1 << 0;
/// Subtype mask bit: certificate chain.
pub const SUB_CHAIN: u16 = 1 << 1;
/// Subtype mask bit: certification request.
pub const SUB_REQUEST: u16 = 1 << 2;
/// Subtype mask bit: CRL.
pub const SUB_CRL: u16 = 1 << 3;
/// Subtype mask matching any subtype.
pub const SUB_ANY: u16 = 0xffff;

fn subtype_bit(subtype: ObjectSubtype) -> u16 {
    match subtype {
        ObjectSubtype::None => SUB_ANY,
        ObjectSubtype::Certificate(t) => match t {
            CertificateType::Certificate => SUB_CERT,
            CertificateType::Chain => SUB_CHAIN,
            CertificateType::Request => SUB_REQUEST,
            CertificateType::Crl => SUB_CRL,
            CertificateType::AttributeCert => 1 << 4,
            CertificateType::RtcsRequest => 1 << 5,
            CertificateType::RtcsResponse => 1 << 6,
            CertificateType::OcspRequest => 1 << 7,
            CertificateType::OcspResponse => 1 << 8,
            CertificateType::CmsAttributes => 1 << 9,
            CertificateType::PkiUser => 1 << 10,
        },
    }
}

/// Character sets a string attribute may be restricted to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Charset {
    /// PrintableString characters.
    Printable,
    /// IA5 (ASCII).
    Ia5,
    /// Any UTF-8.
    Utf8,
}

impl Charset {
    fn accepts(&self, s: &str) -> bool {
        match self {
            Charset::Printable => s.bytes().all(|b| {
                b.is_ascii_alphanumeric()
                    || b" '()+,-./:=?".contains(&b)
            }),
            Charset::Ia5 => s.is_ascii(),
            Charset::Utf8 => true,
        }
    }
}

/// The value constraint attached to an attribute.
#[derive(Copy, Clone, Debug)]
pub enum ValueConstraint {
    /// No constraint beyond the kind.
    None,
    /// Inclusive numeric bounds.
    Range(i64, i64),
    /// Inclusive byte-length bounds for strings and blobs, with an
    /// optional character-set restriction for strings.
    Length(usize, usize, Option<Charset>),
    /// The handle must denote an object of one of the given types.
    Handle(&'static [ObjectType]),
}

/// One (type, subtype, state) -> access entry of an attribute's
/// access vector.
#[derive(Copy, Clone, Debug)]
pub struct AclTarget {
    /// The object type the entry applies to.
    pub object_type: ObjectType,
    /// The subtypes the entry applies to.
    pub subtypes: u16,
    /// The states the entry applies in.
    pub states: u8,
    /// The permitted operations.
    pub access: u8,
}

/// Cross-attribute dependencies.
#[derive(Copy, Clone, Debug)]
pub enum Dependency {
    /// The named attribute must already be set.
    Requires(Attribute),
    /// The named attribute must not be set.
    Excludes(Attribute),
}

/// The access-control row for one attribute.
#[derive(Debug)]
pub struct AttributeAcl {
    /// The attribute.
    pub attr: Attribute,
    /// The kind of value the attribute carries.
    pub kind: AttributeKind,
    /// The value constraint for writes.
    pub constraint: ValueConstraint,
    /// The access vector.
    pub targets: &'static [AclTarget],
    /// Cross-attribute dependencies checked on writes.
    pub depends: &'static [Dependency],
}

macro_rules! target {
    ($ty:ident, $sub:expr, $st:expr, $acc:expr) => {
        AclTarget {
            object_type: ObjectType::$ty,
            subtypes: $sub,
            states: $st,
            access: $acc,
        }
    };
}

/// The attribute access-control table.
///
/// Kept ordered by attribute identifier; the index below is what
/// lookups actually use.
pub static ATTRIBUTE_ACLS: &[AttributeAcl] = &[
    AttributeAcl {
        attr: Attribute::ErrorLocus,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Context, SUB_ANY, ST_ANY, READ),
            target!(Certificate, SUB_ANY, ST_ANY, READ),
            target!(Keyset, SUB_ANY, ST_ANY, READ),
            target!(Envelope, SUB_ANY, ST_ANY, READ),
            target!(User, SUB_ANY, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::ErrorType,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Context, SUB_ANY, ST_ANY, READ),
            target!(Certificate, SUB_ANY, ST_ANY, READ),
            target!(Keyset, SUB_ANY, ST_ANY, READ),
            target!(Envelope, SUB_ANY, ST_ANY, READ),
            target!(User, SUB_ANY, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionComplianceLevel,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(0, 4),
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionSelfTestOk,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW | TRIGGER)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionConfigChanged,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW | TRIGGER)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionDefaultHash,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(1, 2),
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionDefaultCipher,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(1, 1),
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionStorePath,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 255, None),
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW | DELETE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::OptionEnvelopeBuffer,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(1024, 1 << 24),
        targets: &[target!(User, SUB_ANY, ST_USABLE, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::ContextAlgorithm,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[target!(Context, SUB_ANY, ST_ANY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::ContextKeySize,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[target!(Context, SUB_ANY, ST_USABLE, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::ContextLabel,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 64, Some(Charset::Printable)),
        targets: &[target!(Context, SUB_ANY, ST_USABLE, RW | DELETE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::ContextHashValue,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::None,
        targets: &[target!(Context, SUB_ANY, ST_READY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertSelfSigned,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertImmutable,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[target!(Certificate, SUB_ANY, ST_ANY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertTrustedImplicit,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, RW),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertSerialNumber,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::Length(1, 20, None),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_CRL, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertValidFrom,
        kind: AttributeKind::Time,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertValidTo,
        kind: AttributeKind::Time,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertCountry,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(2, 2, Some(Charset::Printable)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertOrganization,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 64, Some(Charset::Utf8)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertOrgUnit,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 64, Some(Charset::Utf8)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertCommonName,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 64, Some(Charset::Utf8)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertKeyUsage,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(0, 0x1ff),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertCa,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertPathLenConstraint,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(0, 64),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        // A path-length constraint is only meaningful on a CA
        // certificate.
        depends: &[Dependency::Requires(Attribute::CertCa)],
    },
    AttributeAcl {
        attr: Attribute::CertAltNameDns,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 255, Some(Charset::Ia5)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertPolicy,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 64, Some(Charset::Printable)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertNameConstraintPermitted,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 255, Some(Charset::Ia5)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[Dependency::Requires(Attribute::CertCa),
                   Dependency::Excludes(
                       Attribute::CertNameConstraintExcluded)],
    },
    AttributeAcl {
        attr: Attribute::CertNameConstraintExcluded,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 255, Some(Charset::Ia5)),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[Dependency::Requires(Attribute::CertCa),
                   Dependency::Excludes(
                       Attribute::CertNameConstraintPermitted)],
    },
    AttributeAcl {
        attr: Attribute::CertPublicKey,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(&[ObjectType::Context]),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertFingerprint,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_READY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertSubjectKeyId,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::Length(1, 64, None),
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CERT | SUB_CHAIN, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertIssuerName,
        kind: AttributeKind::String,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_CRL,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertSubjectName,
        kind: AttributeKind::String,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_REQUEST,
                    ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertRevocationReason,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(0, 6),
        targets: &[
            target!(Certificate, SUB_CRL, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CRL | SUB_CERT, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertRevocationDate,
        kind: AttributeKind::Time,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CRL, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CRL | SUB_CERT, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertInvalidityDate,
        kind: AttributeKind::Time,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CRL, ST_PARTIAL, WRITE),
            target!(Certificate, SUB_CRL | SUB_CERT, ST_ANY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertRevokedCert,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(&[ObjectType::Certificate]),
        targets: &[
            target!(Certificate, SUB_CRL, ST_PARTIAL, WRITE),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertCursor,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(-4, -1),
        targets: &[
            target!(Certificate, SUB_CHAIN | SUB_CRL, ST_ANY, RW),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::CertEncoded,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Certificate, SUB_CERT | SUB_CHAIN | SUB_CRL,
                    ST_READY, READ),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::KeysetConfigData,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Keyset, SUB_ANY, ST_READY,
                    READ_INT | WRITE_INT),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::KeysetUserIndex,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Keyset, SUB_ANY, ST_READY,
                    READ_INT | WRITE_INT),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::KeysetTrustedCerts,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Keyset, SUB_ANY, ST_READY,
                    READ_INT | WRITE_INT),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvPassword,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 255, None),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvSigningKey,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(&[ObjectType::Context]),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvRecipientKey,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(
            &[ObjectType::Context, ObjectType::Certificate]),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvSessionKey,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::Length(16, 64, None),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[Dependency::Excludes(Attribute::EnvPassword)],
    },
    AttributeAcl {
        attr: Attribute::EnvMacKey,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::Length(16, 64, None),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvHashAlgorithm,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(1, 2),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvCompression,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[target!(Envelope, SUB_ANY, ST_READY, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvContentType,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(1, 5),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvDataSize,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(0, i64::MAX),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvDetachedSignature,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[target!(Envelope, SUB_ANY, ST_READY, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvDetachedHash,
        kind: AttributeKind::Bytes,
        constraint: ValueConstraint::Length(32, 64, None),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[Dependency::Requires(Attribute::EnvDetachedSignature)],
    },
    AttributeAcl {
        attr: Attribute::EnvPrivateKey,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(&[ObjectType::Context]),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvKeysetDecrypt,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(&[ObjectType::Keyset]),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvSignatureResult,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[target!(Envelope, SUB_ANY, ST_READY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvSignatureCert,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::None,
        targets: &[target!(Envelope, SUB_ANY, ST_READY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvResourceRequired,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[target!(Envelope, SUB_ANY, ST_READY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvCurrentSigner,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(-4, 64),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::EnvBufferSize,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::Range(1024, 1 << 24),
        targets: &[target!(Envelope, SUB_ANY, ST_READY, RW)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::UserName,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 64, None),
        targets: &[
            target!(User, SUB_ANY, ST_ANY, READ | WRITE_INT),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::UserRole,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[target!(User, SUB_ANY, ST_ANY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::UserPassword,
        kind: AttributeKind::String,
        constraint: ValueConstraint::Length(1, 255, None),
        targets: &[target!(User, SUB_ANY, ST_USABLE, WRITE)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::UserKeyset,
        kind: AttributeKind::Object,
        constraint: ValueConstraint::Handle(&[ObjectType::Keyset]),
        targets: &[
            target!(User, SUB_ANY, ST_ANY, READ | WRITE_INT),
        ],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::UserState,
        kind: AttributeKind::Numeric,
        constraint: ValueConstraint::None,
        targets: &[target!(User, SUB_ANY, ST_ANY, READ)],
        depends: &[],
    },
    AttributeAcl {
        attr: Attribute::Initialised,
        kind: AttributeKind::Boolean,
        constraint: ValueConstraint::None,
        targets: &[
            target!(Context, SUB_ANY, ST_PARTIAL, WRITE_INT | TRIGGER),
            target!(Certificate, SUB_ANY, ST_PARTIAL, WRITE_INT | TRIGGER),
            target!(Keyset, SUB_ANY, ST_PARTIAL, WRITE_INT | TRIGGER),
            target!(Envelope, SUB_ANY, ST_PARTIAL, WRITE_INT | TRIGGER),
            target!(User, SUB_ANY, ST_PARTIAL, WRITE_INT | TRIGGER),
        ],
        depends: &[],
    },
];

lazy_static! {
    static ref ACL_INDEX: HashMap<Attribute, &'static AttributeAcl> = {
        let mut map = HashMap::new();
        for acl in ATTRIBUTE_ACLS {
            let prev = map.insert(acl.attr, acl);
            assert!(prev.is_none(), "duplicate ACL row for {}", acl.attr);
        }
        map
    };
}

/// Looks an attribute's ACL row up.
pub fn acl_for(attr: Attribute) -> Option<&'static AttributeAcl> {
    ACL_INDEX.get(&attr).copied()
}

/// The operation an attribute message performs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AclOp {
    /// Reading the attribute.
    Read,
    /// Writing the attribute.
    Write,
    /// Deleting the attribute.
    Delete,
}

/// A structured ACL decision failure.
#[derive(Debug)]
pub struct AclFailure {
    /// The attribute at fault.
    pub locus: Attribute,
    /// The failure class, recorded onto the object.
    pub kind: ErrorType,
    /// The error to surface to the caller.
    pub error: Error,
}

impl AclFailure {
    fn new(locus: Attribute, kind: ErrorType, error: Error) -> Self {
        AclFailure { locus, kind, error }
    }
}

type AclResult = std::result::Result<&'static AttributeAcl, AclFailure>;

/// Decides whether the given attribute operation is permitted.
///
/// Pure: returns a decision and touches nothing.  `present` reports
/// whether a given attribute is currently set on the target object
/// and is used for cross-attribute dependencies.
pub(crate) fn check_attribute(meta: &ObjectMeta, attr: Attribute, op: AclOp,
                              value: Option<&AttributeValue>, internal: bool,
                              present: &dyn Fn(Attribute) -> bool)
                              -> AclResult {
    use ErrorType::*;

    if attr.is_internal() && !internal {
        return Err(AclFailure::new(attr, Permission,
            Error::Permission(format!("{} is internal", attr))));
    }

    let acl = acl_for(attr).ok_or_else(|| AclFailure::new(
        attr, Permission,
        Error::ArgumentValue(format!("{} is not a known attribute", attr))))?;

    let target = acl.targets.iter().find(|t| {
        t.object_type == meta.object_type
            && t.subtypes & subtype_bit(meta.subtype) != 0
            && t.states & state_bit(meta.state) != 0
    });
    let target = match target {
        Some(t) => t,
        Option::None => {
            // Distinguish "wrong state" from "wrong object".
            let for_object = acl.targets.iter().any(|t| {
                t.object_type == meta.object_type
                    && t.subtypes & subtype_bit(meta.subtype) != 0
            });
            return Err(if for_object {
                if meta.state < ObjectState::Ready {
                    AclFailure::new(attr, NotInitialised,
                        Error::NotInitialised(format!(
                            "{} not accessible before initialisation",
                            attr)))
                } else {
                    AclFailure::new(attr, State,
                        Error::Permission(format!(
                            "{} not accessible in state {:?}",
                            attr, meta.state)))
                }
            } else {
                AclFailure::new(attr, Permission,
                    Error::Permission(format!(
                        "{} not valid for {} objects",
                        attr, meta.object_type)))
            });
        }
    };

    let needed = match (op, internal) {
        (AclOp::Read, false) => READ_EXT,
        (AclOp::Read, true) => READ_INT | READ_EXT,
        (AclOp::Write, false) => WRITE_EXT,
        (AclOp::Write, true) => WRITE_INT | WRITE_EXT,
        (AclOp::Delete, _) => DELETE,
    };
    if target.access & needed == 0 {
        return Err(AclFailure::new(attr, Permission,
            Error::Permission(format!("{} denies {:?}", attr, op))));
    }

    if op == AclOp::Write {
        let value = value.ok_or_else(|| AclFailure::new(
            attr, Permission,
            Error::Internal("write without a value".into())))?;
        check_value(acl, attr, value)?;
        for dep in acl.depends {
            match dep {
                Dependency::Requires(other) if !present(*other) => {
                    return Err(AclFailure::new(attr, AttributeAbsent,
                        Error::NotInitialised(format!(
                            "{} requires {}", attr, other))));
                }
                Dependency::Excludes(other) if present(*other) => {
                    return Err(AclFailure::new(attr, AttributePresent,
                        Error::AlreadyInitialised(format!(
                            "{} excludes {}", attr, other))));
                }
                _ => (),
            }
        }
    }

    Ok(acl)
}

fn check_value(acl: &'static AttributeAcl, attr: Attribute,
               value: &AttributeValue)
               -> std::result::Result<(), AclFailure> {
    use ErrorType::*;

    if value.kind() != acl.kind {
        return Err(AclFailure::new(attr, ValueRange,
            Error::ArgumentValue(format!(
                "{} takes {:?}, got {:?}", attr, acl.kind, value.kind()))));
    }
    match (&acl.constraint, value) {
        (ValueConstraint::None, _) => Ok(()),
        (ValueConstraint::Range(lo, hi), AttributeValue::Int(v)) => {
            if v < lo || v > hi {
                Err(AclFailure::new(attr, ValueRange,
                    Error::ArgumentRange(format!(
                        "{} = {} outside [{}, {}]", attr, v, lo, hi))))
            } else {
                Ok(())
            }
        }
        (ValueConstraint::Length(min, max, charset), v) => {
            let (len, text): (usize, Option<&str>) = match v {
                AttributeValue::Str(s) => (s.len(), Some(s)),
                AttributeValue::Bytes(b) => (b.len(), Option::None),
                _ => return Ok(()),
            };
            if len < *min || len > *max {
                return Err(AclFailure::new(attr, ValueRange,
                    Error::ArgumentRange(format!(
                        "{} length {} outside [{}, {}]",
                        attr, len, min, max))));
            }
            if let (Some(set), Some(s)) = (charset, text) {
                if !set.accepts(s) {
                    return Err(AclFailure::new(attr, Constraint,
                        Error::ArgumentValue(format!(
                            "{} rejects characters outside {:?}",
                            attr, set))));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The control-verb counterpart of the attribute tables.
#[derive(Debug)]
pub(crate) struct VerbAcl {
    /// The action class checked against the object's permission
    /// mask.
    pub class: ActionClass,
    /// The object types the verb is deliverable to.
    pub types: &'static [ObjectType],
    /// Whether the object must have completed initialisation.
    pub need_ready: bool,
    /// Whether the verb runs under the busy protocol.
    pub long_running: bool,
}

/// Returns the ACL for a control verb, or `None` for
/// attribute-shaped messages, which are covered by the attribute
/// tables.
pub(crate) fn verb_acl(msg: &Message) -> Option<VerbAcl> {
    use ActionClass::*;
    use ObjectType::*;
    let acl = match msg {
        Message::GetAttribute(_)
        | Message::SetAttribute(..)
        | Message::DeleteAttribute(_) => return None,
        Message::Compare(..) => VerbAcl {
            class: AttributeRead,
            types: &[Context, Certificate],
            need_ready: true,
            long_running: false,
        },
        Message::Check(_) => VerbAcl {
            class: AttributeRead,
            types: &[Context, Certificate],
            need_ready: false,
            long_running: false,
        },
        Message::GenerateKey { .. } => VerbAcl {
            class: KeyManagement,
            types: &[Context],
            need_ready: false,
            long_running: true,
        },
        Message::HashData(_) => VerbAcl {
            class: Hash,
            types: &[Context],
            need_ready: true,
            long_running: false,
        },
        Message::SignCert(_) => VerbAcl {
            class: Sign,
            types: &[Certificate],
            need_ready: false,
            long_running: false,
        },
        Message::SigCheck(_) | Message::CheckAgainst(_)
        | Message::ValidateChain(_) => VerbAcl {
            class: Verify,
            types: &[Certificate],
            need_ready: true,
            long_running: false,
        },
        Message::PushData(_) | Message::FlushData | Message::PopData(_) =>
            VerbAcl {
                class: Encrypt,
                types: &[Envelope],
                need_ready: true,
                long_running: false,
            },
        Message::KeyGet(_) | Message::KeyGetPrivate(..)
        | Message::KeySet(..) | Message::KeyDelete(_)
        | Message::KeyQuery(_) | Message::CaCertManagement { .. } =>
            VerbAcl {
                class: KeyManagement,
                types: &[Keyset],
                need_ready: true,
                long_running: false,
            },
        Message::AddTrusted { .. } | Message::RemoveTrusted(_)
        | Message::GetTrustedIssuer(_) | Message::EnumTrusted(_) =>
            VerbAcl {
                class: KeyManagement,
                types: &[User],
                need_ready: true,
                long_running: false,
            },
    };
    Some(acl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Handle;

    fn meta(object_type: ObjectType, subtype: ObjectSubtype,
            state: ObjectState) -> ObjectMeta {
        let mut m = ObjectMeta::new(object_type, subtype,
                                    Handle::new(0, 1));
        m.state = state;
        m
    }

    fn absent(_: Attribute) -> bool {
        false
    }

    #[test]
    fn every_row_is_indexed() {
        for acl in ATTRIBUTE_ACLS {
            assert!(acl_for(acl.attr).is_some());
            assert!(!acl.targets.is_empty(), "{} has no targets", acl.attr);
        }
    }

    #[test]
    fn unknown_attribute_rejected() {
        // Sessions have no attribute rows at all.
        let m = meta(ObjectType::Session, ObjectSubtype::None,
                     ObjectState::Ready);
        let err = check_attribute(&m, Attribute::EnvPassword, AclOp::Write,
                                  Some(&AttributeValue::Str("x".into())),
                                  false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::Permission);
    }

    #[test]
    fn internal_range_rejected_externally() {
        let m = meta(ObjectType::Envelope, ObjectSubtype::None,
                     ObjectState::PartiallyInitialised);
        let err = check_attribute(&m, Attribute::Initialised, AclOp::Write,
                                  Some(&AttributeValue::Bool(true)),
                                  false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::Permission);
        assert!(check_attribute(&m, Attribute::Initialised, AclOp::Write,
                                Some(&AttributeValue::Bool(true)),
                                true, &absent).is_ok());
    }

    #[test]
    fn range_limits_are_inclusive() {
        let m = meta(ObjectType::User, ObjectSubtype::None,
                     ObjectState::Ready);
        for v in [0, 4] {
            assert!(check_attribute(&m, Attribute::OptionComplianceLevel,
                                    AclOp::Write,
                                    Some(&AttributeValue::Int(v)),
                                    false, &absent).is_ok());
        }
        let err = check_attribute(&m, Attribute::OptionComplianceLevel,
                                  AclOp::Write,
                                  Some(&AttributeValue::Int(5)),
                                  false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::ValueRange);
        assert!(matches!(err.error, Error::ArgumentRange(_)));
    }

    #[test]
    fn immutable_after_signing() {
        let m = meta(ObjectType::Certificate,
                     ObjectSubtype::Certificate(CertificateType::Certificate),
                     ObjectState::Ready);
        let err = check_attribute(&m, Attribute::CertCommonName, AclOp::Write,
                                  Some(&AttributeValue::Str("Eve".into())),
                                  false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::Permission);
        assert!(matches!(err.error, Error::Permission(_)));
        // Reads still work.
        assert!(check_attribute(&m, Attribute::CertCommonName, AclOp::Read,
                                None, false, &absent).is_ok());

        // An attribute whose only rows demand a later state reports
        // not-initialised instead.
        let m = meta(ObjectType::Context, ObjectSubtype::None,
                     ObjectState::PartiallyInitialised);
        let err = check_attribute(&m, Attribute::ContextHashValue,
                                  AclOp::Read, None, false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::NotInitialised);
    }

    #[test]
    fn dependencies_enforced() {
        let m = meta(ObjectType::Certificate,
                     ObjectSubtype::Certificate(CertificateType::Certificate),
                     ObjectState::PartiallyInitialised);
        // Path-length constraint requires the CA flag.
        let err = check_attribute(&m, Attribute::CertPathLenConstraint,
                                  AclOp::Write,
                                  Some(&AttributeValue::Int(0)),
                                  false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::AttributeAbsent);
        assert!(check_attribute(&m, Attribute::CertPathLenConstraint,
                                AclOp::Write,
                                Some(&AttributeValue::Int(0)), false,
                                &|a| a == Attribute::CertCa).is_ok());
    }

    #[test]
    fn charset_enforced() {
        let m = meta(ObjectType::Certificate,
                     ObjectSubtype::Certificate(CertificateType::Certificate),
                     ObjectState::PartiallyInitialised);
        let err = check_attribute(&m, Attribute::CertCountry, AclOp::Write,
                                  Some(&AttributeValue::Str("N\u{17d}".into())),
                                  false, &absent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::Constraint);
    }

    #[test]
    fn string_read_is_not_write() {
        let m = meta(ObjectType::Envelope, ObjectSubtype::None,
                     ObjectState::Ready);
        // Passwords are write-only.
        let err = check_attribute(&m, Attribute::EnvPassword, AclOp::Read,
                                  None, false, &absent).unwrap_err();
        assert_eq!(err.kind, ErrorType::Permission);
    }
}
