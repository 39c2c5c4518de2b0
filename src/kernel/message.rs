//! The message vocabulary of the kernel bus.

use crate::attr::{Attribute, AttributeValue};
use crate::types::{CheckType, KeyId, PublicKeyAlgorithm};
use crate::{Error, Result};
use super::Handle;

/// What an internal value is compared against by a `Compare`
/// message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareType {
    /// The object's fingerprint.
    Fingerprint,
    /// A completed digest value.
    HashValue,
}

/// A message deliverable to a kernel object.
///
/// Every externally visible operation is one of these.  The
/// dispatcher validates the target handle and consults the
/// access-control tables before the object's handler sees the
/// message.
#[derive(Debug)]
pub enum Message {
    /// Reads an attribute.
    GetAttribute(Attribute),
    /// Writes an attribute.
    SetAttribute(Attribute, AttributeValue),
    /// Deletes an attribute.
    DeleteAttribute(Attribute),
    /// Compares an internal value with a caller-supplied one in
    /// constant time.
    Compare(CompareType, Vec<u8>),
    /// Queries a capability.
    Check(CheckType),
    /// Generates a key pair into an unkeyed context.  Long-running;
    /// delivered under the busy protocol.
    GenerateKey {
        /// The algorithm to generate for.
        algo: PublicKeyAlgorithm,
        /// The key size in bits.  Ignored for fixed-size algorithms.
        bits: usize,
    },
    /// Feeds data into a hash context.  An empty chunk completes the
    /// digest.
    HashData(Vec<u8>),
    /// Signs the certificate-family object with the given key.
    SignCert(Handle),
    /// Verifies the signature on a certificate-family object.  The
    /// handle names the putative issuer, or the object itself for
    /// self-signed checks.
    SigCheck(Handle),
    /// Checks a certificate against a CRL; the handle names the CRL.
    CheckAgainst(Handle),
    /// Pushes data into an envelope.
    PushData(Vec<u8>),
    /// Flushes an envelope, finalising the current phase.
    FlushData,
    /// Pops up to the given number of bytes out of an envelope.
    PopData(usize),
    /// Retrieves a public item from a keyset.
    KeyGet(KeyId),
    /// Retrieves a private item from a keyset, unlocking it with a
    /// password where the backend requires one.
    KeyGetPrivate(KeyId, Option<String>),
    /// Stores an item in a keyset.  The password, if given, protects
    /// private material.
    KeySet(Handle, Option<String>),
    /// Deletes an item from a keyset.
    KeyDelete(KeyId),
    /// Queries a keyset for matching items.
    KeyQuery(KeyId),
    /// Certificate-authority management operation on a keyset.
    CaCertManagement {
        /// The action to perform.
        action: CaAction,
        /// The CA's signing key.
        ca_key: Handle,
        /// The request or certificate the action applies to.
        item: Option<Handle>,
    },
    /// Adds a certificate to the user's trust store.
    AddTrusted {
        /// The certificate or chain to trust.
        cert: Handle,
        /// Add exactly the given certificate instead of a chain's
        /// root.
        single_cert: bool,
    },
    /// Removes a certificate from the user's trust store.
    RemoveTrusted(Handle),
    /// Looks a certificate's trusted issuer up in the user's trust
    /// store, returning the issuer's handle.
    GetTrustedIssuer(Handle),
    /// Enumerates the user's trusted certificates into a chain
    /// object or keyset, or counts them when no target is given.
    EnumTrusted(Option<Handle>),
    /// Validates a certificate chain under the user's compliance
    /// level.
    ValidateChain(Handle),
}

/// The kind of CA management action requested through a keyset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaAction {
    /// Issue a certificate from a request.
    Issue,
    /// Issue a CRL.
    IssueCrl,
    /// Expire old certificates.
    Expire,
    /// Revoke a certificate.
    Revoke,
    /// Clean up the store.
    CleanUp,
}

/// The progress of a push into an envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushStatus {
    /// The data was consumed.
    Accepted,
    /// The envelope needs a caller-supplied resource before it can
    /// continue; see
    /// [`Attribute::EnvResourceRequired`](crate::attr::Attribute).
    ResourceRequired,
    /// The envelope has consumed a complete message; surplus input
    /// was not consumed.
    Complete,
}

/// A successful reply from a message delivery.
#[derive(Debug)]
pub enum Reply {
    /// Nothing to report.
    Unit,
    /// An attribute value.
    Value(AttributeValue),
    /// A byte payload.
    Bytes(Vec<u8>),
    /// A handle, e.g. a fetched key context or trusted certificate.
    Object(Handle),
    /// The outcome of a comparison or capability check.
    Truth(bool),
    /// A count, e.g. of trusted certificates.
    Count(usize),
    /// Push progress.
    Push {
        /// How many input bytes were consumed.
        consumed: usize,
        /// Whether the envelope can proceed.
        status: PushStatus,
    },
    /// Popped data.  Empty once the envelope has reported
    /// end-of-data.
    Pop(Vec<u8>),
}

impl Reply {
    /// Returns the attribute value payload.
    pub fn into_value(self) -> Result<AttributeValue> {
        match self {
            Reply::Value(v) => Ok(v),
            r => Err(Error::Internal(
                format!("expected value reply, got {:?}", r)).into()),
        }
    }

    /// Returns the attribute value as an integer.
    pub fn into_int(self) -> Result<i64> {
        self.into_value()?.into_int()
    }

    /// Returns the attribute value as a boolean.
    pub fn into_bool(self) -> Result<bool> {
        self.into_value()?.into_bool()
    }

    /// Returns the attribute value as a string.
    pub fn into_string(self) -> Result<String> {
        self.into_value()?.into_string()
    }

    /// Returns the byte payload of a `Bytes`, `Pop`, or bytes-valued
    /// attribute reply.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Reply::Bytes(v) | Reply::Pop(v) => Ok(v),
            Reply::Value(v) => v.into_bytes(),
            r => Err(Error::Internal(
                format!("expected bytes reply, got {:?}", r)).into()),
        }
    }

    /// Returns the handle payload.
    pub fn into_object(self) -> Result<Handle> {
        match self {
            Reply::Object(h) => Ok(h),
            Reply::Value(v) => v.into_object(),
            r => Err(Error::Internal(
                format!("expected object reply, got {:?}", r)).into()),
        }
    }

    /// Returns the truth payload.
    pub fn into_truth(self) -> Result<bool> {
        match self {
            Reply::Truth(v) => Ok(v),
            r => Err(Error::Internal(
                format!("expected truth reply, got {:?}", r)).into()),
        }
    }

    /// Returns the count payload.
    pub fn into_count(self) -> Result<usize> {
        match self {
            Reply::Count(v) => Ok(v),
            r => Err(Error::Internal(
                format!("expected count reply, got {:?}", r)).into()),
        }
    }

    /// Returns the push progress payload.
    pub fn into_push(self) -> Result<(usize, PushStatus)> {
        match self {
            Reply::Push { consumed, status } => Ok((consumed, status)),
            r => Err(Error::Internal(
                format!("expected push reply, got {:?}", r)).into()),
        }
    }
}
