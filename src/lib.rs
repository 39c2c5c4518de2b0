//! Cryptographic object kernel and associated machinery.
//!
//! This crate implements the core of a general-purpose cryptographic
//! toolkit: a process-wide kernel of opaque, access-controlled object
//! handles; a certificate store with trust management and chain
//! validation; a streaming envelope engine that assembles and parses
//! signed, encrypted, MACed, and compressed message blobs; and the
//! per-user configuration and identity machinery that ties the rest
//! together.
//!
//! Every externally visible operation is a message sent through the
//! kernel's dispatcher.  The dispatcher validates the target handle,
//! consults the attribute access-control tables, and only then invokes
//! the object's type-specific handler.  This single choke point is what
//! makes the security surface auditable: an attribute either appears in
//! the tables or is rejected by default.
//!
//! A non-goal of this crate is the implementation of cryptographic
//! primitives.  All primitives are reached through the pluggable
//! [`crypto::backend`] interface; the default backend delegates to
//! well-reviewed implementations.  Similarly, persistent key stores are
//! reached through the uniform [`keyset`] facade, and wire-protocol
//! state machines (TLS, CMP, ...) are external collaborators that would
//! plug in as session objects.
//!
//! # Examples
//!
//! ```
//! use keystone::{Kernel, Result};
//! use keystone::kernel::Message;
//! use keystone::attr::{Attribute, AttributeValue};
//!
//! # fn main() -> Result<()> {
//! let kernel = Kernel::new()?;
//! let user = kernel.default_user();
//! let reply = kernel.send(user, Message::GetAttribute(Attribute::UserName))?;
//! assert!(reply.into_string().is_ok());
//! # Ok(()) }
//! ```

#![warn(missing_docs)]

#[macro_use] extern crate lazy_static;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

// On debug builds, Vec<u8>::truncate is very, very slow.  The compiler
// calls drop on every element that is dropped, even though a u8 doesn't
// have a drop implementation.  The compiler optimizes this away at high
// optimization levels, but those levels make debugging harder.
#[allow(dead_code)]
fn vec_truncate(v: &mut Vec<u8>, len: usize) {
    if cfg!(debug_assertions) {
        if len < v.len() {
            unsafe { v.set_len(len); }
        }
    } else {
        v.truncate(len);
    }
}

/// Like `drop(Vec<u8>::drain(..prefix_len))`, but fast in debug
/// builds.
fn vec_drain_prefix(v: &mut Vec<u8>, prefix_len: usize) {
    if cfg!(debug_assertions) {
        // Panic like v.drain(..prefix_len).
        assert!(prefix_len <= v.len(), "prefix len {} > vector len {}",
                prefix_len, v.len());
        let new_len = v.len() - prefix_len;
        unsafe {
            std::ptr::copy(v[prefix_len..].as_ptr(),
                           v[..].as_mut_ptr(),
                           new_len);
        }
        vec_truncate(v, new_len);
    } else {
        v.drain(..prefix_len);
    }
}

pub mod attr;
pub mod ber;
pub mod cert;
pub use cert::Certificate;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod kernel;
pub use kernel::{Handle, Kernel};
pub mod keyset;
pub mod types;
pub mod user;

/// Crate result specialization.
pub type Result<T> = ::std::result::Result<T, anyhow::Error>;

/// Errors returned by this crate.
///
/// Every internal failure maps to one of these kinds.  Argument and
/// permission errors are returned synchronously and do not mutate the
/// target object; data-dependent errors additionally record a locus
/// and type on the target object's record (see
/// [`kernel::ErrorInfo`]).
///
/// Note: This enum cannot be exhaustively matched to allow future
/// extensions.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The requested operation or mechanism is not available.
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// The referenced object, attribute, or item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The object has not completed initialisation.
    #[error("Not initialised: {0}")]
    NotInitialised(String),

    /// The attribute or resource is already set and cannot be set
    /// again.
    #[error("Already initialised: {0}")]
    AlreadyInitialised(String),

    /// The item is already present.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// The access-control tables forbid the operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The wrong key was supplied for the operation.
    #[error("Wrong key")]
    WrongKey,

    /// The operation is incomplete; more input is required.
    #[error("Incomplete: {0}")]
    Incomplete(String),

    /// The operation or stream is already complete.
    #[error("Already complete")]
    Complete,

    /// The operation timed out.
    #[error("Timed out")]
    Timeout,

    /// A backing store could not be opened.
    #[error("Open failed: {0}")]
    Open(String),

    /// A backing store could not be read.
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// A backing store could not be written.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Malformed input data.
    #[error("Bad data: {0}")]
    BadData(String),

    /// A signature or MAC failed to verify.
    #[error("Bad signature: {0}")]
    BadSignature(String),

    /// A semantic check failed.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// The supplied buffer is too small for the pending output.
    #[error("Overflow: {0} byte(s) pending")]
    Overflow(usize),

    /// Not enough data is present to complete the operation.
    #[error("Underflow: {0}")]
    Underflow(String),

    /// The object is busy with a long-running operation.
    #[error("Object is busy")]
    Busy,

    /// An argument has an unacceptable value.
    #[error("Invalid argument value: {0}")]
    ArgumentValue(String),

    /// An argument is outside its permitted range.
    #[error("Argument out of range: {0}")]
    ArgumentRange(String),

    /// A numbered argument is in error.
    #[error("Invalid argument {0}")]
    ArgumentParam(u8),

    /// Memory allocation failed or a size limit was exceeded.
    #[error("Out of memory")]
    Memory,

    /// An internal consistency check failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether `err` wraps this error kind.
    ///
    /// Convenience for matching a [`Result`]'s `anyhow::Error` against
    /// a specific kind without caring about the payload.
    pub fn matches(err: &anyhow::Error, kind: fn(&Error) -> bool) -> bool {
        err.downcast_ref::<Error>().map(kind).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_downcast() {
        let e: anyhow::Error = Error::Busy.into();
        assert!(Error::matches(&e, |e| matches!(e, Error::Busy)));
        assert!(!Error::matches(&e, |e| matches!(e, Error::Timeout)));
    }

    #[test]
    fn drain_prefix() {
        let mut v = vec![1u8, 2, 3, 4, 5];
        vec_drain_prefix(&mut v, 2);
        assert_eq!(&v[..], &[3, 4, 5]);
        vec_drain_prefix(&mut v, 3);
        assert!(v.is_empty());
    }
}
