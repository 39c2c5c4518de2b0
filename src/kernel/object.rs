//! Object records.

use std::sync::Mutex;

use crate::attr::Attribute;
use crate::cert::CertObject;
use crate::crypto::KeyContext;
use crate::envelope::EnvelopeObject;
use crate::keyset::KeysetObject;
use crate::types::{CertificateType, ErrorType, ObjectState, ObjectType};
use crate::user::UserObject;
use super::Handle;

/// The classes of action a message may perform on an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ActionClass {
    /// Producing a signature.
    Sign,
    /// Verifying a signature.
    Verify,
    /// Encrypting data or keys.
    Encrypt,
    /// Decrypting data or keys.
    Decrypt,
    /// Hashing data.
    Hash,
    /// Computing a MAC.
    Mac,
    /// Key management: generation, storage, retrieval.
    KeyManagement,
    /// Reading attributes.
    AttributeRead,
    /// Writing or deleting attributes.
    AttributeWrite,
    /// Destroying the object.
    Destroy,
}

const ACTION_CLASSES: usize = 10;

/// How far an action class is permitted on an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionLevel {
    /// Permitted for external and internal callers.
    External,
    /// Permitted for internal callers only.
    Internal,
    /// Never permitted.
    Forbidden,
}

/// The per-object action permission mask.
#[derive(Copy, Clone, Debug)]
pub struct ActionMap([ActionLevel; ACTION_CLASSES]);

impl ActionMap {
    /// Returns a map forbidding everything except destruction.
    pub fn locked_down() -> Self {
        let mut map = ActionMap([ActionLevel::Forbidden; ACTION_CLASSES]);
        map.set(ActionClass::Destroy, ActionLevel::External);
        map
    }

    /// Returns the default map for an object of the given type.
    pub fn for_type(t: ObjectType) -> Self {
        use ActionClass::*;
        use ActionLevel::*;
        let mut map = ActionMap([Forbidden; ACTION_CLASSES]);
        map.set(AttributeRead, External);
        map.set(AttributeWrite, External);
        map.set(Destroy, External);
        match t {
            ObjectType::Context => {
                map.set(Sign, External);
                map.set(Verify, External);
                map.set(Encrypt, External);
                map.set(Decrypt, External);
                map.set(Hash, External);
                map.set(Mac, External);
                map.set(KeyManagement, External);
            }
            ObjectType::Certificate => {
                map.set(Sign, External);
                map.set(Verify, External);
                map.set(Encrypt, Internal);
                map.set(KeyManagement, Internal);
            }
            ObjectType::Keyset => {
                map.set(KeyManagement, External);
            }
            ObjectType::Envelope => {
                // Data movement through an envelope is classed as
                // encryption or decryption depending on direction.
                map.set(Encrypt, External);
                map.set(Decrypt, External);
                map.set(Sign, Internal);
                map.set(Verify, Internal);
                map.set(Hash, Internal);
                map.set(Mac, Internal);
            }
            ObjectType::Session | ObjectType::Device => (),
            ObjectType::User => {
                map.set(KeyManagement, External);
                map.set(Verify, External);
            }
        }
        map
    }

    /// Sets the level for a class.
    pub fn set(&mut self, class: ActionClass, level: ActionLevel) {
        self.0[class as usize] = level;
    }

    /// Returns the level for a class.
    pub fn level(&self, class: ActionClass) -> ActionLevel {
        self.0[class as usize]
    }
}

/// The subtype of an object, where the type has subtypes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectSubtype {
    /// No subtype distinction.
    None,
    /// A certificate-family subtype.
    Certificate(CertificateType),
}

/// Structured detail about the last failure on an object: the
/// attribute at fault and the failure class.
#[derive(Copy, Clone, Debug)]
pub struct ErrorInfo {
    /// The attribute at which the failure occurred.
    pub locus: Option<Attribute>,
    /// The failure class.
    pub kind: ErrorType,
}

impl ErrorInfo {
    /// Returns a cleared error record.
    pub fn none() -> Self {
        ErrorInfo { locus: None, kind: ErrorType::None }
    }
}

/// The kernel-owned portion of an object record.
#[derive(Clone, Debug)]
pub(crate) struct ObjectMeta {
    pub object_type: ObjectType,
    pub subtype: ObjectSubtype,
    pub state: ObjectState,
    pub owner: Handle,
    pub actions: ActionMap,
    /// In-flight message count.
    pub refs: u32,
    /// Set while a long-running control verb holds the object.
    pub busy: bool,
    /// Set when destruction has been requested but in-flight
    /// references remain.
    pub destroy_pending: bool,
    /// The object this one depends on, e.g. a certificate's bound
    /// public-key context.
    pub dependent: Option<Handle>,
    /// How many other objects name this one as their dependency.
    pub dependent_refs: u32,
    pub error: ErrorInfo,
}

impl ObjectMeta {
    pub(crate) fn new(object_type: ObjectType, subtype: ObjectSubtype,
                      owner: Handle) -> Self {
        ObjectMeta {
            object_type,
            subtype,
            state: ObjectState::PartiallyInitialised,
            owner,
            actions: ActionMap::for_type(object_type),
            refs: 0,
            busy: false,
            destroy_pending: false,
            dependent: None,
            dependent_refs: 0,
            error: ErrorInfo::none(),
        }
    }
}

/// The type-specific payload behind an object record.
#[derive(Debug)]
pub(crate) enum ObjectPayload {
    /// The process-wide system object.
    System,
    Context(KeyContext),
    Certificate(CertObject),
    Envelope(EnvelopeObject),
    Keyset(KeysetObject),
    User(UserObject),
}

impl ObjectPayload {
    pub(crate) fn object_type(&self) -> ObjectType {
        match self {
            // The system object is a degenerate user.
            ObjectPayload::System => ObjectType::User,
            ObjectPayload::Context(_) => ObjectType::Context,
            ObjectPayload::Certificate(_) => ObjectType::Certificate,
            ObjectPayload::Envelope(_) => ObjectType::Envelope,
            ObjectPayload::Keyset(_) => ObjectType::Keyset,
            ObjectPayload::User(_) => ObjectType::User,
        }
    }
}

/// A slot-resident object: kernel metadata plus the type-specific
/// payload, each behind its own lock.
///
/// The meta lock is only ever held for short, non-blocking updates.
/// The payload lock is held for the duration of a message delivery,
/// which serialises messages to the same object in arrival order.
#[derive(Debug)]
pub(crate) struct Object {
    pub meta: Mutex<ObjectMeta>,
    pub payload: Mutex<ObjectPayload>,
}
