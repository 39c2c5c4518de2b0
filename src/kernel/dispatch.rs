//! Message delivery.
//!
//! The single choke point for all operations on kernel objects.  For
//! every message the dispatcher validates the target handle, consults
//! the access-control tables, and only then calls the object's
//! type-specific handler with the payload lock held.  Messages to the
//! same object are thereby serialised in arrival order; messages to
//! distinct objects interleave freely.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::attr::{Attribute, AttributeValue};
use crate::types::{ErrorType, ObjectState, ObjectType};
use crate::{cert, envelope, keyset, user, Error, Result};
use super::acl::{self, AclOp, ValueConstraint};
use super::message::{Message, Reply};
use super::object::{ActionClass, ActionLevel, Object, ObjectPayload};
use super::{Handle, Kernel};

/// A handler failure carrying the attribute locus and failure class
/// to record on the target object.
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub(crate) struct Fault {
    /// The attribute at fault, if the failure is attributable.
    pub locus: Option<Attribute>,
    /// The failure class.
    pub kind: ErrorType,
    /// The underlying error.
    pub error: Error,
}

impl Fault {
    pub(crate) fn new(locus: Attribute, kind: ErrorType, error: Error)
                      -> anyhow::Error {
        anyhow::Error::new(Fault { locus: Some(locus), kind, error })
    }
}

impl Kernel {
    /// Sends a message to an object on behalf of an external caller.
    pub fn send(&self, handle: Handle, msg: Message) -> Result<Reply> {
        self.deliver(handle, msg, false)
    }

    /// Sends a message with kernel-internal privileges.
    pub(crate) fn send_internal(&self, handle: Handle, msg: Message)
                                -> Result<Reply> {
        self.deliver(handle, msg, true)
    }

    fn deliver(&self, handle: Handle, msg: Message, internal: bool)
               -> Result<Reply> {
        let object = self.table.lookup(handle)?;

        // Admission: the object must be live, and control verbs must
        // clear the action-permission mask before we queue behind the
        // payload lock.
        {
            let mut meta = lock_meta(&object)?;
            if meta.destroy_pending || meta.state == ObjectState::Destroyed {
                return Err(Error::NotFound(
                    format!("object {} is being destroyed", handle)).into());
            }
            if let Some(vacl) = acl::verb_acl(&msg) {
                if !vacl.types.contains(&meta.object_type) {
                    return Err(Error::ArgumentValue(format!(
                        "verb not deliverable to {} objects",
                        meta.object_type)).into());
                }
                match meta.actions.level(vacl.class) {
                    ActionLevel::External => (),
                    ActionLevel::Internal if internal => (),
                    _ => return Err(Error::Permission(format!(
                        "{:?} forbidden on this object", vacl.class)).into()),
                }
                if vacl.need_ready
                    && meta.state < ObjectState::Ready
                {
                    return Err(Error::NotInitialised(format!(
                        "object {} is not initialised", handle)).into());
                }
            } else {
                // Attribute-shaped; the fine-grained tables run under
                // the payload lock, but the coarse action class is
                // checked here.
                let class = match &msg {
                    Message::SetAttribute(..)
                    | Message::DeleteAttribute(_) =>
                        ActionClass::AttributeWrite,
                    _ => ActionClass::AttributeRead,
                };
                match meta.actions.level(class) {
                    ActionLevel::External => (),
                    ActionLevel::Internal if internal => (),
                    _ => return Err(Error::Permission(format!(
                        "{:?} forbidden on this object", class)).into()),
                }
            }
            meta.refs += 1;
        }

        trace!(%handle, internal, "delivering {:?}", kind_of(&msg));
        let result = self.deliver_locked(handle, &object, msg, internal);

        // Completion: drop the reference, record structured error
        // detail, and finish a deferred destroy if we were the last
        // reference out.
        let finish = {
            let mut meta = lock_meta(&object)?;
            meta.refs -= 1;
            if let Err(err) = &result {
                if let Some(fault) = err.downcast_ref::<Fault>() {
                    meta.error.locus = fault.locus;
                    meta.error.kind = fault.kind;
                } else if let Some(e) = err.downcast_ref::<Error>() {
                    if matches!(e, Error::BadData(_) | Error::BadSignature(_)
                                   | Error::Invalid(_)) {
                        meta.error.kind = ErrorType::Constraint;
                    }
                }
            }
            meta.destroy_pending && meta.refs == 0
        };
        if finish {
            self.finish_destroy(handle, &object)?;
        }

        // Strip the Fault wrapper; callers see the plain error.
        result.map_err(|err| match err.downcast::<Fault>() {
            Ok(fault) => fault.error.into(),
            Err(err) => err,
        })
    }

    fn deliver_locked(&self, handle: Handle, object: &Arc<Object>,
                      msg: Message, internal: bool) -> Result<Reply> {
        let mut payload = object.payload.lock()
            .map_err(|_| anyhow::Error::from(Error::Internal(
                "object payload poisoned".into())))?;

        // Attribute-shaped messages clear the fine-grained tables
        // first.
        let (attr, op, value) = match &msg {
            Message::GetAttribute(a) => (Some(*a), AclOp::Read, None),
            Message::SetAttribute(a, v) => (Some(*a), AclOp::Write, Some(v)),
            Message::DeleteAttribute(a) => (Some(*a), AclOp::Delete, None),
            _ => (None, AclOp::Read, None),
        };
        if let Some(attr) = attr {
            let meta = lock_meta(object)?.clone();
            let probe = |a: Attribute| attr_present(&payload, a);
            match acl::check_attribute(&meta, attr, op, value, internal,
                                       &probe) {
                Ok(acl) => {
                    if let (ValueConstraint::Handle(types),
                            Some(AttributeValue::Object(h))) =
                        (&acl.constraint, value)
                    {
                        self.check_handle_type(*h, types)
                            .map_err(|e| Fault {
                                locus: Some(attr),
                                kind: ErrorType::ValueRange,
                                error: e,
                            })?;
                    }
                }
                Err(fail) => {
                    debug!(%handle, attr = %fail.locus,
                           "attribute rejected: {}", fail.error);
                    return Err(Fault::new(fail.locus, fail.kind, fail.error));
                }
            }

            // Error reporting is common to every object type.
            let meta = lock_meta(object)?;
            match (&msg, attr) {
                (Message::GetAttribute(_), Attribute::ErrorLocus) => {
                    let locus = meta.error.locus
                        .map(|a| a.id() as i64).unwrap_or(0);
                    return Ok(Reply::Value(AttributeValue::Int(locus)));
                }
                (Message::GetAttribute(_), Attribute::ErrorType) => {
                    return Ok(Reply::Value(AttributeValue::Int(
                        meta.error.kind as i64)));
                }
                _ => (),
            }
            drop(meta);

            // The terminal initialisation write is likewise common.
            if let (Message::SetAttribute(..), Attribute::Initialised) =
                (&msg, attr)
            {
                let mut meta = lock_meta(object)?;
                meta.state = ObjectState::Ready;
                return Ok(Reply::Unit);
            }
        }

        match &mut *payload {
            ObjectPayload::System =>
                system_handler(&msg),
            ObjectPayload::Context(ctx) =>
                crate::crypto::context::dispatch(
                    self, handle, object, ctx, msg),
            ObjectPayload::Certificate(c) =>
                cert::dispatch(self, handle, object, c, msg, internal),
            ObjectPayload::Envelope(e) =>
                envelope::dispatch(self, handle, e, msg),
            ObjectPayload::Keyset(k) =>
                keyset::dispatch(self, handle, k, msg, internal),
            ObjectPayload::User(u) =>
                user::dispatch(self, handle, object, u, msg, internal),
        }
    }

    fn check_handle_type(&self, handle: Handle, types: &[ObjectType])
                         -> std::result::Result<(), Error> {
        let object = self.table.lookup(handle)
            .map_err(|_| Error::ArgumentValue(
                format!("no such object {}", handle)))?;
        let meta = object.meta.lock()
            .map_err(|_| Error::Internal("object meta poisoned".into()))?;
        if !types.contains(&meta.object_type) {
            return Err(Error::ArgumentValue(format!(
                "expected one of {:?}, got {}", types, meta.object_type)));
        }
        Ok(())
    }
}

fn system_handler(msg: &Message) -> Result<Reply> {
    match msg {
        Message::Check(_) => Ok(Reply::Truth(false)),
        _ => Err(Error::NotAvailable(
            "the system object accepts no such message".into()).into()),
    }
}

/// Reports whether an attribute is currently set on a payload; feeds
/// the ACL engine's cross-attribute dependency checks.
fn attr_present(payload: &ObjectPayload, attr: Attribute) -> bool {
    match payload {
        ObjectPayload::Certificate(c) => c.attr_present(attr),
        ObjectPayload::Envelope(e) => e.attr_present(attr),
        ObjectPayload::User(u) => u.attr_present(attr),
        _ => false,
    }
}

fn kind_of(msg: &Message) -> &'static str {
    match msg {
        Message::GetAttribute(_) => "get-attribute",
        Message::SetAttribute(..) => "set-attribute",
        Message::DeleteAttribute(_) => "delete-attribute",
        Message::Compare(..) => "compare",
        Message::Check(_) => "check",
        Message::GenerateKey { .. } => "generate-key",
        Message::HashData(_) => "hash-data",
        Message::SignCert(_) => "sign",
        Message::SigCheck(_) => "sig-check",
        Message::CheckAgainst(_) => "check-against",
        Message::PushData(_) => "push-data",
        Message::FlushData => "flush-data",
        Message::PopData(_) => "pop-data",
        Message::KeyGet(_) => "key-get",
        Message::KeyGetPrivate(..) => "key-get-private",
        Message::KeySet(..) => "key-set",
        Message::KeyDelete(_) => "key-delete",
        Message::KeyQuery(_) => "key-query",
        Message::CaCertManagement { .. } => "ca-certmgmt",
        Message::AddTrusted { .. } => "add-trusted",
        Message::RemoveTrusted(_) => "remove-trusted",
        Message::GetTrustedIssuer(_) => "get-trusted-issuer",
        Message::EnumTrusted(_) => "enum-trusted",
        Message::ValidateChain(_) => "validate-chain",
    }
}

pub(crate) fn lock_meta(object: &Arc<Object>)
    -> Result<std::sync::MutexGuard<'_, super::object::ObjectMeta>> {
    object.meta.lock()
        .map_err(|_| Error::Internal("object meta poisoned".into()).into())
}
