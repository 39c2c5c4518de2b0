//! The object kernel.
//!
//! A process-wide table of opaque handles referring to typed
//! cryptographic objects, plus the dispatcher that mediates every
//! operation on them.  The kernel enforces type, state, ownership,
//! and access-control policy on every message; object handlers only
//! ever see messages that have already been validated.
//!
//! Two objects exist from kernel creation: the *system object*, which
//! owns transient contexts the kernel needs for itself, and the
//! *default user*, which carries both normal-user and
//! security-officer capabilities so that callers who never deal with
//! user objects get the behaviour they expect.

pub mod acl;
mod dispatch;
mod handle;
mod message;
mod object;
mod table;

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

pub use handle::Handle;
pub use message::{CaAction, CompareType, Message, PushStatus, Reply};
pub use object::{ActionClass, ActionLevel, ActionMap, ErrorInfo,
                 ObjectSubtype};
pub(crate) use dispatch::{lock_meta, Fault};
pub(crate) use object::{Object, ObjectMeta, ObjectPayload};
use table::ObjectTable;

use crate::types::{ObjectState, ObjectType};
use crate::user::UserObject;
use crate::{Error, Result};

/// The object kernel.
///
/// All state lives behind the kernel's object table; the kernel
/// itself is freely shareable across threads.
pub struct Kernel {
    table: ObjectTable,
    system: Handle,
    default_user: Handle,
}

impl Kernel {
    /// Creates a kernel with its two built-in objects.
    pub fn new() -> Result<Kernel> {
        let mut kernel = Kernel {
            table: ObjectTable::new(),
            system: Handle::from_raw(0),
            default_user: Handle::from_raw(0),
        };

        let system = kernel.create_object(
            ObjectType::User, ObjectSubtype::None, None,
            ObjectPayload::System)?;
        {
            let object = kernel.table.lookup(system)?;
            let mut meta = lock_meta(&object)?;
            meta.owner = system;
            meta.state = ObjectState::Ready;
            meta.actions.set(ActionClass::Destroy, ActionLevel::Internal);
        }
        kernel.system = system;

        let default_user = kernel.create_object(
            ObjectType::User, ObjectSubtype::None, Some(system),
            ObjectPayload::User(UserObject::default_user()))?;
        {
            let object = kernel.table.lookup(default_user)?;
            let mut meta = lock_meta(&object)?;
            meta.state = ObjectState::Ready;
            meta.actions.set(ActionClass::Destroy, ActionLevel::Internal);
        }
        kernel.default_user = default_user;

        info!(%system, %default_user, "kernel initialised");
        Ok(kernel)
    }

    /// Returns the system object's handle.
    pub fn system(&self) -> Handle {
        self.system
    }

    /// Returns the default user's handle.
    pub fn default_user(&self) -> Handle {
        self.default_user
    }

    /// Inserts a new object into the table in the
    /// partially-initialised state.
    ///
    /// The handle is observable from the moment this returns, with
    /// owner and permissions populated; the caller sends the terminal
    /// initialisation write once the payload is complete.
    pub(crate) fn create_object(&self, object_type: ObjectType,
                                subtype: ObjectSubtype,
                                owner: Option<Handle>,
                                payload: ObjectPayload) -> Result<Handle> {
        let owner = owner.unwrap_or(self.system);
        let object = Arc::new(Object {
            meta: Mutex::new(ObjectMeta::new(object_type, subtype, owner)),
            payload: Mutex::new(payload),
        });
        let handle = self.table.allocate(object)?;
        debug!(%handle, %owner, "created {} object", object_type);
        Ok(handle)
    }

    /// Sends the terminal initialisation write, moving the object to
    /// the ready state.
    pub(crate) fn mark_ready(&self, handle: Handle) -> Result<()> {
        self.send_internal(handle, Message::SetAttribute(
            crate::attr::Attribute::Initialised,
            crate::attr::AttributeValue::Bool(true)))?;
        Ok(())
    }

    /// Runs `f` over another object's payload.
    ///
    /// This is the internal fast path for handlers that need a
    /// collaborator object (an envelope reading its signing context,
    /// a user committing to its keyset).  Handlers must never call it
    /// on the object they are currently handling.
    pub(crate) fn with_payload<T>(
        &self, handle: Handle,
        f: impl FnOnce(&mut ObjectPayload) -> Result<T>) -> Result<T> {
        let object = self.table.lookup(handle)?;
        {
            let meta = lock_meta(&object)?;
            if meta.destroy_pending || meta.state == ObjectState::Destroyed {
                return Err(Error::NotFound(
                    format!("object {} is being destroyed", handle)).into());
            }
        }
        let mut payload = object.payload.lock()
            .map_err(|_| anyhow::Error::from(Error::Internal(
                "object payload poisoned".into())))?;
        f(&mut payload)
    }

    /// Returns an object's type and subtype.
    pub(crate) fn object_kind(&self, handle: Handle)
                              -> Result<(ObjectType, ObjectSubtype)> {
        let object = self.table.lookup(handle)?;
        let meta = lock_meta(&object)?;
        Ok((meta.object_type, meta.subtype))
    }

    /// Returns an object's owner.
    pub(crate) fn owner_of(&self, handle: Handle) -> Result<Handle> {
        let object = self.table.lookup(handle)?;
        let owner = lock_meta(&object)?.owner;
        Ok(owner)
    }

    /// Records a dependency from `parent` onto `dep`, e.g. a
    /// certificate onto the context carrying its public key.
    ///
    /// The dependency keeps `dep` alive: destroying it while the
    /// parent exists fails with [`Error::Busy`]; destroying the
    /// parent drops the reference.
    pub(crate) fn bind_dependent(&self, parent: &Arc<Object>, dep: Handle)
                                 -> Result<()> {
        let dep_object = self.table.lookup(dep)?;
        lock_meta(&dep_object)?.dependent_refs += 1;
        let old = lock_meta(parent)?.dependent.replace(dep);
        if let Some(old) = old {
            if let Ok(object) = self.table.lookup(old) {
                let mut meta = lock_meta(&object)?;
                meta.dependent_refs = meta.dependent_refs.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Returns the dependent object recorded on `handle`, if any.
    pub(crate) fn dependent_of(&self, handle: Handle)
                               -> Result<Option<Handle>> {
        let object = self.table.lookup(handle)?;
        let dependent = lock_meta(&object)?.dependent;
        Ok(dependent)
    }

    /// Destroys an object on behalf of an external caller.
    pub fn destroy(&self, handle: Handle) -> Result<()> {
        self.destroy_with_access(handle, false)
    }

    pub(crate) fn destroy_internal(&self, handle: Handle) -> Result<()> {
        self.destroy_with_access(handle, true)
    }

    fn destroy_with_access(&self, handle: Handle, internal: bool)
                           -> Result<()> {
        let object = self.table.lookup(handle)?;
        {
            let mut meta = lock_meta(&object)?;
            match meta.actions.level(ActionClass::Destroy) {
                ActionLevel::External => (),
                ActionLevel::Internal if internal => (),
                _ => return Err(Error::Permission(
                    "object may not be destroyed".into()).into()),
            }
            if meta.busy {
                return Err(Error::Busy.into());
            }
            if meta.dependent_refs > 0 {
                return Err(Error::Busy.into());
            }
            if meta.destroy_pending {
                return Err(Error::NotFound(
                    format!("object {} is being destroyed", handle)).into());
            }
            meta.destroy_pending = true;
            if meta.refs > 0 {
                // In-flight messages drain first; the last one out
                // completes the destruction.
                debug!(%handle, refs = meta.refs, "destroy deferred");
                return Ok(());
            }
        }
        self.finish_destroy(handle, &object)
    }

    pub(crate) fn finish_destroy(&self, handle: Handle,
                                 object: &Arc<Object>) -> Result<()> {
        let dep = lock_meta(object)?.dependent.take();
        let owned = {
            let payload = object.payload.lock()
                .map_err(|_| anyhow::Error::from(Error::Internal(
                    "object payload poisoned".into())))?;
            owned_handles(&payload)
        };
        lock_meta(object)?.state = ObjectState::Destroyed;
        self.table.release(handle)?;
        if let Some(dep) = dep {
            if let Ok(object) = self.table.lookup(dep) {
                let mut meta = lock_meta(&object)?;
                meta.dependent_refs = meta.dependent_refs.saturating_sub(1);
            }
        }
        for child in owned {
            let _ = self.destroy_internal(child);
        }
        debug!(%handle, "object destroyed");
        Ok(())
    }

    /// Marks an object busy for the duration of a long-running
    /// operation.  While busy, destruction fails with
    /// [`Error::Busy`].
    pub(crate) fn enter_busy(&self, object: &Arc<Object>) -> Result<()> {
        let mut meta = lock_meta(object)?;
        meta.busy = true;
        meta.state = ObjectState::Busy;
        Ok(())
    }

    /// Clears the busy flag set by [`Kernel::enter_busy`].
    pub(crate) fn leave_busy(&self, object: &Arc<Object>,
                             state: ObjectState) -> Result<()> {
        let mut meta = lock_meta(object)?;
        meta.busy = false;
        meta.state = state;
        Ok(())
    }

    /// Shuts the kernel down, destroying every object.
    ///
    /// Returns [`Error::Incomplete`] if caller-created objects were
    /// still allocated; the objects are freed regardless.
    pub fn shutdown(self) -> Result<()> {
        let mut leaked = 0;
        // Dependency links constrain destruction order; sweep until
        // nothing more can be freed.
        loop {
            let live: Vec<Handle> = self.table.live_handles()
                .into_iter()
                .filter(|h| *h != self.system && *h != self.default_user)
                .collect();
            if live.is_empty() {
                break;
            }
            if leaked == 0 {
                leaked = live.len();
            }
            let mut progress = false;
            for handle in live {
                if self.destroy_internal(handle).is_ok() {
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        let _ = self.destroy_internal(self.default_user);
        let _ = self.destroy_internal(self.system);
        if leaked > 0 {
            info!(leaked, "shutdown with objects still allocated");
            Err(Error::Incomplete(
                format!("{} object(s) still allocated", leaked)).into())
        } else {
            info!("shutdown");
            Ok(())
        }
    }
}

/// The handles an object owns outright and takes down with it.
fn owned_handles(payload: &ObjectPayload) -> Vec<Handle> {
    match payload {
        ObjectPayload::User(user) => user.owned_handles(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{Attribute, AttributeValue};

    #[test]
    fn kernel_bootstrap() {
        let kernel = Kernel::new().unwrap();
        assert_ne!(kernel.system(), kernel.default_user());
        // The singletons may not be destroyed externally.
        let err = kernel.destroy(kernel.default_user()).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Permission(_))));
        kernel.shutdown().unwrap();
    }

    #[test]
    fn default_user_is_readable() {
        let kernel = Kernel::new().unwrap();
        let name = kernel.send(kernel.default_user(),
                               Message::GetAttribute(Attribute::UserName))
            .unwrap().into_string().unwrap();
        assert!(!name.is_empty());
    }

    #[test]
    fn stale_handles_fail_not_found() {
        let kernel = Kernel::new().unwrap();
        let h = crate::crypto::create_hash_context(
            &kernel, crate::types::HashAlgorithm::Sha256).unwrap();
        kernel.destroy(h).unwrap();
        let err = kernel.send(h, Message::GetAttribute(
            Attribute::ContextAlgorithm)).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
    }

    #[test]
    fn shutdown_reports_leaks() {
        let kernel = Kernel::new().unwrap();
        let _leak = crate::crypto::create_hash_context(
            &kernel, crate::types::HashAlgorithm::Sha256).unwrap();
        let err = kernel.shutdown().unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Incomplete(_))));
    }

    #[test]
    fn concurrent_callers_interleave_freely() {
        use crate::types::HashAlgorithm;
        let kernel = Kernel::new().unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let h = crate::crypto::create_hash_context(
                            &kernel, HashAlgorithm::Sha256).unwrap();
                        kernel.send(h, Message::HashData(
                            b"abc".to_vec())).unwrap();
                        kernel.send(h, Message::HashData(Vec::new()))
                            .unwrap();
                        kernel.destroy(h).unwrap();
                    }
                });
            }
        });
        kernel.shutdown().unwrap();
    }

    #[test]
    fn error_attributes_reflect_last_failure() {
        let kernel = Kernel::new().unwrap();
        let user = kernel.default_user();
        // Out-of-range compliance level.
        let err = kernel.send(user, Message::SetAttribute(
            Attribute::OptionComplianceLevel, AttributeValue::Int(9)))
            .unwrap_err();
        assert!(Error::matches(&err,
            |e| matches!(e, Error::ArgumentRange(_))));
        let locus = kernel.send(user,
            Message::GetAttribute(Attribute::ErrorLocus))
            .unwrap().into_int().unwrap();
        assert_eq!(locus as u32, Attribute::OptionComplianceLevel.id());
        let kind = kernel.send(user,
            Message::GetAttribute(Attribute::ErrorType))
            .unwrap().into_int().unwrap();
        assert_eq!(kind, crate::types::ErrorType::ValueRange as i64);
    }
}
