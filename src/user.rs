//! User objects.
//!
//! A user binds an identity to its configuration options, its trust
//! store, its backing keyset, and, for security officers, a signing
//! key.  The kernel creates one *default user* at start-up carrying
//! both normal-user and security-officer capabilities, so callers
//! who never deal with user objects get the behaviour they expect.
//!
//! A fresh install is in the zeroised state: the only recognised
//! identity is the primary security officer with the fixed
//! bootstrapping password.  Logging in with it erases the store and
//! creates the primary SO record.  Subsequent users are created by
//! an SO; their index records are signed with the creator's key and
//! the signature is verified before the user is admitted.  The
//! configuration container itself is protected by an HMAC keyed from
//! the user's password.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::attr::{Attribute, AttributeValue};
use crate::ber::{self, Reader, Writer};
use crate::cert::trust::TrustManager;
use crate::cert::CertObject;
use crate::config::ConfigOptions;
use crate::crypto::backend::interface::{Asymmetric as _, Backend as _,
                                        Digest as _};
use crate::crypto::backend::Soft;
use crate::crypto::{secure_cmp, KeyMaterial, Password};
use crate::kernel::{Handle, Kernel, Message, Object, ObjectPayload,
                    ObjectSubtype, Reply};
use crate::keyset::{seal_private, unseal_private, PrivateBlob};
use crate::types::{ComplianceLevel, HashAlgorithm, ObjectType,
                   UserState, UserType};
use crate::{Error, Result};

/// The size of user and creator identifiers.
pub const USER_ID_SIZE: usize = 16;

const DEFAULT_USER_ID: [u8; USER_ID_SIZE] = *b"<<DEFAULT_USER>>";
const PRIMARY_SO_ID: [u8; USER_ID_SIZE] = *b"<<<PRIMARY_SO>>>";
const PRIMARY_SO_CREATOR: [u8; USER_ID_SIZE] = *b"<TETRAGRAMMATON>";

/// The primary SO name.
pub const PRIMARY_SO_NAME: &str = "Security officer";

/// The bootstrapping password recognised in the zeroised state.
pub const PRIMARY_SO_PASSWORD: &str = "zeroised";
/// The alternate spelling, accepted for the same purpose.
pub const PRIMARY_SO_ALT_PASSWORD: &str = "zeroized";

/// The payload of a user object.
#[derive(Debug)]
pub(crate) struct UserObject {
    user_type: UserType,
    /// Capabilities are per-user, not implied by the type: the
    /// default user carries both.
    role_normal: bool,
    role_so: bool,
    state: UserState,
    name: String,
    user_id: [u8; USER_ID_SIZE],
    creator_id: [u8; USER_ID_SIZE],
    config: ConfigOptions,
    trust: TrustManager,
    keyset: Option<Handle>,
    signing_key: Option<Handle>,
    password: Option<Password>,
    /// Result of the last deferred self-test run.
    self_test_ok: bool,
}

impl UserObject {
    /// The built-in default user.
    pub(crate) fn default_user() -> Self {
        UserObject {
            user_type: UserType::SecurityOfficer,
            role_normal: true,
            role_so: true,
            state: UserState::UserInited,
            name: "Default user".into(),
            user_id: DEFAULT_USER_ID,
            creator_id: DEFAULT_USER_ID,
            config: ConfigOptions::new(),
            trust: TrustManager::new(),
            keyset: None,
            signing_key: None,
            password: None,
            self_test_ok: false,
        }
    }

    fn primary_so() -> Self {
        UserObject {
            user_type: UserType::SecurityOfficer,
            role_normal: false,
            role_so: true,
            state: UserState::SoInited,
            name: PRIMARY_SO_NAME.into(),
            user_id: PRIMARY_SO_ID,
            creator_id: PRIMARY_SO_CREATOR,
            config: ConfigOptions::new(),
            trust: TrustManager::new(),
            keyset: None,
            signing_key: None,
            password: None,
            self_test_ok: false,
        }
    }

    /// Returns the compliance level in force for this user.
    pub(crate) fn compliance_level(&self) -> ComplianceLevel {
        self.config.compliance_level()
    }

    /// Returns the trust store.
    pub(crate) fn trust(&self) -> &TrustManager {
        &self.trust
    }

    /// Returns whether the user may act as a security officer.
    pub(crate) fn is_so(&self) -> bool {
        self.role_so && self.state != UserState::Locked
    }

    pub(crate) fn attr_present(&self, attr: Attribute) -> bool {
        match attr {
            Attribute::UserPassword => self.password.is_some(),
            Attribute::UserKeyset => self.keyset.is_some(),
            _ => self.config.knows(attr),
        }
    }

    /// Handles owned outright and destroyed with the user.
    pub(crate) fn owned_handles(&self) -> Vec<Handle> {
        let mut owned = self.trust.owned_handles();
        owned.extend(self.keyset);
        owned.extend(self.signing_key);
        owned
    }

    fn user_record(&self) -> UserRecord {
        UserRecord {
            user_id: self.user_id,
            creator_id: self.creator_id,
            user_type: self.user_type,
            state: self.state,
            name: self.name.clone(),
            file_ref: 0,
            signing_public: None,
            identity_sig: None,
        }
    }
}

/// One entry of the user index.
#[derive(Clone, Debug)]
struct UserRecord {
    user_id: [u8; USER_ID_SIZE],
    creator_id: [u8; USER_ID_SIZE],
    user_type: UserType,
    state: UserState,
    name: String,
    file_ref: i64,
    /// The user's public signing key, recorded so that identities
    /// this user creates can be verified later.
    signing_public: Option<[u8; 32]>,
    /// The creator's signature over the identity fields.
    identity_sig: Option<[u8; 64]>,
}

fn user_type_code(t: UserType) -> i64 {
    match t {
        UserType::Normal => 1,
        UserType::SecurityOfficer => 2,
        UserType::CertificateAuthority => 3,
    }
}

fn user_type_from_code(code: i64) -> Result<UserType> {
    match code {
        1 => Ok(UserType::Normal),
        2 => Ok(UserType::SecurityOfficer),
        3 => Ok(UserType::CertificateAuthority),
        n => Err(Error::BadData(format!("unknown user type {}", n)).into()),
    }
}

fn user_state_code(s: UserState) -> i64 {
    match s {
        UserState::PreInit => 0,
        UserState::SoInited => 1,
        UserState::UserInited => 2,
        UserState::Locked => 3,
    }
}

fn user_state_from_code(code: i64) -> Result<UserState> {
    match code {
        0 => Ok(UserState::PreInit),
        1 => Ok(UserState::SoInited),
        2 => Ok(UserState::UserInited),
        3 => Ok(UserState::Locked),
        n => Err(Error::BadData(
            format!("unknown user state {}", n)).into()),
    }
}

impl UserRecord {
    fn identity_digest(&self) -> Vec<u8> {
        let mut h = Soft::hasher(HashAlgorithm::Sha256);
        h.update(&self.user_id);
        h.update(&self.creator_id);
        h.update(self.name.as_bytes());
        h.finish()
    }

    fn serialize(&self, w: &mut Writer) -> Result<()> {
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_octet_string(&self.user_id);
            w.write_octet_string(&self.creator_id);
            w.write_integer(user_type_code(self.user_type));
            w.write_integer(user_state_code(self.state));
            w.write_string(ber::TAG_UTF8_STRING, &self.name);
            w.write_integer(self.file_ref);
            if let Some(public) = &self.signing_public {
                w.write_primitive(ber::tag_context_primitive(0), public);
            }
            if let Some(sig) = &self.identity_sig {
                w.write_primitive(ber::tag_context_primitive(1), sig);
            }
            Ok(())
        })
    }

    fn parse(r: &mut Reader) -> Result<UserRecord> {
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let user_id: [u8; USER_ID_SIZE] = r.read_octet_string()?
                .as_slice().try_into()
                .map_err(|_| anyhow::Error::from(Error::BadData(
                    "bad user id length".into())))?;
            let creator_id: [u8; USER_ID_SIZE] = r.read_octet_string()?
                .as_slice().try_into()
                .map_err(|_| anyhow::Error::from(Error::BadData(
                    "bad creator id length".into())))?;
            let user_type = user_type_from_code(r.read_integer()?)?;
            let state = user_state_from_code(r.read_integer()?)?;
            let name = r.read_string(&[ber::TAG_UTF8_STRING])?;
            let file_ref = r.read_integer()?;
            let mut record = UserRecord {
                user_id, creator_id, user_type, state, name, file_ref,
                signing_public: None,
                identity_sig: None,
            };
            while !r.is_empty() {
                let tag = r.peek_tag()?;
                if tag == ber::tag_context_primitive(0) {
                    record.signing_public = Some(
                        r.read_value(tag)?.try_into()
                            .map_err(|_| anyhow::Error::from(
                                Error::BadData(
                                    "bad signing key length".into())))?);
                } else if tag == ber::tag_context_primitive(1) {
                    record.identity_sig = Some(
                        r.read_value(tag)?.try_into()
                            .map_err(|_| anyhow::Error::from(
                                Error::BadData(
                                    "bad identity signature".into())))?);
                } else {
                    return Err(Error::BadData(
                        format!("unknown index member {:#04x}", tag))
                        .into());
                }
            }
            Ok(record)
        })
    }
}

/// The flat, append-oriented user index.  Lookup is linear; the
/// namespace is flat because a user is looked up before its creator
/// is known.
#[derive(Debug, Default)]
struct UserIndex {
    records: Vec<UserRecord>,
}

impl UserIndex {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            for record in &self.records {
                record.serialize(w)?;
            }
            Ok(())
        })?;
        Ok(w.into_vec())
    }

    fn decode(data: &[u8]) -> Result<UserIndex> {
        let mut index = UserIndex::default();
        let mut r = Reader::new(data);
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            while !r.is_empty() {
                index.records.push(UserRecord::parse(r)?);
            }
            Ok(())
        })?;
        Ok(index)
    }

    fn find_by_name(&self, name: &str) -> Option<&UserRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    fn find_by_id(&self, id: &[u8; USER_ID_SIZE])
                  -> Option<&UserRecord> {
        self.records.iter().find(|record| &record.user_id == id)
    }
}

// The per-user configuration container: the options-and-trust
// payload, an optional sealed signing key, and an HMAC keyed from
// the user's password when one is set.

fn mac_key(password: &Password, user_id: &[u8]) -> Result<Vec<u8>> {
    // The container MAC key is derived from the password, salted
    // with the user id so identical passwords diverge.
    Ok(password.derive_key(user_id, 32)?.as_ref().to_vec())
}

fn encode_container(payload: &[u8], signing: Option<&PrivateBlob>,
                    password: Option<&Password>, user_id: &[u8])
                    -> Result<Vec<u8>> {
    let mut w = Writer::new();
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        w.write_octet_string(payload);
        if let Some(blob) = signing {
            match blob {
                PrivateBlob::Protected { salt, iv, data } => {
                    w.write_constructed(ber::tag_context(1), |w| {
                        w.write_octet_string(salt);
                        w.write_octet_string(iv);
                        w.write_octet_string(data);
                        Ok(())
                    })?;
                }
                PrivateBlob::Plain(data) => {
                    w.write_primitive(ber::tag_context_primitive(2),
                                      data);
                }
            }
        }
        if let Some(password) = password {
            let key = mac_key(password, user_id)?;
            let mut mac = Soft::mac(HashAlgorithm::Sha256, &key)?;
            mac.update(payload);
            w.write_primitive(ber::tag_context_primitive(0),
                              &mac.finish());
        }
        Ok(())
    })?;
    Ok(w.into_vec())
}

fn decode_container(data: &[u8], password: Option<&Password>,
                    user_id: &[u8])
                    -> Result<(Vec<u8>, Option<PrivateBlob>)> {
    let mut r = Reader::new(data);
    let out = r.read_constructed(ber::TAG_SEQUENCE, |r| {
        let payload = r.read_octet_string()?;
        let mut signing = None;
        let mut mac_value = None;
        while !r.is_empty() {
            let tag = r.peek_tag()?;
            if tag == ber::tag_context(1) {
                signing = Some(r.read_constructed(tag, |r| {
                    Ok(PrivateBlob::Protected {
                        salt: r.read_octet_string()?,
                        iv: r.read_octet_string()?,
                        data: r.read_octet_string()?,
                    })
                })?);
            } else if tag == ber::tag_context_primitive(2) {
                signing = Some(PrivateBlob::Plain(
                    r.read_value(tag)?.to_vec()));
            } else if tag == ber::tag_context_primitive(0) {
                mac_value = Some(r.read_value(tag)?.to_vec());
            } else {
                return Err(Error::BadData(format!(
                    "unknown container member {:#04x}", tag)).into());
            }
        }
        match (password, mac_value) {
            (Some(password), Some(mac_value)) => {
                let key = mac_key(password, user_id)?;
                let mut mac = Soft::mac(HashAlgorithm::Sha256, &key)?;
                mac.update(&payload);
                if !secure_cmp(&mac.finish(), &mac_value) {
                    return Err(Error::BadSignature(
                        "configuration MAC does not verify".into())
                        .into());
                }
            }
            (Some(_), None) => {
                return Err(Error::BadSignature(
                    "configuration container is unauthenticated".into())
                    .into());
            }
            (None, _) => (),
        }
        Ok((payload, signing))
    })?;
    if !r.is_empty() {
        return Err(Error::BadData(
            "trailing bytes after container".into()).into());
    }
    Ok(out)
}

// The config blob slot maps user ids to containers.

fn read_containers(kernel: &Kernel, keyset: Handle)
                   -> Result<Vec<([u8; USER_ID_SIZE], Vec<u8>)>> {
    let blob = match kernel.send_internal(
        keyset, Message::GetAttribute(Attribute::KeysetConfigData))
    {
        Ok(reply) => reply.into_bytes()?,
        Err(err) if Error::matches(&err,
            |e| matches!(e, Error::NotFound(_))) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut out = Vec::new();
    let mut r = Reader::new(&blob);
    r.read_constructed(ber::TAG_SEQUENCE, |r| {
        while !r.is_empty() {
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let id: [u8; USER_ID_SIZE] = r.read_octet_string()?
                    .as_slice().try_into()
                    .map_err(|_| anyhow::Error::from(Error::BadData(
                        "bad user id length".into())))?;
                let container = r.read_octet_string()?;
                out.push((id, container));
                Ok(())
            })?;
        }
        Ok(())
    })?;
    Ok(out)
}

fn write_containers(kernel: &Kernel, keyset: Handle,
                    containers: &[([u8; USER_ID_SIZE], Vec<u8>)])
                    -> Result<()> {
    let mut w = Writer::new();
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        for (id, container) in containers {
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_octet_string(id);
                w.write_octet_string(container);
                Ok(())
            })?;
        }
        Ok(())
    })?;
    kernel.send_internal(keyset, Message::SetAttribute(
        Attribute::KeysetConfigData,
        AttributeValue::Bytes(w.into_vec())))?;
    Ok(())
}

fn store_container(kernel: &Kernel, keyset: Handle,
                   user_id: &[u8; USER_ID_SIZE], container: Vec<u8>)
                   -> Result<()> {
    let mut containers = read_containers(kernel, keyset)?;
    match containers.iter_mut().find(|(id, _)| id == user_id) {
        Some(slot) => slot.1 = container,
        None => containers.push((*user_id, container)),
    }
    write_containers(kernel, keyset, &containers)
}

fn read_index(kernel: &Kernel, keyset: Handle)
              -> Result<Option<UserIndex>> {
    match kernel.send_internal(
        keyset, Message::GetAttribute(Attribute::KeysetUserIndex))
    {
        Ok(reply) => Ok(Some(UserIndex::decode(&reply.into_bytes()?)?)),
        Err(err) if Error::matches(&err,
            |e| matches!(e, Error::NotFound(_))) => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_index(kernel: &Kernel, keyset: Handle, index: &UserIndex)
               -> Result<()> {
    kernel.send_internal(keyset, Message::SetAttribute(
        Attribute::KeysetUserIndex,
        AttributeValue::Bytes(index.encode()?)))?;
    Ok(())
}

/// Rewrites a user's recorded lifecycle state in the index.
fn update_index_state(kernel: &Kernel, keyset: Handle,
                      user_id: &[u8; USER_ID_SIZE], state: UserState)
                      -> Result<()> {
    let Some(mut index) = read_index(kernel, keyset)? else {
        return Ok(());
    };
    for record in index.records.iter_mut() {
        if &record.user_id == user_id {
            record.state = state;
        }
    }
    write_index(kernel, keyset, &index)
}

/// Erases all user data, returning the store to its post-install
/// state.
pub fn zeroise(kernel: &Kernel, keyset: Handle) -> Result<()> {
    kernel.with_payload(keyset, |payload| match payload {
        ObjectPayload::Keyset(k) => k.backend_mut().clear(),
        _ => Err(Error::ArgumentValue("not a keyset".into()).into()),
    })?;
    kernel.with_payload(keyset, |payload| match payload {
        ObjectPayload::Keyset(k) => k.backend_mut().commit(),
        _ => Err(Error::ArgumentValue("not a keyset".into()).into()),
    })?;
    warn!("store zeroised");
    Ok(())
}

fn insert_user(kernel: &Kernel, user: UserObject) -> Result<Handle> {
    let handle = kernel.create_object(
        ObjectType::User, ObjectSubtype::None, None,
        ObjectPayload::User(user))?;
    kernel.mark_ready(handle)?;
    Ok(handle)
}

/// Logs a user in against the given store.
///
/// In the zeroised state the only recognised identity is the primary
/// security officer with the bootstrapping password; logging in with
/// it erases the store and creates the primary SO record.
pub fn login(kernel: &Kernel, keyset: Handle, name: &str,
             password: &str) -> Result<Handle> {
    let index = read_index(kernel, keyset)?;
    let Some(index) = index else {
        // Zeroised state.
        if name != PRIMARY_SO_NAME
            || (password != PRIMARY_SO_PASSWORD
                && password != PRIMARY_SO_ALT_PASSWORD)
        {
            return Err(Error::WrongKey.into());
        }
        zeroise(kernel, keyset)?;

        let mut so = UserObject::primary_so();
        so.keyset = Some(keyset);
        let signing = crate::crypto::generate_keypair(
            kernel, crate::types::PublicKeyAlgorithm::Ed25519, 0)?;
        so.signing_key = Some(signing);

        let mut record = so.user_record();
        record.signing_public = Some(signing_public(kernel, signing)?);
        let mut index = UserIndex::default();
        index.records.push(record);
        write_index(kernel, keyset, &index)?;
        info!(name = PRIMARY_SO_NAME, "primary SO created");
        return insert_user(kernel, so);
    };

    let record = index.find_by_name(name)
        .ok_or_else(|| anyhow::Error::from(Error::NotFound(
            format!("no user {:?}", name))))?
        .clone();

    // Mutual authentication: the identity record must verify under
    // the creator's signing key before the user is admitted.
    if let Some(sig) = &record.identity_sig {
        let creator = index.find_by_id(&record.creator_id)
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(
                "creator record is missing".into())))?;
        let public = creator.signing_public
            .ok_or_else(|| anyhow::Error::from(Error::BadSignature(
                "creator carries no signing key".into())))?;
        if !Soft::ed25519_verify(&public, &record.identity_digest(),
                                 sig)?
        {
            return Err(Error::BadSignature(
                "identity record does not verify".into()).into());
        }
    }

    let password = Password::from(password);
    let mut user = UserObject {
        user_type: record.user_type,
        role_normal: record.user_type == UserType::Normal,
        role_so: record.user_type == UserType::SecurityOfficer,
        state: record.state,
        name: record.name.clone(),
        user_id: record.user_id,
        creator_id: record.creator_id,
        config: ConfigOptions::new(),
        trust: TrustManager::new(),
        keyset: Some(keyset),
        signing_key: None,
        password: Some(password.clone()),
        self_test_ok: false,
    };

    let containers = read_containers(kernel, keyset)?;
    if let Some((_, container)) = containers.iter()
        .find(|(id, _)| id == &record.user_id)
    {
        let (payload, signing) = decode_container(
            container, Some(&password), &record.user_id)?;
        let (config, trust) = ConfigOptions::decode(&payload)?;
        user.config = config;
        user.trust = trust;
        if let Some(blob) = signing {
            let material = unseal_private(
                &blob, Some(std::str::from_utf8(password.as_ref())
                    .map_err(|_| anyhow::Error::from(
                        Error::BadData("undecodable password".into())))?))?;
            user.signing_key = Some(
                crate::crypto::import_material(kernel, material)?);
        }
    } else if record.state != UserState::SoInited {
        // An initialised user without its container is damage.
        return Err(Error::NotFound(
            "user configuration is missing".into()).into());
    } else {
        // First login after creation: the supplied password becomes
        // the user's own and completes initialisation.
        user.state = UserState::UserInited;
    }

    debug!(name = %user.name, "user admitted");
    insert_user(kernel, user)
}

fn signing_public(kernel: &Kernel, context: Handle)
                  -> Result<[u8; 32]> {
    kernel.with_payload(context, |payload| match payload {
        ObjectPayload::Context(ctx) => match ctx.material() {
            KeyMaterial::Ed25519Private { public, .. } => Ok(*public),
            _ => Err(Error::ArgumentValue(
                "signing keys are Ed25519".into()).into()),
        },
        _ => Err(Error::ArgumentValue("not a context".into()).into()),
    })
}

/// Creates a new user, signed into the index by the creating
/// security officer.
pub fn create_user(kernel: &Kernel, so: Handle, keyset: Handle,
                   name: &str, user_type: UserType) -> Result<Handle> {
    let (so_id, so_signing) = kernel.with_payload(
        so, |payload| match payload {
            ObjectPayload::User(u) => {
                if !u.is_so() {
                    return Err(Error::Permission(
                        "only a security officer may create users"
                            .into()).into());
                }
                Ok((u.user_id, u.signing_key))
            }
            _ => Err(Error::ArgumentValue("not a user".into()).into()),
        })?;

    let mut index = read_index(kernel, keyset)?
        .ok_or_else(|| anyhow::Error::from(Error::NotInitialised(
            "store is zeroised; log the primary SO in first".into())))?;
    if index.find_by_name(name).is_some() {
        // The namespace is flat; duplicate names are rejected
        // outright.
        return Err(Error::Duplicate(
            format!("user {:?} exists", name)).into());
    }

    let mut user_id = [0u8; USER_ID_SIZE];
    Soft::random(&mut user_id)?;

    let mut record = UserRecord {
        user_id,
        creator_id: so_id,
        user_type,
        state: UserState::SoInited,
        name: name.to_string(),
        file_ref: index.records.len() as i64,
        signing_public: None,
        identity_sig: None,
    };
    if let Some(signing) = so_signing {
        let digest = record.identity_digest();
        let sig = kernel.with_payload(signing, |payload| match payload {
            ObjectPayload::Context(ctx) => ctx.sign_digest(&digest),
            _ => Err(Error::Internal(
                "dangling signing key".into()).into()),
        })?;
        record.identity_sig = Some(sig.as_slice().try_into()
            .map_err(|_| anyhow::Error::from(Error::Internal(
                "unexpected signature size".into())))?);
    }
    index.records.push(record);
    write_index(kernel, keyset, &index)?;
    info!(name, %so, "user created");

    insert_user(kernel, UserObject {
        user_type,
        role_normal: user_type == UserType::Normal,
        role_so: user_type == UserType::SecurityOfficer,
        state: UserState::SoInited,
        name: name.to_string(),
        user_id,
        creator_id: so_id,
        config: ConfigOptions::new(),
        trust: TrustManager::new(),
        keyset: Some(keyset),
        signing_key: None,
        password: None,
        self_test_ok: false,
    })
}

/// Encodes and commits the user's configuration and trust state.
///
/// The encode phase runs under the object lock like any message; the
/// commit writes through the keyset, whose own lock covers the I/O,
/// so concurrent reads of the user continue meanwhile.
fn commit_config(kernel: &Kernel, user: &mut UserObject) -> Result<()> {
    let keyset = user.keyset.ok_or_else(
        || anyhow::Error::from(Error::NotAvailable(
            "user has no backing keyset".into())))?;
    let Some(payload) = user.config.encode(&user.trust)? else {
        debug!(name = %user.name, "nothing to commit");
        return Ok(());
    };
    let signing = match user.signing_key {
        Some(context) => {
            let material = kernel.with_payload(
                context, |payload| match payload {
                    ObjectPayload::Context(ctx) =>
                        ctx.clone_key_material(),
                    _ => Err(Error::Internal(
                        "dangling signing key".into()).into()),
                })?;
            let password = user.password.as_ref()
                .and_then(|p| std::str::from_utf8(p.as_ref()).ok()
                          .map(String::from));
            Some(seal_private(&material, password.as_deref())?)
        }
        None => None,
    };
    let container = encode_container(
        &payload, signing.as_ref(), user.password.as_ref(),
        &user.user_id)?;
    store_container(kernel, keyset, &user.user_id, container)?;
    user.config.clear_dirty();
    user.trust.changed = false;
    debug!(name = %user.name, "configuration committed");
    Ok(())
}

/// Handles a kernel message addressed to a user object.
pub(crate) fn dispatch(kernel: &Kernel, handle: Handle,
                       _object: &Arc<Object>, user: &mut UserObject,
                       msg: Message, _internal: bool) -> Result<Reply> {
    use AttributeValue as V;
    match msg {
        Message::GetAttribute(attr) => {
            let value = match attr {
                Attribute::UserName => V::Str(user.name.clone()),
                Attribute::UserRole =>
                    V::Int(user_type_code(user.user_type)),
                Attribute::UserState =>
                    V::Int(user_state_code(user.state)),
                Attribute::UserKeyset => match user.keyset {
                    Some(keyset) => V::Object(keyset),
                    None => return Err(Error::NotFound(
                        "user has no backing keyset".into()).into()),
                },
                Attribute::OptionSelfTestOk =>
                    V::Bool(user.self_test_ok),
                Attribute::OptionConfigChanged =>
                    V::Bool(user.config.is_dirty()
                            || user.trust.changed),
                attr => user.config.get(attr)?,
            };
            Ok(Reply::Value(value))
        }
        Message::SetAttribute(attr, value) => match attr {
            Attribute::UserPassword => {
                user.password = Some(Password::from(
                    value.into_string()?));
                // A password change completes SO-side
                // initialisation.
                if user.state == UserState::SoInited {
                    user.state = UserState::UserInited;
                    if let Some(keyset) = user.keyset {
                        update_index_state(kernel, keyset,
                                           &user.user_id, user.state)?;
                    }
                }
                Ok(Reply::Unit)
            }
            Attribute::UserName => {
                user.name = value.into_string()?;
                Ok(Reply::Unit)
            }
            Attribute::UserKeyset => {
                user.keyset = Some(value.into_object()?);
                Ok(Reply::Unit)
            }
            Attribute::OptionSelfTestOk => {
                // Two-phase: the write schedules the test; the
                // verdict lands in the pseudo-option read back by
                // `get`.
                if value.into_bool()? {
                    user.self_test_ok = Soft::self_test().is_ok();
                } else {
                    user.self_test_ok = false;
                }
                Ok(Reply::Unit)
            }
            Attribute::OptionConfigChanged => {
                if !value.into_bool()? {
                    return Err(Error::ArgumentValue(
                        "configuration changes cannot be unmade"
                            .into()).into());
                }
                commit_config(kernel, user)?;
                Ok(Reply::Unit)
            }
            attr => {
                user.config.set(attr, value)?;
                Ok(Reply::Unit)
            }
        },
        Message::DeleteAttribute(attr) => {
            user.config.delete(attr)?;
            Ok(Reply::Unit)
        }
        Message::AddTrusted { cert, single_cert } => {
            user.trust.add(kernel, cert, single_cert)?;
            Ok(Reply::Unit)
        }
        Message::RemoveTrusted(cert) => {
            let parsed = kernel.with_payload(
                cert, |payload| match payload {
                    ObjectPayload::Certificate(
                        CertObject::Single(data)) =>
                        data.cert.clone().ok_or_else(
                            || anyhow::Error::from(Error::NotInitialised(
                                "certificate is unsigned".into()))),
                    _ => Err(Error::ArgumentValue(
                        "not a certificate".into()).into()),
                })?;
            user.trust.delete(kernel, &parsed)?;
            Ok(Reply::Unit)
        }
        Message::GetTrustedIssuer(cert) => {
            let parsed = kernel.with_payload(
                cert, |payload| match payload {
                    ObjectPayload::Certificate(
                        CertObject::Single(data)) =>
                        data.cert.clone().ok_or_else(
                            || anyhow::Error::from(Error::NotInitialised(
                                "certificate is unsigned".into()))),
                    _ => Err(Error::ArgumentValue(
                        "not a certificate".into()).into()),
                })?;
            let issuer = user.trust.get_issuer(kernel, handle, &parsed)?;
            Ok(Reply::Object(issuer))
        }
        Message::EnumTrusted(target) => match target {
            None => Ok(Reply::Count(user.trust.count())),
            Some(target) => {
                let (object_type, _) = kernel.object_kind(target)?;
                if object_type != ObjectType::Keyset {
                    return Err(Error::ArgumentValue(
                        "trusted certificates enumerate into a keyset"
                            .into()).into());
                }
                let mut w = Writer::new();
                w.write_constructed(ber::TAG_SEQUENCE, |w| {
                    for encoded in user.trust.enumerate() {
                        w.write_octet_string(encoded);
                    }
                    Ok(())
                })?;
                kernel.send_internal(target, Message::SetAttribute(
                    Attribute::KeysetTrustedCerts,
                    AttributeValue::Bytes(w.into_vec())))?;
                Ok(Reply::Unit)
            }
        },
        _ => Err(Error::NotAvailable(
            "users accept no such message".into()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyset::{self, KeysetOptions};

    fn store(kernel: &Kernel) -> Handle {
        keyset::open(kernel, None, KeysetOptions::Create).unwrap()
    }

    #[test]
    fn zeroised_store_bootstraps_primary_so() {
        let kernel = Kernel::new().unwrap();
        let keyset = store(&kernel);

        // Only the fixed bootstrapping identity is recognised.
        let err = login(&kernel, keyset, "nobody", "zeroised")
            .unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::WrongKey)));
        let err = login(&kernel, keyset, PRIMARY_SO_NAME, "guess")
            .unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::WrongKey)));

        let so = login(&kernel, keyset, PRIMARY_SO_NAME, "zeroized")
            .unwrap();
        let state = kernel.send(so, Message::GetAttribute(
            Attribute::UserState)).unwrap().into_int().unwrap();
        assert_eq!(state, user_state_code(UserState::SoInited));

        // A password change completes initialisation.
        kernel.send(so, Message::SetAttribute(
            Attribute::UserPassword,
            AttributeValue::Str("s3cret".into()))).unwrap();
        let state = kernel.send(so, Message::GetAttribute(
            Attribute::UserState)).unwrap().into_int().unwrap();
        assert_eq!(state, user_state_code(UserState::UserInited));
    }

    #[test]
    fn so_creates_users_with_verified_identity() {
        let kernel = Kernel::new().unwrap();
        let keyset = store(&kernel);
        let so = login(&kernel, keyset, PRIMARY_SO_NAME, "zeroised")
            .unwrap();

        let alice = create_user(&kernel, so, keyset, "alice",
                                UserType::Normal).unwrap();
        let role = kernel.send(alice, Message::GetAttribute(
            Attribute::UserRole)).unwrap().into_int().unwrap();
        assert_eq!(role, user_type_code(UserType::Normal));

        // Names are a flat namespace.
        let err = create_user(&kernel, so, keyset, "alice",
                              UserType::Normal).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Duplicate(_))));

        // An ordinary user cannot create users.
        let err = create_user(&kernel, alice, keyset, "bob",
                              UserType::Normal).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Permission(_))));

        // The created identity loads back, its record verified
        // against the SO's signing key.
        let again = login(&kernel, keyset, "alice", "alicepw").unwrap();
        let state = kernel.send(again, Message::GetAttribute(
            Attribute::UserState)).unwrap().into_int().unwrap();
        assert_eq!(state, user_state_code(UserState::UserInited));
    }

    #[test]
    fn config_commit_and_reload_roundtrip() {
        let kernel = Kernel::new().unwrap();
        let keyset = store(&kernel);
        let so = login(&kernel, keyset, PRIMARY_SO_NAME, "zeroised")
            .unwrap();
        kernel.send(so, Message::SetAttribute(
            Attribute::UserPassword,
            AttributeValue::Str("sopw".into()))).unwrap();

        // Change an option and trust a certificate.
        kernel.send(so, Message::SetAttribute(
            Attribute::OptionComplianceLevel,
            AttributeValue::Int(2))).unwrap();
        let (root, _) = crate::cert::tests::self_signed(
            &kernel, "Committed Root", true);
        kernel.send(so, Message::AddTrusted {
            cert: root, single_cert: true }).unwrap();
        assert!(kernel.send(so, Message::GetAttribute(
            Attribute::OptionConfigChanged))
            .unwrap().into_bool().unwrap());

        kernel.send(so, Message::SetAttribute(
            Attribute::OptionConfigChanged,
            AttributeValue::Bool(true))).unwrap();
        assert!(!kernel.send(so, Message::GetAttribute(
            Attribute::OptionConfigChanged))
            .unwrap().into_bool().unwrap());

        // Reload under the same password: options and trust survive.
        let reloaded = login(&kernel, keyset, PRIMARY_SO_NAME, "sopw")
            .unwrap();
        let level = kernel.send(reloaded, Message::GetAttribute(
            Attribute::OptionComplianceLevel))
            .unwrap().into_int().unwrap();
        assert_eq!(level, 2);
        let trusted = kernel.send(reloaded, Message::EnumTrusted(None))
            .unwrap().into_count().unwrap();
        assert_eq!(trusted, 1);

        // The wrong password fails the container MAC.
        let err = login(&kernel, keyset, PRIMARY_SO_NAME, "wrong")
            .unwrap_err();
        assert!(Error::matches(&err,
            |e| matches!(e, Error::BadSignature(_))));
    }

    #[test]
    fn self_test_is_two_phase() {
        let kernel = Kernel::new().unwrap();
        let user = kernel.default_user();
        assert!(!kernel.send(user, Message::GetAttribute(
            Attribute::OptionSelfTestOk)).unwrap().into_bool().unwrap());
        kernel.send(user, Message::SetAttribute(
            Attribute::OptionSelfTestOk,
            AttributeValue::Bool(true))).unwrap();
        assert!(kernel.send(user, Message::GetAttribute(
            Attribute::OptionSelfTestOk)).unwrap().into_bool().unwrap());
    }

    #[test]
    fn trust_operations_via_messages() {
        let kernel = Kernel::new().unwrap();
        let user = kernel.default_user();
        let (ca, _) = crate::cert::tests::self_signed(
            &kernel, "Msg CA", true);
        let leaf = crate::cert::tests::issue_leaf_handle(
            &kernel, ca, "Msg Leaf").0;

        kernel.send(user, Message::AddTrusted {
            cert: ca, single_cert: true }).unwrap();
        let err = kernel.send(user, Message::AddTrusted {
            cert: ca, single_cert: true }).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Duplicate(_))));

        // The trusted-issuer exchange takes the leaf and returns the
        // issuer.
        let issuer = kernel.send(user, Message::GetTrustedIssuer(leaf))
            .unwrap().into_object().unwrap();
        let cn = kernel.send(issuer, Message::GetAttribute(
            Attribute::CertCommonName)).unwrap().into_string().unwrap();
        assert_eq!(cn, "Msg CA");

        kernel.send(user, Message::RemoveTrusted(ca)).unwrap();
        assert_eq!(kernel.send(user, Message::EnumTrusted(None))
                   .unwrap().into_count().unwrap(), 0);
    }

    #[test]
    fn trusted_certs_enumerate_into_keyset() {
        let kernel = Kernel::new().unwrap();
        let user = kernel.default_user();
        let keyset = store(&kernel);
        let (a, _) = crate::cert::tests::self_signed(
            &kernel, "CTL A", true);
        let (b, _) = crate::cert::tests::self_signed(
            &kernel, "CTL B", true);
        kernel.send(user, Message::AddTrusted {
            cert: a, single_cert: true }).unwrap();
        kernel.send(user, Message::AddTrusted {
            cert: b, single_cert: true }).unwrap();
        kernel.send(user, Message::EnumTrusted(Some(keyset))).unwrap();

        let blob = kernel.send_internal(keyset, Message::GetAttribute(
            Attribute::KeysetTrustedCerts))
            .unwrap().into_bytes().unwrap();
        let mut count = 0;
        let mut r = Reader::new(&blob);
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            while !r.is_empty() {
                r.read_octet_string()?;
                count += 1;
            }
            Ok(())
        }).unwrap();
        assert_eq!(count, 2);
    }
}
