//! Message envelopes.
//!
//! An envelope is a streaming processor that assembles or parses a
//! signed, encrypted, MACed, or compressed content blob.  The caller
//! attaches resources by setting typed attributes, then drives the
//! engine with `push-data`, `flush-data`, and `pop-data` messages.
//!
//! Building freezes the attached resources into a plan at the first
//! push; from then on resource attributes are rejected.  Parsing is
//! the reverse: the engine announces missing resources by suspending
//! with a resource-required status, the caller supplies them as
//! attributes and re-pushes the unconsumed tail.
//!
//! Memory is bounded: the engine consumes input only while its
//! output window has room, so a push may accept fewer bytes than
//! offered.  A pop-flush-pop sequence never loses or duplicates
//! bytes.

use tracing::debug;

use crate::attr::{Attribute, AttributeValue, CURSOR_FIRST, CURSOR_LAST,
                  CURSOR_NEXT, CURSOR_PREVIOUS};
use crate::cert::{CertObject, Certificate, PublicKeyInfo};
use crate::crypto::backend::interface::RsaKeyParts;
use crate::crypto::{KeyMaterial, Password, Protected, SessionKey};
use crate::kernel::{Handle, Kernel, Message, ObjectPayload, ObjectSubtype,
                    PushStatus, Reply};
use crate::types::{ContentType, Direction, EnvelopeFormat, HashAlgorithm,
                   ObjectType};
use crate::{Error, Result};

mod build;
mod parse;

pub(crate) use build::Builder;
pub(crate) use parse::Parser;

/// The default output window.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// A signing or decryption key captured from a context.
#[derive(Clone, Debug)]
pub(crate) enum CapturedKey {
    Rsa(RsaKeyParts),
    Ed25519 {
        secret: Protected,
        public: [u8; 32],
    },
}

impl CapturedKey {
    fn from_material(material: KeyMaterial) -> Result<Self> {
        match material {
            KeyMaterial::RsaPrivate(parts) => Ok(CapturedKey::Rsa(parts)),
            KeyMaterial::Ed25519Private { secret, public } =>
                Ok(CapturedKey::Ed25519 { secret, public }),
            _ => Err(Error::ArgumentValue(
                "context holds no private key".into()).into()),
        }
    }

    pub(crate) fn public_info(&self) -> PublicKeyInfo {
        match self {
            CapturedKey::Rsa(parts) => PublicKeyInfo::Rsa {
                n: parts.n.clone(),
                e: parts.e.clone(),
            },
            CapturedKey::Ed25519 { public, .. } =>
                PublicKeyInfo::Ed25519(*public),
        }
    }
}

/// How a signer or recipient is identified on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum KeyIdentifier {
    /// Encoded issuer name plus serial number.
    IssuerSerial(Vec<u8>, Vec<u8>),
    /// A subject-key-identifier.
    KeyId(Vec<u8>),
}

/// A signer attached to a building envelope.
#[derive(Debug)]
pub(crate) struct SignerSpec {
    pub key: CapturedKey,
    pub sid: KeyIdentifier,
    /// The signer's certificate, carried in the output when known.
    pub cert: Option<Vec<u8>>,
}

/// A public-key recipient attached to a building envelope.
#[derive(Debug)]
pub(crate) struct RecipientSpec {
    pub key: PublicKeyInfo,
    pub rid: KeyIdentifier,
}

/// The resources attached to an envelope.
#[derive(Debug, Default)]
pub(crate) struct Resources {
    pub password: Option<Password>,
    pub signers: Vec<SignerSpec>,
    pub recipient: Option<RecipientSpec>,
    pub session_key: Option<SessionKey>,
    pub mac_key: Option<Vec<u8>>,
    pub private_key: Option<CapturedKey>,
    pub decrypt_keyset: Option<Handle>,
    pub hash_algo: Option<HashAlgorithm>,
    pub compress: bool,
    pub content_type: Option<ContentType>,
    pub data_size: Option<u64>,
    pub detached: bool,
    pub detached_hash: Option<Vec<u8>>,
}

/// The engine behind an envelope, one per direction.
#[derive(Debug)]
enum Engine {
    /// Building, before the first push freezes the plan.
    Pending,
    Build(Builder),
    Parse(Parser),
}

/// The payload of an envelope object.
#[derive(Debug)]
pub(crate) struct EnvelopeObject {
    format: EnvelopeFormat,
    direction: Direction,
    buffer_size: usize,
    resources: Resources,
    engine: Engine,
    signer_cursor: usize,
}

impl EnvelopeObject {
    fn new(format: EnvelopeFormat, direction: Direction) -> Self {
        let engine = match direction {
            Direction::Building => Engine::Pending,
            Direction::Parsing => Engine::Parse(Parser::new(format)),
        };
        EnvelopeObject {
            format,
            direction,
            buffer_size: DEFAULT_BUFFER_SIZE,
            resources: Resources::default(),
            engine,
            signer_cursor: 0,
        }
    }

    /// Reports whether an attribute is set, for the ACL engine's
    /// dependency checks.
    pub(crate) fn attr_present(&self, attr: Attribute) -> bool {
        let r = &self.resources;
        match attr {
            Attribute::EnvPassword => r.password.is_some(),
            Attribute::EnvSigningKey => !r.signers.is_empty(),
            Attribute::EnvRecipientKey => r.recipient.is_some(),
            Attribute::EnvSessionKey => r.session_key.is_some(),
            Attribute::EnvMacKey => r.mac_key.is_some(),
            Attribute::EnvPrivateKey => r.private_key.is_some(),
            Attribute::EnvKeysetDecrypt => r.decrypt_keyset.is_some(),
            Attribute::EnvHashAlgorithm => r.hash_algo.is_some(),
            Attribute::EnvCompression => r.compress,
            Attribute::EnvContentType => r.content_type.is_some(),
            Attribute::EnvDataSize => r.data_size.is_some(),
            Attribute::EnvDetachedSignature => r.detached,
            Attribute::EnvDetachedHash => r.detached_hash.is_some(),
            _ => false,
        }
    }

    fn frozen(&self) -> bool {
        matches!(self.engine, Engine::Build(_))
    }

    /// The resources the engine is still waiting for.
    fn required(&self) -> Vec<Attribute> {
        match &self.engine {
            Engine::Parse(parser) => parser.required(&self.resources),
            _ => Vec::new(),
        }
    }
}

/// Creates an envelope object.
pub fn create(kernel: &Kernel, format: EnvelopeFormat,
              direction: Direction) -> Result<Handle> {
    if format == EnvelopeFormat::Pgp {
        return Err(Error::NotAvailable(
            "the OpenPGP envelope format is not yet wired up".into())
            .into());
    }
    let handle = kernel.create_object(
        ObjectType::Envelope, ObjectSubtype::None,
        Some(kernel.default_user()),
        ObjectPayload::Envelope(EnvelopeObject::new(format, direction)))?;
    kernel.mark_ready(handle)?;
    debug!(%handle, ?format, ?direction, "created envelope");
    Ok(handle)
}

/// Captures the private key behind a context or certificate handle.
fn capture_private_key(kernel: &Kernel, handle: Handle)
                       -> Result<CapturedKey> {
    kernel.with_payload(handle, |payload| match payload {
        ObjectPayload::Context(ctx) =>
            CapturedKey::from_material(ctx.clone_key_material()?),
        _ => Err(Error::ArgumentValue("not a context".into()).into()),
    })
}

/// Resolves a signing-key attribute value: a bare context, or a
/// certificate whose dependent context holds the key.
fn capture_signer(kernel: &Kernel, handle: Handle) -> Result<SignerSpec> {
    let (object_type, _) = kernel.object_kind(handle)?;
    match object_type {
        ObjectType::Context => {
            let key = capture_private_key(kernel, handle)?;
            let sid = KeyIdentifier::KeyId(
                spki_key_id(&key.public_info())?);
            Ok(SignerSpec { key, sid, cert: None })
        }
        ObjectType::Certificate => {
            let (sid, cert_bytes) = kernel.with_payload(
                handle, |payload| match payload {
                    ObjectPayload::Certificate(
                        CertObject::Single(data)) => {
                        let cert = data.cert.as_ref().ok_or_else(
                            || anyhow::Error::from(Error::NotInitialised(
                                "certificate is unsigned".into())))?;
                        Ok((issuer_serial_of(cert)?,
                            cert.encoded().to_vec()))
                    }
                    _ => Err(Error::ArgumentValue(
                        "not a certificate".into()).into()),
                })?;
            let key_handle = kernel.dependent_of(handle)?
                .ok_or_else(|| anyhow::Error::from(Error::NotInitialised(
                    "certificate has no bound key".into())))?;
            let key = capture_private_key(kernel, key_handle)?;
            Ok(SignerSpec { key, sid, cert: Some(cert_bytes) })
        }
        _ => Err(Error::ArgumentValue(
            "signing key must be a context or certificate".into()).into()),
    }
}

/// Resolves a recipient attribute value to its public key.
fn capture_recipient(kernel: &Kernel, handle: Handle)
                     -> Result<RecipientSpec> {
    let (object_type, _) = kernel.object_kind(handle)?;
    kernel.with_payload(handle, |payload| match (object_type, payload) {
        (ObjectType::Context, ObjectPayload::Context(ctx)) => {
            let key = PublicKeyInfo::from_material(ctx.material())?;
            let rid = KeyIdentifier::KeyId(spki_key_id(&key)?);
            Ok(RecipientSpec { key, rid })
        }
        (ObjectType::Certificate,
         ObjectPayload::Certificate(CertObject::Single(data))) => {
            let cert = data.cert.as_ref().ok_or_else(
                || anyhow::Error::from(Error::NotInitialised(
                    "certificate is unsigned".into())))?;
            Ok(RecipientSpec {
                key: cert.public_key().clone(),
                rid: issuer_serial_of(cert)?,
            })
        }
        _ => Err(Error::ArgumentValue(
            "recipient must be a context or certificate".into()).into()),
    })
}

fn issuer_serial_of(cert: &Certificate) -> Result<KeyIdentifier> {
    let mut w = crate::ber::Writer::new();
    cert.issuer().serialize(&mut w)?;
    Ok(KeyIdentifier::IssuerSerial(w.into_vec(),
                                   cert.serial().to_vec()))
}

fn spki_key_id(key: &PublicKeyInfo) -> Result<Vec<u8>> {
    let mut w = crate::ber::Writer::new();
    key.serialize(&mut w)?;
    let mut h = <crate::crypto::backend::Soft as
                 crate::crypto::backend::interface::Digest>::hasher(
        HashAlgorithm::Sha256);
    h.update(w.as_bytes());
    Ok(h.finish())
}

/// Handles a kernel message addressed to an envelope object.
pub(crate) fn dispatch(kernel: &Kernel, handle: Handle,
                       env: &mut EnvelopeObject, msg: Message)
                       -> Result<Reply> {
    match msg {
        Message::GetAttribute(attr) => get_attribute(kernel, env, attr),
        Message::SetAttribute(attr, value) =>
            set_attribute(kernel, env, attr, value),
        Message::DeleteAttribute(attr) => Err(Error::NotAvailable(
            format!("{} cannot be deleted", attr)).into()),
        Message::PushData(data) => push_data(kernel, env, &data),
        Message::FlushData => flush_data(kernel, env),
        Message::PopData(max) => {
            let out = match &mut env.engine {
                Engine::Pending => Vec::new(),
                Engine::Build(builder) => builder.pop(max),
                Engine::Parse(parser) => parser.pop(max),
            };
            Ok(Reply::Pop(out))
        }
        _ => Err(Error::NotAvailable(
            format!("envelopes accept no such message (object {})",
                    handle)).into()),
    }
}

fn get_attribute(kernel: &Kernel, env: &mut EnvelopeObject,
                 attr: Attribute) -> Result<Reply> {
    use AttributeValue as V;
    let value = match attr {
        Attribute::EnvHashAlgorithm => V::Int(
            match env.resources.hash_algo.unwrap_or_default() {
                HashAlgorithm::Sha256 => 1,
                HashAlgorithm::Sha512 => 2,
            }),
        Attribute::EnvCompression => V::Bool(env.resources.compress),
        Attribute::EnvContentType => V::Int(
            content_type_code(env.resources.content_type
                              .unwrap_or_default())),
        Attribute::EnvDetachedSignature => V::Bool(env.resources.detached),
        Attribute::EnvBufferSize => V::Int(env.buffer_size as i64),
        Attribute::EnvResourceRequired => {
            let required = env.required();
            match required.first() {
                Some(attr) => V::Int(attr.id() as i64),
                None => return Err(Error::NotFound(
                    "no outstanding resources".into()).into()),
            }
        }
        Attribute::EnvCurrentSigner =>
            V::Int(env.signer_cursor as i64),
        Attribute::EnvSignatureResult => {
            let cursor = env.signer_cursor;
            let parser = parsing(env)?;
            let ok = parser.signer_result(cursor)?;
            V::Int(if ok { 0 } else { 1 })
        }
        Attribute::EnvSignatureCert => {
            let cursor = env.signer_cursor;
            let parser = parsing(env)?;
            match parser.signer_cert_handle(kernel, cursor)? {
                Some(handle) => V::Object(handle),
                None => return Err(Error::NotFound(
                    "signer carried no certificate".into()).into()),
            }
        }
        _ => return Err(Error::NotAvailable(
            format!("{} on an envelope", attr)).into()),
    };
    Ok(Reply::Value(value))
}

fn parsing(env: &mut EnvelopeObject) -> Result<&mut Parser> {
    match &mut env.engine {
        Engine::Parse(parser) => Ok(parser),
        _ => Err(Error::NotAvailable(
            "only parsing envelopes carry signer results".into()).into()),
    }
}

fn content_type_code(t: ContentType) -> i64 {
    match t {
        ContentType::Data => 1,
        ContentType::SignedData => 2,
        ContentType::EnvelopedData => 3,
        ContentType::CompressedData => 4,
        ContentType::AuthenticatedData => 5,
    }
}

fn content_type_from_code(code: i64) -> Result<ContentType> {
    match code {
        1 => Ok(ContentType::Data),
        2 => Ok(ContentType::SignedData),
        3 => Ok(ContentType::EnvelopedData),
        4 => Ok(ContentType::CompressedData),
        5 => Ok(ContentType::AuthenticatedData),
        _ => Err(Error::ArgumentValue(
            format!("bad content type {}", code)).into()),
    }
}

fn set_attribute(kernel: &Kernel, env: &mut EnvelopeObject,
                 attr: Attribute, value: AttributeValue) -> Result<Reply> {
    // Cursor movement and the buffer window stay live throughout.
    match attr {
        Attribute::EnvCurrentSigner => {
            let command = value.into_int()?;
            let count = match &env.engine {
                Engine::Parse(parser) => parser.signer_count(),
                _ => env.resources.signers.len(),
            };
            env.signer_cursor = move_signer_cursor(
                env.signer_cursor, count, command)?;
            return Ok(Reply::Unit);
        }
        Attribute::EnvBufferSize => {
            env.buffer_size = value.into_int()? as usize;
            return Ok(Reply::Unit);
        }
        _ => (),
    }

    if env.direction == Direction::Building && env.frozen() {
        return Err(Error::AlreadyInitialised(
            "envelope contents are frozen after the first push".into())
            .into());
    }

    let r = &mut env.resources;
    match attr {
        Attribute::EnvPassword =>
            r.password = Some(Password::from(value.into_string()?)),
        Attribute::EnvSigningKey => {
            let spec = capture_signer(kernel, value.into_object()?)?;
            if env.direction == Direction::Parsing {
                // On the parse side the attribute supplies the
                // decryption key.
                r.private_key = Some(spec.key);
            } else {
                if r.signers.iter().any(|s| s.sid == spec.sid) {
                    return Err(Error::AlreadyInitialised(
                        "this signing key is already attached".into())
                        .into());
                }
                r.signers.push(spec);
            }
        }
        Attribute::EnvRecipientKey =>
            r.recipient = Some(capture_recipient(
                kernel, value.into_object()?)?),
        Attribute::EnvPrivateKey =>
            r.private_key = Some(capture_private_key(
                kernel, value.into_object()?)?),
        Attribute::EnvSessionKey =>
            r.session_key = Some(SessionKey::from(value.into_bytes()?)),
        Attribute::EnvMacKey => r.mac_key = Some(value.into_bytes()?),
        Attribute::EnvKeysetDecrypt =>
            r.decrypt_keyset = Some(value.into_object()?),
        Attribute::EnvHashAlgorithm => {
            r.hash_algo = Some(match value.into_int()? {
                1 => HashAlgorithm::Sha256,
                2 => HashAlgorithm::Sha512,
                n => return Err(Error::ArgumentRange(
                    format!("bad hash algorithm {}", n)).into()),
            });
        }
        Attribute::EnvCompression => r.compress = value.into_bool()?,
        Attribute::EnvContentType =>
            r.content_type = Some(content_type_from_code(
                value.into_int()?)?),
        Attribute::EnvDataSize =>
            r.data_size = Some(value.into_int()? as u64),
        Attribute::EnvDetachedSignature =>
            r.detached = value.into_bool()?,
        Attribute::EnvDetachedHash =>
            r.detached_hash = Some(value.into_bytes()?),
        _ => return Err(Error::NotAvailable(
            format!("{} on an envelope", attr)).into()),
    }
    Ok(Reply::Unit)
}

fn move_signer_cursor(current: usize, count: usize, command: i64)
                      -> Result<usize> {
    if count == 0 {
        return Err(Error::NotFound("no signers".into()).into());
    }
    match command {
        CURSOR_FIRST => Ok(0),
        CURSOR_LAST => Ok(count - 1),
        CURSOR_NEXT if current + 1 < count => Ok(current + 1),
        CURSOR_NEXT => Err(Error::NotFound("no next signer".into()).into()),
        CURSOR_PREVIOUS if current > 0 => Ok(current - 1),
        CURSOR_PREVIOUS => Err(Error::NotFound(
            "no previous signer".into()).into()),
        _ => Err(Error::ArgumentValue(
            format!("bad cursor command {}", command)).into()),
    }
}

fn push_data(kernel: &Kernel, env: &mut EnvelopeObject, data: &[u8])
             -> Result<Reply> {
    let cap = env.buffer_size;
    match &mut env.engine {
        Engine::Pending => {
            let mut builder = Builder::new(env.format, &env.resources)?;
            let consumed = builder.push(data, cap)?;
            env.engine = Engine::Build(builder);
            Ok(Reply::Push { consumed, status: PushStatus::Accepted })
        }
        Engine::Build(builder) => {
            let consumed = builder.push(data, cap)?;
            Ok(Reply::Push { consumed, status: PushStatus::Accepted })
        }
        Engine::Parse(parser) => {
            let (consumed, status) =
                parser.push(kernel, data, &env.resources, cap)?;
            Ok(Reply::Push { consumed, status })
        }
    }
}

fn flush_data(kernel: &Kernel, env: &mut EnvelopeObject) -> Result<Reply> {
    let cap = env.buffer_size;
    match &mut env.engine {
        Engine::Pending => {
            // Flushing an empty envelope still emits the framing.
            let mut builder = Builder::new(env.format, &env.resources)?;
            let result = builder.flush(cap);
            env.engine = Engine::Build(builder);
            result.map(|_| Reply::Unit)
        }
        Engine::Build(builder) => builder.flush(cap).map(|_| Reply::Unit),
        Engine::Parse(parser) =>
            parser.flush(kernel, &env.resources).map(|_| Reply::Unit),
    }
}

#[cfg(test)]
mod tests;
