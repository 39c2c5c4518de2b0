use crate::attr::{Attribute, AttributeValue, CURSOR_FIRST, CURSOR_NEXT};
use crate::cert::tests::self_signed;
use crate::crypto;
use crate::kernel::{Message, PushStatus};
use crate::types::{Direction, EnvelopeFormat, PublicKeyAlgorithm};
use crate::{Error, Handle, Kernel};

fn set(kernel: &Kernel, env: Handle, attr: Attribute,
       value: AttributeValue) {
    kernel.send(env, Message::SetAttribute(attr, value)).unwrap();
}

fn push_all(kernel: &Kernel, env: Handle, mut data: &[u8]) {
    loop {
        let (consumed, status) = kernel
            .send(env, Message::PushData(data.to_vec()))
            .unwrap().into_push().unwrap();
        assert_ne!(status, PushStatus::ResourceRequired);
        data = &data[consumed..];
        if data.is_empty() {
            break;
        }
        // The window is full; drain it.
        assert!(!pop_some(kernel, env).is_empty());
    }
}

fn pop_some(kernel: &Kernel, env: Handle) -> Vec<u8> {
    kernel.send(env, Message::PopData(1 << 20))
        .unwrap().into_bytes().unwrap()
}

fn pop_all(kernel: &Kernel, env: Handle) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = pop_some(kernel, env);
        if chunk.is_empty() {
            return out;
        }
        out.extend_from_slice(&chunk);
    }
}

fn drain(kernel: &Kernel, env: Handle) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match kernel.send(env, Message::FlushData) {
            Ok(_) => {
                out.extend_from_slice(&pop_all(kernel, env));
                return out;
            }
            Err(err) if Error::matches(&err,
                |e| matches!(e, Error::Overflow(_))) => {
                out.extend_from_slice(&pop_all(kernel, env));
            }
            Err(err) => panic!("flush failed: {}", err),
        }
    }
}

#[test]
fn password_roundtrip() {
    let kernel = Kernel::new().unwrap();
    let payload = &b"Some test data\0"[..15];

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("Password".into()));
    set(&kernel, env, Attribute::EnvDataSize,
        AttributeValue::Int(payload.len() as i64));
    push_all(&kernel, env, payload);
    let blob = drain(&kernel, env);
    assert!(!blob.is_empty());
    kernel.destroy(env).unwrap();

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    let (consumed, status) = kernel
        .send(env, Message::PushData(blob.clone()))
        .unwrap().into_push().unwrap();
    assert_eq!(consumed, blob.len());
    assert_eq!(status, PushStatus::ResourceRequired);

    // The envelope names the missing resource.
    let required = kernel.send(env, Message::GetAttribute(
        Attribute::EnvResourceRequired)).unwrap().into_int().unwrap();
    assert_eq!(required as u32, Attribute::EnvPassword.id());

    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("Password".into()));
    let (_, status) = kernel.send(env, Message::PushData(Vec::new()))
        .unwrap().into_push().unwrap();
    assert_eq!(status, PushStatus::Accepted);
    kernel.send(env, Message::FlushData).unwrap();

    let out = pop_some(&kernel, env);
    assert_eq!(out, payload);
    // End of data yields exactly zero bytes, never an error.
    assert!(pop_some(&kernel, env).is_empty());
}

#[test]
fn session_key_roundtrip() {
    let kernel = Kernel::new().unwrap();
    let payload = b"session-keyed content".to_vec();
    let key = vec![0x5a; 32];

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvSessionKey,
        AttributeValue::Bytes(key.clone()));
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    let (_, status) = kernel.send(env, Message::PushData(blob))
        .unwrap().into_push().unwrap();
    assert_eq!(status, PushStatus::ResourceRequired);
    let required = kernel.send(env, Message::GetAttribute(
        Attribute::EnvResourceRequired)).unwrap().into_int().unwrap();
    assert_eq!(required as u32, Attribute::EnvSessionKey.id());
    set(&kernel, env, Attribute::EnvSessionKey,
        AttributeValue::Bytes(key));
    kernel.send(env, Message::PushData(Vec::new())).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), payload);
}

#[test]
fn public_key_recipient_roundtrip() {
    let kernel = Kernel::new().unwrap();
    let payload = b"for your eyes only".to_vec();
    let key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Rsa, 1024).unwrap();

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvRecipientKey,
        AttributeValue::Object(key));
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    let (_, status) = kernel.send(env, Message::PushData(blob))
        .unwrap().into_push().unwrap();
    assert_eq!(status, PushStatus::ResourceRequired);
    set(&kernel, env, Attribute::EnvPrivateKey,
        AttributeValue::Object(key));
    kernel.send(env, Message::PushData(Vec::new())).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), payload);
}

#[test]
fn multi_signer_envelope() {
    let kernel = Kernel::new().unwrap();
    let payload = b"signed by two hands".to_vec();
    let (alice, _) = self_signed(&kernel, "Alice", false);
    let (bob, _) = self_signed(&kernel, "Bob", false);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(alice));
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(bob));
    // Re-adding the same key is rejected and changes nothing.
    let err = kernel.send(env, Message::SetAttribute(
        Attribute::EnvSigningKey, AttributeValue::Object(alice)))
        .unwrap_err();
    assert!(Error::matches(&err,
        |e| matches!(e, Error::AlreadyInitialised(_))));

    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    let (_, status) = kernel.send(env, Message::PushData(blob))
        .unwrap().into_push().unwrap();
    assert_eq!(status, PushStatus::Accepted);
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), payload);

    // Walk the signers: two verify, a third does not exist.
    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_FIRST));
    assert_eq!(kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap(), 0);
    let cert = kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureCert)).unwrap().into_object().unwrap();
    let cn = kernel.send(cert, Message::GetAttribute(
        Attribute::CertCommonName)).unwrap().into_string().unwrap();
    assert_eq!(cn, "Alice");

    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_NEXT));
    assert_eq!(kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap(), 0);

    let err = kernel.send(env, Message::SetAttribute(
        Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_NEXT))).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
}

#[test]
fn tampered_signed_content_fails_verification() {
    let kernel = Kernel::new().unwrap();
    let (signer, _) = self_signed(&kernel, "Sig", false);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(signer));
    push_all(&kernel, env, b"original content");
    let mut blob = drain(&kernel, env);

    // Flip a bit inside the content chunk.
    let window = b"original";
    let at = blob.windows(window.len())
        .position(|w| w == window).unwrap();
    blob[at] ^= 0x20;

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_FIRST));
    assert_eq!(kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap(), 1);
}

#[cfg(feature = "compression-deflate")]
#[test]
fn compressed_roundtrip_reports_end_once() {
    let kernel = Kernel::new().unwrap();
    let payload: Vec<u8> = b"squeeze me ".iter().cycle()
        .take(4000).copied().collect();

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvCompression,
        AttributeValue::Bool(true));
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);
    assert!(blob.len() < payload.len());

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    let mut rest: &[u8] = &blob;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (consumed, _) = kernel
            .send(env, Message::PushData(rest.to_vec()))
            .unwrap().into_push().unwrap();
        rest = &rest[consumed..];
        out.extend_from_slice(&pop_all(&kernel, env));
    }
    kernel.send(env, Message::FlushData).unwrap();
    out.extend_from_slice(&pop_all(&kernel, env));
    assert_eq!(out, payload);
    // End of data is reported exactly once; popping again yields
    // zero bytes rather than an error.
    assert!(pop_some(&kernel, env).is_empty());
    assert!(pop_some(&kernel, env).is_empty());
}

#[cfg(feature = "compression-deflate")]
#[test]
fn signing_composes_with_compression() {
    let kernel = Kernel::new().unwrap();
    let payload: Vec<u8> = b"sign then squeeze ".iter().cycle()
        .take(2000).copied().collect();
    let (signer, _) = self_signed(&kernel, "Squeezer", false);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(signer));
    set(&kernel, env, Attribute::EnvCompression,
        AttributeValue::Bool(true));
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), payload);
    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_FIRST));
    assert_eq!(kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap(), 0);
}

#[test]
fn mac_roundtrip_and_mismatch() {
    let kernel = Kernel::new().unwrap();
    let payload = b"authenticated".to_vec();
    let key = vec![0x11; 32];

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvMacKey,
        AttributeValue::Bytes(key.clone()));
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    let (_, status) = kernel.send(env, Message::PushData(blob.clone()))
        .unwrap().into_push().unwrap();
    assert_eq!(status, PushStatus::ResourceRequired);
    set(&kernel, env, Attribute::EnvMacKey,
        AttributeValue::Bytes(key));
    kernel.send(env, Message::PushData(Vec::new())).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), payload);

    // A wrong key surfaces at the trailer check.
    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    set(&kernel, env, Attribute::EnvMacKey,
        AttributeValue::Bytes(vec![0x22; 32]));
    kernel.send(env, Message::PushData(Vec::new())).unwrap();
    let err = kernel.send(env, Message::FlushData).unwrap_err();
    assert!(Error::matches(&err,
        |e| matches!(e, Error::BadSignature(_))));
}

#[test]
fn detached_signature_both_paths_agree() {
    let kernel = Kernel::new().unwrap();
    let payload = b"detached payload".to_vec();
    let (signer, _) = self_signed(&kernel, "Detacher", false);

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvDetachedSignature,
        AttributeValue::Bool(true));
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(signer));
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);

    // Path one: push the signed data after the signature.
    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob.clone())).unwrap();
    kernel.send(env, Message::PushData(payload.clone())).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_FIRST));
    let via_data = kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap();

    // Path two: pre-supply the content hash.
    let digest = {
        use crate::crypto::backend::interface::Digest as _;
        let mut h = crate::crypto::backend::Soft::hasher(
            crate::types::HashAlgorithm::Sha256);
        h.update(&payload);
        h.finish()
    };
    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    set(&kernel, env, Attribute::EnvDetachedSignature,
        AttributeValue::Bool(true));
    set(&kernel, env, Attribute::EnvDetachedHash,
        AttributeValue::Bytes(digest));
    kernel.send(env, Message::FlushData).unwrap();
    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_FIRST));
    let via_hash = kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap();

    assert_eq!(via_data, 0);
    assert_eq!(via_hash, 0);
}

#[test]
fn raw_envelope_passthrough() {
    let kernel = Kernel::new().unwrap();
    let payload = b"untouched bytes".to_vec();
    let env = super::create(&kernel, EnvelopeFormat::Raw,
                            Direction::Building).unwrap();
    push_all(&kernel, env, &payload);
    let blob = drain(&kernel, env);
    assert_eq!(blob, payload);

    let env = super::create(&kernel, EnvelopeFormat::Raw,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), payload);
}

#[test]
fn overflow_then_retry_completes() {
    let kernel = Kernel::new().unwrap();
    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvBufferSize,
        AttributeValue::Int(1024));
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("Password".into()));

    // Fill the window so the trailer cannot fit.
    let payload = vec![0xabu8; 4096];
    let mut rest: &[u8] = &payload;
    let mut blob = Vec::new();
    while !rest.is_empty() {
        let (consumed, _) = kernel
            .send(env, Message::PushData(rest.to_vec()))
            .unwrap().into_push().unwrap();
        rest = &rest[consumed..];
        if consumed == 0 {
            blob.extend_from_slice(&pop_all(&kernel, env));
        }
    }
    let err = kernel.send(env, Message::FlushData).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Overflow(_))));
    blob.extend_from_slice(&pop_all(&kernel, env));
    // A single pop-and-retry completes; nothing is lost or
    // duplicated.
    kernel.send(env, Message::FlushData).unwrap();
    blob.extend_from_slice(&pop_all(&kernel, env));

    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("Password".into()));
    // The parse window is just as small; pump and pop until dry.
    let mut out = Vec::new();
    loop {
        kernel.send(env, Message::PushData(Vec::new())).unwrap();
        let chunk = pop_all(&kernel, env);
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    kernel.send(env, Message::FlushData).unwrap();
    out.extend_from_slice(&pop_all(&kernel, env));
    assert_eq!(out, payload);
}

#[test]
fn conflicting_layers_rejected_at_freeze() {
    let kernel = Kernel::new().unwrap();
    let (signer, _) = self_signed(&kernel, "Conflicted", false);
    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(signer));
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("pw".into()));
    let err = kernel.send(env, Message::PushData(b"x".to_vec()))
        .unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
}

#[test]
fn resources_frozen_after_first_push() {
    let kernel = Kernel::new().unwrap();
    let env = super::create(&kernel, EnvelopeFormat::Cms,
                            Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("pw".into()));
    kernel.send(env, Message::PushData(b"data".to_vec())).unwrap();
    let err = kernel.send(env, Message::SetAttribute(
        Attribute::EnvCompression, AttributeValue::Bool(true)))
        .unwrap_err();
    assert!(Error::matches(&err,
        |e| matches!(e, Error::AlreadyInitialised(_))));
}

#[test]
fn pgp_format_is_enumerated_but_unavailable() {
    let kernel = Kernel::new().unwrap();
    let err = super::create(&kernel, EnvelopeFormat::Pgp,
                            Direction::Building).unwrap_err();
    assert!(Error::matches(&err,
        |e| matches!(e, Error::NotAvailable(_))));
}
