//! End-to-end scenarios exercising the whole stack through the
//! public message interface.

use std::time::{Duration, UNIX_EPOCH};

use keystone::attr::{Attribute, AttributeValue, CURSOR_FIRST,
                     CURSOR_NEXT};
use keystone::kernel::{Message, PushStatus};
use keystone::types::{CertificateType, Direction, EnvelopeFormat,
                      KeyUsage, PublicKeyAlgorithm, RevocationReason,
                      UserType};
use keystone::{cert, crypto, envelope, keyset, user, Error, Handle,
               Kernel};

fn set(kernel: &Kernel, handle: Handle, attr: Attribute,
       value: AttributeValue) {
    kernel.send(handle, Message::SetAttribute(attr, value)).unwrap();
}

fn build_cert(kernel: &Kernel, cn: &str, ca: bool,
              algo: PublicKeyAlgorithm, bits: usize)
              -> (Handle, Handle) {
    let key = crypto::generate_keypair(kernel, algo, bits).unwrap();
    let handle = cert::create(kernel, CertificateType::Certificate)
        .unwrap();
    set(kernel, handle, Attribute::CertCommonName,
        AttributeValue::Str(cn.into()));
    if ca {
        set(kernel, handle, Attribute::CertCa,
            AttributeValue::Bool(true));
        set(kernel, handle, Attribute::CertKeyUsage, AttributeValue::Int(
            (KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN) as i64));
    } else {
        set(kernel, handle, Attribute::CertKeyUsage, AttributeValue::Int(
            KeyUsage::DIGITAL_SIGNATURE as i64));
    }
    set(kernel, handle, Attribute::CertPublicKey,
        AttributeValue::Object(key));
    (handle, key)
}

fn pop_all(kernel: &Kernel, env: Handle) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = kernel.send(env, Message::PopData(1 << 20))
            .unwrap().into_bytes().unwrap();
        if chunk.is_empty() {
            return out;
        }
        out.extend_from_slice(&chunk);
    }
}

// Scenario: a self-signed certificate survives export, destruction,
// and re-import with byte-identical encoding.
#[test]
fn self_signed_certificate_roundtrip() {
    let kernel = Kernel::new().unwrap();
    let key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Rsa, 1024).unwrap();
    let handle = cert::create(&kernel, CertificateType::Certificate)
        .unwrap();
    set(&kernel, handle, Attribute::CertCountry,
        AttributeValue::Str("NZ".into()));
    set(&kernel, handle, Attribute::CertOrganization,
        AttributeValue::Str("Dave's Wetaburgers".into()));
    set(&kernel, handle, Attribute::CertCommonName,
        AttributeValue::Str("Dave Smith".into()));
    let from = UNIX_EPOCH + Duration::from_secs(1212667994);
    set(&kernel, handle, Attribute::CertValidFrom,
        AttributeValue::Time(from));
    set(&kernel, handle, Attribute::CertValidTo,
        AttributeValue::Time(from + Duration::from_secs(365 * 86400)));
    set(&kernel, handle, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::DIGITAL_SIGNATURE | KeyUsage::KEY_ENCIPHERMENT)
            as i64));
    set(&kernel, handle, Attribute::CertPublicKey,
        AttributeValue::Object(key));
    kernel.send(handle, Message::SignCert(key)).unwrap();

    let exported = kernel.send(handle, Message::GetAttribute(
        Attribute::CertEncoded)).unwrap().into_bytes().unwrap();
    kernel.destroy(handle).unwrap();

    let imported = cert::import(&kernel, &exported).unwrap();
    kernel.send(imported, Message::SigCheck(imported)).unwrap();
    let again = kernel.send(imported, Message::GetAttribute(
        Attribute::CertEncoded)).unwrap().into_bytes().unwrap();
    assert_eq!(again, exported);
}

// Scenario: a CA-issued chain validates while the root is trusted
// and is rejected at the anchor once it is not.
#[test]
fn chain_validation_follows_trust() {
    let kernel = Kernel::new().unwrap();
    let (ca, ca_key) = build_cert(&kernel, "Scenario CA", true,
                                  PublicKeyAlgorithm::Ed25519, 0);
    kernel.send(ca, Message::SignCert(ca_key)).unwrap();
    let (leaf, _) = build_cert(&kernel, "Scenario Leaf", false,
                               PublicKeyAlgorithm::Ed25519, 0);
    kernel.send(leaf, Message::SignCert(ca)).unwrap();

    let chain = cert::create_chain(&kernel, &[leaf, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    kernel.send(chain, Message::ValidateChain(kernel.default_user()))
        .unwrap();

    let untrusted = cert::create_chain(&kernel, &[leaf, ca]).unwrap();
    let err = kernel.send(untrusted, Message::ValidateChain(
        kernel.default_user())).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let locus = kernel.send(untrusted, Message::GetAttribute(
        Attribute::ErrorLocus)).unwrap().into_int().unwrap();
    assert_eq!(locus as u32, Attribute::CertTrustedImplicit.id());

    // Trusting the root through the user's store also anchors it.
    kernel.send(kernel.default_user(), Message::AddTrusted {
        cert: ca, single_cert: true }).unwrap();
    kernel.send(untrusted, Message::ValidateChain(
        kernel.default_user())).unwrap();
}

// Scenario: password envelope round-trip, 15 bytes, with the
// resource-required suspension in the middle.
#[test]
fn password_envelope_roundtrip() {
    let kernel = Kernel::new().unwrap();
    let payload = &b"Some test data\0"[..15];

    let env = envelope::create(&kernel, EnvelopeFormat::Cms,
                               Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvDataSize,
        AttributeValue::Int(payload.len() as i64));
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("Password".into()));
    kernel.send(env, Message::PushData(payload.to_vec())).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    let blob = pop_all(&kernel, env);

    let env = envelope::create(&kernel, EnvelopeFormat::Cms,
                               Direction::Parsing).unwrap();
    let (_, status) = kernel.send(env, Message::PushData(blob))
        .unwrap().into_push().unwrap();
    assert_eq!(status, PushStatus::ResourceRequired);
    set(&kernel, env, Attribute::EnvPassword,
        AttributeValue::Str("Password".into()));
    kernel.send(env, Message::PushData(Vec::new())).unwrap();
    kernel.send(env, Message::FlushData).unwrap();

    let out = kernel.send(env, Message::PopData(1 << 20))
        .unwrap().into_bytes().unwrap();
    assert_eq!(out, payload);
    let second = kernel.send(env, Message::PopData(1 << 20))
        .unwrap().into_bytes().unwrap();
    assert!(second.is_empty());
}

// Scenario: two signers over the same payload, walked by cursor.
#[test]
fn multi_signature_envelope() {
    let kernel = Kernel::new().unwrap();
    let (alice, alice_key) = build_cert(&kernel, "Alice", false,
                                        PublicKeyAlgorithm::Ed25519, 0);
    kernel.send(alice, Message::SignCert(alice_key)).unwrap();
    let (bob, bob_key) = build_cert(&kernel, "Bob", false,
                                    PublicKeyAlgorithm::Ed25519, 0);
    kernel.send(bob, Message::SignCert(bob_key)).unwrap();

    let env = envelope::create(&kernel, EnvelopeFormat::Cms,
                               Direction::Building).unwrap();
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(alice));
    set(&kernel, env, Attribute::EnvSigningKey,
        AttributeValue::Object(bob));
    kernel.send(env, Message::PushData(b"dual payload".to_vec()))
        .unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    let blob = pop_all(&kernel, env);

    let env = envelope::create(&kernel, EnvelopeFormat::Cms,
                               Direction::Parsing).unwrap();
    kernel.send(env, Message::PushData(blob)).unwrap();
    kernel.send(env, Message::FlushData).unwrap();
    assert_eq!(pop_all(&kernel, env), b"dual payload");

    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_FIRST));
    assert_eq!(kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap(), 0);
    set(&kernel, env, Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_NEXT));
    assert_eq!(kernel.send(env, Message::GetAttribute(
        Attribute::EnvSignatureResult)).unwrap().into_int().unwrap(), 0);
    let err = kernel.send(env, Message::SetAttribute(
        Attribute::EnvCurrentSigner,
        AttributeValue::Int(CURSOR_NEXT))).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
}

// Scenario: an issuer chain asserting a permitted subtree admits
// right-anchored matches and rejects everything else, whether the
// name arrives as an alternative name or as a host-shaped subject.
#[test]
fn name_constraint_enforcement() {
    let kernel = Kernel::new().unwrap();
    let ca_key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let ca = cert::create(&kernel, CertificateType::Certificate).unwrap();
    set(&kernel, ca, Attribute::CertCommonName,
        AttributeValue::Str("Constrained Issuer".into()));
    set(&kernel, ca, Attribute::CertCa, AttributeValue::Bool(true));
    set(&kernel, ca, Attribute::CertNameConstraintPermitted,
        AttributeValue::Str("testcertificates.gov".into()));
    set(&kernel, ca, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN) as i64));
    set(&kernel, ca, Attribute::CertPublicKey,
        AttributeValue::Object(ca_key));
    kernel.send(ca, Message::SignCert(ca_key)).unwrap();

    let issue = |cn: &str, san: Option<&str>| -> Handle {
        let key = crypto::generate_keypair(
            &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
        let leaf = cert::create(&kernel, CertificateType::Certificate)
            .unwrap();
        set(&kernel, leaf, Attribute::CertCommonName,
            AttributeValue::Str(cn.into()));
        set(&kernel, leaf, Attribute::CertKeyUsage, AttributeValue::Int(
            KeyUsage::DIGITAL_SIGNATURE as i64));
        if let Some(san) = san {
            set(&kernel, leaf, Attribute::CertAltNameDns,
                AttributeValue::Str(san.into()));
        }
        set(&kernel, leaf, Attribute::CertPublicKey,
            AttributeValue::Object(key));
        kernel.send(leaf, Message::SignCert(ca)).unwrap();
        leaf
    };
    let validate = |leaf: Handle| -> keystone::Result<()> {
        let chain = cert::create_chain(&kernel, &[leaf, ca]).unwrap();
        set(&kernel, chain, Attribute::CertTrustedImplicit,
            AttributeValue::Bool(true));
        kernel.send(chain, Message::ValidateChain(kernel.default_user()))
            .map(|_| ())
    };

    // A right-anchored match is permitted.
    validate(issue("Good", Some("mytestcertificates.gov"))).unwrap();

    // A name outside the permitted subtree is rejected at the
    // name-constraints locus.
    let bad = issue("Bad", Some("mytest.example.gov"));
    let chain = cert::create_chain(&kernel, &[bad, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    let err = kernel.send(chain, Message::ValidateChain(
        kernel.default_user())).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let locus = kernel.send(chain, Message::GetAttribute(
        Attribute::ErrorLocus)).unwrap().into_int().unwrap();
    assert_eq!(locus as u32,
               Attribute::CertNameConstraintPermitted.id());

    // So is a host-shaped subject name with no alternative names.
    let err = validate(issue("mytest.example.gov", None)).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));

    // And a host-shaped subject inside the subtree passes.
    validate(issue("mytestcertificates.gov", None)).unwrap();
}

// Scenario: a CA revokes its own certificate; the CRL check reflects
// the recorded reason and dates.
#[test]
fn crl_revocation_reflects_through_check() {
    let kernel = Kernel::new().unwrap();
    let (ca, ca_key) = build_cert(&kernel, "Revoked CA", true,
                                  PublicKeyAlgorithm::Ed25519, 0);
    kernel.send(ca, Message::SignCert(ca_key)).unwrap();

    let invalidity = UNIX_EPOCH + Duration::from_secs(915_148_800);
    let crl = cert::create(&kernel, CertificateType::Crl).unwrap();
    set(&kernel, crl, Attribute::CertRevokedCert,
        AttributeValue::Object(ca));
    set(&kernel, crl, Attribute::CertRevocationReason,
        AttributeValue::Int(RevocationReason::CaCompromise.code() as i64));
    set(&kernel, crl, Attribute::CertInvalidityDate,
        AttributeValue::Time(invalidity));
    kernel.send(crl, Message::SignCert(ca)).unwrap();

    let err = kernel.send(ca, Message::CheckAgainst(crl)).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let reason = kernel.send(ca, Message::GetAttribute(
        Attribute::CertRevocationReason)).unwrap().into_int().unwrap();
    assert_eq!(reason, RevocationReason::CaCompromise.code() as i64);
    let date = kernel.send(ca, Message::GetAttribute(
        Attribute::CertInvalidityDate)).unwrap()
        .into_value().unwrap().into_time().unwrap();
    assert_eq!(date, invalidity);
}

// Scenario: a user's keyset, config, trust, and created identities
// survive a store round-trip.
#[test]
fn user_store_lifecycle() {
    let kernel = Kernel::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.kst");

    {
        let store = keyset::open(&kernel, Some(&path),
                                 keyset::KeysetOptions::Create).unwrap();
        let so = user::login(&kernel, store, user::PRIMARY_SO_NAME,
                             user::PRIMARY_SO_PASSWORD).unwrap();
        set(&kernel, so, Attribute::UserPassword,
            AttributeValue::Str("so-password".into()));
        user::create_user(&kernel, so, store, "carol",
                          UserType::Normal).unwrap();

        let (root, root_key) = build_cert(
            &kernel, "Persistent Root", true,
            PublicKeyAlgorithm::Ed25519, 0);
        kernel.send(root, Message::SignCert(root_key)).unwrap();
        kernel.send(so, Message::AddTrusted {
            cert: root, single_cert: true }).unwrap();
        set(&kernel, so, Attribute::OptionComplianceLevel,
            AttributeValue::Int(2));
        set(&kernel, so, Attribute::OptionConfigChanged,
            AttributeValue::Bool(true));
    }

    // A second kernel sees the same store from disk.
    let kernel = Kernel::new().unwrap();
    let store = keyset::open(&kernel, Some(&path),
                             keyset::KeysetOptions::ReadWrite).unwrap();
    let so = user::login(&kernel, store, user::PRIMARY_SO_NAME,
                         "so-password").unwrap();
    let level = kernel.send(so, Message::GetAttribute(
        Attribute::OptionComplianceLevel))
        .unwrap().into_int().unwrap();
    assert_eq!(level, 2);
    assert_eq!(kernel.send(so, Message::EnumTrusted(None))
               .unwrap().into_count().unwrap(), 1);
    user::login(&kernel, store, "carol", "carol-password").unwrap();

    // Zeroisation returns the store to its initial state.
    user::zeroise(&kernel, store).unwrap();
    let err = user::login(&kernel, store, "carol", "carol-password")
        .unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::WrongKey)));
}
