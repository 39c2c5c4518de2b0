use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::attr::{Attribute, AttributeValue};
use crate::crypto;
use crate::kernel::Message;
use crate::types::{CertificateType, ComplianceLevel, ErrorType, KeyUsage,
                   PublicKeyAlgorithm, RevocationReason};
use crate::{Error, Handle, Kernel};
use super::*;

fn set(kernel: &Kernel, handle: Handle, attr: Attribute,
       value: AttributeValue) {
    kernel.send(handle, Message::SetAttribute(attr, value)).unwrap();
}

fn exported(kernel: &Kernel, handle: Handle) -> Vec<u8> {
    kernel.send(handle, Message::GetAttribute(Attribute::CertEncoded))
        .unwrap().into_bytes().unwrap()
}

/// Builds a self-signed Ed25519 certificate, CA-flavoured or leaf.
pub fn self_signed(kernel: &Kernel, cn: &str, ca: bool)
                   -> (Handle, Certificate) {
    let key = crypto::generate_keypair(
        kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let cert = super::create(kernel, CertificateType::Certificate).unwrap();
    set(kernel, cert, Attribute::CertCommonName,
        AttributeValue::Str(cn.into()));
    if ca {
        set(kernel, cert, Attribute::CertCa, AttributeValue::Bool(true));
        set(kernel, cert, Attribute::CertKeyUsage, AttributeValue::Int(
            (KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN) as i64));
    } else {
        set(kernel, cert, Attribute::CertKeyUsage, AttributeValue::Int(
            KeyUsage::DIGITAL_SIGNATURE as i64));
    }
    set(kernel, cert, Attribute::CertPublicKey,
        AttributeValue::Object(key));
    kernel.send(cert, Message::SignCert(key)).unwrap();
    let parsed = Certificate::decode(&exported(kernel, cert)).unwrap();
    (cert, parsed)
}

/// Issues an Ed25519 leaf under the given CA certificate.
pub fn issue_leaf_handle(kernel: &Kernel, ca: Handle, cn: &str)
                         -> (Handle, Certificate) {
    let key = crypto::generate_keypair(
        kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let cert = super::create(kernel, CertificateType::Certificate).unwrap();
    set(kernel, cert, Attribute::CertCommonName,
        AttributeValue::Str(cn.into()));
    set(kernel, cert, Attribute::CertKeyUsage, AttributeValue::Int(
        KeyUsage::DIGITAL_SIGNATURE as i64));
    set(kernel, cert, Attribute::CertPublicKey,
        AttributeValue::Object(key));
    kernel.send(cert, Message::SignCert(ca)).unwrap();
    let parsed = Certificate::decode(&exported(kernel, cert)).unwrap();
    (cert, parsed)
}

/// Issues an Ed25519 leaf, returning the parsed certificate.
pub fn issue_leaf(kernel: &Kernel, ca: Handle, cn: &str) -> Certificate {
    issue_leaf_handle(kernel, ca, cn).1
}

#[test]
fn self_signed_roundtrip() {
    let kernel = Kernel::new().unwrap();
    let key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Rsa, 1024).unwrap();
    let cert = super::create(&kernel, CertificateType::Certificate)
        .unwrap();
    set(&kernel, cert, Attribute::CertCountry,
        AttributeValue::Str("NZ".into()));
    set(&kernel, cert, Attribute::CertOrganization,
        AttributeValue::Str("Dave's Wetaburgers".into()));
    set(&kernel, cert, Attribute::CertCommonName,
        AttributeValue::Str("Dave Smith".into()));
    let valid_from = UNIX_EPOCH + Duration::from_secs(1212667994);
    set(&kernel, cert, Attribute::CertValidFrom,
        AttributeValue::Time(valid_from));
    set(&kernel, cert, Attribute::CertValidTo,
        AttributeValue::Time(valid_from
                             + Duration::from_secs(365 * 86400)));
    set(&kernel, cert, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::DIGITAL_SIGNATURE | KeyUsage::KEY_ENCIPHERMENT)
            as i64));
    set(&kernel, cert, Attribute::CertPublicKey,
        AttributeValue::Object(key));
    kernel.send(cert, Message::SignCert(key)).unwrap();

    // The object is immutable now.
    let err = kernel.send(cert, Message::SetAttribute(
        Attribute::CertCommonName,
        AttributeValue::Str("Eve".into()))).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Permission(_))));

    let first_export = exported(&kernel, cert);
    kernel.destroy(cert).unwrap();

    let imported = super::import(&kernel, &first_export).unwrap();
    kernel.send(imported, Message::SigCheck(imported)).unwrap();
    assert!(kernel.send(imported, Message::GetAttribute(
        Attribute::CertSelfSigned)).unwrap().into_bool().unwrap());
    assert_eq!(kernel.send(imported, Message::GetAttribute(
        Attribute::CertSubjectName)).unwrap().into_string().unwrap(),
        "C=NZ, O=Dave's Wetaburgers, CN=Dave Smith");
    assert_eq!(exported(&kernel, imported), first_export);
}

#[test]
fn certificate_binds_its_key_context() {
    let kernel = Kernel::new().unwrap();
    let (cert, _) = self_signed(&kernel, "Binder", false);
    let key = kernel.send(cert, Message::GetAttribute(
        Attribute::CertPublicKey)).unwrap().into_object().unwrap();
    // The bound context cannot be destroyed out from under the
    // certificate.
    let err = kernel.destroy(key).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Busy)));
    kernel.destroy(cert).unwrap();
    kernel.destroy(key).unwrap();
}

#[test]
fn ca_chain_validates_and_trust_is_required() {
    let kernel = Kernel::new().unwrap();
    let (ca, _) = self_signed(&kernel, "Test CA", true);
    let (leaf, _) = issue_leaf_handle(&kernel, ca, "Leaf");
    kernel.send(leaf, Message::SigCheck(ca)).unwrap();

    let chain = super::create_chain(&kernel, &[leaf, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    kernel.send(chain, Message::ValidateChain(kernel.default_user()))
        .unwrap();

    // Without the trust mark the same chain is rejected at the
    // anchor.
    let untrusted = super::create_chain(&kernel, &[leaf, ca]).unwrap();
    let err = kernel.send(untrusted, Message::ValidateChain(
        kernel.default_user())).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let locus = kernel.send(untrusted, Message::GetAttribute(
        Attribute::ErrorLocus)).unwrap().into_int().unwrap();
    assert_eq!(locus as u32, Attribute::CertTrustedImplicit.id());
}

#[test]
fn wrong_issuer_fails_signature_check() {
    let kernel = Kernel::new().unwrap();
    let (ca, _) = self_signed(&kernel, "Real CA", true);
    let (other, _) = self_signed(&kernel, "Other CA", true);
    let (leaf, _) = issue_leaf_handle(&kernel, ca, "Leaf");
    let err = kernel.send(leaf, Message::SigCheck(other)).unwrap_err();
    assert!(Error::matches(&err,
        |e| matches!(e, Error::BadSignature(_))));
}

#[test]
fn path_length_constraint_boundary() {
    let kernel = Kernel::new().unwrap();

    // Root limited to zero intermediates.
    let root_key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let root = super::create(&kernel, CertificateType::Certificate)
        .unwrap();
    set(&kernel, root, Attribute::CertCommonName,
        AttributeValue::Str("Short Root".into()));
    set(&kernel, root, Attribute::CertCa, AttributeValue::Bool(true));
    set(&kernel, root, Attribute::CertPathLenConstraint,
        AttributeValue::Int(0));
    set(&kernel, root, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN) as i64));
    set(&kernel, root, Attribute::CertPublicKey,
        AttributeValue::Object(root_key));
    kernel.send(root, Message::SignCert(root_key)).unwrap();

    // Directly-issued leaf: depth 0, within the limit.
    let (leaf, _) = issue_leaf_handle(&kernel, root, "Direct Leaf");
    let chain = super::create_chain(&kernel, &[leaf, root]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    kernel.send(chain, Message::ValidateChain(kernel.default_user()))
        .unwrap();

    // An intermediate CA pushes the depth past the limit.
    let mid_key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let mid = super::create(&kernel, CertificateType::Certificate)
        .unwrap();
    set(&kernel, mid, Attribute::CertCommonName,
        AttributeValue::Str("Mid CA".into()));
    set(&kernel, mid, Attribute::CertCa, AttributeValue::Bool(true));
    set(&kernel, mid, Attribute::CertKeyUsage, AttributeValue::Int(
        KeyUsage::KEY_CERT_SIGN as i64));
    set(&kernel, mid, Attribute::CertPublicKey,
        AttributeValue::Object(mid_key));
    kernel.send(mid, Message::SignCert(root)).unwrap();
    let (deep_leaf, _) = issue_leaf_handle(&kernel, mid, "Deep Leaf");

    let long = super::create_chain(&kernel, &[deep_leaf, mid, root])
        .unwrap();
    set(&kernel, long, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    let err = kernel.send(long, Message::ValidateChain(
        kernel.default_user())).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let locus = kernel.send(long, Message::GetAttribute(
        Attribute::ErrorLocus)).unwrap().into_int().unwrap();
    assert_eq!(locus as u32, Attribute::CertPathLenConstraint.id());
}

#[test]
fn name_constraints_enforced() {
    let kernel = Kernel::new().unwrap();
    let key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let ca = super::create(&kernel, CertificateType::Certificate).unwrap();
    set(&kernel, ca, Attribute::CertCommonName,
        AttributeValue::Str("Constrained CA".into()));
    set(&kernel, ca, Attribute::CertCa, AttributeValue::Bool(true));
    set(&kernel, ca, Attribute::CertNameConstraintPermitted,
        AttributeValue::Str("testcertificates.gov".into()));
    set(&kernel, ca, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN) as i64));
    set(&kernel, ca, Attribute::CertPublicKey, AttributeValue::Object(key));
    kernel.send(ca, Message::SignCert(key)).unwrap();

    let issue_with_san = |san: &str, cn: &str| -> Handle {
        let leaf_key = crypto::generate_keypair(
            &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
        let leaf = super::create(&kernel, CertificateType::Certificate)
            .unwrap();
        set(&kernel, leaf, Attribute::CertCommonName,
            AttributeValue::Str(cn.into()));
        set(&kernel, leaf, Attribute::CertKeyUsage, AttributeValue::Int(
            KeyUsage::DIGITAL_SIGNATURE as i64));
        set(&kernel, leaf, Attribute::CertAltNameDns,
            AttributeValue::Str(san.into()));
        set(&kernel, leaf, Attribute::CertPublicKey,
            AttributeValue::Object(leaf_key));
        kernel.send(leaf, Message::SignCert(ca)).unwrap();
        leaf
    };

    // A right-anchored match is permitted.
    let good = issue_with_san("mytestcertificates.gov", "Good");
    let chain = super::create_chain(&kernel, &[good, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    kernel.send(chain, Message::ValidateChain(kernel.default_user()))
        .unwrap();

    // A name outside the permitted subtree is not.
    let bad = issue_with_san("mytest.example.gov", "Bad");
    let chain = super::create_chain(&kernel, &[bad, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    let err = kernel.send(chain, Message::ValidateChain(
        kernel.default_user())).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let locus = kernel.send(chain, Message::GetAttribute(
        Attribute::ErrorLocus)).unwrap().into_int().unwrap();
    assert_eq!(locus as u32,
               Attribute::CertNameConstraintPermitted.id());
}

#[test]
fn subject_name_is_constrained_like_alt_names() {
    let kernel = Kernel::new().unwrap();
    let key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let ca = super::create(&kernel, CertificateType::Certificate).unwrap();
    set(&kernel, ca, Attribute::CertCommonName,
        AttributeValue::Str("Excluding CA".into()));
    set(&kernel, ca, Attribute::CertCa, AttributeValue::Bool(true));
    set(&kernel, ca, Attribute::CertNameConstraintExcluded,
        AttributeValue::Str("example.gov".into()));
    set(&kernel, ca, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN) as i64));
    set(&kernel, ca, Attribute::CertPublicKey, AttributeValue::Object(key));
    kernel.send(ca, Message::SignCert(key)).unwrap();

    // A host-shaped common name with no alternative names is still
    // caught by the excluded subtree.
    let (bad, _) = issue_leaf_handle(&kernel, ca, "service.example.gov");
    let chain = super::create_chain(&kernel, &[bad, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    let err = kernel.send(chain, Message::ValidateChain(
        kernel.default_user())).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));
    let locus = kernel.send(chain, Message::GetAttribute(
        Attribute::ErrorLocus)).unwrap().into_int().unwrap();
    assert_eq!(locus as u32,
               Attribute::CertNameConstraintExcluded.id());

    // A host name outside the excluded subtree passes.
    let (good, _) = issue_leaf_handle(&kernel, ca, "service.example.org");
    let chain = super::create_chain(&kernel, &[good, ca]).unwrap();
    set(&kernel, chain, Attribute::CertTrustedImplicit,
        AttributeValue::Bool(true));
    kernel.send(chain, Message::ValidateChain(kernel.default_user()))
        .unwrap();
}

#[test]
fn crl_revocation_reflects_through_check() {
    let kernel = Kernel::new().unwrap();
    let (ca, _) = self_signed(&kernel, "Compromised CA", true);

    let revocation_date = UNIX_EPOCH + Duration::from_secs(1_200_000_000);
    let invalidity = UNIX_EPOCH + Duration::from_secs(915_148_800); // 1999

    let crl = super::create(&kernel, CertificateType::Crl).unwrap();
    set(&kernel, crl, Attribute::CertRevokedCert,
        AttributeValue::Object(ca));
    set(&kernel, crl, Attribute::CertRevocationReason,
        AttributeValue::Int(RevocationReason::CaCompromise.code() as i64));
    set(&kernel, crl, Attribute::CertRevocationDate,
        AttributeValue::Time(revocation_date));
    set(&kernel, crl, Attribute::CertInvalidityDate,
        AttributeValue::Time(invalidity));
    kernel.send(crl, Message::SignCert(ca)).unwrap();

    // The CRL round-trips through its encoding.
    let encoded = exported(&kernel, crl);
    assert!(!encoded.is_empty());

    let err = kernel.send(ca, Message::CheckAgainst(crl)).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::Invalid(_))));

    let reason = kernel.send(ca, Message::GetAttribute(
        Attribute::CertRevocationReason)).unwrap().into_int().unwrap();
    assert_eq!(reason, RevocationReason::CaCompromise.code() as i64);
    let date = kernel.send(ca, Message::GetAttribute(
        Attribute::CertRevocationDate)).unwrap()
        .into_value().unwrap().into_time().unwrap();
    assert_eq!(date, revocation_date);
    let recorded = kernel.send(ca, Message::GetAttribute(
        Attribute::CertInvalidityDate)).unwrap()
        .into_value().unwrap().into_time().unwrap();
    assert_eq!(recorded, invalidity);

    // An unrelated certificate is not revoked.
    let (other, _) = issue_leaf_handle(&kernel, ca, "Innocent");
    kernel.send(other, Message::CheckAgainst(crl)).unwrap();
}

#[test]
fn compliance_ladder_tolerates_expiry_only_when_oblivious() {
    let kernel = Kernel::new().unwrap();
    let key = crypto::generate_keypair(
        &kernel, PublicKeyAlgorithm::Ed25519, 0).unwrap();
    let cert = super::create(&kernel, CertificateType::Certificate)
        .unwrap();
    set(&kernel, cert, Attribute::CertCommonName,
        AttributeValue::Str("Expired Root".into()));
    set(&kernel, cert, Attribute::CertCa, AttributeValue::Bool(true));
    set(&kernel, cert, Attribute::CertKeyUsage, AttributeValue::Int(
        (KeyUsage::KEY_CERT_SIGN | KeyUsage::DIGITAL_SIGNATURE) as i64));
    set(&kernel, cert, Attribute::CertValidFrom, AttributeValue::Time(
        UNIX_EPOCH + Duration::from_secs(1_000_000_000)));
    set(&kernel, cert, Attribute::CertValidTo, AttributeValue::Time(
        UNIX_EPOCH + Duration::from_secs(1_100_000_000)));
    set(&kernel, cert, Attribute::CertPublicKey,
        AttributeValue::Object(key));
    kernel.send(cert, Message::SignCert(key)).unwrap();
    let parsed = Certificate::decode(&exported(&kernel, cert)).unwrap();

    let certs = vec![parsed];
    let now = SystemTime::now();
    assert!(validate::check_path(&certs, ComplianceLevel::Oblivious,
                                 true, now).is_ok());
    let err = validate::check_path(&certs, ComplianceLevel::Reduced,
                                   true, now).unwrap_err();
    assert_eq!(err.locus, Some(Attribute::CertValidTo));
    // Unanchored chains fail everywhere.
    let err = validate::check_path(&certs, ComplianceLevel::Oblivious,
                                   false, now).unwrap_err();
    assert_eq!(err.locus, Some(Attribute::CertTrustedImplicit));
}

#[test]
fn validation_ignores_extension_order() {
    // The validator consumes the typed extension set, so two chains
    // differing only in extension layout behave identically; here we
    // simply confirm a second identical run returns the same result.
    let kernel = Kernel::new().unwrap();
    let (ca, ca_cert) = self_signed(&kernel, "Stable CA", true);
    let leaf = issue_leaf(&kernel, ca, "Stable Leaf");
    let certs = vec![leaf, ca_cert];
    let now = SystemTime::now();
    for _ in 0..2 {
        assert!(validate::check_path(&certs, ComplianceLevel::PkixFull,
                                     true, now).is_ok());
    }
}

#[test]
fn revocation_attribute_errors_before_check() {
    let kernel = Kernel::new().unwrap();
    let (cert, _) = self_signed(&kernel, "Clean", false);
    let err = kernel.send(cert, Message::GetAttribute(
        Attribute::CertRevocationReason)).unwrap_err();
    assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
}

#[test]
fn error_type_recorded_on_acl_failure() {
    let kernel = Kernel::new().unwrap();
    let cert = super::create(&kernel, CertificateType::Certificate)
        .unwrap();
    // Path-length constraint without the CA flag violates a
    // dependency.
    let err = kernel.send(cert, Message::SetAttribute(
        Attribute::CertPathLenConstraint, AttributeValue::Int(3)))
        .unwrap_err();
    assert!(Error::matches(&err,
        |e| matches!(e, Error::NotInitialised(_))));
    let kind = kernel.send(cert, Message::GetAttribute(
        Attribute::ErrorType)).unwrap().into_int().unwrap();
    assert_eq!(kind, ErrorType::AttributeAbsent as i64);
}
