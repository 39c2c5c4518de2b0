//! Certificate chain validation.
//!
//! Walks a candidate chain, leaf at position 0 and putative root at
//! position n-1, applying name, validity, key-usage,
//! basic-constraint, policy, and name-constraint rules at the
//! selected compliance level.  A single structured result identifies
//! the first failed check, so the caller can present one coherent
//! error; the engine never partially mutates anything.
//!
//! The compliance ladder, from the top down:
//!
//! * `pkix-full` — everything below, plus certificate-policy
//!   intersection over the whole chain.
//! * `pkix-partial` — everything below, plus name-constraint
//!   evaluation.
//! * `standard` — everything below, plus key-usage and
//!   basic-constraint (CA flag, path length) enforcement, and
//!   rejection of unknown critical extensions.
//! * `reduced` — signature, chaining, anchoring, and validity
//!   checks; unknown critical extensions are tolerated.
//! * `oblivious` — as `reduced` but expired certificates pass.
//!   Intended for forensic import only.
//!
//! Revocation is deliberately not checked here; it is supplied as an
//! extra input gate by status-protocol sessions at higher levels.

use std::time::SystemTime;

use tracing::debug;

use crate::attr::Attribute;
use crate::kernel::{Fault, Handle, Kernel, ObjectPayload};
use crate::types::{ComplianceLevel, ErrorType};
use crate::{Error, Result};
use super::{Certificate, ChainData};

/// A structured validation failure: the offending chain position and
/// the attribute locus of the first failed check.
#[derive(Debug)]
pub struct PathError {
    /// The chain position, leaf = 0.
    pub position: usize,
    /// The attribute locus, where one applies.
    pub locus: Option<Attribute>,
    /// Human-readable detail.
    pub message: String,
}

impl PathError {
    fn new(position: usize, locus: Option<Attribute>,
           message: impl Into<String>) -> Self {
        PathError { position, locus, message: message.into() }
    }

    fn into_fault(self) -> anyhow::Error {
        let error = Error::Invalid(format!(
            "certificate {} fails validation: {}",
            self.position, self.message));
        match self.locus {
            Some(locus) => Fault::new(locus, ErrorType::Constraint, error),
            None => error.into(),
        }
    }
}

type PathResult = std::result::Result<(), PathError>;

/// Validates a chain object against the given user's trust store and
/// compliance level.
pub(crate) fn validate_chain(kernel: &Kernel, user: Handle,
                             chain: &ChainData) -> Result<()> {
    let root = chain.certs.last()
        .expect("chains are never empty");
    let (level, root_in_store) =
        kernel.with_payload(user, |payload| match payload {
            ObjectPayload::User(u) =>
                Ok((u.compliance_level(), u.trust().is_trusted(root))),
            _ => Err(Error::ArgumentValue(
                "trust anchor source must be a user".into()).into()),
        })?;
    let anchored = root_in_store || chain.trusted_implicit;
    debug!(certs = chain.certs.len(), %level, anchored,
           "validating chain");
    check_path(&chain.certs, level, anchored, SystemTime::now())
        .map_err(PathError::into_fault)
}

/// The pure path-validation core.
pub(crate) fn check_path(certs: &[Certificate], level: ComplianceLevel,
                         anchored: bool, now: SystemTime) -> PathResult {
    let n = certs.len();
    let root_pos = n - 1;
    let root = &certs[root_pos];

    // Anchor discovery.
    if !root.is_self_signed() || !anchored {
        return Err(PathError::new(
            root_pos, Some(Attribute::CertTrustedImplicit),
            "the chain does not end in a trusted self-signed root"));
    }

    // Signature and name chaining, root downwards.
    for i in (1..n).rev() {
        let issuer = &certs[i];
        let subject = &certs[i - 1];
        if !issuer.subject().matches(subject.issuer()) {
            return Err(PathError::new(
                i - 1, Some(Attribute::CertIssuerName),
                "issuer name does not match the parent's subject"));
        }
        match subject.verify_signature(issuer.public_key()) {
            Ok(true) => (),
            _ => return Err(PathError::new(
                i - 1, None,
                "signature does not verify under the parent's key")),
        }
    }

    // Validity windows.  Oblivious mode admits expired certificates.
    if level > ComplianceLevel::Oblivious {
        for (i, cert) in certs.iter().enumerate() {
            let (from, to) = cert.validity();
            if now < from {
                return Err(PathError::new(
                    i, Some(Attribute::CertValidFrom),
                    "certificate is not yet valid"));
            }
            if now > to {
                return Err(PathError::new(
                    i, Some(Attribute::CertValidTo),
                    "certificate has expired"));
            }
        }
    }

    if level >= ComplianceLevel::Standard {
        // Unknown critical extensions are fatal from here up.
        for (i, cert) in certs.iter().enumerate() {
            if cert.extensions().unknown_critical {
                return Err(PathError::new(
                    i, None, "unrecognised critical extension"));
            }
        }

        // Every issuing certificate must be a CA entitled to sign
        // certificates, and declared path lengths must cover the
        // remaining depth.
        for i in 1..n {
            let cert = &certs[i];
            let ext = cert.extensions();
            let is_ca = ext.basic_constraints
                .map(|bc| bc.ca).unwrap_or(false);
            if !is_ca {
                return Err(PathError::new(
                    i, Some(Attribute::CertCa),
                    "issuing certificate is not a CA"));
            }
            let may_sign = ext.key_usage
                .map(|u| u.for_certification()).unwrap_or(false);
            if !may_sign {
                return Err(PathError::new(
                    i, Some(Attribute::CertKeyUsage),
                    "issuing certificate may not sign certificates"));
            }
            if let Some(max) = ext.basic_constraints
                .and_then(|bc| bc.path_len)
            {
                // Certificates strictly between this one and the
                // leaf count against the declared limit.
                let depth = (i - 1) as u32;
                if depth > max {
                    return Err(PathError::new(
                        i, Some(Attribute::CertPathLenConstraint),
                        "path-length constraint exceeded"));
                }
            }
        }

        // The leaf must assert some usage.
        let leaf_usage = certs[0].extensions().key_usage;
        if leaf_usage.map(|u| u.is_empty()).unwrap_or(true) {
            return Err(PathError::new(
                0, Some(Attribute::CertKeyUsage),
                "leaf asserts no key usage"));
        }
    }

    if level >= ComplianceLevel::PkixPartial {
        check_name_constraints(certs)?;
    }

    if level >= ComplianceLevel::PkixFull {
        check_policies(certs)?;
    }

    Ok(())
}

/// Normalises a DNS name for constraint matching.
fn dns_normalize(name: &str) -> String {
    idna::domain_to_ascii(name)
        .unwrap_or_else(|_| name.to_ascii_lowercase())
}

/// Right-anchored subdomain matching: a constraint `foo.bar`
/// permits `x.foo.bar` and `foo.bar` itself, but not `foo1.bar`.
fn dns_matches(name: &str, constraint: &str) -> bool {
    let name = dns_normalize(name);
    let constraint = dns_normalize(constraint);
    if name == constraint {
        return true;
    }
    name.ends_with(&constraint)
}

/// Returns whether a name component is being used as a DNS-style
/// host name, and is therefore subject to DNS subtree constraints.
fn is_host_name(name: &str) -> bool {
    name.contains('.')
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b == b'-' || b == b'.'
        })
}

/// The DNS names a certificate asserts: every subjectAltName
/// component, plus the subject common name where it stands in for a
/// host name.
fn constrained_names(cert: &Certificate) -> Vec<&str> {
    let mut names: Vec<&str> = cert.extensions().subject_alt_names
        .iter()
        .map(String::as_str)
        .collect();
    if let Some(cn) = cert.subject().get(super::DnAttribute::CommonName) {
        if is_host_name(cn) {
            names.push(cn);
        }
    }
    names
}

/// Accumulates permitted and excluded subtrees while descending and
/// checks the subject name and every DNS name below against them.
fn check_name_constraints(certs: &[Certificate]) -> PathResult {
    let n = certs.len();
    let mut permitted: Vec<String> = Vec::new();
    let mut excluded: Vec<String> = Vec::new();

    for i in (0..n).rev() {
        let cert = &certs[i];

        // Constraints declared above this certificate apply to it.
        if i < n - 1 {
            for name in constrained_names(cert) {
                if !excluded.is_empty()
                    && excluded.iter().any(|c| dns_matches(name, c))
                {
                    return Err(PathError::new(
                        i, Some(Attribute::CertNameConstraintExcluded),
                        format!("{} is in an excluded subtree", name)));
                }
                if !permitted.is_empty()
                    && !permitted.iter().any(|c| dns_matches(name, c))
                {
                    return Err(PathError::new(
                        i, Some(Attribute::CertNameConstraintPermitted),
                        format!("{} is outside every permitted subtree",
                                name)));
                }
            }
        }

        if let Some(nc) = &cert.extensions().name_constraints {
            permitted.extend(nc.permitted.iter().cloned());
            excluded.extend(nc.excluded.iter().cloned());
        }
    }
    Ok(())
}

/// Simplified policy processing: where every certificate asserts
/// policies, the asserted sets must share at least one identifier
/// all the way down.  A certificate without policy assertions acts
/// as any-policy.
fn check_policies(certs: &[Certificate]) -> PathResult {
    let mut current: Option<Vec<String>> = None;
    for i in (0..certs.len()).rev() {
        let asserted = &certs[i].extensions().policies;
        if asserted.is_empty() {
            continue;
        }
        match &current {
            None => current = Some(asserted.clone()),
            Some(set) => {
                let next: Vec<String> = asserted.iter()
                    .filter(|p| set.contains(p))
                    .cloned()
                    .collect();
                if next.is_empty() {
                    return Err(PathError::new(
                        i, Some(Attribute::CertPolicy),
                        "no acceptable policy identifier in common"));
                }
                current = Some(next);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_matching_is_right_anchored() {
        assert!(dns_matches("x.foo.bar", "foo.bar"));
        assert!(dns_matches("foo.bar", "foo.bar"));
        assert!(dns_matches("mytestcertificates.gov",
                            "testcertificates.gov"));
        assert!(!dns_matches("foo1.bar", "foo.bar"));
        assert!(!dns_matches("mytest.example.gov",
                             "testcertificates.gov"));
        assert!(dns_matches("X.FOO.BAR", "foo.bar"));
    }

    #[test]
    fn host_name_detection() {
        assert!(is_host_name("www.example.gov"));
        assert!(is_host_name("example.gov"));
        // Ordinary personal and organisational names are not
        // constrained as DNS names.
        assert!(!is_host_name("Dave Smith"));
        assert!(!is_host_name("localhost"));
        assert!(!is_host_name(".example.gov"));
        assert!(!is_host_name("example.gov."));
    }
}
