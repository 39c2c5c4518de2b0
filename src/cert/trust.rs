//! The certificate trust manager.
//!
//! Each user object owns one of these: an indexed store of the
//! certificates the user has marked implicitly trusted.  Lookup
//! during chain validation is by subject name ("is this issuer
//! trusted?"), with an exact-match index by subject key identifier
//! alongside it.  Entries hold the certificate bytes; the
//! materialised certificate object is created lazily and released
//! with the entry.

use std::collections::HashMap;

use tracing::debug;

use crate::ber::{self, Reader, Writer};
use crate::kernel::{Handle, Kernel, ObjectPayload, ObjectSubtype};
use crate::types::{CertificateType, ObjectType};
use crate::{Error, Result};
use super::dn::DistinguishedName;
use super::{CertData, CertObject, Certificate};

/// One trusted certificate.
#[derive(Debug)]
pub(crate) struct TrustEntry {
    subject: DistinguishedName,
    subject_key_id: Vec<u8>,
    encoded: Vec<u8>,
    /// The materialised certificate object, if one has been handed
    /// out.
    handle: Option<Handle>,
}

impl TrustEntry {
    /// Returns the entry's certificate bytes.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Returns the entry's subject name.
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }
}

fn subject_key(dn: &DistinguishedName) -> String {
    dn.normalized().iter()
        .map(|(attr, value)| format!("{:?}={};", attr, value))
        .collect()
}

/// The per-user store of implicitly trusted certificates.
#[derive(Debug, Default)]
pub(crate) struct TrustManager {
    entries: Vec<TrustEntry>,
    by_subject: HashMap<String, Vec<usize>>,
    by_key_id: HashMap<Vec<u8>, usize>,
    /// True iff the in-memory state differs from the last persisted
    /// snapshot.
    pub changed: bool,
}

impl TrustManager {
    /// Returns an empty store.
    pub fn new() -> Self {
        TrustManager::default()
    }

    /// Returns the number of trusted certificates.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Adds a certificate.
    ///
    /// Duplicates (same subject and subject key identifier) are
    /// rejected.
    pub fn add_certificate(&mut self, cert: &Certificate) -> Result<()> {
        let key_id = cert.subject_key_id();
        if let Some(&idx) = self.by_key_id.get(&key_id) {
            if self.entries[idx].subject.matches(cert.subject()) {
                return Err(Error::Duplicate(format!(
                    "{} is already trusted", cert.subject())).into());
            }
        }
        let idx = self.entries.len();
        self.by_subject.entry(subject_key(cert.subject()))
            .or_default().push(idx);
        self.by_key_id.insert(key_id.clone(), idx);
        self.entries.push(TrustEntry {
            subject: cert.subject().clone(),
            subject_key_id: key_id,
            encoded: cert.encoded().to_vec(),
            handle: None,
        });
        self.changed = true;
        debug!(subject = %cert.subject(), "added trust entry");
        Ok(())
    }

    /// Adds the object behind `handle`: the certificate itself, or a
    /// chain's root unless `single_cert` asks for the leaf exactly.
    pub fn add(&mut self, kernel: &Kernel, handle: Handle,
               single_cert: bool) -> Result<()> {
        let cert = kernel.with_payload(handle, |payload| match payload {
            ObjectPayload::Certificate(CertObject::Single(data)) =>
                Ok(super::require_cert(data)?.clone()),
            ObjectPayload::Certificate(CertObject::Chain(chain)) => {
                let cert = if single_cert {
                    &chain.certs[chain.cursor]
                } else {
                    // The root carries the trust for the whole chain.
                    chain.certs.last().expect("chains are never empty")
                };
                Ok(cert.clone())
            }
            _ => Err(Error::ArgumentValue(
                "not a certificate".into()).into()),
        })?;
        self.add_certificate(&cert)
    }

    fn remove_at(&mut self, kernel: &Kernel, idx: usize) {
        let entry = self.entries.remove(idx);
        if let Some(handle) = entry.handle {
            let _ = kernel.destroy_internal(handle);
        }
        // Reindex; entries are few and deletions rare.
        self.rebuild_indices();
        self.changed = true;
        debug!(subject = %entry.subject, "deleted trust entry");
    }

    fn rebuild_indices(&mut self) {
        self.by_subject.clear();
        self.by_key_id.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.by_subject.entry(subject_key(&entry.subject))
                .or_default().push(idx);
            self.by_key_id.insert(entry.subject_key_id.clone(), idx);
        }
    }

    /// Removes the entry matching the given certificate.
    pub fn delete(&mut self, kernel: &Kernel, cert: &Certificate)
                  -> Result<()> {
        match self.find_exact(cert) {
            Some(idx) => {
                self.remove_at(kernel, idx);
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "{} is not trusted", cert.subject())).into()),
        }
    }

    fn find_exact(&self, cert: &Certificate) -> Option<usize> {
        self.by_key_id.get(&cert.subject_key_id()).copied()
            .filter(|&idx| self.entries[idx].subject
                    .matches(cert.subject()))
    }

    /// Returns whether the exact certificate is trusted.
    pub fn is_trusted(&self, cert: &Certificate) -> bool {
        self.find_exact(cert)
            .map(|idx| self.entries[idx].encoded == cert.encoded())
            .unwrap_or(false)
    }

    /// Finds the trusted issuer of the given certificate.
    pub fn find_issuer(&self, cert: &Certificate) -> Option<&TrustEntry> {
        self.by_subject.get(&subject_key(cert.issuer()))
            .and_then(|indices| indices.first())
            .map(|&idx| &self.entries[idx])
    }

    /// Materialises the trusted certificate matching `cert`'s issuer
    /// as an object, creating it lazily.
    pub fn get_issuer(&mut self, kernel: &Kernel, owner: Handle,
                      cert: &Certificate) -> Result<Handle> {
        let idx = self.by_subject.get(&subject_key(cert.issuer()))
            .and_then(|indices| indices.first().copied())
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(format!(
                "no trusted certificate for {}", cert.issuer()))))?;
        let entry = &mut self.entries[idx];
        if let Some(handle) = entry.handle {
            // The handle may have been released behind our back;
            // reload from the stored bytes if so.
            if kernel.object_kind(handle).is_ok() {
                return Ok(handle);
            }
        }
        let parsed = Certificate::decode(&entry.encoded)?;
        let handle = kernel.create_object(
            ObjectType::Certificate,
            ObjectSubtype::Certificate(CertificateType::Certificate),
            Some(owner),
            ObjectPayload::Certificate(CertObject::Single(CertData {
                cert: Some(parsed),
                trusted_implicit: true,
                ..CertData::default()
            })))?;
        kernel.mark_ready(handle)?;
        entry.handle = Some(handle);
        Ok(handle)
    }

    /// Returns every trusted certificate's encoded bytes.
    pub fn enumerate(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|entry| entry.encoded.as_slice())
    }

    /// Returns the handles of materialised entries, for teardown.
    pub fn owned_handles(&self) -> Vec<Handle> {
        self.entries.iter().filter_map(|entry| entry.handle).collect()
    }

    /// Serialises the store for persistence.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            for entry in &self.entries {
                w.write_octet_string(&entry.encoded);
            }
            Ok(())
        })?;
        Ok(w.into_vec())
    }

    /// Restores a store from its serialised form.  The restored
    /// state counts as persisted: the changed flag is clear.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut manager = TrustManager::new();
        let mut r = Reader::new(data);
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            while !r.is_empty() {
                let encoded = r.read_octet_string()?;
                let cert = Certificate::decode(&encoded)?;
                manager.add_certificate(&cert)?;
            }
            Ok(())
        })?;
        manager.changed = false;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::tests::self_signed;
    use crate::Kernel;

    #[test]
    fn add_find_delete() {
        let kernel = Kernel::new().unwrap();
        let (_, root) = self_signed(&kernel, "Trusty Root", true);
        let mut manager = TrustManager::new();
        manager.add_certificate(&root).unwrap();
        assert!(manager.changed);
        assert_eq!(manager.count(), 1);
        assert!(manager.is_trusted(&root));

        // Duplicates are rejected.
        let err = manager.add_certificate(&root).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Duplicate(_))));
        assert_eq!(manager.count(), 1);

        manager.delete(&kernel, &root).unwrap();
        assert_eq!(manager.count(), 0);
        assert!(!manager.is_trusted(&root));
        let err = manager.delete(&kernel, &root).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
    }

    #[test]
    fn issuer_lookup() {
        let kernel = Kernel::new().unwrap();
        let (ca_handle, ca) = self_signed(&kernel, "Lookup CA", true);
        let leaf = crate::cert::tests::issue_leaf(
            &kernel, ca_handle, "Leaf");
        let mut manager = TrustManager::new();
        manager.add_certificate(&ca).unwrap();

        let entry = manager.find_issuer(&leaf).unwrap();
        assert!(entry.subject().matches(ca.subject()));
        // The CA is its own issuer.
        assert!(manager.find_issuer(&ca).is_some());

        let handle = manager.get_issuer(
            &kernel, kernel.default_user(), &leaf).unwrap();
        // Repeated materialisation returns the same object.
        assert_eq!(manager.get_issuer(
            &kernel, kernel.default_user(), &leaf).unwrap(), handle);
    }

    #[test]
    fn net_adds_survive() {
        let kernel = Kernel::new().unwrap();
        let (_, a) = self_signed(&kernel, "Root A", true);
        let (_, b) = self_signed(&kernel, "Root B", true);
        let mut manager = TrustManager::new();
        manager.add_certificate(&a).unwrap();
        manager.add_certificate(&b).unwrap();
        manager.delete(&kernel, &a).unwrap();
        assert!(!manager.is_trusted(&a));
        assert!(manager.is_trusted(&b));

        let encoded = manager.encode().unwrap();
        let restored = TrustManager::decode(&encoded).unwrap();
        assert!(!restored.changed);
        assert_eq!(restored.count(), 1);
        assert!(restored.is_trusted(&b));
    }
}
