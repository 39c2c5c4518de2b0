//! Certificate extensions.
//!
//! Typed representations of the extensions the path validator and
//! the trust machinery consume, plus their encoding.  Unrecognised
//! non-critical extensions are skipped on parse; an unrecognised
//! critical extension is remembered so the validator can reject it
//! at the appropriate compliance level.

use crate::ber::{self, Oid, Reader, Writer};
use crate::types::KeyUsage;
use crate::{Error, Result};

fn oid_key_usage() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 15])
}

fn oid_subject_alt_name() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 17])
}

fn oid_basic_constraints() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 19])
}

fn oid_name_constraints() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 30])
}

fn oid_certificate_policies() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 32])
}

fn oid_subject_key_id() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 14])
}

fn oid_reason_code() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 21])
}

fn oid_invalidity_date() -> Oid {
    Oid::from_arcs(&[2, 5, 29, 24])
}

/// The basic-constraints extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BasicConstraints {
    /// Whether the subject is a CA.
    pub ca: bool,
    /// The maximum number of intermediate certificates that may
    /// follow.
    pub path_len: Option<u32>,
}

/// The name-constraints extension, restricted to DNS names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameConstraints {
    /// Permitted subtrees.
    pub permitted: Vec<String>,
    /// Excluded subtrees.
    pub excluded: Vec<String>,
}

/// The typed extension set of a certificate.
#[derive(Clone, Debug, Default)]
pub struct Extensions {
    /// Key usage.
    pub key_usage: Option<KeyUsage>,
    /// Basic constraints.
    pub basic_constraints: Option<BasicConstraints>,
    /// DNS subject-alternative-names.
    pub subject_alt_names: Vec<String>,
    /// Asserted certificate policies, as dotted-decimal identifiers.
    pub policies: Vec<String>,
    /// Name constraints.
    pub name_constraints: Option<NameConstraints>,
    /// Subject key identifier.
    pub subject_key_id: Option<Vec<u8>>,
    /// Whether an unrecognised critical extension was seen on parse.
    pub unknown_critical: bool,
}

impl Extensions {
    /// Returns whether any extension is present.
    pub fn is_empty(&self) -> bool {
        self.key_usage.is_none()
            && self.basic_constraints.is_none()
            && self.subject_alt_names.is_empty()
            && self.policies.is_empty()
            && self.name_constraints.is_none()
            && self.subject_key_id.is_none()
    }

    /// Serialises the extension list (the bare SEQUENCE, without the
    /// explicit context tag wrapping it in a certificate).
    pub fn serialize(&self, w: &mut Writer) -> Result<()> {
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            if let Some(usage) = &self.key_usage {
                write_extension(w, &oid_key_usage(), true, |w| {
                    write_key_usage(w, *usage);
                    Ok(())
                })?;
            }
            if let Some(bc) = &self.basic_constraints {
                write_extension(w, &oid_basic_constraints(), true, |w| {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        if bc.ca {
                            w.write_boolean(true);
                        }
                        if let Some(len) = bc.path_len {
                            w.write_integer(len as i64);
                        }
                        Ok(())
                    })
                })?;
            }
            if !self.subject_alt_names.is_empty() {
                write_extension(w, &oid_subject_alt_name(), false, |w| {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        for name in &self.subject_alt_names {
                            w.write_primitive(
                                ber::tag_context_primitive(2),
                                name.as_bytes());
                        }
                        Ok(())
                    })
                })?;
            }
            if !self.policies.is_empty() {
                write_extension(w, &oid_certificate_policies(), false, |w| {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        for policy in &self.policies {
                            let oid = parse_dotted_oid(policy)?;
                            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                                w.write_oid(&oid);
                                Ok(())
                            })?;
                        }
                        Ok(())
                    })
                })?;
            }
            if let Some(nc) = &self.name_constraints {
                write_extension(w, &oid_name_constraints(), true, |w| {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        if !nc.permitted.is_empty() {
                            write_subtrees(w, 0, &nc.permitted)?;
                        }
                        if !nc.excluded.is_empty() {
                            write_subtrees(w, 1, &nc.excluded)?;
                        }
                        Ok(())
                    })
                })?;
            }
            if let Some(skid) = &self.subject_key_id {
                write_extension(w, &oid_subject_key_id(), false, |w| {
                    w.write_octet_string(skid);
                    Ok(())
                })?;
            }
            Ok(())
        })
    }

    /// Parses an extension list.
    pub fn parse(r: &mut Reader) -> Result<Self> {
        let mut ext = Extensions::default();
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            while !r.is_empty() {
                r.read_constructed(ber::TAG_SEQUENCE, |r| {
                    let oid = r.read_oid()?;
                    let critical = if r.peek_tag().ok()
                        == Some(ber::TAG_BOOLEAN)
                    {
                        r.read_boolean()?
                    } else {
                        false
                    };
                    let body = r.read_octet_string()?;
                    ext.parse_one(&oid, critical, &body)
                })?;
            }
            Ok(())
        })?;
        Ok(ext)
    }

    fn parse_one(&mut self, oid: &Oid, critical: bool, body: &[u8])
                 -> Result<()> {
        let mut r = Reader::new(body);
        if *oid == oid_key_usage() {
            self.key_usage = Some(read_key_usage(&mut r)?);
        } else if *oid == oid_basic_constraints() {
            self.basic_constraints = Some(
                r.read_constructed(ber::TAG_SEQUENCE, |r| {
                    let ca = if r.peek_tag().ok() == Some(ber::TAG_BOOLEAN) {
                        r.read_boolean()?
                    } else {
                        false
                    };
                    let path_len = if !r.is_empty() {
                        Some(r.read_integer()? as u32)
                    } else {
                        None
                    };
                    Ok(BasicConstraints { ca, path_len })
                })?);
        } else if *oid == oid_subject_alt_name() {
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                while !r.is_empty() {
                    // Only dNSName components are modelled; other
                    // forms are skipped.
                    if r.peek_tag()? == ber::tag_context_primitive(2) {
                        let name = r.read_value(
                            ber::tag_context_primitive(2))?;
                        let name = std::str::from_utf8(name)
                            .map_err(|_| anyhow::Error::from(Error::BadData(
                                "undecodable DNS name".into())))?;
                        self.subject_alt_names.push(name.to_string());
                    } else {
                        r.skip_value()?;
                    }
                }
                Ok(())
            })?;
        } else if *oid == oid_certificate_policies() {
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                while !r.is_empty() {
                    let policy = r.read_constructed(ber::TAG_SEQUENCE, |r| {
                        let oid = r.read_oid()?;
                        // Qualifiers are ignored.
                        while !r.is_empty() {
                            r.skip_value()?;
                        }
                        Ok(oid)
                    })?;
                    self.policies.push(format_dotted_oid(&policy)?);
                }
                Ok(())
            })?;
        } else if *oid == oid_name_constraints() {
            let mut nc = NameConstraints::default();
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                while !r.is_empty() {
                    let tag = r.peek_tag()?;
                    if tag == ber::tag_context(0) {
                        nc.permitted = read_subtrees(r, 0)?;
                    } else if tag == ber::tag_context(1) {
                        nc.excluded = read_subtrees(r, 1)?;
                    } else {
                        return Err(Error::BadData(
                            "unexpected name-constraints member".into())
                            .into());
                    }
                }
                Ok(())
            })?;
            self.name_constraints = Some(nc);
        } else if *oid == oid_subject_key_id() {
            self.subject_key_id = Some(r.read_octet_string()?);
        } else if critical {
            self.unknown_critical = true;
        }
        Ok(())
    }
}

fn write_extension<F>(w: &mut Writer, oid: &Oid, critical: bool, f: F)
                      -> Result<()>
    where F: FnOnce(&mut Writer) -> Result<()>
{
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        w.write_oid(oid);
        if critical {
            w.write_boolean(true);
        }
        let mut inner = Writer::new();
        f(&mut inner)?;
        w.write_octet_string(inner.as_bytes());
        Ok(())
    })
}

fn write_key_usage(w: &mut Writer, usage: KeyUsage) {
    // Named-bit encoding: bit 0 is the most significant bit of the
    // first octet, trailing zero bits are trimmed.
    let bits = usage.bits();
    let mut bytes = [0u8; 2];
    for i in 0..9 {
        if bits & (1 << i) != 0 {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    let len = if bytes[1] != 0 { 2 } else if bytes[0] != 0 { 1 } else { 0 };
    let unused = if len == 0 {
        0
    } else {
        bytes[len - 1].trailing_zeros().min(7) as u8
    };
    w.write_bit_string(unused, &bytes[..len]);
}

fn read_key_usage(r: &mut Reader) -> Result<KeyUsage> {
    let (_unused, bytes) = r.read_bit_string()?;
    let mut bits = 0u16;
    for i in 0..9usize {
        if bytes.get(i / 8).map(|b| b & (0x80 >> (i % 8)) != 0)
            .unwrap_or(false)
        {
            bits |= 1 << i;
        }
    }
    KeyUsage::from_bits(bits)
}

fn write_subtrees(w: &mut Writer, context: u8, names: &[String])
                  -> Result<()> {
    w.write_constructed(ber::tag_context(context), |w| {
        for name in names {
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_primitive(ber::tag_context_primitive(2),
                                  name.as_bytes());
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn read_subtrees(r: &mut Reader, context: u8) -> Result<Vec<String>> {
    let mut names = Vec::new();
    r.read_constructed(ber::tag_context(context), |r| {
        while !r.is_empty() {
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let name = r.read_value(ber::tag_context_primitive(2))?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| anyhow::Error::from(Error::BadData(
                        "undecodable DNS name".into())))?;
                names.push(name.to_string());
                Ok(())
            })?;
        }
        Ok(())
    })?;
    Ok(names)
}

/// Parses a dotted-decimal policy identifier.
pub fn parse_dotted_oid(s: &str) -> Result<Oid> {
    let arcs: std::result::Result<Vec<u32>, _> =
        s.split('.').map(|p| p.parse::<u32>()).collect();
    let arcs = arcs.map_err(|_| anyhow::Error::from(Error::ArgumentValue(
        format!("bad policy identifier {:?}", s))))?;
    if arcs.len() < 2 {
        return Err(Error::ArgumentValue(
            format!("bad policy identifier {:?}", s)).into());
    }
    Ok(Oid::from_arcs(&arcs))
}

/// Formats an identifier back to dotted-decimal form.
pub fn format_dotted_oid(oid: &Oid) -> Result<String> {
    let body = oid.as_bytes();
    let mut arcs: Vec<u32> = vec![
        (body[0] / 40) as u32,
        (body[0] % 40) as u32,
    ];
    let mut acc: u32 = 0;
    for &b in &body[1..] {
        acc = acc.checked_shl(7)
            .and_then(|a| a.checked_add((b & 0x7f) as u32))
            .ok_or_else(|| anyhow::Error::from(Error::BadData(
                "oversized identifier arc".into())))?;
        if b & 0x80 == 0 {
            arcs.push(acc);
            acc = 0;
        }
    }
    Ok(arcs.iter().map(|a| a.to_string()).collect::<Vec<_>>().join("."))
}

/// A CRL entry: one revoked certificate.
#[derive(Clone, Debug, PartialEq)]
pub struct RevocationEntry {
    /// The revoked certificate's serial number.
    pub serial: Vec<u8>,
    /// When the revocation took effect.
    pub revocation_date: std::time::SystemTime,
    /// The asserted reason, if any.
    pub reason: Option<crate::types::RevocationReason>,
    /// When the key is suspected to have actually become invalid.
    pub invalidity_date: Option<std::time::SystemTime>,
}

impl RevocationEntry {
    /// Serialises the entry.
    pub fn serialize(&self, w: &mut Writer) -> Result<()> {
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_integer_bytes(&self.serial);
            w.write_time(self.revocation_date)?;
            if self.reason.is_some() || self.invalidity_date.is_some() {
                w.write_constructed(ber::TAG_SEQUENCE, |w| {
                    if let Some(reason) = self.reason {
                        write_extension(w, &oid_reason_code(), false, |w| {
                            w.write_enumerated(reason.code() as i64);
                            Ok(())
                        })?;
                    }
                    if let Some(date) = self.invalidity_date {
                        write_extension(w, &oid_invalidity_date(), false,
                                        |w| w.write_time(date))?;
                    }
                    Ok(())
                })?;
            }
            Ok(())
        })
    }

    /// Parses an entry.
    pub fn parse(r: &mut Reader) -> Result<Self> {
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let serial = r.read_integer_bytes()?;
            let revocation_date = r.read_time()?;
            let mut reason = None;
            let mut invalidity_date = None;
            if !r.is_empty() {
                r.read_constructed(ber::TAG_SEQUENCE, |r| {
                    while !r.is_empty() {
                        r.read_constructed(ber::TAG_SEQUENCE, |r| {
                            let oid = r.read_oid()?;
                            if r.peek_tag().ok() == Some(ber::TAG_BOOLEAN) {
                                r.read_boolean()?;
                            }
                            let body = r.read_octet_string()?;
                            let mut br = Reader::new(&body);
                            if oid == oid_reason_code() {
                                reason = Some(
                                    crate::types::RevocationReason::from_code(
                                        br.read_enumerated()? as u8)?);
                            } else if oid == oid_invalidity_date() {
                                invalidity_date = Some(br.read_time()?);
                            }
                            Ok(())
                        })?;
                    }
                    Ok(())
                })?;
            }
            Ok(RevocationEntry {
                serial, revocation_date, reason, invalidity_date,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn key_usage_roundtrip() {
        for bits in [KeyUsage::DIGITAL_SIGNATURE,
                     KeyUsage::DIGITAL_SIGNATURE | KeyUsage::KEY_ENCIPHERMENT,
                     KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN,
                     KeyUsage::DECIPHER_ONLY] {
            let usage = KeyUsage::from_bits(bits).unwrap();
            let mut w = Writer::new();
            write_key_usage(&mut w, usage);
            let got = read_key_usage(&mut Reader::new(w.as_bytes())).unwrap();
            assert_eq!(got, usage, "bits {:#x}", bits);
        }
    }

    quickcheck! {
        fn key_usage_roundtrip_qc(usage: KeyUsage) -> bool {
            let mut w = Writer::new();
            write_key_usage(&mut w, usage);
            read_key_usage(&mut Reader::new(w.as_bytes())).unwrap() == usage
        }
    }

    #[test]
    fn extensions_roundtrip() {
        let ext = Extensions {
            key_usage: Some(KeyUsage::from_bits(
                KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN).unwrap()),
            basic_constraints: Some(BasicConstraints {
                ca: true,
                path_len: Some(1),
            }),
            subject_alt_names: vec!["mytestcertificates.gov".into()],
            policies: vec!["1.3.6.1.4.1.99999.1".into()],
            name_constraints: Some(NameConstraints {
                permitted: vec!["testcertificates.gov".into()],
                excluded: vec![],
            }),
            subject_key_id: Some(vec![1, 2, 3, 4]),
            unknown_critical: false,
        };
        let mut w = Writer::new();
        ext.serialize(&mut w).unwrap();
        let got = Extensions::parse(&mut Reader::new(w.as_bytes())).unwrap();
        assert_eq!(got.key_usage, ext.key_usage);
        assert_eq!(got.basic_constraints, ext.basic_constraints);
        assert_eq!(got.subject_alt_names, ext.subject_alt_names);
        assert_eq!(got.policies, ext.policies);
        assert_eq!(got.name_constraints, ext.name_constraints);
        assert_eq!(got.subject_key_id, ext.subject_key_id);
    }

    #[test]
    fn dotted_oid_roundtrip() {
        for s in ["2.5.29.32.0", "1.3.6.1.4.1.99999.1"] {
            let oid = parse_dotted_oid(s).unwrap();
            assert_eq!(format_dotted_oid(&oid).unwrap(), s);
        }
        assert!(parse_dotted_oid("x.y").is_err());
    }

    #[test]
    fn revocation_entry_roundtrip() {
        let entry = RevocationEntry {
            serial: vec![0x01, 0x88],
            revocation_date: UNIX_EPOCH + Duration::from_secs(1_200_000_000),
            reason: Some(crate::types::RevocationReason::CaCompromise),
            invalidity_date: Some(
                UNIX_EPOCH + Duration::from_secs(915_148_800)),
        };
        let mut w = Writer::new();
        entry.serialize(&mut w).unwrap();
        let got = RevocationEntry::parse(&mut Reader::new(w.as_bytes()))
            .unwrap();
        assert_eq!(got, entry);
    }
}
