//! Distinguished names.
//!
//! Names are kept as an ordered list of attribute-value assertions,
//! one per relative distinguished name, which is how every profile
//! this crate cares about lays them out.  Comparison for chain
//! building uses the normalised form: case differences and redundant
//! whitespace in values do not break issuer/subject matching.

use std::fmt;

use crate::ber::{self, Oid, Reader, Writer};
use crate::{Error, Result};

#[cfg(test)]
use quickcheck::{Arbitrary, Gen};

/// The name components the crate understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DnAttribute {
    /// C.
    Country,
    /// O.
    Organization,
    /// OU.
    OrganizationalUnit,
    /// CN.
    CommonName,
}

impl DnAttribute {
    fn oid(&self) -> Oid {
        match self {
            DnAttribute::Country => Oid::from_arcs(&[2, 5, 4, 6]),
            DnAttribute::Organization => Oid::from_arcs(&[2, 5, 4, 10]),
            DnAttribute::OrganizationalUnit => Oid::from_arcs(&[2, 5, 4, 11]),
            DnAttribute::CommonName => Oid::from_arcs(&[2, 5, 4, 3]),
        }
    }

    fn from_oid(oid: &Oid) -> Option<Self> {
        match oid.as_bytes() {
            [0x55, 0x04, 0x06] => Some(DnAttribute::Country),
            [0x55, 0x04, 0x0a] => Some(DnAttribute::Organization),
            [0x55, 0x04, 0x0b] => Some(DnAttribute::OrganizationalUnit),
            [0x55, 0x04, 0x03] => Some(DnAttribute::CommonName),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DnAttribute::Country => "C",
            DnAttribute::Organization => "O",
            DnAttribute::OrganizationalUnit => "OU",
            DnAttribute::CommonName => "CN",
        }
    }
}

/// A distinguished name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DistinguishedName {
    rdns: Vec<(DnAttribute, String)>,
}

impl DistinguishedName {
    /// Returns an empty name.
    pub fn new() -> Self {
        DistinguishedName { rdns: Vec::new() }
    }

    /// Returns whether the name has no components.
    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Sets a component, replacing an existing value.
    pub fn set(&mut self, attr: DnAttribute, value: impl Into<String>) {
        let value = value.into();
        for rdn in self.rdns.iter_mut() {
            if rdn.0 == attr {
                rdn.1 = value;
                return;
            }
        }
        self.rdns.push((attr, value));
    }

    /// Returns a component's value.
    pub fn get(&self, attr: DnAttribute) -> Option<&str> {
        self.rdns.iter()
            .find(|(a, _)| *a == attr)
            .map(|(_, v)| v.as_str())
    }

    /// Serialises the name.
    pub fn serialize(&self, w: &mut Writer) -> Result<()> {
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            for (attr, value) in &self.rdns {
                w.write_constructed(ber::TAG_SET, |w| {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_oid(&attr.oid());
                        // Country names are constrained to
                        // PrintableString by the profile.
                        if *attr == DnAttribute::Country {
                            w.write_string(ber::TAG_PRINTABLE_STRING, value);
                        } else {
                            w.write_string(ber::TAG_UTF8_STRING, value);
                        }
                        Ok(())
                    })
                })?;
            }
            Ok(())
        })
    }

    /// Parses a name.
    pub fn parse(r: &mut Reader) -> Result<Self> {
        let mut dn = DistinguishedName::new();
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            while !r.is_empty() {
                r.read_constructed(ber::TAG_SET, |r| {
                    r.read_constructed(ber::TAG_SEQUENCE, |r| {
                        let oid = r.read_oid()?;
                        let value = r.read_string(&[
                            ber::TAG_PRINTABLE_STRING,
                            ber::TAG_UTF8_STRING,
                            ber::TAG_IA5_STRING,
                        ])?;
                        match DnAttribute::from_oid(&oid) {
                            Some(attr) => dn.rdns.push((attr, value)),
                            None => return Err(Error::BadData(
                                "unrecognised name attribute".into()).into()),
                        }
                        Ok(())
                    })
                })?;
            }
            Ok(())
        })?;
        Ok(dn)
    }

    /// Returns the name in normalised form: values lower-cased with
    /// whitespace runs collapsed, components in encoding order.
    pub fn normalized(&self) -> Vec<(DnAttribute, String)> {
        self.rdns.iter()
            .map(|(attr, value)| {
                let collapsed = value.split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                (*attr, collapsed.to_lowercase())
            })
            .collect()
    }

    /// Returns whether two names match after normalisation.
    pub fn matches(&self, other: &DistinguishedName) -> bool {
        self.normalized() == other.normalized()
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (attr, value) in &self.rdns {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", attr.label(), value)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Arbitrary for DistinguishedName {
    fn arbitrary(g: &mut Gen) -> Self {
        let mut dn = DistinguishedName::new();
        let attrs = [DnAttribute::Country, DnAttribute::Organization,
                     DnAttribute::OrganizationalUnit,
                     DnAttribute::CommonName];
        for attr in attrs {
            if bool::arbitrary(g) {
                let len = if attr == DnAttribute::Country { 2 }
                          else { usize::arbitrary(g) % 16 + 1 };
                let value: String = (0..len)
                    .map(|_| char::from(b'a' + (u8::arbitrary(g) % 26)))
                    .collect();
                dn.set(attr, value);
            }
        }
        dn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.set(DnAttribute::Country, "NZ");
        dn.set(DnAttribute::Organization, "Dave's Wetaburgers");
        dn.set(DnAttribute::CommonName, "Dave Smith");
        dn
    }

    #[test]
    fn display_form() {
        assert_eq!(sample().to_string(),
                   "C=NZ, O=Dave's Wetaburgers, CN=Dave Smith");
    }

    #[test]
    fn roundtrip() {
        let dn = sample();
        let mut w = Writer::new();
        dn.serialize(&mut w).unwrap();
        let got = DistinguishedName::parse(
            &mut Reader::new(w.as_bytes())).unwrap();
        assert_eq!(got, dn);
    }

    quickcheck! {
        fn roundtrip_qc(dn: DistinguishedName) -> bool {
            let mut w = Writer::new();
            dn.serialize(&mut w).unwrap();
            DistinguishedName::parse(&mut Reader::new(w.as_bytes()))
                .unwrap() == dn
        }
    }

    #[test]
    fn normalised_matching() {
        let a = sample();
        let mut b = DistinguishedName::new();
        b.set(DnAttribute::Country, "nz");
        b.set(DnAttribute::Organization, "DAVE'S  WETABURGERS");
        b.set(DnAttribute::CommonName, "dave smith");
        assert!(a.matches(&b));
        assert_ne!(a, b);

        let mut c = sample();
        c.set(DnAttribute::CommonName, "Eve Smith");
        assert!(!a.matches(&c));
    }

    #[test]
    fn set_replaces() {
        let mut dn = sample();
        dn.set(DnAttribute::CommonName, "Dave II");
        assert_eq!(dn.get(DnAttribute::CommonName), Some("Dave II"));
        assert_eq!(dn.normalized().len(), 3);
    }
}
