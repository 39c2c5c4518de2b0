//! Per-user configuration options.
//!
//! A small table of typed options with defaults, range discipline
//! enforced by the kernel's tables, and a dirty flag per slot.  The
//! compliance level and the self-test verdict are reducing-only:
//! once lowered they never go back up for the lifetime of the owning
//! user.
//!
//! Serialisation covers every option that differs from its default,
//! plus a snapshot of the owning user's trust store; the combined
//! blob is what the user object commits to its keyset.

use std::collections::HashMap;

use crate::attr::{Attribute, AttributeValue};
use crate::ber::{self, Reader, Writer};
use crate::cert::trust::TrustManager;
use crate::types::ComplianceLevel;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(Option<String>),
}

#[derive(Clone, Debug)]
struct OptionSlot {
    value: OptionValue,
    dirty: bool,
}

/// An option's static description: default value and whether writes
/// may only reduce it.
struct OptionDef {
    attr: Attribute,
    default: OptionValue,
    reducing: bool,
}

fn definitions() -> &'static [OptionDef] {
    static DEFS: once_cell::sync::Lazy<Vec<OptionDef>> =
        once_cell::sync::Lazy::new(|| vec![
            OptionDef {
                attr: Attribute::OptionComplianceLevel,
                default: OptionValue::Int(
                    ComplianceLevel::PkixFull.to_option()),
                reducing: true,
            },
            OptionDef {
                attr: Attribute::OptionSelfTestOk,
                default: OptionValue::Bool(false),
                reducing: true,
            },
            OptionDef {
                attr: Attribute::OptionDefaultHash,
                default: OptionValue::Int(1),
                reducing: false,
            },
            OptionDef {
                attr: Attribute::OptionDefaultCipher,
                default: OptionValue::Int(1),
                reducing: false,
            },
            OptionDef {
                attr: Attribute::OptionStorePath,
                default: OptionValue::Str(None),
                reducing: false,
            },
            OptionDef {
                attr: Attribute::OptionEnvelopeBuffer,
                default: OptionValue::Int(
                    crate::envelope::DEFAULT_BUFFER_SIZE as i64),
                reducing: false,
            },
        ]);
    &DEFS
}

fn definition(attr: Attribute) -> Option<&'static OptionDef> {
    definitions().iter().find(|def| def.attr == attr)
}

/// The per-user option table.
#[derive(Debug, Default)]
pub(crate) struct ConfigOptions {
    slots: HashMap<Attribute, OptionSlot>,
}

impl ConfigOptions {
    /// Returns a table holding the defaults.
    pub fn new() -> Self {
        ConfigOptions::default()
    }

    fn current(&self, attr: Attribute) -> Option<OptionValue> {
        if let Some(slot) = self.slots.get(&attr) {
            return Some(slot.value.clone());
        }
        definition(attr).map(|def| def.default.clone())
    }

    /// Returns whether the attribute is a known option.
    pub fn knows(&self, attr: Attribute) -> bool {
        definition(attr).is_some()
    }

    /// Reads an option; falls back to the default, so reads of known
    /// options never fail.
    pub fn get(&self, attr: Attribute) -> Result<AttributeValue> {
        match self.current(attr) {
            Some(OptionValue::Int(v)) => Ok(AttributeValue::Int(v)),
            Some(OptionValue::Bool(v)) => Ok(AttributeValue::Bool(v)),
            Some(OptionValue::Str(Some(v))) => Ok(AttributeValue::Str(v)),
            Some(OptionValue::Str(None)) => Err(Error::NotFound(
                format!("{} is unset", attr)).into()),
            None => Err(Error::NotAvailable(
                format!("{} is not an option", attr)).into()),
        }
    }

    /// Writes an option.  Value typing and ranges have already been
    /// checked by the kernel's tables; this enforces the
    /// reducing-only discipline and the dirty flag.
    ///
    /// Setting an option to its current value is deliberately not
    /// short-circuited: the dirty flag still rises.
    pub fn set(&mut self, attr: Attribute, value: AttributeValue)
               -> Result<()> {
        let def = definition(attr).ok_or_else(
            || anyhow::Error::from(Error::NotAvailable(
                format!("{} is not an option", attr))))?;
        let new = match (&def.default, value) {
            (OptionValue::Int(_), AttributeValue::Int(v)) =>
                OptionValue::Int(v),
            (OptionValue::Bool(_), AttributeValue::Bool(v)) =>
                OptionValue::Bool(v),
            (OptionValue::Str(_), AttributeValue::Str(v)) =>
                OptionValue::Str(Some(v)),
            _ => return Err(Error::ArgumentValue(
                format!("wrong value kind for {}", attr)).into()),
        };
        if def.reducing {
            let current = self.current(attr).expect("definition exists");
            let raised = match (&current, &new) {
                (OptionValue::Int(old), OptionValue::Int(new)) =>
                    new > old,
                (OptionValue::Bool(old), OptionValue::Bool(new)) =>
                    *new && !*old,
                _ => false,
            };
            if raised {
                return Err(Error::Permission(format!(
                    "{} may only be reduced", attr)).into());
            }
        }
        self.slots.insert(attr, OptionSlot { value: new, dirty: true });
        Ok(())
    }

    /// Clears a string option back to unset.
    pub fn delete(&mut self, attr: Attribute) -> Result<()> {
        let def = definition(attr).ok_or_else(
            || anyhow::Error::from(Error::NotAvailable(
                format!("{} is not an option", attr))))?;
        if !matches!(def.default, OptionValue::Str(_)) {
            return Err(Error::Permission(format!(
                "{} is not deletable", attr)).into());
        }
        match self.current(attr) {
            Some(OptionValue::Str(Some(_))) => {
                self.slots.insert(attr, OptionSlot {
                    value: OptionValue::Str(None),
                    dirty: true,
                });
                Ok(())
            }
            _ => Err(Error::NotFound(
                format!("{} is unset", attr)).into()),
        }
    }

    /// Returns the compliance level in force.
    pub fn compliance_level(&self) -> ComplianceLevel {
        match self.current(Attribute::OptionComplianceLevel) {
            Some(OptionValue::Int(v)) =>
                ComplianceLevel::from_option(v)
                    .unwrap_or(ComplianceLevel::Standard),
            _ => ComplianceLevel::Standard,
        }
    }

    /// Returns whether unsaved changes exist.
    pub fn is_dirty(&self) -> bool {
        self.slots.values().any(|slot| slot.dirty)
    }

    /// Clears the dirty flags after a successful commit.
    pub fn clear_dirty(&mut self) {
        for slot in self.slots.values_mut() {
            slot.dirty = false;
        }
    }

    /// Serialises the non-default options and a trust snapshot.
    /// Returns `None` when neither has anything to commit.
    pub fn encode(&self, trust: &TrustManager)
                  -> Result<Option<Vec<u8>>> {
        if !self.is_dirty() && !trust.changed {
            return Ok(None);
        }
        let mut w = Writer::new();
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                for def in definitions() {
                    let Some(slot) = self.slots.get(&def.attr) else {
                        continue;
                    };
                    if slot.value == def.default {
                        continue;
                    }
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_integer(def.attr.id() as i64);
                        match &slot.value {
                            OptionValue::Int(v) => w.write_integer(*v),
                            OptionValue::Bool(v) => w.write_boolean(*v),
                            OptionValue::Str(Some(v)) =>
                                w.write_string(ber::TAG_UTF8_STRING, v),
                            OptionValue::Str(None) => w.write_null(),
                        }
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            w.write_octet_string(&trust.encode()?);
            Ok(())
        })?;
        Ok(Some(w.into_vec()))
    }

    /// Restores options and the trust snapshot from a commit blob.
    pub fn decode(data: &[u8]) -> Result<(ConfigOptions, TrustManager)> {
        let mut config = ConfigOptions::new();
        let mut r = Reader::new(data);
        let trust = r.read_constructed(ber::TAG_SEQUENCE, |r| {
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                while !r.is_empty() {
                    r.read_constructed(ber::TAG_SEQUENCE, |r| {
                        let attr = Attribute::from_id(
                            r.read_integer()? as u32)?;
                        let value = match r.peek_tag()? {
                            ber::TAG_INTEGER => OptionValue::Int(
                                r.read_integer()?),
                            ber::TAG_BOOLEAN => OptionValue::Bool(
                                r.read_boolean()?),
                            ber::TAG_UTF8_STRING => OptionValue::Str(
                                Some(r.read_string(
                                    &[ber::TAG_UTF8_STRING])?)),
                            ber::TAG_NULL => {
                                r.read_null()?;
                                OptionValue::Str(None)
                            }
                            tag => return Err(Error::BadData(format!(
                                "unexpected option value tag {:#04x}",
                                tag)).into()),
                        };
                        config.slots.insert(attr, OptionSlot {
                            value,
                            dirty: false,
                        });
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            let trust_blob = r.read_octet_string()?;
            TrustManager::decode(&trust_blob)
        })?;
        if !r.is_empty() {
            return Err(Error::BadData(
                "trailing bytes in configuration".into()).into());
        }
        Ok((config, trust))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_dirty_tracking() {
        let mut config = ConfigOptions::new();
        assert!(!config.is_dirty());
        assert_eq!(config.get(Attribute::OptionDefaultHash).unwrap(),
                   AttributeValue::Int(1));

        config.set(Attribute::OptionDefaultHash,
                   AttributeValue::Int(2)).unwrap();
        assert!(config.is_dirty());

        // A same-value write still raises the dirty flag.
        config.clear_dirty();
        config.set(Attribute::OptionDefaultHash,
                   AttributeValue::Int(2)).unwrap();
        assert!(config.is_dirty());
    }

    #[test]
    fn compliance_level_is_reducing_only() {
        let mut config = ConfigOptions::new();
        assert_eq!(config.compliance_level(), ComplianceLevel::PkixFull);
        config.set(Attribute::OptionComplianceLevel,
                   AttributeValue::Int(2)).unwrap();
        assert_eq!(config.compliance_level(), ComplianceLevel::Standard);
        let err = config.set(Attribute::OptionComplianceLevel,
                             AttributeValue::Int(3)).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Permission(_))));
        // Equal or lower is fine.
        config.set(Attribute::OptionComplianceLevel,
                   AttributeValue::Int(2)).unwrap();
        config.set(Attribute::OptionComplianceLevel,
                   AttributeValue::Int(0)).unwrap();
    }

    #[test]
    fn string_options_delete_to_unset() {
        let mut config = ConfigOptions::new();
        assert!(config.get(Attribute::OptionStorePath).is_err());
        let err = config.delete(Attribute::OptionStorePath).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::NotFound(_))));
        config.set(Attribute::OptionStorePath,
                   AttributeValue::Str("/var/keys".into())).unwrap();
        assert_eq!(config.get(Attribute::OptionStorePath).unwrap(),
                   AttributeValue::Str("/var/keys".into()));
        config.delete(Attribute::OptionStorePath).unwrap();
        assert!(config.get(Attribute::OptionStorePath).is_err());
        // Non-string options are not deletable.
        let err = config.delete(Attribute::OptionDefaultHash).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Permission(_))));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut config = ConfigOptions::new();
        let trust = TrustManager::new();
        // Nothing to commit yet.
        assert!(config.encode(&trust).unwrap().is_none());

        config.set(Attribute::OptionComplianceLevel,
                   AttributeValue::Int(2)).unwrap();
        config.set(Attribute::OptionStorePath,
                   AttributeValue::Str("/tmp/store".into())).unwrap();
        let blob = config.encode(&trust).unwrap().unwrap();

        let (restored, restored_trust) =
            ConfigOptions::decode(&blob).unwrap();
        assert_eq!(restored.compliance_level(),
                   ComplianceLevel::Standard);
        assert_eq!(restored.get(Attribute::OptionStorePath).unwrap(),
                   AttributeValue::Str("/tmp/store".into()));
        assert!(!restored.is_dirty());
        assert_eq!(restored_trust.count(), 0);
    }
}
