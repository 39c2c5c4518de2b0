//! The file-resident keyset backend.
//!
//! A single structured container holds the item list and the opaque
//! blob slots.  The whole store is read at open and rewritten on
//! commit; stores of the size this backend is meant for (user keys,
//! a trust list, configuration) make that the right trade.

use std::path::{Path, PathBuf};

use buffered_reader::BufferedReader as _;
use tracing::debug;

use crate::ber::{self, Reader, Writer};
use crate::types::KeyId;
use crate::{Error, Result};
use super::{BlobKind, KeysetBackend, KeysetOptions, PrivateBlob,
            StoredItem};

/// A file-resident keyset.  Without a path it is a purely in-memory
/// store, used for ephemeral keysets and tests.
#[derive(Debug)]
pub struct FileKeyset {
    path: Option<PathBuf>,
    writable: bool,
    items: Vec<StoredItem>,
    blobs: Vec<(BlobKind, Vec<u8>)>,
    dirty: bool,
}

impl FileKeyset {
    /// Opens or creates a store.
    pub fn open(path: Option<&Path>, options: KeysetOptions)
                -> Result<FileKeyset> {
        let writable = options != KeysetOptions::ReadOnly;
        let mut keyset = FileKeyset {
            path: path.map(PathBuf::from),
            writable,
            items: Vec::new(),
            blobs: Vec::new(),
            dirty: false,
        };
        match (path, options) {
            (None, _) | (_, KeysetOptions::Create) => (),
            (Some(path), _) => {
                let mut reader = buffered_reader::File::open(path)
                    .map_err(|e| anyhow::Error::from(Error::Open(
                        format!("{}: {}", path.display(), e))))?;
                let data = reader.steal_eof()
                    .map_err(|e| anyhow::Error::from(Error::ReadFailed(
                        format!("{}: {}", path.display(), e))))?;
                keyset.load(&data)?;
            }
        }
        Ok(keyset)
    }

    fn load(&mut self, data: &[u8]) -> Result<()> {
        let mut r = Reader::new(data);
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let version = r.read_integer()?;
            if version != 1 {
                return Err(Error::BadData(
                    format!("container version {}", version)).into());
            }
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                while !r.is_empty() {
                    self.items.push(read_item(r)?);
                }
                Ok(())
            })?;
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                while !r.is_empty() {
                    r.read_constructed(ber::TAG_SEQUENCE, |r| {
                        let kind = BlobKind::from_code(r.read_integer()?)?;
                        let data = r.read_octet_string()?;
                        self.blobs.push((kind, data));
                        Ok(())
                    })?;
                }
                Ok(())
            })
        })?;
        if !r.is_empty() {
            return Err(Error::BadData(
                "trailing bytes in container".into()).into());
        }
        debug!(items = self.items.len(), "loaded keyset");
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_integer(1);
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                for item in &self.items {
                    write_item(w, item)?;
                }
                Ok(())
            })?;
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                for (kind, data) in &self.blobs {
                    w.write_constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_integer(kind.code());
                        w.write_octet_string(data);
                        Ok(())
                    })?;
                }
                Ok(())
            })
        })?;
        Ok(w.into_vec())
    }
}

impl KeysetBackend for FileKeyset {
    fn writable(&self) -> bool {
        self.writable
    }

    fn get(&self, id: &KeyId) -> Result<&StoredItem> {
        self.items.iter()
            .find(|item| item.matches(id))
            .ok_or_else(|| Error::NotFound(
                format!("no item matching {:?}", id)).into())
    }

    fn set(&mut self, item: StoredItem) -> Result<()> {
        if !self.writable {
            return Err(Error::Permission(
                "keyset is read-only".into()).into());
        }
        // Replace an existing entry for the same certificate or
        // label.
        let replace = self.items.iter().position(|existing| {
            (item.cert.is_some() && existing.cert == item.cert)
                || (item.label.is_some()
                    && existing.label == item.label)
        });
        match replace {
            Some(at) => self.items[at] = item,
            None => self.items.push(item),
        }
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, id: &KeyId) -> Result<()> {
        if !self.writable {
            return Err(Error::Permission(
                "keyset is read-only".into()).into());
        }
        let at = self.items.iter().position(|item| item.matches(id))
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(
                format!("no item matching {:?}", id))))?;
        self.items.remove(at);
        self.dirty = true;
        Ok(())
    }

    fn query(&self, id: &KeyId) -> usize {
        self.items.iter().filter(|item| item.matches(id)).count()
    }

    fn get_blob(&self, kind: BlobKind) -> Option<&[u8]> {
        self.blobs.iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, data)| data.as_slice())
    }

    fn set_blob(&mut self, kind: BlobKind, data: Vec<u8>) -> Result<()> {
        if !self.writable {
            return Err(Error::Permission(
                "keyset is read-only".into()).into());
        }
        match self.blobs.iter_mut().find(|(k, _)| *k == kind) {
            Some(slot) => slot.1 = data,
            None => self.blobs.push((kind, data)),
        }
        self.dirty = true;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if !self.writable {
            return Err(Error::Permission(
                "keyset is read-only".into()).into());
        }
        self.items.clear();
        self.blobs.clear();
        self.dirty = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let encoded = self.encode()?;
            std::fs::write(path, &encoded)
                .map_err(|e| anyhow::Error::from(Error::WriteFailed(
                    format!("{}: {}", path.display(), e))))?;
            debug!(path = %path.display(), bytes = encoded.len(),
                   "committed keyset");
        }
        self.dirty = false;
        Ok(())
    }
}

fn write_item(w: &mut Writer, item: &StoredItem) -> Result<()> {
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        if let Some(label) = &item.label {
            w.write_primitive(ber::tag_context_primitive(0),
                              label.as_bytes());
        }
        if let Some(cert) = &item.cert {
            w.write_primitive(ber::tag_context_primitive(1), cert);
        }
        if let Some(public) = &item.public {
            w.write_primitive(ber::tag_context_primitive(2), public);
        }
        match &item.private {
            None => (),
            Some(PrivateBlob::Plain(data)) => {
                w.write_primitive(ber::tag_context_primitive(3), data);
            }
            Some(PrivateBlob::Protected { salt, iv, data }) => {
                w.write_constructed(ber::tag_context(4), |w| {
                    w.write_octet_string(salt);
                    w.write_octet_string(iv);
                    w.write_octet_string(data);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}

fn read_item(r: &mut Reader) -> Result<StoredItem> {
    r.read_constructed(ber::TAG_SEQUENCE, |r| {
        let mut item = StoredItem::default();
        while !r.is_empty() {
            let tag = r.peek_tag()?;
            if tag == ber::tag_context_primitive(0) {
                let label = r.read_value(tag)?;
                item.label = Some(String::from_utf8(label.to_vec())
                    .map_err(|_| anyhow::Error::from(Error::BadData(
                        "undecodable label".into())))?);
            } else if tag == ber::tag_context_primitive(1) {
                item.cert = Some(r.read_value(tag)?.to_vec());
            } else if tag == ber::tag_context_primitive(2) {
                item.public = Some(r.read_value(tag)?.to_vec());
            } else if tag == ber::tag_context_primitive(3) {
                item.private = Some(PrivateBlob::Plain(
                    r.read_value(tag)?.to_vec()));
            } else if tag == ber::tag_context(4) {
                item.private = Some(r.read_constructed(tag, |r| {
                    Ok(PrivateBlob::Protected {
                        salt: r.read_octet_string()?,
                        iv: r.read_octet_string()?,
                        data: r.read_octet_string()?,
                    })
                })?);
            } else {
                return Err(Error::BadData(
                    format!("unknown item member {:#04x}", tag)).into());
            }
        }
        Ok(item)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.kst");

        let mut keyset = FileKeyset::open(
            Some(&path), KeysetOptions::Create).unwrap();
        keyset.set(StoredItem {
            label: Some("alpha".into()),
            cert: None,
            public: Some(vec![1, 2, 3]),
            private: Some(PrivateBlob::Plain(vec![4, 5])),
        }).unwrap();
        keyset.set_blob(BlobKind::UserIndex, vec![9, 9]).unwrap();
        keyset.commit().unwrap();

        let mut reopened = FileKeyset::open(
            Some(&path), KeysetOptions::ReadOnly).unwrap();
        let item = reopened.get(&KeyId::Name("alpha".into())).unwrap();
        assert_eq!(item.public.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(reopened.get_blob(BlobKind::UserIndex),
                   Some(&[9u8, 9][..]));
        assert!(!reopened.writable());
        assert!(reopened.set_blob(BlobKind::Config, vec![]).is_err());
    }

    #[test]
    fn missing_store_fails_open() {
        let err = FileKeyset::open(
            Some(Path::new("/nonexistent/keys.kst")),
            KeysetOptions::ReadOnly).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(e, Error::Open(_))));
    }

    #[test]
    fn truncated_container_is_bad_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.kst");
        let mut keyset = FileKeyset::open(
            Some(&path), KeysetOptions::Create).unwrap();
        keyset.set_blob(BlobKind::Config, vec![1; 64]).unwrap();
        keyset.commit().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, &bytes).unwrap();
        let err = FileKeyset::open(
            Some(&path), KeysetOptions::ReadOnly).unwrap_err();
        assert!(Error::matches(&err, |e| matches!(
            e, Error::BadData(_) | Error::Underflow(_))));
    }
}
