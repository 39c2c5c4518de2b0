//! The envelope building engine.
//!
//! At construction the attached resources are frozen into a plan:
//! exactly one primary action (plain data, signing, encryption, or
//! MACing), optionally with compression underneath.  The header is
//! emitted immediately; pushed content streams through the plan's
//! stages; `flush` emits the trailer.
//!
//! Framing is indefinite-length throughout, except that a declared
//! data size turns the content item itself into a single
//! definite-length string.

#[cfg(feature = "compression-deflate")]
use flate2::{Compress, Compression, FlushCompress, Status};

use crate::ber::{self, Oid, Writer};
use crate::crypto::backend::interface::{
    Asymmetric as _, Backend as _, CipherContext, CipherDirection,
    Digest as _, DigestContext, MacContext, Symmetric as _,
};
use crate::crypto::backend::Soft;
use crate::crypto::{Password, SessionKey};
use crate::types::{ContentType, EnvelopeFormat, HashAlgorithm,
                   SymmetricAlgorithm};
use crate::{Error, Result};
use super::{CapturedKey, KeyIdentifier, RecipientSpec, Resources,
            SignerSpec};

pub(super) fn oid_data() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 7, 1])
}

pub(super) fn oid_signed_data() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 7, 2])
}

pub(super) fn oid_enveloped_data() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 7, 3])
}

pub(super) fn oid_auth_data() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 9, 16, 1, 2])
}

pub(super) fn oid_compressed_data() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 9, 16, 1, 9])
}

pub(super) fn oid_zlib() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 9, 16, 3, 8])
}

pub(super) fn oid_sha256() -> Oid {
    Oid::from_arcs(&[2, 16, 840, 1, 101, 3, 4, 2, 1])
}

pub(super) fn oid_sha512() -> Oid {
    Oid::from_arcs(&[2, 16, 840, 1, 101, 3, 4, 2, 3])
}

pub(super) fn oid_hmac_sha256() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 2, 9])
}

pub(super) fn oid_aes256_cfb() -> Oid {
    Oid::from_arcs(&[2, 16, 840, 1, 101, 3, 4, 1, 44])
}

pub(super) fn oid_rsa_transport() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 1, 1])
}

pub(super) fn oid_password_kdf() -> Oid {
    // Our string-to-key mechanism; profile-internal.
    Oid::from_arcs(&[1, 3, 6, 1, 4, 1, 11591, 4, 13])
}

pub(super) fn oid_ed25519() -> Oid {
    Oid::from_arcs(&[1, 3, 101, 112])
}

pub(super) fn oid_sha256_with_rsa() -> Oid {
    Oid::from_arcs(&[1, 2, 840, 113549, 1, 1, 11])
}

pub(super) fn hash_oid(algo: HashAlgorithm) -> Oid {
    match algo {
        HashAlgorithm::Sha256 => oid_sha256(),
        HashAlgorithm::Sha512 => oid_sha512(),
    }
}

/// The primary action of a plan.
enum Action {
    Plain,
    Sign {
        signers: Vec<SignerSpec>,
        hasher: Box<dyn DigestContext>,
        detached: bool,
    },
    Encrypt {
        cipher: Box<dyn CipherContext>,
    },
    Mac {
        mac: Box<dyn MacContext>,
    },
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Action::Plain => f.write_str("Plain"),
            Action::Sign { signers, detached, .. } =>
                write!(f, "Sign({} signer(s), detached={})",
                       signers.len(), detached),
            Action::Encrypt { .. } => f.write_str("Encrypt"),
            Action::Mac { .. } => f.write_str("Mac"),
        }
    }
}

/// How the content item is framed.
#[derive(Debug)]
enum ContentFraming {
    /// Not represented in the output: raw passthrough or a detached
    /// signature.
    None,
    /// A single definite-length string; the declared size is counted
    /// down.
    Definite { remaining: u64 },
    /// A run of definite chunks inside an indefinite container.
    Chunked,
}

/// The envelope building engine.
pub(crate) struct Builder {
    format: EnvelopeFormat,
    action: Action,
    #[cfg(feature = "compression-deflate")]
    compressor: Option<Compress>,
    framing: ContentFraming,
    /// Whether the content container is an indefinite frame needing
    /// its own end-of-contents marker.
    container_eoc: bool,
    /// End-of-contents markers owed after the trailer items.
    trailing_eocs: usize,
    out: Vec<u8>,
    /// Trailer bytes that did not fit the output window.
    pending: Vec<u8>,
    trailer_built: bool,
    finished: bool,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("action", &self.action)
            .field("framing", &self.framing)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Builder {
    /// Freezes the resources into a plan and emits the header.
    pub(crate) fn new(format: EnvelopeFormat, resources: &Resources)
                      -> Result<Builder> {
        let mut actions = 0;
        if !resources.signers.is_empty() {
            actions += 1;
        }
        if resources.recipient.is_some() || resources.password.is_some()
            || resources.session_key.is_some()
        {
            actions += 1;
        }
        if resources.mac_key.is_some() {
            actions += 1;
        }
        if actions > 1 {
            return Err(Error::Invalid(
                "signing, encryption, and MACing are separate layers; \
                 nest envelopes to combine them".into()).into());
        }

        let mut builder = Builder {
            format,
            action: Action::Plain,
            #[cfg(feature = "compression-deflate")]
            compressor: None,
            framing: ContentFraming::None,
            container_eoc: false,
            trailing_eocs: 0,
            out: Vec::new(),
            pending: Vec::new(),
            trailer_built: false,
            finished: false,
        };

        if format == EnvelopeFormat::Raw {
            if actions > 0 || resources.compress {
                return Err(Error::Invalid(
                    "raw envelopes carry no transforms".into()).into());
            }
            return Ok(builder);
        }

        #[cfg(not(feature = "compression-deflate"))]
        if resources.compress {
            return Err(Error::NotAvailable(
                "compiled without compression support".into()).into());
        }
        #[cfg(feature = "compression-deflate")]
        if resources.compress {
            builder.compressor =
                Some(Compress::new(Compression::default(), true));
        }

        builder.write_header(resources)?;
        Ok(builder)
    }

    /// The inner content type identifier recorded in the encap
    /// header.
    fn econtent_oid(&self, resources: &Resources) -> Oid {
        if resources.compress {
            oid_compressed_data()
        } else {
            match resources.content_type.unwrap_or(ContentType::Data) {
                ContentType::Data => oid_data(),
                ContentType::SignedData => oid_signed_data(),
                ContentType::EnvelopedData => oid_enveloped_data(),
                ContentType::CompressedData => oid_compressed_data(),
                ContentType::AuthenticatedData => oid_auth_data(),
            }
        }
    }

    fn sized_framing(&mut self, w: &mut Writer, sized: Option<u64>) {
        match sized {
            Some(size) => {
                w.write_header(ber::TAG_OCTET_STRING, size as usize);
                self.framing = ContentFraming::Definite {
                    remaining: size,
                };
            }
            None => {
                self.framing = ContentFraming::Chunked;
            }
        }
    }

    fn write_header(&mut self, resources: &Resources) -> Result<()> {
        let hash_algo = resources.hash_algo.unwrap_or_default();
        // Compression makes the content size unpredictable, so the
        // hint only yields definite framing without it.
        let sized = if resources.compress {
            None
        } else {
            resources.data_size
        };
        let mut w = Writer::new();

        if !resources.signers.is_empty() {
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&oid_signed_data());
            w.write_indefinite_header(ber::tag_context(0));
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_integer(1);
            w.write_constructed(ber::TAG_SET, |w| {
                w.write_constructed(ber::TAG_SEQUENCE, |w| {
                    w.write_oid(&hash_oid(hash_algo));
                    Ok(())
                })
            })?;
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&self.econtent_oid(resources));
            if resources.detached {
                self.framing = ContentFraming::None;
                self.container_eoc = false;
            } else {
                w.write_indefinite_header(ber::tag_context(0));
                self.sized_framing(&mut w, sized);
                self.container_eoc = true;
            }
            // SignedData, [0], outer; the encap sequence closes
            // before the signer infos.
            self.trailing_eocs = 3;
            self.action = Action::Sign {
                signers: clone_signers(&resources.signers),
                hasher: Soft::hasher(hash_algo),
                detached: resources.detached,
            };
        } else if let Some(key) = &resources.mac_key {
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&oid_auth_data());
            w.write_indefinite_header(ber::tag_context(0));
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_integer(0);
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_oid(&oid_hmac_sha256());
                Ok(())
            })?;
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&self.econtent_oid(resources));
            w.write_indefinite_header(ber::tag_context(0));
            self.sized_framing(&mut w, sized);
            self.container_eoc = true;
            self.trailing_eocs = 3;
            self.action = Action::Mac {
                mac: Soft::mac(HashAlgorithm::Sha256, key)?,
            };
        } else if resources.recipient.is_some()
            || resources.password.is_some()
            || resources.session_key.is_some()
        {
            let algo = SymmetricAlgorithm::Aes256Cfb;
            let cek = match &resources.session_key {
                Some(key) => key.clone(),
                None => SessionKey::new(algo.key_size())?,
            };
            let mut iv = vec![0u8; algo.block_size()];
            Soft::random(&mut iv)?;

            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&oid_enveloped_data());
            w.write_indefinite_header(ber::tag_context(0));
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_integer(0);
            w.write_constructed(ber::TAG_SET, |w| {
                if let Some(password) = &resources.password {
                    write_password_recipient(w, password, &cek)?;
                }
                if let Some(recipient) = &resources.recipient {
                    write_key_transport_recipient(w, recipient, &cek)?;
                }
                Ok(())
            })?;
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&self.econtent_oid(resources));
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_oid(&oid_aes256_cfb());
                w.write_octet_string(&iv);
                Ok(())
            })?;
            match sized {
                Some(size) => {
                    // Implicitly tagged primitive string.
                    w.write_header(ber::tag_context_primitive(0),
                                   size as usize);
                    self.framing = ContentFraming::Definite {
                        remaining: size,
                    };
                    self.container_eoc = false;
                }
                None => {
                    w.write_indefinite_header(ber::tag_context(0));
                    self.framing = ContentFraming::Chunked;
                    self.container_eoc = true;
                }
            }
            // encryptedContentInfo, EnvelopedData, [0], outer.
            self.trailing_eocs = 4;
            self.action = Action::Encrypt {
                cipher: Soft::cipher(algo, cek.as_ref(), &iv,
                                     CipherDirection::Encrypt)?,
            };
        } else if resources.compress {
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&oid_compressed_data());
            w.write_indefinite_header(ber::tag_context(0));
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_integer(0);
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_oid(&oid_zlib());
                Ok(())
            })?;
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&oid_data());
            w.write_indefinite_header(ber::tag_context(0));
            self.framing = ContentFraming::Chunked;
            self.container_eoc = true;
            // encap SEQ, CompressedData SEQ, [0], outer.
            self.trailing_eocs = 4;
        } else {
            w.write_indefinite_header(ber::TAG_SEQUENCE);
            w.write_oid(&oid_data());
            w.write_indefinite_header(ber::tag_context(0));
            self.sized_framing(&mut w, sized);
            self.container_eoc = true;
            // Only the outer sequence remains after the content.
            self.trailing_eocs = 1;
        }

        self.out.extend_from_slice(w.as_bytes());
        Ok(())
    }

    /// Pushes content, returning how much input was consumed.  Stops
    /// early once the output window is full; the caller pops and
    /// re-pushes the tail.
    pub(crate) fn push(&mut self, data: &[u8], cap: usize)
                       -> Result<usize> {
        if self.finished || self.trailer_built {
            return Err(Error::Complete.into());
        }
        if self.format == EnvelopeFormat::Raw {
            let room = cap.saturating_sub(self.out.len());
            let take = room.min(data.len());
            self.out.extend_from_slice(&data[..take]);
            return Ok(take);
        }

        let mut consumed = 0;
        while consumed < data.len() && self.out.len() < cap {
            let take = (data.len() - consumed).min(4096);
            self.absorb(&data[consumed..consumed + take])?;
            consumed += take;
        }
        Ok(consumed)
    }

    /// Runs one chunk through hash/MAC, compression, encryption, and
    /// framing, in that order.
    fn absorb(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.action {
            Action::Sign { hasher, .. } => hasher.update(chunk),
            Action::Mac { mac } => mac.update(chunk),
            _ => (),
        }

        #[allow(unused_mut)]
        let mut staged = chunk.to_vec();
        #[cfg(feature = "compression-deflate")]
        if let Some(compress) = &mut self.compressor {
            let mut squeezed = Vec::with_capacity(chunk.len() + 64);
            deflate_into(compress, chunk, &mut squeezed,
                         FlushCompress::None)?;
            staged = squeezed;
        }

        if let Action::Encrypt { cipher } = &mut self.action {
            cipher.process(&mut staged);
        }
        self.frame(&staged)
    }

    fn frame(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        match &mut self.framing {
            ContentFraming::None => Ok(()),
            ContentFraming::Definite { remaining } => {
                if (bytes.len() as u64) > *remaining {
                    return Err(Error::Invalid(
                        "more content than the declared size".into())
                        .into());
                }
                *remaining -= bytes.len() as u64;
                self.out.extend_from_slice(bytes);
                Ok(())
            }
            ContentFraming::Chunked => {
                let mut w = Writer::new();
                w.write_primitive(ber::TAG_OCTET_STRING, bytes);
                self.out.extend_from_slice(w.as_bytes());
                Ok(())
            }
        }
    }

    /// Finalises the message: drains the compressor, closes the
    /// content, and emits the trailer.  Returns a structured
    /// overflow when the output window cannot take the whole
    /// trailer; pop what is available and call again.
    pub(crate) fn flush(&mut self, cap: usize) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.trailer_built {
            self.build_trailer()?;
            self.trailer_built = true;
        }
        let room = cap.saturating_sub(self.out.len());
        let take = room.min(self.pending.len());
        if take > 0 {
            self.out.extend_from_slice(&self.pending[..take]);
            crate::vec_drain_prefix(&mut self.pending, take);
        }
        if !self.pending.is_empty() {
            return Err(Error::Overflow(self.pending.len()).into());
        }
        self.finished = true;
        Ok(())
    }

    fn build_trailer(&mut self) -> Result<()> {
        if self.format == EnvelopeFormat::Raw {
            return Ok(());
        }
        // Drain the compressor through the remaining stages.
        #[cfg(feature = "compression-deflate")]
        if let Some(mut compress) = self.compressor.take() {
            let mut tail = Vec::with_capacity(256);
            deflate_into(&mut compress, &[], &mut tail,
                         FlushCompress::Finish)?;
            if let Action::Encrypt { cipher } = &mut self.action {
                cipher.process(&mut tail);
            }
            self.frame(&tail)?;
        }

        if let ContentFraming::Definite { remaining } = &self.framing {
            if *remaining > 0 {
                return Err(Error::Incomplete(format!(
                    "{} declared byte(s) not yet pushed", remaining))
                    .into());
            }
        }

        let mut w = Writer::new();
        if self.container_eoc {
            w.write_end_of_contents();
        }

        match std::mem::replace(&mut self.action, Action::Plain) {
            Action::Plain => (),
            Action::Encrypt { .. } => (),
            Action::Mac { mac } => {
                // Close the encapsulated-content sequence, then the
                // MAC value follows it.
                w.write_end_of_contents();
                w.write_octet_string(&mac.finish());
            }
            Action::Sign { signers, hasher, .. } => {
                // Likewise: the signer infos sit after the closed
                // encapsulated content.
                w.write_end_of_contents();
                let digest = hasher.finish();
                let carried: Vec<&Vec<u8>> = signers.iter()
                    .filter_map(|s| s.cert.as_ref())
                    .collect();
                if !carried.is_empty() {
                    w.write_constructed(ber::tag_context(0), |w| {
                        for cert in carried {
                            w.write_raw(cert);
                        }
                        Ok(())
                    })?;
                }
                w.write_constructed(ber::TAG_SET, |w| {
                    for signer in &signers {
                        write_signer_info(w, signer, &digest)?;
                    }
                    Ok(())
                })?;
            }
        }

        for _ in 0..self.trailing_eocs {
            w.write_end_of_contents();
        }
        self.trailing_eocs = 0;
        self.pending = w.into_vec();
        Ok(())
    }

    /// Pops up to `max` output bytes.
    pub(crate) fn pop(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.out.len());
        let out = self.out[..take].to_vec();
        crate::vec_drain_prefix(&mut self.out, take);
        out
    }
}

fn clone_signers(signers: &[SignerSpec]) -> Vec<SignerSpec> {
    signers.iter().map(|s| SignerSpec {
        key: s.key.clone(),
        sid: s.sid.clone(),
        cert: s.cert.clone(),
    }).collect()
}

#[cfg(feature = "compression-deflate")]
fn deflate_into(compress: &mut Compress, input: &[u8],
                out: &mut Vec<u8>, flush: FlushCompress) -> Result<()> {
    let finishing = matches!(flush, FlushCompress::Finish);
    let mut input = input;
    loop {
        out.reserve(1024);
        let before = compress.total_in();
        let status = compress.compress_vec(input, out, flush)
            .map_err(|e| anyhow::Error::from(Error::Internal(
                format!("compression failed: {}", e))))?;
        let took = (compress.total_in() - before) as usize;
        input = &input[took..];
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if input.is_empty() && !finishing {
                    return Ok(());
                }
            }
        }
    }
}

fn write_signer_info(w: &mut Writer, signer: &SignerSpec, digest: &[u8])
                     -> Result<()> {
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        match &signer.sid {
            KeyIdentifier::IssuerSerial(name, serial) => {
                w.write_integer(1);
                w.write_constructed(ber::TAG_SEQUENCE, |w| {
                    w.write_raw(name);
                    w.write_integer_bytes(serial);
                    Ok(())
                })?;
            }
            KeyIdentifier::KeyId(id) => {
                w.write_integer(3);
                w.write_primitive(ber::tag_context_primitive(0), id);
            }
        }
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_oid(&oid_sha256());
            Ok(())
        })?;
        let (sig_oid, signature) = match &signer.key {
            CapturedKey::Rsa(parts) => (
                oid_sha256_with_rsa(),
                Soft::rsa_sign_pkcs1_sha256(parts, digest)?,
            ),
            CapturedKey::Ed25519 { secret, public } => (
                oid_ed25519(),
                Soft::ed25519_sign(secret, public, digest)?.to_vec(),
            ),
        };
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_oid(&sig_oid);
            if sig_oid == oid_sha256_with_rsa() {
                w.write_null();
            }
            Ok(())
        })?;
        w.write_octet_string(&signature);
        Ok(())
    })
}

fn write_password_recipient(w: &mut Writer, password: &Password,
                            cek: &SessionKey) -> Result<()> {
    let mut salt = vec![0u8; 16];
    Soft::random(&mut salt)?;
    let kek = password.derive_key(&salt, 32)?;
    let mut iv = vec![0u8; 16];
    Soft::random(&mut iv)?;
    let mut wrapped = cek.as_ref().to_vec();
    Soft::cipher(SymmetricAlgorithm::Aes256Cfb, kek.as_ref(), &iv,
                 CipherDirection::Encrypt)?
        .process(&mut wrapped);

    // Password recipient, [3].
    w.write_constructed(ber::tag_context(3), |w| {
        w.write_integer(0);
        w.write_constructed(ber::tag_context(0), |w| {
            w.write_oid(&oid_password_kdf());
            w.write_constructed(ber::TAG_SEQUENCE, |w| {
                w.write_octet_string(&salt);
                Ok(())
            })
        })?;
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_oid(&oid_aes256_cfb());
            w.write_octet_string(&iv);
            Ok(())
        })?;
        w.write_octet_string(&wrapped);
        Ok(())
    })
}

fn write_key_transport_recipient(w: &mut Writer, recipient: &RecipientSpec,
                                 cek: &SessionKey) -> Result<()> {
    let wrapped = match &recipient.key {
        crate::cert::PublicKeyInfo::Rsa { n, e } =>
            Soft::rsa_encrypt_pkcs1(n, e, cek.as_ref())?,
        crate::cert::PublicKeyInfo::Ed25519(_) =>
            return Err(Error::NotAvailable(
                "Ed25519 keys cannot transport session keys".into())
                .into()),
    };
    w.write_constructed(ber::TAG_SEQUENCE, |w| {
        match &recipient.rid {
            KeyIdentifier::IssuerSerial(name, serial) => {
                w.write_integer(0);
                w.write_constructed(ber::TAG_SEQUENCE, |w| {
                    w.write_raw(name);
                    w.write_integer_bytes(serial);
                    Ok(())
                })?;
            }
            KeyIdentifier::KeyId(id) => {
                w.write_integer(2);
                w.write_primitive(ber::tag_context_primitive(0), id);
            }
        }
        w.write_constructed(ber::TAG_SEQUENCE, |w| {
            w.write_oid(&oid_rsa_transport());
            w.write_null();
            Ok(())
        })?;
        w.write_octet_string(&wrapped);
        Ok(())
    })
}
