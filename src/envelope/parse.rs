//! The envelope parsing engine.
//!
//! A poll-style state machine: `header -> awaiting-resource -> body
//! -> trailer -> finished`, with `error` terminal from anywhere.
//! Input accumulates until a phase can complete; a truncated
//! structure simply waits for more bytes, while malformed data is
//! fatal.  When a frame requires a resource the caller has not
//! supplied, the machine suspends and reports which attributes would
//! satisfy it; supplying them and pushing again resumes exactly
//! where it stopped.

#[cfg(feature = "compression-deflate")]
use flate2::{Decompress, FlushDecompress, Status};

use tracing::debug;

use crate::attr::Attribute;
use crate::ber::{self, Length, Reader};
use crate::cert::Certificate;
use crate::crypto::backend::interface::{
    Asymmetric as _, CipherContext, CipherDirection, Digest as _,
    DigestContext, MacContext, Symmetric as _,
};
use crate::crypto::backend::Soft;
use crate::crypto::{secure_cmp, SessionKey};
use crate::kernel::{Handle, Kernel, Message, PushStatus};
use crate::types::{EnvelopeFormat, HashAlgorithm, KeyId,
                   SymmetricAlgorithm};
use crate::{Error, Result};
use super::build::{oid_aes256_cfb, oid_auth_data, oid_compressed_data,
                   oid_data, oid_ed25519, oid_enveloped_data,
                   oid_hmac_sha256, oid_password_kdf, oid_rsa_transport,
                   oid_sha256, oid_sha256_with_rsa, oid_sha512,
                   oid_signed_data, oid_zlib};
use super::{CapturedKey, KeyIdentifier, Resources};

#[derive(Debug, PartialEq, Eq)]
enum State {
    Header,
    AwaitingResource,
    Body,
    Trailer,
    /// A detached signature has been parsed; the signed content
    /// arrives through further pushes or a hash attribute.
    DetachedContent,
    Finished,
    Failed,
}

/// The outer structure recognised in the header.
#[derive(Debug)]
enum Layout {
    Data,
    Signed {
        hash: HashAlgorithm,
        detached: bool,
        compressed: bool,
    },
    Enveloped {
        recipients: Vec<RecipientInfo>,
        iv: Vec<u8>,
        compressed: bool,
    },
    Compressed,
    Auth {
        compressed: bool,
    },
}

#[derive(Debug)]
enum RecipientInfo {
    Password {
        salt: Vec<u8>,
        iv: Vec<u8>,
        wrapped: Vec<u8>,
    },
    KeyTransport {
        rid: KeyIdentifier,
        wrapped: Vec<u8>,
    },
}

/// How the content item is being read.
#[derive(Debug)]
enum Reading {
    /// No content is present (detached signatures).
    None,
    /// A single definite-length string.
    Definite { remaining: u64 },
    /// Definite chunks until an end-of-contents marker, which also
    /// closes the containing frame.
    Chunked { chunk_remaining: u64 },
}

/// What remains to be read after the content.
#[derive(Copy, Clone, Debug)]
enum TrailerStep {
    Eoc,
    MacValue,
    SignerInfos,
}

struct BodyState {
    cipher: Option<Box<dyn CipherContext>>,
    hasher: Option<Box<dyn DigestContext>>,
    mac: Option<Box<dyn MacContext>>,
    #[cfg(feature = "compression-deflate")]
    inflate: Option<Decompress>,
    reading: Reading,
}

impl std::fmt::Debug for BodyState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BodyState")
            .field("reading", &self.reading)
            .finish()
    }
}

#[derive(Debug)]
struct ParsedSigner {
    sid: KeyIdentifier,
    signature: Vec<u8>,
    cert: Option<Vec<u8>>,
    result: Option<bool>,
    handle: Option<Handle>,
}

/// The envelope parsing engine.
pub(crate) struct Parser {
    format: EnvelopeFormat,
    state: State,
    in_buf: Vec<u8>,
    out: Vec<u8>,
    layout: Option<Layout>,
    body: Option<BodyState>,
    trailer_plan: Vec<TrailerStep>,
    trailer_done: usize,
    signers: Vec<ParsedSigner>,
    mac_expected: Option<Vec<u8>>,
    mac_computed: Option<Vec<u8>>,
    digest: Option<Vec<u8>>,
    detached_hasher: Option<Box<dyn DigestContext>>,
    detached_fed: bool,
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("state", &self.state)
            .field("buffered", &self.in_buf.len())
            .field("signers", &self.signers.len())
            .finish()
    }
}

impl Parser {
    pub(crate) fn new(format: EnvelopeFormat) -> Self {
        Parser {
            format,
            state: State::Header,
            in_buf: Vec::new(),
            out: Vec::new(),
            layout: None,
            body: None,
            trailer_plan: Vec::new(),
            trailer_done: 0,
            signers: Vec::new(),
            mac_expected: None,
            mac_computed: None,
            digest: None,
            detached_hasher: None,
            detached_fed: false,
        }
    }

    /// Accepts input, returning how much was consumed and how to
    /// proceed.
    pub(crate) fn push(&mut self, kernel: &Kernel, data: &[u8],
                       resources: &Resources, cap: usize)
                       -> Result<(usize, PushStatus)> {
        if self.state == State::Failed {
            return Err(Error::Invalid(
                "the envelope has already failed".into()).into());
        }
        if self.format == EnvelopeFormat::Raw {
            let room = cap.saturating_sub(self.out.len());
            let take = room.min(data.len());
            self.out.extend_from_slice(&data[..take]);
            return Ok((take, PushStatus::Accepted));
        }
        if self.state == State::Finished {
            return Ok((0, PushStatus::Complete));
        }

        let mut consumed = 0;
        if self.out.len() < cap {
            self.in_buf.extend_from_slice(data);
            consumed = data.len();
        }
        let status = self.run(kernel, resources, cap)
            .map_err(|err| {
                if !is_underflow(&err) {
                    self.state = State::Failed;
                }
                err
            })?;
        if status == PushStatus::Complete {
            // Surplus bytes past the end of the message go back to
            // the caller.
            let give_back = self.in_buf.len().min(consumed);
            consumed -= give_back;
            let keep = self.in_buf.len() - give_back;
            self.in_buf.truncate(keep);
        }
        Ok((consumed, status))
    }

    fn run(&mut self, kernel: &Kernel, resources: &Resources,
           cap: usize) -> Result<PushStatus> {
        loop {
            match self.state {
                State::Header => {
                    match self.parse_header()? {
                        Some(()) => self.state = State::AwaitingResource,
                        None => return Ok(PushStatus::Accepted),
                    }
                }
                State::AwaitingResource => {
                    if !self.required(resources).is_empty() {
                        debug!("envelope suspended awaiting resources");
                        return Ok(PushStatus::ResourceRequired);
                    }
                    match self.prepare_body(kernel, resources) {
                        Ok(body) => {
                            self.body = Some(body);
                            self.state = State::Body;
                        }
                        // The content header itself may be split
                        // across pushes.
                        Err(err) if is_underflow(&err) =>
                            return Ok(PushStatus::Accepted),
                        Err(err) => return Err(err),
                    }
                }
                State::Body => {
                    if !self.pump_body(cap)? {
                        return Ok(PushStatus::Accepted);
                    }
                    self.finish_body();
                    self.state = State::Trailer;
                }
                State::Trailer => {
                    if !self.parse_trailer()? {
                        return Ok(PushStatus::Accepted);
                    }
                    self.finish_trailer(resources)?;
                }
                State::DetachedContent => {
                    if !self.in_buf.is_empty() {
                        let pending = std::mem::take(&mut self.in_buf);
                        if let Some(hasher) = &mut self.detached_hasher {
                            hasher.update(&pending);
                            self.detached_fed = true;
                        }
                    }
                    return Ok(PushStatus::Accepted);
                }
                State::Finished => {
                    return Ok(if self.in_buf.is_empty() {
                        PushStatus::Accepted
                    } else {
                        PushStatus::Complete
                    });
                }
                State::Failed => unreachable!(),
            }
        }
    }

    /// The attributes that would unblock the engine.
    pub(crate) fn required(&self, resources: &Resources)
                           -> Vec<Attribute> {
        let mut needed = Vec::new();
        match (&self.state, &self.layout) {
            (State::AwaitingResource, Some(Layout::Enveloped {
                recipients, ..
            })) => {
                let has_password = recipients.iter().any(
                    |r| matches!(r, RecipientInfo::Password { .. }));
                let has_ktri = recipients.iter().any(
                    |r| matches!(r, RecipientInfo::KeyTransport { .. }));
                if has_password && resources.password.is_none() {
                    needed.push(Attribute::EnvPassword);
                }
                if has_ktri && resources.private_key.is_none()
                    && resources.decrypt_keyset.is_none()
                {
                    needed.push(Attribute::EnvPrivateKey);
                    needed.push(Attribute::EnvKeysetDecrypt);
                }
                if recipients.is_empty()
                    && resources.session_key.is_none()
                {
                    needed.push(Attribute::EnvSessionKey);
                }
                // Any one satisfied source is enough.
                if (has_password && resources.password.is_some())
                    || (has_ktri && (resources.private_key.is_some()
                                     || resources.decrypt_keyset.is_some()))
                    || (!recipients.is_empty()
                        && resources.session_key.is_some())
                {
                    needed.clear();
                }
            }
            (State::AwaitingResource, Some(Layout::Auth { .. })) => {
                if resources.mac_key.is_none() {
                    needed.push(Attribute::EnvMacKey);
                }
            }
            (State::DetachedContent, _) => {
                if !self.detached_fed
                    && resources.detached_hash.is_none()
                {
                    needed.push(Attribute::EnvDetachedHash);
                }
            }
            _ => (),
        }
        needed
    }

    fn parse_header(&mut self) -> Result<Option<()>> {
        let buf = std::mem::take(&mut self.in_buf);
        let mut r = Reader::new(&buf);
        let parsed = Self::parse_header_inner(&mut r);
        match parsed {
            Ok(layout) => {
                let pos = r.position();
                self.layout = Some(layout);
                self.in_buf = buf[pos..].to_vec();
                Ok(Some(()))
            }
            Err(err) if is_underflow(&err) => {
                self.in_buf = buf;
                Ok(None)
            }
            Err(err) => {
                self.in_buf = buf;
                Err(err)
            }
        }
    }

    fn parse_header_inner(r: &mut Reader) -> Result<Layout> {
        expect_indefinite(r, ber::TAG_SEQUENCE)?;
        let content_oid = r.read_oid()?;
        expect_indefinite(r, ber::tag_context(0))?;

        if content_oid == oid_data() {
            return Ok(Layout::Data);
        }
        if content_oid == oid_signed_data() {
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let _version = r.read_integer()?;
            let hash = r.read_constructed(ber::TAG_SET, |r| {
                r.read_constructed(ber::TAG_SEQUENCE, |r| {
                    let oid = r.read_oid()?;
                    if oid == oid_sha256() {
                        Ok(HashAlgorithm::Sha256)
                    } else if oid == oid_sha512() {
                        Ok(HashAlgorithm::Sha512)
                    } else {
                        Err(Error::NotAvailable(
                            "unsupported digest algorithm".into()).into())
                    }
                })
            })?;
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let econtent = r.read_oid()?;
            // Content present iff an explicit [0] frame follows.
            let detached = r.peek_tag()? != ber::tag_context(0);
            if !detached {
                expect_indefinite(r, ber::tag_context(0))?;
            }
            return Ok(Layout::Signed {
                hash,
                detached,
                compressed: econtent == oid_compressed_data(),
            });
        }
        if content_oid == oid_enveloped_data() {
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let _version = r.read_integer()?;
            let mut recipients = Vec::new();
            r.read_constructed(ber::TAG_SET, |r| {
                while !r.is_empty() {
                    recipients.push(parse_recipient(r)?);
                }
                Ok(())
            })?;
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let econtent = r.read_oid()?;
            let iv = r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let alg = r.read_oid()?;
                if alg != oid_aes256_cfb() {
                    return Err(Error::NotAvailable(
                        "unsupported content cipher".into()).into());
                }
                r.read_octet_string()
            })?;
            return Ok(Layout::Enveloped {
                recipients,
                iv,
                compressed: econtent == oid_compressed_data(),
            });
        }
        if content_oid == oid_auth_data() {
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let _version = r.read_integer()?;
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let alg = r.read_oid()?;
                if alg != oid_hmac_sha256() {
                    return Err(Error::NotAvailable(
                        "unsupported MAC algorithm".into()).into());
                }
                Ok(())
            })?;
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let econtent = r.read_oid()?;
            expect_indefinite(r, ber::tag_context(0))?;
            return Ok(Layout::Auth {
                compressed: econtent == oid_compressed_data(),
            });
        }
        if content_oid == oid_compressed_data() {
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let _version = r.read_integer()?;
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let alg = r.read_oid()?;
                if alg != oid_zlib() {
                    return Err(Error::NotAvailable(
                        "unsupported compression algorithm".into()).into());
                }
                Ok(())
            })?;
            expect_indefinite(r, ber::TAG_SEQUENCE)?;
            let _econtent = r.read_oid()?;
            expect_indefinite(r, ber::tag_context(0))?;
            return Ok(Layout::Compressed);
        }
        Err(Error::BadData("unrecognised content type".into()).into())
    }

    /// Turns satisfied resources into the body pipeline and lays out
    /// the trailer.
    fn prepare_body(&mut self, kernel: &Kernel, resources: &Resources)
                    -> Result<BodyState> {
        use TrailerStep::*;

        #[derive(Copy, Clone, PartialEq)]
        enum Kind { Data, Compressed, Auth, SignedDetached, Signed,
                    Enveloped }
        let kind = match self.layout.as_ref().expect("header parsed") {
            Layout::Data => Kind::Data,
            Layout::Compressed => Kind::Compressed,
            Layout::Auth { .. } => Kind::Auth,
            Layout::Signed { detached: true, .. } => Kind::SignedDetached,
            Layout::Signed { detached: false, .. } => Kind::Signed,
            Layout::Enveloped { .. } => Kind::Enveloped,
        };

        // Where the content starts, then what frames remain after
        // it.  The chunk reader consumes the marker closing its own
        // container, so the plans below start at the next frame out.
        let (reading, plan) = match kind {
            Kind::Data => (self.start_content()?, vec![Eoc]),
            Kind::Compressed =>
                (self.start_content()?, vec![Eoc, Eoc, Eoc, Eoc]),
            Kind::Auth =>
                (self.start_content()?,
                 vec![Eoc, MacValue, Eoc, Eoc, Eoc]),
            Kind::SignedDetached =>
                (Reading::None, vec![Eoc, SignerInfos, Eoc, Eoc, Eoc]),
            Kind::Signed =>
                (self.start_content()?,
                 vec![Eoc, SignerInfos, Eoc, Eoc, Eoc]),
            Kind::Enveloped =>
                (self.start_encrypted_content()?,
                 vec![Eoc, Eoc, Eoc, Eoc]),
        };

        let layout = self.layout.as_ref().expect("header parsed");
        let cipher = match layout {
            Layout::Enveloped { recipients, iv, .. } => {
                let cek = recover_cek(kernel, recipients, resources)?;
                Some(Soft::cipher(SymmetricAlgorithm::Aes256Cfb,
                                  cek.as_ref(), iv,
                                  CipherDirection::Decrypt)?)
            }
            _ => None,
        };
        let hasher = match layout {
            Layout::Signed { hash, .. } => Some(Soft::hasher(*hash)),
            _ => None,
        };
        let mac = match layout {
            Layout::Auth { .. } => {
                let key = resources.mac_key.as_ref()
                    .expect("resource check passed");
                Some(Soft::mac(HashAlgorithm::Sha256, key)?)
            }
            _ => None,
        };
        let inner_compressed = match layout {
            Layout::Compressed => true,
            Layout::Signed { compressed, .. } => *compressed,
            Layout::Enveloped { compressed, .. } => *compressed,
            Layout::Auth { compressed } => *compressed,
            Layout::Data => false,
        };
        #[cfg(feature = "compression-deflate")]
        let inflate = if inner_compressed {
            Some(Decompress::new(true))
        } else {
            None
        };
        #[cfg(not(feature = "compression-deflate"))]
        if inner_compressed {
            return Err(Error::NotAvailable(
                "compiled without compression support".into()).into());
        }

        self.trailer_plan = plan;
        self.trailer_done = 0;
        Ok(BodyState {
            cipher,
            hasher,
            mac,
            #[cfg(feature = "compression-deflate")]
            inflate,
            reading,
        })
    }

    /// Reads the header of the content item itself.
    fn start_content(&mut self) -> Result<Reading> {
        let (reading, pos) = {
            let mut r = Reader::new(&self.in_buf);
            let (tag, length) = r.read_header()?;
            if tag != ber::TAG_OCTET_STRING {
                return Err(Error::BadData(
                    "expected content string".into()).into());
            }
            match length {
                Length::Definite(len) =>
                    (Reading::Definite { remaining: len as u64 },
                     r.position()),
                Length::Indefinite => return Err(Error::BadData(
                    "unexpected constructed content".into()).into()),
            }
        };
        // A chunk run begins with its first chunk header; a definite
        // string is the whole content.  Distinguished lazily: a
        // definite string here may equally be the first chunk of a
        // run, so read chunk-wise in both cases.
        crate::vec_drain_prefix(&mut self.in_buf, pos);
        let Reading::Definite { remaining } = reading else {
            unreachable!()
        };
        Ok(Reading::Chunked { chunk_remaining: remaining })
    }

    fn start_encrypted_content(&mut self) -> Result<Reading> {
        let mut r = Reader::new(&self.in_buf);
        let (tag, length) = r.read_header()?;
        let reading = if tag == ber::tag_context_primitive(0) {
            match length {
                Length::Definite(len) =>
                    Reading::Definite { remaining: len as u64 },
                Length::Indefinite => return Err(Error::BadData(
                    "primitive content cannot be indefinite".into())
                    .into()),
            }
        } else if tag == ber::tag_context(0) && length == Length::Indefinite {
            // Chunk headers follow.
            let pos = r.position();
            crate::vec_drain_prefix(&mut self.in_buf, pos);
            return Ok(Reading::Chunked { chunk_remaining: 0 });
        } else {
            return Err(Error::BadData(
                "unexpected encrypted-content framing".into()).into());
        };
        let pos = r.position();
        crate::vec_drain_prefix(&mut self.in_buf, pos);
        Ok(reading)
    }

    /// Streams content bytes through the pipeline.  Returns true
    /// once the content is complete.
    fn pump_body(&mut self, cap: usize) -> Result<bool> {
        let mut body = self.body.take().expect("body prepared");
        let result = self.pump_body_inner(&mut body, cap);
        self.body = Some(body);
        result
    }

    fn pump_body_inner(&mut self, body: &mut BodyState, cap: usize)
                       -> Result<bool> {
        loop {
            if self.out.len() >= cap {
                return Ok(false);
            }
            match &mut body.reading {
                Reading::None => return Ok(true),
                Reading::Definite { remaining } => {
                    if *remaining == 0 {
                        return Ok(true);
                    }
                    if self.in_buf.is_empty() {
                        return Ok(false);
                    }
                    let take = (*remaining as usize)
                        .min(self.in_buf.len())
                        .min(4096);
                    *remaining -= take as u64;
                    let chunk: Vec<u8> =
                        self.in_buf[..take].to_vec();
                    crate::vec_drain_prefix(&mut self.in_buf, take);
                    Self::feed(&mut self.out, body, &chunk)?;
                }
                Reading::Chunked { chunk_remaining } => {
                    if *chunk_remaining > 0 {
                        if self.in_buf.is_empty() {
                            return Ok(false);
                        }
                        let take = (*chunk_remaining as usize)
                            .min(self.in_buf.len())
                            .min(4096);
                        *chunk_remaining -= take as u64;
                        let chunk: Vec<u8> =
                            self.in_buf[..take].to_vec();
                        crate::vec_drain_prefix(&mut self.in_buf, take);
                        Self::feed(&mut self.out, body, &chunk)?;
                        continue;
                    }
                    // At a chunk boundary: the next item is another
                    // chunk or the frame-closing marker.
                    let mut r = Reader::new(&self.in_buf);
                    match r.read_end_of_contents() {
                        Ok(true) => {
                            let pos = r.position();
                            crate::vec_drain_prefix(
                                &mut self.in_buf, pos);
                            return Ok(true);
                        }
                        Ok(false) => (),
                        Err(err) if is_underflow(&err) =>
                            return Ok(false),
                        Err(err) => return Err(err),
                    }
                    match r.read_header() {
                        Ok((ber::TAG_OCTET_STRING,
                            Length::Definite(len))) => {
                            let pos = r.position();
                            crate::vec_drain_prefix(
                                &mut self.in_buf, pos);
                            *chunk_remaining = len as u64;
                        }
                        Ok(_) => return Err(Error::BadData(
                            "unexpected item in content run".into())
                            .into()),
                        Err(err) if is_underflow(&err) =>
                            return Ok(false),
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Decrypt, decompress, authenticate, emit.
    fn feed(out: &mut Vec<u8>, body: &mut BodyState, chunk: &[u8])
            -> Result<()> {
        let mut staged = chunk.to_vec();
        if let Some(cipher) = &mut body.cipher {
            cipher.process(&mut staged);
        }
        #[cfg(feature = "compression-deflate")]
        if let Some(inflate) = &mut body.inflate {
            staged = inflate_all(inflate, &staged)?;
        }
        if let Some(hasher) = &mut body.hasher {
            hasher.update(&staged);
        }
        if let Some(mac) = &mut body.mac {
            mac.update(&staged);
        }
        out.extend_from_slice(&staged);
        Ok(())
    }

    fn finish_body(&mut self) {
        let body = self.body.as_mut().expect("body prepared");
        if let Some(hasher) = body.hasher.take() {
            self.digest = Some(hasher.finish());
        }
        if let Some(mac) = body.mac.take() {
            self.mac_computed = Some(mac.finish());
        }
    }

    /// Works through the trailer plan.  Returns true when the whole
    /// trailer has been read.
    fn parse_trailer(&mut self) -> Result<bool> {
        while self.trailer_done < self.trailer_plan.len() {
            let buf = std::mem::take(&mut self.in_buf);
            let mut r = Reader::new(&buf);
            let step = self.trailer_plan[self.trailer_done];
            let outcome = self.parse_trailer_step(step, &mut r);
            match outcome {
                Ok(()) => {
                    let pos = r.position();
                    self.in_buf = buf[pos..].to_vec();
                    self.trailer_done += 1;
                }
                Err(err) if is_underflow(&err) => {
                    self.in_buf = buf;
                    return Ok(false);
                }
                Err(err) => {
                    self.in_buf = buf;
                    return Err(err);
                }
            }
        }
        Ok(true)
    }

    fn parse_trailer_step(&mut self, step: TrailerStep, r: &mut Reader)
                          -> Result<()> {
        match step {
            TrailerStep::Eoc => {
                if r.read_end_of_contents()? {
                    Ok(())
                } else {
                    Err(Error::BadData(
                        "expected end-of-contents".into()).into())
                }
            }
            TrailerStep::MacValue => {
                self.mac_expected = Some(r.read_octet_string()?);
                Ok(())
            }
            TrailerStep::SignerInfos => {
                let mut certs = Vec::new();
                if r.peek_tag()? == ber::tag_context(0) {
                    let body = r.read_value(ber::tag_context(0))?;
                    let mut cr = Reader::new(body);
                    while !cr.is_empty() {
                        let start = cr.position();
                        cr.skip_value()?;
                        certs.push(body[start..cr.position()].to_vec());
                    }
                }
                let mut signers = Vec::new();
                r.read_constructed(ber::TAG_SET, |r| {
                    while !r.is_empty() {
                        signers.push(parse_signer_info(r)?);
                    }
                    Ok(())
                })?;
                if signers.is_empty() {
                    return Err(Error::BadData(
                        "no signers present".into()).into());
                }
                // Pair signers with their carried certificates.
                for signer in &mut signers {
                    signer.cert = certs.iter()
                        .find(|c| cert_matches_sid(c, &signer.sid))
                        .cloned();
                }
                self.signers = signers;
                Ok(())
            }
        }
    }

    /// Called once the trailer is complete: verify what can be
    /// verified and move on.
    fn finish_trailer(&mut self, resources: &Resources) -> Result<()> {
        let detached = matches!(self.layout,
                                Some(Layout::Signed { detached: true, .. }));
        if detached {
            let hash = self.layout_hash();
            self.detached_hasher = Some(Soft::hasher(hash));
            self.state = State::DetachedContent;
            return Ok(());
        }
        if let Some(digest) = self.digest.clone() {
            self.verify_signers(&digest, resources);
        }
        self.state = State::Finished;
        debug!(signers = self.signers.len(), "envelope parsed");
        Ok(())
    }

    fn layout_hash(&self) -> HashAlgorithm {
        match &self.layout {
            Some(Layout::Signed { hash, .. }) => *hash,
            _ => HashAlgorithm::Sha256,
        }
    }

    fn verify_signers(&mut self, digest: &[u8], resources: &Resources) {
        for signer in &mut self.signers {
            let key = signer.cert.as_deref()
                .and_then(|encoded| Certificate::decode(encoded).ok())
                .map(|cert| cert.public_key().clone())
                .or_else(|| resources.recipient.as_ref()
                         .map(|r| r.key.clone()));
            signer.result = key.map(|key| {
                key.verify(digest, &signer.signature).unwrap_or(false)
            });
        }
    }

    /// Finalises the message.
    pub(crate) fn flush(&mut self, _kernel: &Kernel,
                        resources: &Resources) -> Result<()> {
        match self.state {
            State::Failed => Err(Error::Invalid(
                "the envelope has already failed".into()).into()),
            State::Header | State::AwaitingResource | State::Body
            | State::Trailer => {
                if self.format == EnvelopeFormat::Raw {
                    self.state = State::Finished;
                    return Ok(());
                }
                Err(Error::Incomplete(
                    "the envelope is not complete".into()).into())
            }
            State::DetachedContent => {
                let digest = match &resources.detached_hash {
                    Some(digest) => digest.clone(),
                    None => {
                        if !self.detached_fed {
                            return Err(Error::Incomplete(
                                "no detached content or hash supplied"
                                    .into()).into());
                        }
                        self.detached_hasher.take()
                            .expect("created with the detached state")
                            .finish()
                    }
                };
                self.verify_signers(&digest, resources);
                self.state = State::Finished;
                self.check_outcome()
            }
            State::Finished => self.check_outcome(),
        }
    }

    fn check_outcome(&self) -> Result<()> {
        if let (Some(expected), Some(computed)) =
            (&self.mac_expected, &self.mac_computed)
        {
            if !secure_cmp(expected, computed) {
                return Err(Error::BadSignature(
                    "MAC does not verify".into()).into());
            }
        }
        Ok(())
    }

    /// Pops decoded plaintext; zero bytes once the end of data has
    /// been reached.
    pub(crate) fn pop(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.out.len());
        let out = self.out[..take].to_vec();
        crate::vec_drain_prefix(&mut self.out, take);
        out
    }

    pub(crate) fn signer_count(&self) -> usize {
        self.signers.len()
    }

    pub(crate) fn signer_result(&self, cursor: usize) -> Result<bool> {
        let signer = self.signers.get(cursor)
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(
                "no signer under the cursor".into())))?;
        signer.result.ok_or_else(|| Error::NotAvailable(
            "no verification key for this signer".into()).into())
    }

    pub(crate) fn signer_cert_handle(&mut self, kernel: &Kernel,
                                     cursor: usize)
                                     -> Result<Option<Handle>> {
        let signer = self.signers.get_mut(cursor)
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(
                "no signer under the cursor".into())))?;
        if let Some(handle) = signer.handle {
            return Ok(Some(handle));
        }
        match &signer.cert {
            Some(encoded) => {
                let handle = crate::cert::import(kernel, encoded)?;
                signer.handle = Some(handle);
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }
}

fn is_underflow(err: &anyhow::Error) -> bool {
    Error::matches(err, |e| matches!(e, Error::Underflow(_)))
}

fn expect_indefinite(r: &mut Reader, tag: u8) -> Result<()> {
    let (got, length) = r.read_header()?;
    if got != tag || length != Length::Indefinite {
        return Err(Error::BadData(format!(
            "expected indefinite frame {:#04x}", tag)).into());
    }
    Ok(())
}

fn parse_recipient(r: &mut Reader) -> Result<RecipientInfo> {
    let tag = r.peek_tag()?;
    if tag == ber::tag_context(3) {
        // Password recipient.
        r.read_constructed(ber::tag_context(3), |r| {
            let _version = r.read_integer()?;
            let salt = r.read_constructed(ber::tag_context(0), |r| {
                let kdf = r.read_oid()?;
                if kdf != oid_password_kdf() {
                    return Err(Error::NotAvailable(
                        "unsupported key derivation".into()).into());
                }
                r.read_constructed(ber::TAG_SEQUENCE,
                                   |r| r.read_octet_string())
            })?;
            let iv = r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let alg = r.read_oid()?;
                if alg != oid_aes256_cfb() {
                    return Err(Error::NotAvailable(
                        "unsupported key cipher".into()).into());
                }
                r.read_octet_string()
            })?;
            let wrapped = r.read_octet_string()?;
            Ok(RecipientInfo::Password { salt, iv, wrapped })
        })
    } else if tag == ber::TAG_SEQUENCE {
        // Key transport.
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let version = r.read_integer()?;
            let rid = if version == 2 {
                KeyIdentifier::KeyId(
                    r.read_value(ber::tag_context_primitive(0))?.to_vec())
            } else {
                let (name, serial) = read_issuer_serial(r)?;
                KeyIdentifier::IssuerSerial(name, serial)
            };
            r.read_constructed(ber::TAG_SEQUENCE, |r| {
                let alg = r.read_oid()?;
                if alg != oid_rsa_transport() {
                    return Err(Error::NotAvailable(
                        "unsupported key transport".into()).into());
                }
                if !r.is_empty() {
                    r.read_null()?;
                }
                Ok(())
            })?;
            let wrapped = r.read_octet_string()?;
            Ok(RecipientInfo::KeyTransport { rid, wrapped })
        })
    } else {
        Err(Error::BadData("unrecognised recipient form".into()).into())
    }
}

fn read_issuer_serial(r: &mut Reader) -> Result<(Vec<u8>, Vec<u8>)> {
    r.read_constructed(ber::TAG_SEQUENCE, |r| {
        // The issuer name is kept in encoded form for comparisons.
        let name = r.read_raw()?.to_vec();
        let serial = r.read_integer_bytes()?;
        Ok((name, serial))
    })
}

fn parse_signer_info(r: &mut Reader) -> Result<ParsedSigner> {
    r.read_constructed(ber::TAG_SEQUENCE, |r| {
        let version = r.read_integer()?;
        let sid = if version == 3 {
            KeyIdentifier::KeyId(
                r.read_value(ber::tag_context_primitive(0))?.to_vec())
        } else {
            let (name, serial) = read_issuer_serial(r)?;
            KeyIdentifier::IssuerSerial(name, serial)
        };
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let oid = r.read_oid()?;
            if oid != oid_sha256() && oid != oid_sha512() {
                return Err(Error::NotAvailable(
                    "unsupported digest algorithm".into()).into());
            }
            Ok(())
        })?;
        r.read_constructed(ber::TAG_SEQUENCE, |r| {
            let oid = r.read_oid()?;
            if oid != oid_sha256_with_rsa() && oid != oid_ed25519() {
                return Err(Error::NotAvailable(
                    "unsupported signature algorithm".into()).into());
            }
            if !r.is_empty() {
                r.read_null()?;
            }
            Ok(())
        })?;
        let signature = r.read_octet_string()?;
        Ok(ParsedSigner {
            sid,
            signature,
            cert: None,
            result: None,
            handle: None,
        })
    })
}

fn cert_matches_sid(encoded: &[u8], sid: &KeyIdentifier) -> bool {
    let Ok(cert) = Certificate::decode(encoded) else {
        return false;
    };
    match sid {
        KeyIdentifier::IssuerSerial(name, serial) => {
            let mut w = crate::ber::Writer::new();
            if cert.issuer().serialize(&mut w).is_err() {
                return false;
            }
            w.as_bytes() == &name[..] && cert.serial() == &serial[..]
        }
        KeyIdentifier::KeyId(id) => cert.subject_key_id() == *id,
    }
}

fn recover_cek(kernel: &Kernel, recipients: &[RecipientInfo],
               resources: &Resources) -> Result<SessionKey> {
    if recipients.is_empty() {
        return resources.session_key.clone()
            .ok_or_else(|| Error::NotInitialised(
                "no session key supplied".into()).into());
    }
    for recipient in recipients {
        match recipient {
            RecipientInfo::Password { salt, iv, wrapped } => {
                let Some(password) = &resources.password else {
                    continue;
                };
                let kek = password.derive_key(salt, 32)?;
                let mut cek = wrapped.clone();
                Soft::cipher(SymmetricAlgorithm::Aes256Cfb,
                             kek.as_ref(), iv,
                             CipherDirection::Decrypt)?
                    .process(&mut cek);
                return Ok(SessionKey::from(cek));
            }
            RecipientInfo::KeyTransport { rid, wrapped } => {
                let key = match &resources.private_key {
                    Some(key) => Some(key.clone()),
                    None => match resources.decrypt_keyset {
                        Some(keyset) =>
                            lookup_private_key(kernel, keyset, rid)?,
                        None => None,
                    },
                };
                let Some(CapturedKey::Rsa(parts)) = key else {
                    continue;
                };
                let cek = Soft::rsa_decrypt_pkcs1(&parts, wrapped)?;
                return Ok(SessionKey::from(cek));
            }
        }
    }
    Err(Error::WrongKey.into())
}

fn lookup_private_key(kernel: &Kernel, keyset: Handle,
                      rid: &KeyIdentifier)
                      -> Result<Option<CapturedKey>> {
    let id = match rid {
        KeyIdentifier::KeyId(id) => KeyId::SubjectKeyId(id.clone()),
        KeyIdentifier::IssuerSerial(name, serial) =>
            KeyId::IssuerSerial(name.clone(), serial.clone()),
    };
    match kernel.send_internal(keyset,
                               Message::KeyGetPrivate(id, None)) {
        Ok(reply) => {
            let context = reply.into_object()?;
            Ok(Some(super::capture_private_key(kernel, context)?))
        }
        Err(err) if Error::matches(&err,
            |e| matches!(e, Error::NotFound(_))) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(feature = "compression-deflate")]
fn inflate_all(inflate: &mut Decompress, input: &[u8])
               -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 2 + 64);
    let mut input = input;
    loop {
        out.reserve(1024);
        let before = inflate.total_in();
        let status = inflate.decompress_vec(input, &mut out,
                                            FlushDecompress::None)
            .map_err(|e| anyhow::Error::from(Error::BadData(
                format!("decompression failed: {}", e))))?;
        let took = (inflate.total_in() - before) as usize;
        input = &input[took..];
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                if input.is_empty() {
                    return Ok(out);
                }
            }
        }
    }
}
