//! Blocking side of the streaming decoder.
//!
//! Entries the `zip` crate can stream (known sizes, no encryption, stored or
//! deflate) go through [`zip::read::read_zipfile_from_stream`]. The crate
//! refuses entries whose sizes only follow the payload in a data descriptor,
//! which is what streaming writers produce, so those are framed here:
//! deflate payloads end where the deflate stream ends, stored payloads end
//! at the first descriptor whose CRC and sizes agree with the bytes before it.

use std::io::{self, BufRead, Read, Take};

use bytes::Bytes;
use flate2::Crc;
use flate2::bufread::DeflateDecoder;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use zip::read::{ZipFile, read_zipfile_from_stream};
use zip::result::ZipError;

use crate::entry::{ArchiveEntry, Chunk};
use crate::error::{Error, Result};
use crate::reader::ArchiveStreamReader;

const LOCAL_HEADER: u32 = 0x0403_4b50;
const CENTRAL_HEADER: u32 = 0x0201_4b50;
const END_OF_CENTRAL: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL: u32 = 0x0606_4b50;
const DATA_DESCRIPTOR: u32 = 0x0807_4b50;
const DESCRIPTOR_SIGNATURE: [u8; 4] = DATA_DESCRIPTOR.to_le_bytes();

const LOCAL_HEADER_LEN: usize = 30;
const ZIP64_EXTRA_ID: u16 = 0x0001;
/// Signature, CRC and two 8-byte sizes.
const DESCRIPTOR_MAX_LEN: usize = 24;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_DESCRIPTOR: u16 = 1 << 3;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    u64::from(le32(b, at)) | (u64::from(le32(b, at + 4)) << 32)
}

fn read_exact<R: Read>(reader: &mut ArchiveStreamReader<R>, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Truncated {
            offset: reader.offset(),
        },
        _ => Error::Io(e),
    })
}

fn header_error(error: ZipError, offset: u64) -> Error {
    match error {
        ZipError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Error::Truncated { offset },
        ZipError::Io(e) => Error::Io(e),
        source => Error::Header { offset, source },
    }
}

/// Why a payload cannot be decoded.
#[derive(Clone, Copy, Debug)]
enum Refusal {
    Encrypted,
    Unsupported(u16),
}

impl Refusal {
    fn error(self, name: &str) -> Error {
        let name = name.to_owned();
        match self {
            Refusal::Encrypted => Error::Encrypted { name },
            Refusal::Unsupported(method) => Error::UnsupportedCompression { name, method },
        }
    }
}

#[derive(Debug)]
struct LocalHeader {
    name: String,
    flags: u16,
    method: u16,
    compressed: u64,
    uncompressed: u64,
    zip64: bool,
}

impl LocalHeader {
    fn read<R: Read>(reader: &mut ArchiveStreamReader<R>) -> Result<Self> {
        let mut fixed = [0u8; LOCAL_HEADER_LEN];
        read_exact(reader, &mut fixed)?;
        let mut name = vec![0u8; usize::from(le16(&fixed, 26))];
        read_exact(reader, &mut name)?;
        let mut extra = vec![0u8; usize::from(le16(&fixed, 28))];
        read_exact(reader, &mut extra)?;

        let mut header = Self {
            // Streaming writers set the UTF-8 flag; anything else is decoded lossily.
            name: String::from_utf8_lossy(&name).into_owned(),
            flags: le16(&fixed, 6),
            method: le16(&fixed, 8),
            compressed: u64::from(le32(&fixed, 18)),
            uncompressed: u64::from(le32(&fixed, 22)),
            zip64: false,
        };
        header.apply_zip64_extra(&extra);
        Ok(header)
    }

    fn apply_zip64_extra(&mut self, mut extra: &[u8]) {
        while extra.len() >= 4 {
            let id = le16(extra, 0);
            let len = usize::from(le16(extra, 2));
            let Some(data) = extra.get(4..4 + len) else {
                return;
            };
            if id == ZIP64_EXTRA_ID {
                self.zip64 = true;
                let mut fields = data.chunks_exact(8).map(|f| le64(f, 0));
                if self.uncompressed == u64::from(u32::MAX) {
                    self.uncompressed = fields.next().unwrap_or(self.uncompressed);
                }
                if self.compressed == u64::from(u32::MAX) {
                    self.compressed = fields.next().unwrap_or(self.compressed);
                }
            }
            extra = &extra[4 + len..];
        }
    }

    fn has_descriptor(&self) -> bool {
        self.flags & FLAG_DESCRIPTOR != 0
    }

    fn refusal(&self) -> Option<Refusal> {
        if self.flags & FLAG_ENCRYPTED != 0 {
            Some(Refusal::Encrypted)
        } else if self.method != METHOD_STORED && self.method != METHOD_DEFLATE {
            Some(Refusal::Unsupported(self.method))
        } else {
            None
        }
    }
}

struct Descriptor {
    crc: u32,
    compressed: u64,
    uncompressed: u64,
}

impl Descriptor {
    /// Descriptor after a deflate stream. The signature is optional.
    fn read<R: Read>(reader: &mut ArchiveStreamReader<R>, zip64: bool) -> Result<Self> {
        let head = reader.peek(4)?;
        if head.len() >= 4 && le32(head, 0) == DATA_DESCRIPTOR {
            reader.consume(4);
        }
        let mut raw = [0u8; DESCRIPTOR_MAX_LEN - 4];
        let raw = if zip64 { &mut raw[..] } else { &mut raw[..12] };
        read_exact(reader, raw)?;
        Ok(if zip64 {
            Self {
                crc: le32(raw, 0),
                compressed: le64(raw, 4),
                uncompressed: le64(raw, 12),
            }
        } else {
            Self {
                crc: le32(raw, 0),
                compressed: u64::from(le32(raw, 4)),
                uncompressed: u64::from(le32(raw, 8)),
            }
        })
    }

    /// Signed descriptor at the start of `window` that closes a stored
    /// payload of `produced` bytes with checksum `crc`, and its length.
    fn closing_stored(window: &[u8], crc: u32, produced: u64, zip64: bool) -> Option<usize> {
        let len = if zip64 { DESCRIPTOR_MAX_LEN } else { 16 };
        if window.len() < len || window[..4] != DESCRIPTOR_SIGNATURE {
            return None;
        }
        let descriptor = if zip64 {
            Self {
                crc: le32(window, 4),
                compressed: le64(window, 8),
                uncompressed: le64(window, 16),
            }
        } else {
            Self {
                crc: le32(window, 4),
                compressed: u64::from(le32(window, 8)),
                uncompressed: u64::from(le32(window, 12)),
            }
        };
        (descriptor.crc == crc
            && descriptor.compressed == produced
            && descriptor.uncompressed == produced)
            .then_some(len)
    }
}

fn find_signature(window: &[u8]) -> Option<usize> {
    window.windows(4).position(|w| w == DESCRIPTOR_SIGNATURE)
}

/// How the current entry's payload is delimited in the stream.
enum Framing<'a, R: Read> {
    /// Parsed and decoded by the `zip` crate.
    Zip(ZipFile<'a, ArchiveStreamReader<R>>),
    /// Deflate stream followed by a data descriptor.
    Deflated {
        decoder: DeflateDecoder<&'a mut ArchiveStreamReader<R>>,
        zip64: bool,
    },
    /// Stored bytes terminated by a signed data descriptor.
    Stored {
        reader: &'a mut ArchiveStreamReader<R>,
        zip64: bool,
    },
    /// Undecodable payload of known length. Skippable.
    Raw {
        raw: Take<&'a mut ArchiveStreamReader<R>>,
        refusal: Refusal,
    },
    /// Undecodable payload whose length follows it. Neither readable nor skippable.
    Unframed { refusal: Refusal },
}

/// Payload of the entry the decoder is positioned on.
pub(crate) struct Body<'a, R: Read> {
    entry: ArchiveEntry,
    framing: Framing<'a, R>,
    crc: Crc,
    produced: u64,
    /// Expected uncompressed size, when the header states it.
    expected: Option<u64>,
    finished: bool,
}

impl<'a, R: Read> Body<'a, R> {
    fn new(entry: ArchiveEntry, framing: Framing<'a, R>) -> Self {
        Self {
            expected: entry.size_hint,
            entry,
            framing,
            crc: Crc::new(),
            produced: 0,
            finished: false,
        }
    }

    pub(crate) fn entry(&self) -> &ArchiveEntry {
        &self.entry
    }

    fn payload_error(&self, source: io::Error) -> Error {
        Error::Payload {
            name: self.entry.name.clone(),
            source,
        }
    }

    /// Decoded bytes into `buf`. `Ok(0)` only once the payload has ended and
    /// checked out against its CRC and size.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let read = match &mut self.framing {
            Framing::Zip(file) => file.read(buf),
            Framing::Deflated { decoder, .. } => decoder.read(buf),
            Framing::Stored { .. } => return self.read_stored(buf),
            Framing::Raw { refusal, .. } | Framing::Unframed { refusal } => {
                return Err(refusal.error(&self.entry.name));
            }
        };
        let n = read.map_err(|e| self.payload_error(e))?;
        if n == 0 {
            self.finish()?;
        } else {
            self.crc.update(&buf[..n]);
            self.produced += n as u64;
        }
        Ok(n)
    }

    fn read_stored(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Framing::Stored { reader, zip64 } = &mut self.framing else {
            return Ok(0);
        };
        let zip64 = *zip64;
        let window = reader.peek(DESCRIPTOR_MAX_LEN + 1)?;
        if window.len() < DESCRIPTOR_SIGNATURE.len() {
            let window_len = window.len() as u64;
            return Err(Error::Truncated {
                offset: reader.offset() + window_len,
            });
        }
        // Bytes up to the next candidate signature, holding back a tail that
        // could be the start of one split across reads.
        let held_back = window.len() - (DESCRIPTOR_SIGNATURE.len() - 1);
        let n = match find_signature(window) {
            Some(0) => {
                if let Some(len) =
                    Descriptor::closing_stored(window, self.crc.sum(), self.produced, zip64)
                {
                    reader.consume(len);
                    self.finished = true;
                    return Ok(0);
                }
                find_signature(&window[1..]).map_or(held_back, |i| i + 1)
            }
            Some(i) => i,
            None => held_back,
        };
        let n = n.min(buf.len());
        buf[..n].copy_from_slice(&window[..n]);
        reader.consume(n);
        self.crc.update(&buf[..n]);
        self.produced += n as u64;
        Ok(n)
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let name = &self.entry.name;
        match &mut self.framing {
            Framing::Zip(_) => {}
            Framing::Deflated { decoder, zip64 } => {
                let consumed = decoder.total_in();
                let descriptor = Descriptor::read(decoder.get_mut(), *zip64)?;
                if descriptor.crc != self.crc.sum() {
                    return Err(Error::CrcMismatch {
                        name: name.clone(),
                        expected: descriptor.crc,
                        actual: self.crc.sum(),
                    });
                }
                if descriptor.compressed != consumed {
                    return Err(Error::SizeMismatch {
                        name: name.clone(),
                        expected: descriptor.compressed,
                        actual: consumed,
                    });
                }
                self.expected = Some(descriptor.uncompressed);
            }
            Framing::Stored { .. } | Framing::Raw { .. } | Framing::Unframed { .. } => {}
        }
        match self.expected {
            Some(expected) if expected != self.produced => Err(Error::SizeMismatch {
                name: name.clone(),
                expected,
                actual: self.produced,
            }),
            _ => Ok(()),
        }
    }

    /// Next payload chunk of at most `chunk_size` bytes. The final chunk may
    /// be empty. Directories have no chunks.
    pub(crate) fn next_chunk(&mut self, chunk_size: usize) -> Result<Option<Chunk>> {
        if self.finished || self.entry.is_directory {
            return Ok(None);
        }
        let mut buf = vec![0u8; chunk_size.max(1)];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(Some(Chunk::new(Bytes::from(buf), n == 0)))
    }

    /// Move the stream past whatever of the payload was not pulled.
    ///
    /// Decodable payloads that were started are verified on the way.
    pub(crate) fn skip(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        match self.framing {
            // Dropping the entry drains its remaining raw bytes.
            Framing::Zip(file) => {
                drop(file);
                Ok(())
            }
            // Streaming writers flag directories too but may omit their descriptor.
            Framing::Stored { reader, zip64 } if self.entry.is_directory => {
                let window = reader.peek(DESCRIPTOR_MAX_LEN)?;
                if let Some(len) = Descriptor::closing_stored(window, 0, 0, zip64) {
                    reader.consume(len);
                }
                Ok(())
            }
            Framing::Deflated { .. } | Framing::Stored { .. } => {
                let mut scratch = vec![0u8; 8 * 1024];
                while self.read(&mut scratch)? > 0 {}
                Ok(())
            }
            Framing::Raw { mut raw, .. } => {
                io::copy(&mut raw, &mut io::sink())?;
                if raw.limit() > 0 {
                    let offset = raw.get_mut().offset();
                    return Err(Error::Truncated { offset });
                }
                Ok(())
            }
            Framing::Unframed { .. } => Err(Error::UnknownLength {
                name: self.entry.name,
            }),
        }
    }
}

/// Forward-only ZIP decoder over a blocking reader.
pub(crate) struct Decoder<R> {
    reader: ArchiveStreamReader<R>,
    done: bool,
}

impl<R: Read> Decoder<R> {
    pub(crate) fn new(reader: ArchiveStreamReader<R>) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// Position on the next entry. `None` at the central directory.
    pub(crate) fn next_entry(&mut self) -> Result<Option<Body<'_, R>>> {
        if self.done {
            return Ok(None);
        }
        let offset = self.reader.offset();
        let head = self.reader.peek(LOCAL_HEADER_LEN)?;
        if head.len() < 4 {
            return Err(if offset == 0 {
                Error::NotZip
            } else {
                Error::Truncated {
                    offset: offset + head.len() as u64,
                }
            });
        }
        match le32(head, 0) {
            LOCAL_HEADER => {}
            CENTRAL_HEADER | END_OF_CENTRAL | ZIP64_END_OF_CENTRAL => {
                debug!(offset, "reached central directory");
                self.done = true;
                return Ok(None);
            }
            _ if offset == 0 => return Err(Error::NotZip),
            signature => return Err(Error::BadSignature { signature, offset }),
        }
        if head.len() < LOCAL_HEADER_LEN {
            return Err(Error::Truncated {
                offset: offset + head.len() as u64,
            });
        }

        let flags = le16(head, 6);
        let method = le16(head, 8);
        let streamable = flags & (FLAG_ENCRYPTED | FLAG_DESCRIPTOR) == 0
            && (method == METHOD_STORED || method == METHOD_DEFLATE);
        if streamable {
            return match read_zipfile_from_stream(&mut self.reader) {
                Ok(Some(file)) => {
                    let entry = ArchiveEntry::new(file.name(), Some(file.size()));
                    trace!(offset, name = %entry.name, "entry");
                    Ok(Some(Body::new(entry, Framing::Zip(file))))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(header_error(e, offset)),
            };
        }

        let header = LocalHeader::read(&mut self.reader)?;
        trace!(offset, name = %header.name, flags, method, "entry framed locally");
        let size_hint = (!header.has_descriptor()).then_some(header.uncompressed);
        let entry = ArchiveEntry::new(header.name.as_str(), size_hint);
        let framing = match header.refusal() {
            Some(refusal) if header.has_descriptor() => Framing::Unframed { refusal },
            Some(refusal) => Framing::Raw {
                raw: (&mut self.reader).take(header.compressed),
                refusal,
            },
            None if header.method == METHOD_DEFLATE => Framing::Deflated {
                decoder: DeflateDecoder::new(&mut self.reader),
                zip64: header.zip64,
            },
            None => Framing::Stored {
                reader: &mut self.reader,
                zip64: header.zip64,
            },
        };
        Ok(Some(Body::new(entry, framing)))
    }

    /// Reclassify a failure as truncation when the input ran out under it.
    fn classify(&mut self, error: Error) -> Error {
        match error {
            Error::Payload { .. } | Error::CrcMismatch { .. } | Error::SizeMismatch { .. } => {
                match self.reader.is_eof() {
                    Ok(true) => Error::Truncated {
                        offset: self.reader.offset(),
                    },
                    _ => error,
                }
            }
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    NextEntry,
    NextChunk,
}

#[derive(Debug)]
pub(crate) enum Reply {
    Entry(Option<ArchiveEntry>),
    Chunk(Option<Chunk>),
}

/// Answer requests until the async side hangs up or the archive fails.
///
/// An error is sent once and ends the loop.
pub(crate) fn serve<R: Read>(
    mut decoder: Decoder<R>,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    replies: &mpsc::Sender<Result<Reply>>,
    chunk_size: usize,
) {
    let mut pending = requests.blocking_recv();
    while let Some(request) = pending.take() {
        let outcome = match request {
            Request::NextChunk => match replies.blocking_send(Ok(Reply::Chunk(None))) {
                Ok(()) => Ok(requests.blocking_recv()),
                Err(_) => Ok(None),
            },
            Request::NextEntry => stream_entry(&mut decoder, requests, replies, chunk_size),
        };
        match outcome {
            Ok(next) => pending = next,
            Err(e) => {
                let e = decoder.classify(e);
                debug!(error = %e, "archive decoding failed");
                let _ = replies.blocking_send(Err(e));
                return;
            }
        }
    }
    trace!("archive decoder released");
}

/// Serve one entry and its chunk requests. Returns the request that moved
/// past it, or `None` once the async side is gone.
fn stream_entry<R: Read>(
    decoder: &mut Decoder<R>,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    replies: &mpsc::Sender<Result<Reply>>,
    chunk_size: usize,
) -> Result<Option<Request>> {
    let Some(mut body) = decoder.next_entry()? else {
        if replies.blocking_send(Ok(Reply::Entry(None))).is_err() {
            return Ok(None);
        }
        return Ok(requests.blocking_recv());
    };
    if replies
        .blocking_send(Ok(Reply::Entry(Some(body.entry().clone()))))
        .is_err()
    {
        return Ok(None);
    }
    loop {
        match requests.blocking_recv() {
            Some(Request::NextChunk) => {
                let chunk = body.next_chunk(chunk_size)?;
                if replies.blocking_send(Ok(Reply::Chunk(chunk))).is_err() {
                    return Ok(None);
                }
            }
            Some(Request::NextEntry) => {
                body.skip()?;
                return Ok(Some(Request::NextEntry));
            }
            None => return Ok(None),
        }
    }
}
