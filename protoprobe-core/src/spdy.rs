//! Minimal client-side SPDY/3.1 implementation.
//!
//! Just enough of the protocol to issue a single `GET /` on stream 1 and
//! drain the response: SYN_STREAM / SYN_REPLY / DATA with flow-control
//! replenishment, plus handling for the session-level frames a server may
//! interleave (SETTINGS, PING, HEADERS, WINDOW_UPDATE, RST_STREAM, GOAWAY).
//! Header blocks are zlib-compressed with the SPDY/3 dictionary; the
//! compression state persists across frames for the lifetime of a session,
//! as the protocol requires.
//!
//! No Rust crate provides a SPDY client, so this subset lives here rather
//! than behind a dependency.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::trace;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SPDY_VERSION: u16 = 3;

// Control frame types.
const SYN_STREAM: u16 = 1;
const SYN_REPLY: u16 = 2;
const RST_STREAM: u16 = 3;
const SETTINGS: u16 = 4;
const PING: u16 = 6;
const GOAWAY: u16 = 7;
const HEADERS: u16 = 8;
const WINDOW_UPDATE: u16 = 9;

const FLAG_FIN: u8 = 0x01;

/// The single client-initiated stream (client stream ids are odd).
const REQUEST_STREAM_ID: u32 = 1;

/// Upper bound on a control frame payload we are willing to buffer.
const MAX_CONTROL_PAYLOAD: usize = 1 << 20;
/// Upper bound on a decompressed header block.
const MAX_HEADER_BLOCK: usize = 1 << 20;
/// Sanity bound on the header count advertised in a block.
const MAX_HEADER_COUNT: u32 = 1024;

/// Zlib dictionary for SPDY/3 header-block compression.
const DICTIONARY: &[u8] = b"\x00\x00\x00\x07options\x00\x00\x00\x04head\x00\x00\x00\x04post\
\x00\x00\x00\x03put\x00\x00\x00\x06delete\x00\x00\x00\x05trace\x00\x00\x00\x06accept\
\x00\x00\x00\x0eaccept-charset\x00\x00\x00\x0faccept-encoding\x00\x00\x00\x0faccept-language\
\x00\x00\x00\raccept-ranges\x00\x00\x00\x03age\x00\x00\x00\x05allow\x00\x00\x00\rauthorization\
\x00\x00\x00\rcache-control\x00\x00\x00\nconnection\x00\x00\x00\x0ccontent-base\
\x00\x00\x00\x10content-encoding\x00\x00\x00\x10content-language\x00\x00\x00\x0econtent-length\
\x00\x00\x00\x10content-location\x00\x00\x00\x0bcontent-md5\x00\x00\x00\rcontent-range\
\x00\x00\x00\x0ccontent-type\x00\x00\x00\x04date\x00\x00\x00\x04etag\x00\x00\x00\x06expect\
\x00\x00\x00\x07expires\x00\x00\x00\x04from\x00\x00\x00\x04host\x00\x00\x00\x08if-match\
\x00\x00\x00\x11if-modified-since\x00\x00\x00\rif-none-match\x00\x00\x00\x08if-range\
\x00\x00\x00\x13if-unmodified-since\x00\x00\x00\rlast-modified\x00\x00\x00\x08location\
\x00\x00\x00\x0cmax-forwards\x00\x00\x00\x06pragma\x00\x00\x00\x12proxy-authenticate\
\x00\x00\x00\x13proxy-authorization\x00\x00\x00\x05range\x00\x00\x00\x07referer\
\x00\x00\x00\x0bretry-after\x00\x00\x00\x06server\x00\x00\x00\x02te\x00\x00\x00\x07trailer\
\x00\x00\x00\x11transfer-encoding\x00\x00\x00\x07upgrade\x00\x00\x00\nuser-agent\
\x00\x00\x00\x04vary\x00\x00\x00\x03via\x00\x00\x00\x07warning\x00\x00\x00\x10www-authenticate\
\x00\x00\x00\x06method\x00\x00\x00\x03get\x00\x00\x00\x06status\x00\x00\x00\x06200 OK\
\x00\x00\x00\x07version\x00\x00\x00\x08HTTP/1.1\x00\x00\x00\x03url\x00\x00\x00\x06public\
\x00\x00\x00\nset-cookie\x00\x00\x00\nkeep-alive\x00\x00\x00\x06origin\
100101201202205206300302303304305306307402405406407408409410411412413414415416417502504505\
203 Non-Authoritative Information204 No Content301 Moved Permanently400 Bad Request\
401 Unauthorized403 Forbidden404 Not Found500 Internal Server Error501 Not Implemented\
503 Service UnavailableJan Feb Mar Apr May Jun Jul Aug Sept Oct Nov Dec 00:00:00 \
Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMTchunked,text/html,image/png,image/jpg,image/gif,\
application/xml,application/xhtml+xml,text/plain,text/javascript,publicprivatemax-age=\
gzip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.";

/// SPDY session or stream failure.
#[derive(Debug, Error)]
pub enum SpdyError {
    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Header-block compression or decompression failure.
    #[error("header compression error: {0}")]
    Compression(String),
    /// The peer violated the framing rules we depend on.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server reset our stream.
    #[error("stream reset by server (status {0})")]
    Reset(u32),
    /// The server is going away.
    #[error("session closed by server (GOAWAY)")]
    GoAway,
}

/// Outcome of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdyResponse {
    /// Numeric part of the `:status` header, when the reply carried one.
    pub status: Option<u16>,
    /// Reply headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Total DATA payload bytes drained.
    pub body_len: usize,
}

/// A parsed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameHeader {
    Control { kind: u16, flags: u8, length: usize },
    Data { stream_id: u32, flags: u8, length: usize },
}

fn parse_frame_header(raw: [u8; 8]) -> Result<FrameHeader, SpdyError> {
    let flags = raw[4];
    let length = usize::from(raw[5]) << 16 | usize::from(raw[6]) << 8 | usize::from(raw[7]);
    if raw[0] & 0x80 == 0 {
        let stream_id = u32::from_be_bytes([raw[0] & 0x7f, raw[1], raw[2], raw[3]]);
        return Ok(FrameHeader::Data {
            stream_id,
            flags,
            length,
        });
    }
    let version = u16::from_be_bytes([raw[0] & 0x7f, raw[1]]);
    if version != SPDY_VERSION {
        return Err(SpdyError::Protocol(format!(
            "unsupported SPDY version {version}"
        )));
    }
    let kind = u16::from_be_bytes([raw[2], raw[3]]);
    Ok(FrameHeader::Control {
        kind,
        flags,
        length,
    })
}

/// Append a 24-bit big-endian length.
fn put_u24(buf: &mut BytesMut, value: usize) {
    debug_assert!(value <= 0x00ff_ffff);
    #[allow(clippy::cast_possible_truncation)]
    {
        buf.put_u8((value >> 16) as u8);
        buf.put_u16((value & 0xffff) as u16);
    }
}

/// Serialize a name/value block (uncompressed form).
fn encode_header_block(headers: &[(&str, &str)]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(headers.len() as u32);
    for (name, value) in headers {
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(name.len() as u32);
        buf.put_slice(name.as_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    buf
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, SpdyError> {
    if buf.remaining() < 4 {
        return Err(SpdyError::Protocol("truncated header block".to_string()));
    }
    Ok(buf.get_u32())
}

fn read_string(buf: &mut &[u8]) -> Result<String, SpdyError> {
    let len = read_u32(buf)? as usize;
    if len > MAX_HEADER_BLOCK || buf.remaining() < len {
        return Err(SpdyError::Protocol("truncated header block".to_string()));
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Parse a decompressed name/value block.
fn decode_header_block(block: &[u8]) -> Result<Vec<(String, String)>, SpdyError> {
    let mut buf = block;
    let count = read_u32(&mut buf)?;
    if count > MAX_HEADER_COUNT {
        return Err(SpdyError::Protocol(format!(
            "header count {count} out of range"
        )));
    }
    let mut headers = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let name = read_string(&mut buf)?;
        let value = read_string(&mut buf)?;
        headers.push((name, value));
    }
    Ok(headers)
}

/// Numeric part of a `:status` value such as `200 OK`.
fn parse_status(headers: &[(String, String)]) -> Option<u16> {
    headers
        .iter()
        .find(|(name, _)| name == ":status")
        .and_then(|(_, value)| value.split_whitespace().next()?.parse().ok())
}

/// Stateful zlib pair for one session's header blocks.
struct HeaderCodec {
    compress: Compress,
    decompress: Decompress,
}

impl HeaderCodec {
    fn new() -> Result<Self, SpdyError> {
        let mut compress = Compress::new(Compression::default(), true);
        compress
            .set_dictionary(DICTIONARY)
            .map_err(|e| SpdyError::Compression(e.to_string()))?;
        Ok(Self {
            compress,
            decompress: Decompress::new(true),
        })
    }

    fn compress_block(&mut self, plain: &[u8]) -> Result<Vec<u8>, SpdyError> {
        let mut out = Vec::with_capacity(plain.len() + 64);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(1024);
            }
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress_vec(&plain[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| SpdyError::Compression(e.to_string()))?;
            // Header blocks are tiny; the deltas always fit usize.
            #[allow(clippy::cast_possible_truncation)]
            {
                consumed += (self.compress.total_in() - before_in) as usize;
            }
            let produced = self.compress.total_out() - before_out;
            if status == Status::StreamEnd
                || (consumed == plain.len() && produced == 0 && out.len() < out.capacity())
            {
                break;
            }
        }
        Ok(out)
    }

    fn decompress_block(&mut self, input: &[u8]) -> Result<Vec<u8>, SpdyError> {
        let mut out = Vec::with_capacity(input.len().saturating_mul(4).max(256));
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(1024);
            }
            if out.capacity() > MAX_HEADER_BLOCK {
                return Err(SpdyError::Protocol("header block too large".to_string()));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let result =
                self.decompress
                    .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync);
            #[allow(clippy::cast_possible_truncation)]
            {
                consumed += (self.decompress.total_in() - before_in) as usize;
            }
            match result {
                Ok(status) => {
                    let produced = self.decompress.total_out() - before_out;
                    if status == Status::StreamEnd
                        || (consumed == input.len()
                            && produced == 0
                            && out.len() < out.capacity())
                    {
                        break;
                    }
                }
                Err(e) => {
                    // Zlib signals the dictionary requirement on first use.
                    if e.needs_dictionary().is_some() {
                        self.decompress
                            .set_dictionary(DICTIONARY)
                            .map_err(|e| SpdyError::Compression(e.to_string()))?;
                        continue;
                    }
                    return Err(SpdyError::Compression(e.to_string()));
                }
            }
        }
        Ok(out)
    }
}

/// Client side of one SPDY/3.1 session, good for a single request.
pub struct ClientSession<S> {
    stream: S,
    codec: HeaderCodec,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    /// Establish the session state over an already-negotiated stream.
    pub fn new(stream: S) -> Result<Self, SpdyError> {
        Ok(Self {
            stream,
            codec: HeaderCodec::new()?,
        })
    }

    /// `GET /` from `host`: send SYN_STREAM, then read frames until the
    /// server half-closes our stream, draining and counting DATA payloads.
    pub async fn get(&mut self, host: &str) -> Result<SpdyResponse, SpdyError> {
        self.send_syn_stream(host).await?;

        let mut response = SpdyResponse {
            status: None,
            headers: Vec::new(),
            body_len: 0,
        };
        let mut reply_seen = false;

        loop {
            let mut raw = [0u8; 8];
            self.stream.read_exact(&mut raw).await?;
            match parse_frame_header(raw)? {
                FrameHeader::Control {
                    kind,
                    flags,
                    length,
                } => match kind {
                    SYN_REPLY => {
                        let payload = self.read_control_payload(length).await?;
                        if payload.len() < 4 {
                            return Err(SpdyError::Protocol("truncated SYN_REPLY".to_string()));
                        }
                        let stream_id =
                            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
                        // Decompress whatever arrives; skipping a block would
                        // corrupt the shared zlib state.
                        let block = self.codec.decompress_block(&payload[4..])?;
                        let headers = decode_header_block(&block)?;
                        if stream_id != REQUEST_STREAM_ID {
                            continue;
                        }
                        trace!("[SPDY] SYN_REPLY with {} header(s)", headers.len());
                        response.status = parse_status(&headers);
                        response.headers = headers;
                        reply_seen = true;
                        if flags & FLAG_FIN != 0 {
                            break;
                        }
                    }
                    HEADERS => {
                        let payload = self.read_control_payload(length).await?;
                        if payload.len() < 4 {
                            return Err(SpdyError::Protocol("truncated HEADERS".to_string()));
                        }
                        let stream_id =
                            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
                        let _ = self.codec.decompress_block(&payload[4..])?;
                        if stream_id == REQUEST_STREAM_ID && reply_seen && flags & FLAG_FIN != 0 {
                            break;
                        }
                    }
                    RST_STREAM => {
                        let payload = self.read_control_payload(length).await?;
                        if payload.len() < 8 {
                            return Err(SpdyError::Protocol("truncated RST_STREAM".to_string()));
                        }
                        let stream_id =
                            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
                        let status =
                            u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                        if stream_id == REQUEST_STREAM_ID {
                            return Err(SpdyError::Reset(status));
                        }
                    }
                    GOAWAY => return Err(SpdyError::GoAway),
                    PING => {
                        // Echo the ping back unchanged.
                        let payload = self.read_control_payload(length).await?;
                        self.send_control(PING, 0, &payload).await?;
                    }
                    SETTINGS | WINDOW_UPDATE => {
                        self.skip_payload(length).await?;
                    }
                    other => {
                        trace!("[SPDY] ignoring control frame type {other}");
                        self.skip_payload(length).await?;
                    }
                },
                FrameHeader::Data {
                    stream_id,
                    flags,
                    length,
                } => {
                    self.skip_payload(length).await?;
                    if stream_id != REQUEST_STREAM_ID {
                        continue;
                    }
                    if !reply_seen {
                        return Err(SpdyError::Protocol("DATA before SYN_REPLY".to_string()));
                    }
                    response.body_len += length;
                    if flags & FLAG_FIN != 0 {
                        break;
                    }
                    if length > 0 {
                        // Replenish the stream flow-control window so large
                        // bodies keep flowing.
                        #[allow(clippy::cast_possible_truncation)]
                        self.send_window_update(REQUEST_STREAM_ID, length as u32)
                            .await?;
                    }
                }
            }
        }

        Ok(response)
    }

    async fn send_syn_stream(&mut self, host: &str) -> Result<(), SpdyError> {
        let headers = [
            (":method", "GET"),
            (":path", "/"),
            (":version", "HTTP/1.1"),
            (":host", host),
            (":scheme", "https"),
        ];
        let block = encode_header_block(&headers);
        let compressed = self.codec.compress_block(&block)?;

        // stream id + associated stream id + priority/slot, then the block.
        let mut payload = BytesMut::with_capacity(10 + compressed.len());
        payload.put_u32(REQUEST_STREAM_ID);
        payload.put_u32(0);
        payload.put_u8(0);
        payload.put_u8(0);
        payload.put_slice(&compressed);

        self.send_control(SYN_STREAM, FLAG_FIN, &payload).await
    }

    async fn send_window_update(&mut self, stream_id: u32, delta: u32) -> Result<(), SpdyError> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(stream_id & 0x7fff_ffff);
        payload.put_u32(delta & 0x7fff_ffff);
        self.send_control(WINDOW_UPDATE, 0, &payload).await
    }

    async fn send_control(&mut self, kind: u16, flags: u8, payload: &[u8]) -> Result<(), SpdyError> {
        if payload.len() > 0x00ff_ffff {
            return Err(SpdyError::Protocol("frame payload too large".to_string()));
        }
        let mut frame = BytesMut::with_capacity(8 + payload.len());
        frame.put_u16(0x8000 | SPDY_VERSION);
        frame.put_u16(kind);
        frame.put_u8(flags);
        put_u24(&mut frame, payload.len());
        frame.put_slice(payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_control_payload(&mut self, length: usize) -> Result<Vec<u8>, SpdyError> {
        if length > MAX_CONTROL_PAYLOAD {
            return Err(SpdyError::Protocol(format!(
                "control payload of {length} bytes exceeds limit"
            )));
        }
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn skip_payload(&mut self, length: usize) -> Result<(), SpdyError> {
        let mut remaining = length;
        let mut scratch = [0u8; 8192];
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            self.stream.read_exact(&mut scratch[..chunk]).await?;
            remaining -= chunk;
        }
        Ok(())
    }
}
