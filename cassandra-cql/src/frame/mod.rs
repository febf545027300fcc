pub mod frame_errors;
pub mod protocol_version;
pub mod request;
pub mod response;
pub mod types;
pub mod value_codec;

use crate::frame::frame_errors::{CqlRequestSerializationError, FrameError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use protocol_version::{header_len_for_version_byte, ProtocolVersion};
use thiserror::Error;
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;

use request::SerializableRequest;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// Direction bit of the version byte, set on frames sent by the server.
pub const RESPONSE_DIRECTION: u8 = 0x80;

/// Stream id of frames pushed by the server on its own initiative.
pub const EVENT_STREAM_ID: i16 = -1;

/// Bodies above this size are rejected instead of buffered.
pub const MAX_FRAME_BODY_LEN: usize = 256 * 1024 * 1024;

/// Bodies shorter than this are sent uncompressed even if compression was negotiated.
pub const MIN_COMPRESSIBLE_LEN: usize = 64;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name of the algorithm as used in STARTUP and SUPPORTED.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }

    pub fn from_name(name: &str) -> Option<Compression> {
        match name {
            "lz4" => Some(Compression::Lz4),
            "snappy" => Some(Compression::Snappy),
            _ => None,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request encoded into a complete frame, waiting for a stream id.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
    version: ProtocolVersion,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
        custom_payload: Option<&HashMap<String, Bytes>>,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let header_len = version.header_len();
        let mut flags = 0;

        let mut body = Vec::new();
        if let Some(payload) = custom_payload {
            if version.supports_frame_extensions() {
                flags |= FLAG_CUSTOM_PAYLOAD;
                types::write_bytes_map(payload, &mut body)
                    .map_err(|_| CqlRequestSerializationError::CustomPayloadTooBig)?;
            }
        }
        req.serialize(&mut body, version)?;

        let mut data = vec![0; header_len];
        match compression {
            Some(compression) if req.is_compressible() && body.len() >= MIN_COMPRESSIBLE_LEN => {
                flags |= FLAG_COMPRESSION;
                compress_append(&body, compression, &mut data)
                    .map_err(CqlRequestSerializationError::Compression)?;
            }
            _ => data.extend_from_slice(&body),
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_byte();
        data[1] = flags;
        // Leave space for the stream number
        data[header_len - 5] = R::OPCODE as u8;

        let body_len = u32::try_from(data.len() - header_len)
            .map_err(|_| CqlRequestSerializationError::BodySerialization(
                frame_errors::SerializationError::ValueTooBig,
            ))?;
        data[header_len - 4..header_len].copy_from_slice(&body_len.to_be_bytes());

        Ok(Self { data, version })
    }

    /// Stamps the stream id into the header. Before v3 only the low byte is written.
    pub fn set_stream(&mut self, stream: i16) {
        match self.version {
            ProtocolVersion::V1 => self.data[2] = stream as i8 as u8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => {
                self.data[2..4].copy_from_slice(&stream.to_be_bytes())
            }
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::LATEST.as_byte() | RESPONSE_DIRECTION,
            flags: 0x00,
            stream: 0,
        }
    }
}

impl FrameParams {
    pub fn is_event(&self) -> bool {
        self.stream == EVENT_STREAM_ID
    }
}

/// A whole frame cut out of the byte stream, body still undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub params: FrameParams,
    pub opcode: u8,
    pub body: Bytes,
}

/// Which side produced the frames fed to a [`FrameDecoder`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameDirection {
    /// Frames sent by a server to this client.
    Response,
    /// Frames sent by a client; used by servers and test doubles.
    Request,
}

#[derive(Debug, Clone, Copy)]
enum DecoderState {
    AwaitingHeader,
    AwaitingBody { params: FrameParams, opcode: u8, length: usize },
}

/// Reassembles frames from arbitrarily split chunks of a byte stream.
///
/// Bytes are appended with [`FrameDecoder::feed`]; [`FrameDecoder::next_frame`]
/// then yields complete frames in stream order. Partial headers and bodies stay
/// buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecoderState,
    direction: FrameDirection,
    max_body_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameDirection::Response)
    }
}

impl FrameDecoder {
    pub fn new(direction: FrameDirection) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecoderState::AwaitingHeader,
            direction,
            max_body_len: MAX_FRAME_BODY_LEN,
        }
    }

    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    /// Buffer that socket reads can fill directly, followed by `next_frame` calls.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes received but not yet returned as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameError> {
        loop {
            match self.state {
                DecoderState::AwaitingHeader => {
                    let Some(&version) = self.buf.first() else {
                        return Ok(None);
                    };
                    let header_len = header_len_for_version_byte(version);
                    if self.buf.len() < header_len {
                        return Ok(None);
                    }
                    let header = self.buf.split_to(header_len);
                    let (params, opcode, length) = self.parse_header(&header)?;
                    self.state = DecoderState::AwaitingBody {
                        params,
                        opcode,
                        length,
                    };
                }
                DecoderState::AwaitingBody {
                    params,
                    opcode,
                    length,
                } => {
                    if self.buf.len() < length {
                        self.buf.reserve(length - self.buf.len());
                        return Ok(None);
                    }
                    let body = self.buf.split_to(length).freeze();
                    self.state = DecoderState::AwaitingHeader;
                    return Ok(Some(RawFrame {
                        params,
                        opcode,
                        body,
                    }));
                }
            }
        }
    }

    /// Feeds a chunk and drains every frame it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>, FrameError> {
        self.feed(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn parse_header(&self, mut header: &[u8]) -> Result<(FrameParams, u8, usize), FrameError> {
        let version = header.get_u8();
        let from_server = version & RESPONSE_DIRECTION != 0;
        match (self.direction, from_server) {
            (FrameDirection::Response, false) => return Err(FrameError::FrameFromClient),
            (FrameDirection::Request, true) => return Err(FrameError::FrameFromServer),
            _ => {}
        }
        let raw_version = version & 0x7f;
        if !(1..=4).contains(&raw_version) {
            return Err(FrameError::VersionNotSupported(raw_version));
        }

        let flags = header.get_u8();
        let stream = if raw_version < 3 {
            header.get_i8() as i16
        } else {
            header.get_i16()
        };
        let opcode = header.get_u8();
        let length = header.get_u32() as usize;
        if length > self.max_body_len {
            return Err(FrameError::FrameTooLarge(length));
        }

        Ok((
            FrameParams {
                version,
                flags,
                stream,
            },
            opcode,
            length,
        ))
    }
}

#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len =
                u32::try_from(uncomp_body.len()).map_err(|_| FrameError::FrameCompression)?;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < 4 {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len).map_err(|_| FrameError::FrameDecompression)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

impl<T: Copy + std::fmt::Debug> TryFromPrimitiveError<T> {
    pub fn primitive(&self) -> T {
        self.primitive
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::request::options::Options;
    use crate::frame::request::query::{Query, QueryParameters};
    use assert_matches::assert_matches;

    fn response_frame(version: ProtocolVersion, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![version.as_byte() | RESPONSE_DIRECTION, 0];
        match version {
            ProtocolVersion::V1 => out.push(stream as i8 as u8),
            _ => out.extend_from_slice(&stream.to_be_bytes()),
        }
        out.push(opcode);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let compression = Compression::Lz4;
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, compression, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn test_lz4_decompress() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        let compression = Compression::Lz4;
        compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], compression).unwrap();
        assert_eq!(32, comp_body.len());
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn test_snappy_round_trip() {
        let uncomp_body = "SELECT * FROM ks.t WHERE a = ?".repeat(20);
        let mut comp_body = Vec::new();
        compress_append(uncomp_body.as_bytes(), Compression::Snappy, &mut comp_body).unwrap();
        assert!(comp_body.len() < uncomp_body.len());
        let result = decompress(&comp_body, Compression::Snappy).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn decoder_reassembles_byte_by_byte() {
        let frame = response_frame(ProtocolVersion::V4, 17, 0x08, &[0, 0, 0, 1]);
        let mut whole = FrameDecoder::default();
        let expected = whole.decode(&frame).unwrap();
        assert_eq!(expected.len(), 1);

        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for byte in &frame {
            frames.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames, expected);
        assert_eq!(frames[0].params.stream, 17);
        assert_eq!(frames[0].opcode, 0x08);
        assert_eq!(&frames[0].body[..], &[0, 0, 0, 1]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn decoder_emits_concatenated_frames_in_order() {
        let mut chunk = response_frame(ProtocolVersion::V4, 1, 0x02, &[]);
        chunk.extend(response_frame(ProtocolVersion::V4, 2, 0x08, &[0, 0, 0, 1]));
        // Start of a third frame stays buffered.
        let third = response_frame(ProtocolVersion::V4, 3, 0x02, &[]);
        chunk.extend_from_slice(&third[..4]);

        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(&chunk).unwrap();
        assert_eq!(
            frames.iter().map(|f| f.params.stream).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(decoder.buffered_len(), 4);

        let frames = decoder.decode(&third[4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].params.stream, 3);
    }

    #[test]
    fn decoder_handles_v1_headers_and_events() {
        let frame = response_frame(ProtocolVersion::V1, -1, 0x0C, &[1, 2]);
        assert_eq!(frame.len(), 8 + 2);
        let frames = FrameDecoder::default().decode(&frame).unwrap();
        assert!(frames[0].params.is_event());
        assert_eq!(&frames[0].body[..], &[1, 2]);
    }

    #[test]
    fn decoder_rejects_bad_headers() {
        let mut frame = response_frame(ProtocolVersion::V4, 0, 0x02, &[]);
        frame[0] = 0x04;
        assert_matches!(
            FrameDecoder::default().decode(&frame),
            Err(FrameError::FrameFromClient)
        );

        let frame = response_frame(ProtocolVersion::V4, 0, 0x02, &[0; 16]);
        assert_matches!(
            FrameDecoder::default().with_max_body_len(8).decode(&frame),
            Err(FrameError::FrameTooLarge(16))
        );
    }

    #[test]
    fn serialized_request_header_layout() {
        let mut req =
            SerializedRequest::make(&Options, ProtocolVersion::V4, None, false, None).unwrap();
        req.set_stream(0x0102);
        assert_eq!(req.get_data(), &[0x04, 0x00, 0x01, 0x02, 0x05, 0, 0, 0, 0]);

        let mut req =
            SerializedRequest::make(&Options, ProtocolVersion::V1, None, true, None).unwrap();
        req.set_stream(5);
        assert_eq!(req.get_data(), &[0x01, FLAG_TRACING, 0x05, 0x05, 0, 0, 0, 0]);

        let mut decoder = FrameDecoder::new(FrameDirection::Request);
        let frames = decoder.decode(req.get_data()).unwrap();
        assert_eq!(frames[0].params.stream, 5);
        assert_eq!(frames[0].opcode, 0x05);
    }

    #[test]
    fn only_large_compressible_bodies_are_compressed() {
        let short = Query {
            contents: "SELECT 1".into(),
            parameters: QueryParameters::default(),
        };
        let req =
            SerializedRequest::make(&short, ProtocolVersion::V4, Some(Compression::Lz4), false, None)
                .unwrap();
        assert_eq!(req.get_data()[1] & FLAG_COMPRESSION, 0);

        let long = Query {
            contents: "SELECT a, b, c FROM ks.table_name WHERE a = 1 ".repeat(4).into(),
            parameters: QueryParameters::default(),
        };
        let req =
            SerializedRequest::make(&long, ProtocolVersion::V4, Some(Compression::Lz4), false, None)
                .unwrap();
        assert_eq!(req.get_data()[1] & FLAG_COMPRESSION, FLAG_COMPRESSION);

        let frame = FrameDecoder::new(FrameDirection::Request)
            .decode(req.get_data())
            .unwrap()
            .remove(0);
        let body = decompress(&frame.body, Compression::Lz4).unwrap();
        let mut plain = Vec::new();
        long.serialize(&mut plain, ProtocolVersion::V4).unwrap();
        assert_eq!(body, plain);
    }

    #[test]
    fn body_extensions_in_order() {
        let trace_id = Uuid::from_u128(42);
        let mut body = Vec::new();
        types::write_uuid(&trace_id, &mut body);
        types::write_string_list(&["careful"], &mut body).unwrap();
        let mut payload = HashMap::new();
        payload.insert("k".to_owned(), Bytes::from_static(b"v"));
        types::write_bytes_map(&payload, &mut body).unwrap();
        body.extend_from_slice(&[0, 0, 0, 1]);

        let parsed = parse_response_body_extensions(
            FLAG_TRACING | FLAG_WARNING | FLAG_CUSTOM_PAYLOAD,
            None,
            body.into(),
        )
        .unwrap();
        assert_eq!(parsed.trace_id, Some(trace_id));
        assert_eq!(parsed.warnings, vec!["careful".to_owned()]);
        assert_eq!(parsed.custom_payload, Some(payload));
        assert_eq!(&parsed.body[..], &[0, 0, 0, 1]);

        assert_matches!(
            parse_response_body_extensions(FLAG_COMPRESSION, None, Bytes::new()),
            Err(FrameError::NoCompressionNegotiated)
        );
    }
}
