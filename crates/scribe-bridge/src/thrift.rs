// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thrift binary protocol codec for the Scribe `Log` call.
//!
//! Scribe peers speak the binary protocol with strict read/write disabled, so
//! messages are always written in the old unversioned header form. Both the
//! unversioned and the versioned header are accepted when reading.
//!
//! Two transports are supported:
//! - framed: every message is preceded by its length as a big-endian `u32`
//! - buffered: messages follow each other on the stream without framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::ProtocolError;
use crate::scribe::{LogEntry, ResultCode};

pub const LOG_METHOD: &str = "Log";

const VERSION_MASK: u32 = 0xffff_0000;
const VERSION_1: u32 = 0x8001_0000;
const FRAME_HEADER_LEN: usize = 4;
const MAX_DEPTH: usize = 64;
/// Room reserved ahead of the next socket read on a buffered connection.
const READ_RESERVE: usize = 64 * 1024;

/// `TApplicationException` type for an unknown method name.
pub const UNKNOWN_METHOD: i32 = 1;

mod ttype {
    pub const STOP: u8 = 0;
    pub const BOOL: u8 = 2;
    pub const BYTE: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const I16: u8 = 6;
    pub const I32: u8 = 8;
    pub const I64: u8 = 10;
    pub const STRING: u8 = 11;
    pub const STRUCT: u8 = 12;
    pub const MAP: u8 = 13;
    pub const SET: u8 = 14;
    pub const LIST: u8 = 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageType::Call),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Exception),
            4 => Ok(MessageType::Oneway),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// Transport framing of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Framed,
    Buffered,
}

impl Framing {
    pub fn from_is_framed(is_framed: bool) -> Self {
        if is_framed {
            Framing::Framed
        } else {
            Framing::Buffered
        }
    }
}

/// A request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Log { seqid: i32, entries: Vec<LogEntry> },
    /// Any other method; its arguments have been skipped.
    Unknown { name: String, seqid: i32 },
}

impl Call {
    pub fn seqid(&self) -> i32 {
        match self {
            Call::Log { seqid, .. } | Call::Unknown { seqid, .. } => *seqid,
        }
    }
}

/// A response as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Log { seqid: i32, code: ResultCode },
    Exception {
        name: String,
        seqid: i32,
        message: String,
        kind: i32,
    },
}

impl Reply {
    pub fn seqid(&self) -> i32 {
        match self {
            Reply::Log { seqid, .. } | Reply::Exception { seqid, .. } => *seqid,
        }
    }
}

enum ReadError {
    Incomplete,
    Protocol(ProtocolError),
}

impl From<ProtocolError> for ReadError {
    fn from(e: ProtocolError) -> Self {
        ReadError::Protocol(e)
    }
}

type ReadResult<T> = Result<T, ReadError>;

/// Cursor over a possibly incomplete message.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    max_size: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], max_size: usize) -> Self {
        Reader {
            buf,
            pos: 0,
            max_size,
        }
    }

    fn take(&mut self, n: usize) -> ReadResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ReadError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i16(&mut self) -> ReadResult<i16> {
        let mut b = self.take(2)?;
        Ok(b.get_i16())
    }

    fn read_i32(&mut self) -> ReadResult<i32> {
        let mut b = self.take(4)?;
        Ok(b.get_i32())
    }

    fn read_size(&mut self) -> ReadResult<usize> {
        let size = self.read_i32()?;
        let size = usize::try_from(size).map_err(|_| ProtocolError::NegativeSize(size))?;
        if size > self.max_size {
            return Err(ProtocolError::SizeLimit {
                size,
                limit: self.max_size,
            }
            .into());
        }
        Ok(size)
    }

    fn read_binary(&mut self) -> ReadResult<&'a [u8]> {
        let len = self.read_size()?;
        self.take(len)
    }

    fn read_string(&mut self) -> ReadResult<String> {
        Ok(String::from_utf8_lossy(self.read_binary()?).into_owned())
    }

    fn read_message_header(&mut self) -> ReadResult<(String, MessageType, i32)> {
        let first = self.read_i32()?;
        if first < 0 {
            // versioned header written by a strict peer
            let word = first as u32;
            if word & VERSION_MASK != VERSION_1 {
                return Err(ProtocolError::BadVersion(word).into());
            }
            let kind = MessageType::from_u8((word & 0xff) as u8)?;
            let name = self.read_string()?;
            let seqid = self.read_i32()?;
            Ok((name, kind, seqid))
        } else {
            let len = first as usize;
            if len > self.max_size {
                return Err(ProtocolError::SizeLimit {
                    size: len,
                    limit: self.max_size,
                }
                .into());
            }
            let name = String::from_utf8_lossy(self.take(len)?).into_owned();
            let kind = MessageType::from_u8(self.read_u8()?)?;
            let seqid = self.read_i32()?;
            Ok((name, kind, seqid))
        }
    }

    /// Returns the next field as `(type, id)`, or `None` at the end of a struct.
    fn read_field_header(&mut self) -> ReadResult<Option<(u8, i16)>> {
        let field_type = self.read_u8()?;
        if field_type == ttype::STOP {
            return Ok(None);
        }
        let id = self.read_i16()?;
        Ok(Some((field_type, id)))
    }

    fn skip(&mut self, field_type: u8, depth: usize) -> ReadResult<()> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::DepthLimit(MAX_DEPTH).into());
        }
        match field_type {
            ttype::BOOL | ttype::BYTE => {
                self.take(1)?;
            }
            ttype::I16 => {
                self.take(2)?;
            }
            ttype::I32 => {
                self.take(4)?;
            }
            ttype::I64 | ttype::DOUBLE => {
                self.take(8)?;
            }
            ttype::STRING => {
                self.read_binary()?;
            }
            ttype::STRUCT => {
                while let Some((inner, _)) = self.read_field_header()? {
                    self.skip(inner, depth + 1)?;
                }
            }
            ttype::MAP => {
                let key_type = self.read_u8()?;
                let value_type = self.read_u8()?;
                let size = self.read_size()?;
                for _ in 0..size {
                    self.skip(key_type, depth + 1)?;
                    self.skip(value_type, depth + 1)?;
                }
            }
            ttype::SET | ttype::LIST => {
                let elem_type = self.read_u8()?;
                let size = self.read_size()?;
                for _ in 0..size {
                    self.skip(elem_type, depth + 1)?;
                }
            }
            other => return Err(ProtocolError::InvalidFieldType(other).into()),
        }
        Ok(())
    }

    fn read_log_entry(&mut self) -> ReadResult<LogEntry> {
        let mut category = String::new();
        let mut message = Bytes::new();
        while let Some((field_type, id)) = self.read_field_header()? {
            match (id, field_type) {
                (1, ttype::STRING) => category = self.read_string()?,
                (2, ttype::STRING) => message = Bytes::copy_from_slice(self.read_binary()?),
                _ => self.skip(field_type, 1)?,
            }
        }
        Ok(LogEntry { category, message })
    }

    fn read_log_args(&mut self) -> ReadResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        while let Some((field_type, id)) = self.read_field_header()? {
            if (id, field_type) != (1, ttype::LIST) {
                self.skip(field_type, 1)?;
                continue;
            }
            let elem_type = self.read_u8()?;
            let size = self.read_size()?;
            if elem_type != ttype::STRUCT {
                for _ in 0..size {
                    self.skip(elem_type, 1)?;
                }
                continue;
            }
            entries.reserve(size.min(1024));
            for _ in 0..size {
                entries.push(self.read_log_entry()?);
            }
        }
        Ok(entries)
    }

    fn read_log_result(&mut self) -> ReadResult<ResultCode> {
        let mut success = None;
        while let Some((field_type, id)) = self.read_field_header()? {
            match (id, field_type) {
                (0, ttype::I32) => success = Some(self.read_i32()?),
                _ => self.skip(field_type, 1)?,
            }
        }
        let value = success.ok_or(ProtocolError::MissingField("success"))?;
        Ok(ResultCode::from_i32(value).ok_or(ProtocolError::UnknownResultCode(value))?)
    }

    fn read_application_exception(&mut self) -> ReadResult<(String, i32)> {
        let mut message = String::new();
        let mut kind = 0;
        while let Some((field_type, id)) = self.read_field_header()? {
            match (id, field_type) {
                (1, ttype::STRING) => message = self.read_string()?,
                (2, ttype::I32) => kind = self.read_i32()?,
                _ => self.skip(field_type, 1)?,
            }
        }
        Ok((message, kind))
    }

    fn read_call(&mut self) -> ReadResult<Call> {
        let (name, kind, seqid) = self.read_message_header()?;
        // `Log` expects an answer, so oneway calls are refused
        if kind != MessageType::Call {
            return Err(ProtocolError::InvalidMessageType(kind as u8).into());
        }
        if name == LOG_METHOD {
            let entries = self.read_log_args()?;
            Ok(Call::Log { seqid, entries })
        } else {
            self.skip(ttype::STRUCT, 0)?;
            Ok(Call::Unknown { name, seqid })
        }
    }

    fn read_reply(&mut self) -> ReadResult<Reply> {
        let (name, kind, seqid) = self.read_message_header()?;
        match kind {
            MessageType::Reply => {
                let code = self.read_log_result()?;
                Ok(Reply::Log { seqid, code })
            }
            MessageType::Exception => {
                let (message, kind) = self.read_application_exception()?;
                Ok(Reply::Exception {
                    name,
                    seqid,
                    message,
                    kind,
                })
            }
            other => Err(ProtocolError::InvalidMessageType(other as u8).into()),
        }
    }
}

fn write_string(dst: &mut BytesMut, value: &[u8]) {
    dst.put_i32(value.len() as i32);
    dst.put_slice(value);
}

fn write_message_header(dst: &mut BytesMut, name: &str, kind: MessageType, seqid: i32) {
    write_string(dst, name.as_bytes());
    dst.put_u8(kind as u8);
    dst.put_i32(seqid);
}

fn write_field_header(dst: &mut BytesMut, field_type: u8, id: i16) {
    dst.put_u8(field_type);
    dst.put_i16(id);
}

fn write_call(dst: &mut BytesMut, call: &Call) {
    match call {
        Call::Log { seqid, entries } => {
            write_message_header(dst, LOG_METHOD, MessageType::Call, *seqid);
            write_field_header(dst, ttype::LIST, 1);
            dst.put_u8(ttype::STRUCT);
            dst.put_i32(entries.len() as i32);
            for entry in entries {
                write_field_header(dst, ttype::STRING, 1);
                write_string(dst, entry.category.as_bytes());
                write_field_header(dst, ttype::STRING, 2);
                write_string(dst, &entry.message);
                dst.put_u8(ttype::STOP);
            }
            dst.put_u8(ttype::STOP);
        }
        Call::Unknown { name, seqid } => {
            write_message_header(dst, name, MessageType::Call, *seqid);
            dst.put_u8(ttype::STOP);
        }
    }
}

fn write_reply(dst: &mut BytesMut, reply: &Reply) {
    match reply {
        Reply::Log { seqid, code } => {
            write_message_header(dst, LOG_METHOD, MessageType::Reply, *seqid);
            write_field_header(dst, ttype::I32, 0);
            dst.put_i32(code.as_i32());
            dst.put_u8(ttype::STOP);
        }
        Reply::Exception {
            name,
            seqid,
            message,
            kind,
        } => {
            write_message_header(dst, name, MessageType::Exception, *seqid);
            write_field_header(dst, ttype::STRING, 1);
            write_string(dst, message.as_bytes());
            write_field_header(dst, ttype::I32, 2);
            dst.put_i32(*kind);
            dst.put_u8(ttype::STOP);
        }
    }
}

/// One open container while scanning for the end of a message.
#[derive(Debug, Clone, Copy)]
enum Open {
    Struct,
    Elements { elem_type: u8, remaining: usize },
    /// Keys and values alternate; `remaining` counts both.
    Pairs {
        key_type: u8,
        value_type: u8,
        remaining: usize,
    },
}

/// Finds where a buffered message ends without decoding it.
///
/// Progress is kept across calls, so bytes arriving in small reads are only
/// walked once. Each step (a field header with its value, or one container
/// element) either completes or leaves the state untouched.
#[derive(Debug, Clone, Default)]
struct Scanner {
    pos: usize,
    header_done: bool,
    open: Vec<Open>,
}

impl Scanner {
    /// Returns the message length once all of it is in `buf`.
    fn scan(&mut self, buf: &[u8], max_size: usize) -> Result<Option<usize>, ProtocolError> {
        loop {
            let mut reader = Reader {
                buf,
                pos: self.pos,
                max_size,
            };
            match self.step(&mut reader) {
                Ok(done) => {
                    self.pos = reader.pos;
                    if done {
                        return Ok(Some(self.pos));
                    }
                }
                Err(ReadError::Incomplete) => return Ok(None),
                Err(ReadError::Protocol(e)) => return Err(e),
            }
        }
    }

    /// Consumes one step; `true` once the message is complete.
    fn step(&mut self, reader: &mut Reader<'_>) -> ReadResult<bool> {
        if !self.header_done {
            reader.read_message_header()?;
            self.header_done = true;
            self.open.push(Open::Struct);
            return Ok(false);
        }

        let Some(top) = self.open.last().copied() else {
            return Ok(true);
        };
        let value_type = match top {
            Open::Struct => match reader.read_field_header()? {
                Some((field_type, _)) => field_type,
                None => {
                    self.open.pop();
                    return Ok(self.open.is_empty());
                }
            },
            Open::Elements { remaining: 0, .. } | Open::Pairs { remaining: 0, .. } => {
                self.open.pop();
                return Ok(self.open.is_empty());
            }
            Open::Elements { elem_type, .. } => elem_type,
            Open::Pairs {
                key_type,
                value_type,
                remaining,
            } => {
                if remaining % 2 == 0 {
                    key_type
                } else {
                    value_type
                }
            }
        };

        let inner = Self::enter(reader, value_type)?;

        // the step is complete, commit it
        if let Some(
            Open::Elements { remaining, .. } | Open::Pairs { remaining, .. },
        ) = self.open.last_mut()
        {
            *remaining -= 1;
        }
        if let Some(inner) = inner {
            if self.open.len() >= MAX_DEPTH {
                return Err(ProtocolError::DepthLimit(MAX_DEPTH).into());
            }
            self.open.push(inner);
        }
        Ok(false)
    }

    /// Reads a scalar entirely, or the header of a container.
    fn enter(reader: &mut Reader<'_>, value_type: u8) -> ReadResult<Option<Open>> {
        match value_type {
            ttype::STRUCT => Ok(Some(Open::Struct)),
            ttype::LIST | ttype::SET => {
                let elem_type = reader.read_u8()?;
                let remaining = reader.read_size()?;
                Ok(Some(Open::Elements {
                    elem_type,
                    remaining,
                }))
            }
            ttype::MAP => {
                let key_type = reader.read_u8()?;
                let value_type = reader.read_u8()?;
                let size = reader.read_size()?;
                Ok(Some(Open::Pairs {
                    key_type,
                    value_type,
                    remaining: size.saturating_mul(2),
                }))
            }
            scalar => {
                reader.skip(scalar, 0)?;
                Ok(None)
            }
        }
    }
}

/// Shared framing logic for both codecs.
#[derive(Debug, Clone)]
struct Transport {
    framing: Framing,
    max_size: usize,
    scanner: Scanner,
    #[cfg(test)]
    parses: usize,
}

impl Transport {
    fn new(framing: Framing, max_size: usize) -> Self {
        Transport {
            framing,
            max_size,
            scanner: Scanner::default(),
            #[cfg(test)]
            parses: 0,
        }
    }

    fn decode<T>(
        &mut self,
        src: &mut BytesMut,
        read: impl FnOnce(&mut Reader<'_>) -> ReadResult<T>,
    ) -> Result<Option<T>, ProtocolError> {
        match self.framing {
            Framing::Framed => {
                if src.len() < FRAME_HEADER_LEN {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                if len > self.max_size {
                    return Err(ProtocolError::SizeLimit {
                        size: len,
                        limit: self.max_size,
                    });
                }
                if src.len() < FRAME_HEADER_LEN + len {
                    src.reserve(FRAME_HEADER_LEN + len - src.len());
                    return Ok(None);
                }
                let frame = src.split_to(FRAME_HEADER_LEN + len);
                let mut reader = Reader::new(&frame[FRAME_HEADER_LEN..], self.max_size);
                self.count_parse();
                match read(&mut reader) {
                    Ok(item) => Ok(Some(item)),
                    Err(ReadError::Incomplete) => Err(ProtocolError::Truncated),
                    Err(ReadError::Protocol(e)) => Err(e),
                }
            }
            Framing::Buffered => {
                let len = match self.scanner.scan(&src[..], self.max_size) {
                    Ok(Some(len)) => len,
                    Ok(None) if src.len() > self.max_size => {
                        return Err(ProtocolError::SizeLimit {
                            size: src.len(),
                            limit: self.max_size,
                        });
                    }
                    Ok(None) => {
                        src.reserve(READ_RESERVE);
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };
                self.scanner = Scanner::default();
                let message = src.split_to(len);
                let mut reader = Reader::new(&message[..], self.max_size);
                self.count_parse();
                match read(&mut reader) {
                    Ok(item) => Ok(Some(item)),
                    Err(ReadError::Incomplete) => Err(ProtocolError::Truncated),
                    Err(ReadError::Protocol(e)) => Err(e),
                }
            }
        }
    }

    #[cfg(test)]
    fn count_parse(&mut self) {
        self.parses += 1;
    }

    #[cfg(not(test))]
    fn count_parse(&mut self) {}

    fn encode(&self, dst: &mut BytesMut, write: impl FnOnce(&mut BytesMut)) {
        match self.framing {
            Framing::Framed => {
                let start = dst.len();
                dst.put_u32(0);
                write(dst);
                let len = (dst.len() - start - FRAME_HEADER_LEN) as u32;
                dst[start..start + FRAME_HEADER_LEN].copy_from_slice(&len.to_be_bytes());
            }
            Framing::Buffered => write(dst),
        }
    }
}

/// Server side codec: decodes [`Call`]s and encodes [`Reply`]s.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    transport: Transport,
}

impl ServerCodec {
    pub fn new(framing: Framing, max_size: usize) -> Self {
        ServerCodec {
            transport: Transport::new(framing, max_size),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = Call;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Call>, ProtocolError> {
        self.transport.decode(src, |reader| reader.read_call())
    }
}

impl Encoder<Reply> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.transport.encode(dst, |dst| write_reply(dst, &reply));
        Ok(())
    }
}

/// Client side codec: encodes [`Call`]s and decodes [`Reply`]s.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    transport: Transport,
}

impl ClientCodec {
    pub fn new(framing: Framing, max_size: usize) -> Self {
        ClientCodec {
            transport: Transport::new(framing, max_size),
        }
    }
}

impl Decoder for ClientCodec {
    type Item = Reply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        self.transport.decode(src, |reader| reader.read_reply())
    }
}

impl Encoder<Call> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, call: Call, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.transport.encode(dst, |dst| write_call(dst, &call));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    fn entries() -> Vec<LogEntry> {
        vec![
            LogEntry::new("app", "first line"),
            LogEntry::new("web", Bytes::from_static(&[0xff, 0x00, 0x10])),
        ]
    }

    fn encode_call(framing: Framing, call: Call) -> BytesMut {
        let mut buf = BytesMut::new();
        ClientCodec::new(framing, LIMIT).encode(call, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_log_call_non_strict_layout() {
        let buf = encode_call(
            Framing::Buffered,
            Call::Log {
                seqid: 7,
                entries: vec![LogEntry::new("c", "m")],
            },
        );
        let parts: &[&[u8]] = &[
            &[0, 0, 0, 3],
            b"Log",
            &[1],
            &[0, 0, 0, 7],
            // field 1: list<struct>, one element
            &[15, 0, 1, 12, 0, 0, 0, 1],
            // category
            &[11, 0, 1, 0, 0, 0, 1],
            b"c",
            // message
            &[11, 0, 2, 0, 0, 0, 1],
            b"m",
            &[0],
            &[0],
        ];
        assert_eq!(&buf[..], &parts.concat()[..]);
    }

    #[test]
    fn test_framed_call_has_length_prefix() {
        let buf = encode_call(
            Framing::Framed,
            Call::Log {
                seqid: 1,
                entries: entries(),
            },
        );
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[test]
    fn test_server_decodes_framed_and_buffered_calls() {
        for framing in [Framing::Framed, Framing::Buffered] {
            let call = Call::Log {
                seqid: 42,
                entries: entries(),
            };
            let mut buf = encode_call(framing, call.clone());
            let decoded = ServerCodec::new(framing, LIMIT).decode(&mut buf).unwrap();
            assert_eq!(decoded, Some(call));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_server_waits_for_complete_message() {
        for framing in [Framing::Framed, Framing::Buffered] {
            let full = encode_call(
                framing,
                Call::Log {
                    seqid: 3,
                    entries: entries(),
                },
            );
            let mut codec = ServerCodec::new(framing, LIMIT);
            let mut partial = BytesMut::from(&full[..full.len() - 1]);
            assert_eq!(codec.decode(&mut partial).unwrap(), None);
            partial.extend_from_slice(&full[full.len() - 1..]);
            assert!(matches!(
                codec.decode(&mut partial).unwrap(),
                Some(Call::Log { seqid: 3, .. })
            ));
        }
    }

    #[test]
    fn test_buffered_back_to_back_calls() {
        let mut buf = encode_call(
            Framing::Buffered,
            Call::Log {
                seqid: 1,
                entries: entries(),
            },
        );
        buf.extend_from_slice(&encode_call(
            Framing::Buffered,
            Call::Log {
                seqid: 2,
                entries: Vec::new(),
            },
        ));
        let mut codec = ServerCodec::new(Framing::Buffered, LIMIT);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().seqid(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().seqid(), 2);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_server_accepts_strict_header() {
        let mut buf = BytesMut::new();
        buf.put_u32(VERSION_1 | MessageType::Call as u32);
        write_string(&mut buf, b"Log");
        buf.put_i32(9);
        write_field_header(&mut buf, ttype::LIST, 1);
        buf.put_u8(ttype::STRUCT);
        buf.put_i32(1);
        write_field_header(&mut buf, ttype::STRING, 1);
        write_string(&mut buf, b"strict");
        write_field_header(&mut buf, ttype::STRING, 2);
        write_string(&mut buf, b"hello");
        buf.put_u8(ttype::STOP);
        buf.put_u8(ttype::STOP);

        let decoded = ServerCodec::new(Framing::Buffered, LIMIT)
            .decode(&mut buf)
            .unwrap();
        assert_eq!(
            decoded,
            Some(Call::Log {
                seqid: 9,
                entries: vec![LogEntry::new("strict", "hello")],
            })
        );
    }

    #[test]
    fn test_server_rejects_bad_version() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8002_0001);
        write_string(&mut buf, b"Log");
        buf.put_i32(1);
        let err = ServerCodec::new(Framing::Buffered, LIMIT)
            .decode(&mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BadVersion(0x8002_0001)));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut buf = BytesMut::new();
        write_message_header(&mut buf, LOG_METHOD, MessageType::Call, 5);
        // unknown i64 and map fields before the entries
        write_field_header(&mut buf, ttype::I64, 9);
        buf.put_i64(-1);
        write_field_header(&mut buf, ttype::MAP, 10);
        buf.put_u8(ttype::STRING);
        buf.put_u8(ttype::I32);
        buf.put_i32(1);
        write_string(&mut buf, b"k");
        buf.put_i32(3);
        write_field_header(&mut buf, ttype::LIST, 1);
        buf.put_u8(ttype::STRUCT);
        buf.put_i32(1);
        // entry with an extra bool field
        write_field_header(&mut buf, ttype::BOOL, 3);
        buf.put_u8(1);
        write_field_header(&mut buf, ttype::STRING, 1);
        write_string(&mut buf, b"cat");
        write_field_header(&mut buf, ttype::STRING, 2);
        write_string(&mut buf, b"msg");
        buf.put_u8(ttype::STOP);
        buf.put_u8(ttype::STOP);

        let decoded = ServerCodec::new(Framing::Buffered, LIMIT)
            .decode(&mut buf)
            .unwrap();
        assert_eq!(
            decoded,
            Some(Call::Log {
                seqid: 5,
                entries: vec![LogEntry::new("cat", "msg")],
            })
        );
    }

    #[test]
    fn test_unknown_method_skips_arguments() {
        let mut buf = BytesMut::new();
        write_message_header(&mut buf, "getStatus", MessageType::Call, 11);
        write_field_header(&mut buf, ttype::STRING, 1);
        write_string(&mut buf, b"ignored");
        buf.put_u8(ttype::STOP);

        let mut codec = ServerCodec::new(Framing::Buffered, LIMIT);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Call::Unknown {
                name: "getStatus".to_string(),
                seqid: 11
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_buffered_call_in_small_reads_is_parsed_once() {
        let entries: Vec<LogEntry> = (0..20_000)
            .map(|i| LogEntry::new("category", format!("message number {i}")))
            .collect();
        let full = encode_call(
            Framing::Buffered,
            Call::Log {
                seqid: 42,
                entries: entries.clone(),
            },
        );
        assert!(full.len() > 10 * 64 * 1024);

        let mut codec = ServerCodec::new(Framing::Buffered, LIMIT);
        let mut buf = BytesMut::new();
        let mut chunks = full.chunks(64 * 1024).peekable();
        let mut decoded = None;
        while let Some(chunk) = chunks.next() {
            buf.extend_from_slice(chunk);
            let result = codec.decode(&mut buf).unwrap();
            if chunks.peek().is_some() {
                assert_eq!(result, None);
            } else {
                decoded = result;
            }
        }

        assert_eq!(decoded, Some(Call::Log { seqid: 42, entries }));
        assert_eq!(codec.transport.parses, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_buffered_scan_resumes_byte_by_byte() {
        let mut full = BytesMut::new();
        write_message_header(&mut full, LOG_METHOD, MessageType::Call, 6);
        // nested containers ahead of the entries
        write_field_header(&mut full, ttype::MAP, 7);
        full.put_u8(ttype::STRING);
        full.put_u8(ttype::LIST);
        full.put_i32(1);
        write_string(&mut full, b"key");
        full.put_u8(ttype::I64);
        full.put_i32(2);
        full.put_i64(1);
        full.put_i64(2);
        write_field_header(&mut full, ttype::LIST, 1);
        full.put_u8(ttype::STRUCT);
        full.put_i32(2);
        for (category, message) in [(&b"a"[..], &b"one"[..]), (&b"b"[..], &b"two"[..])] {
            write_field_header(&mut full, ttype::STRING, 1);
            write_string(&mut full, category);
            write_field_header(&mut full, ttype::STRING, 2);
            write_string(&mut full, message);
            full.put_u8(ttype::STOP);
        }
        full.put_u8(ttype::STOP);
        // start of the next call
        full.extend_from_slice(&[0, 0, 0, 3]);

        let mut codec = ServerCodec::new(Framing::Buffered, LIMIT);
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in &full[..full.len() - 4] {
            assert_eq!(decoded, None);
            buf.put_u8(*byte);
            decoded = codec.decode(&mut buf).unwrap();
        }
        assert_eq!(
            decoded,
            Some(Call::Log {
                seqid: 6,
                entries: vec![LogEntry::new("a", "one"), LogEntry::new("b", "two")],
            })
        );
        assert_eq!(codec.transport.parses, 1);

        // the scan starts over for the next message
        buf.extend_from_slice(&full[full.len() - 4..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_oneway_call_is_rejected() {
        for framing in [Framing::Framed, Framing::Buffered] {
            let mut message = BytesMut::new();
            write_message_header(&mut message, LOG_METHOD, MessageType::Oneway, 1);
            write_field_header(&mut message, ttype::LIST, 1);
            message.put_u8(ttype::STRUCT);
            message.put_i32(0);
            message.put_u8(ttype::STOP);

            let mut buf = BytesMut::new();
            if framing == Framing::Framed {
                buf.put_u32(message.len() as u32);
            }
            buf.extend_from_slice(&message);

            let err = ServerCodec::new(framing, LIMIT).decode(&mut buf).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidMessageType(4)));
        }
    }

    #[test]
    fn test_size_limits() {
        let mut buf = encode_call(
            Framing::Framed,
            Call::Log {
                seqid: 1,
                entries: entries(),
            },
        );
        let err = ServerCodec::new(Framing::Framed, 8).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeLimit { limit: 8, .. }));

        let mut buf = encode_call(
            Framing::Buffered,
            Call::Log {
                seqid: 1,
                entries: vec![LogEntry::new("c", vec![b'x'; 64])],
            },
        );
        let err = ServerCodec::new(Framing::Buffered, 16).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeLimit { limit: 16, .. }));
    }

    #[test]
    fn test_truncated_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(&[0, 0, 0, 3, b'L']);
        let err = ServerCodec::new(Framing::Framed, LIMIT).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[test]
    fn test_reply_and_exception_round_trip() {
        for framing in [Framing::Framed, Framing::Buffered] {
            let mut server = ServerCodec::new(framing, LIMIT);
            let mut client = ClientCodec::new(framing, LIMIT);
            let mut buf = BytesMut::new();

            let ok = Reply::Log {
                seqid: 4,
                code: ResultCode::TryLater,
            };
            let exception = Reply::Exception {
                name: "getStatus".to_string(),
                seqid: 5,
                message: "Unknown function getStatus".to_string(),
                kind: UNKNOWN_METHOD,
            };
            server.encode(ok.clone(), &mut buf).unwrap();
            server.encode(exception.clone(), &mut buf).unwrap();

            assert_eq!(client.decode(&mut buf).unwrap(), Some(ok));
            assert_eq!(client.decode(&mut buf).unwrap(), Some(exception));
        }
    }

    #[test]
    fn test_reply_with_unknown_result_code() {
        let mut buf = BytesMut::new();
        write_message_header(&mut buf, LOG_METHOD, MessageType::Reply, 1);
        write_field_header(&mut buf, ttype::I32, 0);
        buf.put_i32(99);
        buf.put_u8(ttype::STOP);
        let err = ClientCodec::new(Framing::Buffered, LIMIT)
            .decode(&mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownResultCode(99)));
    }

    #[test]
    fn test_reply_without_success_field() {
        let mut buf = BytesMut::new();
        write_message_header(&mut buf, LOG_METHOD, MessageType::Reply, 1);
        buf.put_u8(ttype::STOP);
        let err = ClientCodec::new(Framing::Buffered, LIMIT)
            .decode(&mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("success")));
    }
}
