// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

#![allow(clippy::float_cmp)]

use {
	crate::common::*,
	std::{fmt, io::{Read, Write}, net::TcpStream},
	bson::{Bson, Document},
	bitflags::bitflags,
	log::trace
};

pub const HEADER_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum InvalidReplyError {
	#[error("unexpected op code {0}")]
	OpCode(i32),
	#[error("reply to request {actual} while waiting for {expected}")]
	ResponseTo { expected: i32, actual: i32 },
	#[error("invalid message length {0}")]
	Length(i32),
	#[error("message is truncated")]
	Truncated,
	#[error("invalid c-string")]
	CString,
	#[error("reply contains no documents")]
	Empty,
	#[error("{0}")]
	Field(String)
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Reply       = 1,
	Insert      = 2002,
	Query       = 2004,
	GetMore     = 2005,
	KillCursors = 2007
}

impl OpCode {
	fn from_i32(v: i32) -> Option<Self> {
		Some(match v {
			1    => Self::Reply,
			2002 => Self::Insert,
			2004 => Self::Query,
			2005 => Self::GetMore,
			2007 => Self::KillCursors,
			_    => return None
		})
	}
}

bitflags! {
	pub struct QueryFlags: i32 {
		const TAILABLE_CURSOR   = 1 << 1;
		const SLAVE_OK          = 1 << 2;
		const OPLOG_REPLAY      = 1 << 3;
		const NO_CURSOR_TIMEOUT = 1 << 4;
		const AWAIT_DATA        = 1 << 5;
		const EXHAUST           = 1 << 6;
		const PARTIAL           = 1 << 7;
	}
}

bitflags! {
	pub struct ReplyFlags: i32 {
		const CURSOR_NOT_FOUND   = 1;
		const QUERY_FAILURE      = 1 << 1;
		const SHARD_CONFIG_STALE = 1 << 2;
		const AWAIT_CAPABLE      = 1 << 3;
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: i32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	fn read(reader: &mut Reader) -> std::result::Result<Self, InvalidReplyError> {
		let message_length = reader.i32()?;
		let request_id = reader.i32()?;
		let response_to = reader.i32()?;
		let op_code = reader.i32()?;

		if message_length as usize != reader.buf.len() {
			return Err(InvalidReplyError::Length(message_length));
		}

		Ok(Self {
			message_length,
			request_id,
			response_to,
			op_code: OpCode::from_i32(op_code).ok_or(InvalidReplyError::OpCode(op_code))?
		})
	}
}

struct Reader<'a> {
	buf: &'a [u8],
	pos: usize
}

impl<'a> Reader<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], InvalidReplyError> {
		let end = self.pos.checked_add(n)
			.filter(|end| *end <= self.buf.len())
			.ok_or(InvalidReplyError::Truncated)?;
		let slice = &self.buf[self.pos..end];
		self.pos = end;
		Ok(slice)
	}

	fn i32(&mut self) -> std::result::Result<i32, InvalidReplyError> {
		let b = self.take(4)?;
		Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
	}

	fn i64(&mut self) -> std::result::Result<i64, InvalidReplyError> {
		let mut b = [0u8; 8];
		b.copy_from_slice(self.take(8)?);
		Ok(i64::from_le_bytes(b))
	}

	fn cstring(&mut self) -> std::result::Result<String, InvalidReplyError> {
		let len = self.buf[self.pos..].iter()
			.position(|b| *b == 0)
			.ok_or(InvalidReplyError::CString)?;
		let s = std::str::from_utf8(self.take(len)?)
			.map_err(|_| InvalidReplyError::CString)?
			.to_string();
		self.take(1)?;
		Ok(s)
	}

	fn document(&mut self) -> Result<Document> {
		let len = self.buf.get(self.pos..self.pos + 4)
			.map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
			.ok_or(InvalidReplyError::Truncated)?;

		if len < 5 {
			return Err(InvalidReplyError::Length(len).into());
		}

		let mut bytes = self.take(len as usize)?;
		Ok(Document::from_reader(&mut bytes)?)
	}

	fn is_empty(&self) -> bool {
		self.pos >= self.buf.len()
	}
}

fn begin_frame() -> Vec<u8> {
	vec![0u8; HEADER_LENGTH]
}

fn finish_frame(mut buf: Vec<u8>, request_id: i32, response_to: i32, op_code: OpCode) -> Vec<u8> {
	Header {
		message_length: buf.len() as i32,
		request_id,
		response_to,
		op_code
	}.copy_to_slice(&mut buf[..HEADER_LENGTH]);
	buf
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) {
	buf.extend_from_slice(s.as_bytes());
	buf.push(0);
}

/// A client request in the legacy opcode format.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
	Query {
		namespace:             String,
		flags:                 QueryFlags,
		number_to_skip:        i32,
		number_to_return:      i32,
		query:                 Document,
		return_field_selector: Option<Document>
	},
	GetMore {
		namespace:        String,
		number_to_return: i32,
		cursor_id:        i64
	},
	KillCursors {
		cursor_ids: Vec<i64>
	},
	Insert {
		namespace:         String,
		continue_on_error: bool,
		documents:         Vec<Document>
	}
}

impl Request {
	pub fn op_code(&self) -> OpCode {
		match self {
			Self::Query { .. }       => OpCode::Query,
			Self::GetMore { .. }     => OpCode::GetMore,
			Self::KillCursors { .. } => OpCode::KillCursors,
			Self::Insert { .. }      => OpCode::Insert
		}
	}

	/// Only queries and get-mores are answered by the server.
	pub fn expects_reply(&self) -> bool {
		matches!(self, Self::Query { .. } | Self::GetMore { .. })
	}

	/// Name used in command monitoring events.
	pub fn command_name(&self) -> String {
		match self {
			Self::Query { namespace, query, .. } if namespace.ends_with(".$cmd") => query.keys()
				.next()
				.map_or_else(|| "query".to_string(), String::clone),
			Self::Query { .. }       => "query".to_string(),
			Self::GetMore { .. }     => "getMore".to_string(),
			Self::KillCursors { .. } => "killCursors".to_string(),
			Self::Insert { .. }      => "insert".to_string()
		}
	}

	pub fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
		let mut buf = begin_frame();

		match self {
			Self::Query { namespace, flags, number_to_skip, number_to_return, query, return_field_selector } => {
				buf.extend_from_slice(&flags.bits().to_le_bytes());
				write_cstring(&mut buf, namespace);
				buf.extend_from_slice(&number_to_skip.to_le_bytes());
				buf.extend_from_slice(&number_to_return.to_le_bytes());
				query.to_writer(&mut buf)?;
				if let Some(selector) = return_field_selector {
					selector.to_writer(&mut buf)?;
				}
			}
			Self::GetMore { namespace, number_to_return, cursor_id } => {
				buf.extend_from_slice(&0i32.to_le_bytes());
				write_cstring(&mut buf, namespace);
				buf.extend_from_slice(&number_to_return.to_le_bytes());
				buf.extend_from_slice(&cursor_id.to_le_bytes());
			}
			Self::KillCursors { cursor_ids } => {
				buf.extend_from_slice(&0i32.to_le_bytes());
				buf.extend_from_slice(&(cursor_ids.len() as i32).to_le_bytes());
				for id in cursor_ids {
					buf.extend_from_slice(&id.to_le_bytes());
				}
			}
			Self::Insert { namespace, continue_on_error, documents } => {
				buf.extend_from_slice(&(*continue_on_error as i32).to_le_bytes());
				write_cstring(&mut buf, namespace);
				for doc in documents {
					doc.to_writer(&mut buf)?;
				}
			}
		}

		Ok(finish_frame(buf, request_id, 0, self.op_code()))
	}

	pub fn decode(frame: &[u8]) -> Result<(Header, Self)> {
		let mut reader = Reader::new(frame);
		let header = Header::read(&mut reader)?;

		let request = match header.op_code {
			OpCode::Query => {
				let flags = QueryFlags::from_bits_truncate(reader.i32()?);
				let namespace = reader.cstring()?;
				let number_to_skip = reader.i32()?;
				let number_to_return = reader.i32()?;
				let query = reader.document()?;
				let return_field_selector = match reader.is_empty() {
					true  => None,
					false => Some(reader.document()?)
				};
				Self::Query { namespace, flags, number_to_skip, number_to_return, query, return_field_selector }
			}
			OpCode::GetMore => {
				reader.i32()?;
				let namespace = reader.cstring()?;
				let number_to_return = reader.i32()?;
				let cursor_id = reader.i64()?;
				Self::GetMore { namespace, number_to_return, cursor_id }
			}
			OpCode::KillCursors => {
				reader.i32()?;
				let n = reader.i32()?;
				let cursor_ids = (0..n.max(0))
					.map(|_| reader.i64())
					.collect::<std::result::Result<_, _>>()?;
				Self::KillCursors { cursor_ids }
			}
			OpCode::Insert => {
				let continue_on_error = reader.i32()? & 1 != 0;
				let namespace = reader.cstring()?;
				let mut documents = Vec::new();
				while !reader.is_empty() {
					documents.push(reader.document()?);
				}
				Self::Insert { namespace, continue_on_error, documents }
			}
			OpCode::Reply => return Err(InvalidReplyError::OpCode(OpCode::Reply as i32).into())
		};

		Ok((header, request))
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
	pub response_to:   i32,
	pub flags:         ReplyFlags,
	pub cursor_id:     i64,
	pub starting_from: i32,
	pub documents:     Vec<Document>
}

impl Reply {
	pub fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
		let mut buf = begin_frame();
		buf.extend_from_slice(&self.flags.bits().to_le_bytes());
		buf.extend_from_slice(&self.cursor_id.to_le_bytes());
		buf.extend_from_slice(&self.starting_from.to_le_bytes());
		buf.extend_from_slice(&(self.documents.len() as i32).to_le_bytes());
		for doc in &self.documents {
			doc.to_writer(&mut buf)?;
		}
		Ok(finish_frame(buf, request_id, self.response_to, OpCode::Reply))
	}

	pub fn decode(frame: &[u8]) -> Result<Self> {
		let mut reader = Reader::new(frame);
		let header = Header::read(&mut reader)?;

		if header.op_code != OpCode::Reply {
			return Err(InvalidReplyError::OpCode(header.op_code as i32).into());
		}

		let flags = ReplyFlags::from_bits_truncate(reader.i32()?);
		let cursor_id = reader.i64()?;
		let starting_from = reader.i32()?;
		let number_returned = reader.i32()?;
		let documents = (0..number_returned.max(0))
			.map(|_| reader.document())
			.collect::<Result<Vec<_>>>()?;

		Ok(Self { response_to: header.response_to, flags, cursor_id, starting_from, documents })
	}

	/// The `$err` message of a failed query.
	pub fn query_failure(&self) -> Option<String> {
		if !self.flags.contains(ReplyFlags::QUERY_FAILURE) { return None; }

		Some(self.documents.first()
			.and_then(|doc| doc.get_str("$err").ok())
			.unwrap_or("unknown query failure")
			.to_string())
	}
}

/// Checks the `ok` field of a command reply.
pub fn check_command_reply(doc: &Document) -> Result<()> {
	let ok = match doc.get("ok") {
		Some(Bson::Double(v))  => *v == 1.0,
		Some(Bson::Int32(v))   => *v == 1,
		Some(Bson::Int64(v))   => *v == 1,
		Some(Bson::Boolean(v)) => *v,
		_ => false
	};

	match ok {
		true  => Ok(()),
		false => Err(Error::Command {
			code:    doc.get_i32("code").unwrap_or(0),
			message: doc.get_str("errmsg").unwrap_or("unknown error").to_string()
		})
	}
}

/// Reads one length-prefixed message, header included.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_message_length: usize) -> Result<Vec<u8>> {
	let mut prefix = [0u8; 4];
	reader.read_exact(&mut prefix)?;
	let len = i32::from_le_bytes(prefix);

	if len < HEADER_LENGTH as i32 || len as usize > max_message_length {
		return Err(InvalidReplyError::Length(len).into());
	}

	let mut buf = vec![0u8; len as usize];
	buf[..4].copy_from_slice(&prefix);
	reader.read_exact(&mut buf[4..])?;
	Ok(buf)
}

/// A bidirectional byte stream to a server.
pub trait Transport: Read + Write + Send + fmt::Debug {}

impl<T: Read + Write + Send + fmt::Debug> Transport for T {}

pub trait Wire: Read + Write {
	fn send_request(&mut self, request_id: i32, request: &Request, max_message_length: usize) -> Result<()> {
		let frame = request.encode(request_id)?;
		if frame.len() > max_message_length {
			return Err(Error::MessageTooLarge { length: frame.len(), max: max_message_length });
		}

		trace!("sending {:?} as request {} ({} bytes)", request.op_code(), request_id, frame.len());
		self.write_all(&frame)?;
		self.flush()?;
		Ok(())
	}

	fn recv_reply(&mut self, request_id: i32, max_message_length: usize) -> Result<Reply> {
		let reply = Reply::decode(&read_frame(self, max_message_length)?)?;
		if reply.response_to != request_id {
			return Err(InvalidReplyError::ResponseTo { expected: request_id, actual: reply.response_to }.into());
		}

		trace!("received reply to {} with {} documents", request_id, reply.documents.len());
		Ok(reply)
	}
}

impl<T: Read + Write + ?Sized> Wire for T {}

/// Opens transports. The pool only depends on this trait, tests plug in a fake server.
pub trait Connector: Send + Sync + fmt::Debug {
	fn connect(&self, address: &ServerAddress, settings: &ClientSettings) -> Result<Box<dyn Transport>>;
}

#[derive(Debug, Default, Copy, Clone)]
pub struct TcpConnector;

impl Connector for TcpConnector {
	fn connect(&self, address: &ServerAddress, settings: &ClientSettings) -> Result<Box<dyn Transport>> {
		let mut last_error = None;

		for addr in address.resolve()? {
			match TcpStream::connect_timeout(&addr, settings.connect_timeout()) {
				Ok(stream) => {
					stream.set_nodelay(true)?;
					stream.set_read_timeout(settings.socket_timeout())?;
					stream.set_write_timeout(settings.socket_timeout())?;
					return Ok(Box::new(stream));
				}
				Err(e) => last_error = Some(e)
			}
		}

		Err(Error::Connectivity {
			address: address.clone(),
			reason:  last_error.map_or_else(|| "address did not resolve".to_string(), |e| e.to_string())
		})
	}
}
