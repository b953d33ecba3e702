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

//! In-process fake server for unit tests.

use {
	crate::{
		common::*,
		wire::{Request, Reply, ReplyFlags, Transport, Connector, HEADER_LENGTH}
	},
	std::{
		io::{self, Read, Write},
		collections::{HashMap, VecDeque},
		sync::{Arc, Mutex, MutexGuard, atomic::{AtomicUsize, Ordering}}
	},
	bson::{doc, Bson, Document}
};

const NONCE: &str = "2375531c32080ae8";

#[derive(Debug)]
pub struct MockState {
	pub reachable:        bool,
	pub fail_ping:        bool,
	pub ismaster:         Document,
	pub version:          String,
	pub users:            Vec<(String, String)>,
	/// Served one per query or get-more.
	pub batches:          VecDeque<Vec<Document>>,
	/// Keeps the cursor open after the last batch, like a tailable cursor.
	pub keep_cursor_open: bool,
	pub cursor_id:        i64,
	pub cursor_open:      bool,
	pub query_failure:    Option<String>,
	/// `err` of the next getlasterror reply.
	pub last_error:       Option<String>,
	pub inserted:         Vec<Document>,
	pub requests:         Vec<Request>
}

#[derive(Debug)]
pub struct MockServer {
	state: Mutex<MockState>
}

impl MockServer {
	fn new(ismaster: Document) -> Self {
		Self {
			state: Mutex::new(MockState {
				reachable:        true,
				fail_ping:        false,
				ismaster,
				version:          "2.4.9".to_string(),
				users:            Vec::new(),
				batches:          VecDeque::new(),
				keep_cursor_open: false,
				cursor_id:        0,
				cursor_open:      false,
				query_failure:    None,
				last_error:       None,
				inserted:         Vec::new(),
				requests:         Vec::new()
			})
		}
	}

	fn hosts(hosts: &[&str]) -> Vec<Bson> {
		hosts.iter().map(|h| Bson::String(h.to_string())).collect()
	}

	pub fn primary() -> Self {
		Self::new(doc! { "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024 })
	}

	pub fn replica_set_primary(set: &str, hosts: &[&str]) -> Self {
		Self::new(doc! { "ismaster": true, "secondary": false, "setName": set, "hosts": Self::hosts(hosts) })
	}

	pub fn secondary(set: &str, hosts: &[&str]) -> Self {
		Self::new(doc! { "ismaster": false, "secondary": true, "setName": set, "hosts": Self::hosts(hosts) })
	}

	pub fn arbiter(set: &str, hosts: &[&str]) -> Self {
		Self::new(doc! { "ismaster": false, "secondary": false, "arbiterOnly": true, "setName": set, "hosts": Self::hosts(hosts) })
	}

	pub fn with_tags(self, tags: &[(&str, &str)]) -> Self {
		let tags = tags.iter()
			.map(|(k, v)| (k.to_string(), Bson::String(v.to_string())))
			.collect::<Document>();
		self.state().ismaster.insert("tags", tags);
		self
	}

	pub fn with_batches(self, batches: Vec<Vec<Document>>) -> Self {
		self.state().batches.extend(batches);
		self
	}

	pub fn state(&self) -> MutexGuard<MockState> {
		self.state.lock().unwrap()
	}

	pub fn requests(&self) -> Vec<Request> {
		self.state().requests.clone()
	}

	/// Number of times the command `name` was received.
	pub fn commands(&self, name: &str) -> usize {
		self.requests().iter()
			.filter(|r| matches!(r, Request::Query { namespace, .. } if namespace.ends_with(".$cmd")))
			.filter(|r| r.command_name() == name)
			.count()
	}

	fn handle(&self, request_id: i32, request: Request) -> Option<Reply> {
		let mut state = self.state();
		state.requests.push(request.clone());

		let reply = |flags: ReplyFlags, cursor_id: i64, documents: Vec<Document>| Some(Reply {
			response_to:   request_id,
			flags:         flags | ReplyFlags::AWAIT_CAPABLE,
			cursor_id,
			starting_from: 0,
			documents
		});

		match request {
			Request::Query { namespace, query, .. } if namespace.ends_with(".$cmd") => {
				let name = query.keys().next().cloned().unwrap_or_default();
				reply(ReplyFlags::empty(), 0, vec![command(&mut state, &name, &query)])
			}
			Request::Query { .. } => {
				if let Some(failure) = state.query_failure.clone() {
					return reply(ReplyFlags::QUERY_FAILURE, 0, vec![doc! { "$err": failure, "code": 2 }]);
				}

				state.cursor_id += 1;
				let documents = state.batches.pop_front().unwrap_or_default();
				state.cursor_open = !state.batches.is_empty() || state.keep_cursor_open;
				let cursor_id = if state.cursor_open { state.cursor_id } else { 0 };
				reply(ReplyFlags::empty(), cursor_id, documents)
			}
			Request::GetMore { cursor_id, .. } => {
				if !state.cursor_open || cursor_id != state.cursor_id {
					return reply(ReplyFlags::CURSOR_NOT_FOUND, 0, Vec::new());
				}

				let documents = state.batches.pop_front().unwrap_or_default();
				state.cursor_open = !state.batches.is_empty() || state.keep_cursor_open;
				let cursor_id = if state.cursor_open { cursor_id } else { 0 };
				reply(ReplyFlags::empty(), cursor_id, documents)
			}
			Request::KillCursors { cursor_ids } => {
				if cursor_ids.contains(&state.cursor_id) {
					state.cursor_open = false;
				}
				None
			}
			Request::Insert { documents, .. } => {
				state.inserted.extend(documents);
				None
			}
		}
	}
}

fn command(state: &mut MockState, name: &str, query: &Document) -> Document {
	match name {
		"ping" if state.fail_ping => doc! { "ok": 0.0, "errmsg": "ping failed" },
		"ping" => doc! { "ok": 1.0 },
		"ismaster" => {
			let mut reply = state.ismaster.clone();
			reply.insert("ok", 1.0);
			reply
		}
		"buildinfo" => doc! {
			"version":    state.version.clone(),
			"gitVersion": "0000000000000000000000000000000000000000",
			"sysInfo":    "mock",
			"bits":       64i64,
			"ok":         1.0
		},
		"getnonce" => doc! { "nonce": NONCE, "ok": 1.0 },
		"authenticate" => match authenticate(state, query) {
			true  => doc! { "ok": 1.0 },
			false => doc! { "ok": 0.0, "errmsg": "auth failed", "code": 18 }
		},
		"getlasterror" => match state.last_error.take() {
			Some(err) => doc! { "ok": 1.0, "err": err, "n": 0 },
			None => doc! { "ok": 1.0, "err": Bson::Null, "n": 0 }
		},
		_ => doc! { "ok": 0.0, "errmsg": format!("no such command: {}", name), "code": 59 }
	}
}

#[cfg(feature = "auth")]
fn authenticate(state: &MockState, query: &Document) -> bool {
	let (user, key) = match (query.get_str("user"), query.get_str("key")) {
		(Ok(user), Ok(key)) => (user, key),
		_ => return false
	};

	state.users.iter()
		.any(|(u, p)| u == user && crate::auth::mongodb_cr_key(NONCE, u, p) == key)
}

#[cfg(not(feature = "auth"))]
fn authenticate(_state: &MockState, _query: &Document) -> bool {
	false
}

#[derive(Debug)]
struct MockTransport {
	server: Arc<MockServer>,
	input:  Vec<u8>,
	output: VecDeque<u8>
}

fn unreachable_error() -> io::Error {
	io::Error::new(io::ErrorKind::ConnectionReset, "server is unreachable")
}

impl Write for MockTransport {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if !self.server.state().reachable {
			return Err(unreachable_error());
		}

		self.input.extend_from_slice(buf);
		while self.input.len() >= HEADER_LENGTH {
			let len = i32::from_le_bytes([self.input[0], self.input[1], self.input[2], self.input[3]]) as usize;
			if self.input.len() < len { break; }

			let frame = self.input.drain(..len).collect::<Vec<_>>();
			let (header, request) = Request::decode(&frame)
				.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

			if let Some(reply) = self.server.handle(header.request_id, request) {
				let bytes = reply.encode(header.request_id.wrapping_add(1_000_000))
					.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
				self.output.extend(bytes);
			}
		}

		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl Read for MockTransport {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if !self.server.state().reachable {
			return Err(unreachable_error());
		}

		let n = buf.len().min(self.output.len());
		for (dst, src) in buf.iter_mut().zip(self.output.drain(..n)) {
			*dst = src;
		}
		Ok(n)
	}
}

#[derive(Debug, Default)]
pub struct MockConnector {
	servers:  Mutex<HashMap<ServerAddress, Arc<MockServer>>>,
	connects: AtomicUsize
}

impl MockConnector {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn add(&self, address: &str, server: MockServer) -> Arc<MockServer> {
		let server = Arc::new(server);
		self.servers.lock().unwrap().insert(address.parse().unwrap(), server.clone());
		server
	}

	pub fn server(&self, address: &str) -> Arc<MockServer> {
		self.servers.lock().unwrap()[&address.parse::<ServerAddress>().unwrap()].clone()
	}

	/// Number of transports opened so far.
	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}
}

impl Connector for MockConnector {
	fn connect(&self, address: &ServerAddress, _settings: &ClientSettings) -> Result<Box<dyn Transport>> {
		let server = self.servers.lock()?.get(address).cloned();
		match server {
			Some(server) if server.state().reachable => {
				self.connects.fetch_add(1, Ordering::SeqCst);
				Ok(Box::new(MockTransport { server, input: Vec::new(), output: VecDeque::new() }))
			}
			_ => Err(Error::Connectivity { address: address.clone(), reason: "connection refused".to_string() })
		}
	}
}
