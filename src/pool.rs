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

use {
	crate::{
		common::*,
		apm::{Event, ConnectionClosedReason},
		server::ServerInstance,
		wire::{Request, Reply, Transport, Wire, QueryFlags, InvalidReplyError, check_command_reply}
	},
	std::{collections::{HashSet, VecDeque}, sync::Arc, time::Instant},
	bson::Document,
	log::debug
};

/// A transport owned by a pool together with the databases it is logged into.
#[derive(Debug)]
pub(crate) struct PooledTransport {
	pub(crate) id:            usize,
	pub(crate) generation:    usize,
	pub(crate) authenticated: HashSet<String>,
	transport:                Box<dyn Transport>
}

impl PooledTransport {
	pub(crate) fn new(id: usize, generation: usize, transport: Box<dyn Transport>) -> Self {
		Self { id, generation, authenticated: HashSet::new(), transport }
	}

	/// Sends `request` and waits for the reply if the server answers it.
	pub(crate) fn round_trip(
		&mut self,
		request_id:         i32,
		request:            &Request,
		max_message_length: usize
	) -> Result<Option<Reply>> {
		self.transport.send_request(request_id, request, max_message_length)?;
		if !request.expects_reply() {
			return Ok(None);
		}

		let reply = self.transport.recv_reply(request_id, max_message_length)?;
		match reply.query_failure() {
			Some(failure) => Err(Error::QueryFailure(failure)),
			None => Ok(Some(reply))
		}
	}

	pub(crate) fn command(
		&mut self,
		request_id:         i32,
		database:           &str,
		command:            Document,
		max_message_length: usize
	) -> Result<Document> {
		let reply = self.round_trip(request_id, &command_request(database, command), max_message_length)?
			.ok_or(InvalidReplyError::Empty)?;
		let doc = reply.documents.into_iter()
			.next()
			.ok_or(InvalidReplyError::Empty)?;
		check_command_reply(&doc)?;
		Ok(doc)
	}
}

/// Commands are single-document queries against `<db>.$cmd`.
pub(crate) fn command_request(database: &str, command: Document) -> Request {
	Request::Query {
		namespace:             format!("{}.$cmd", database),
		flags:                 QueryFlags::SLAVE_OK,
		number_to_skip:        0,
		number_to_return:      -1,
		query:                 command,
		return_field_selector: None
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct PoolStats {
	pub max_size:   usize,
	/// Idle plus checked out plus being opened.
	pub open:       usize,
	pub idle:       usize,
	pub in_use:     usize,
	pub generation: usize
}

#[derive(Debug)]
pub(crate) enum Checkout {
	Idle(PooledTransport),
	/// A slot was reserved, the caller opens the transport.
	Reserved { id: usize, generation: usize },
	Exhausted
}

/// Bounded set of transports to one server.
///
/// Not synchronized on its own: it lives inside the owning instance's lock,
/// which serializes acquire, release and clear.
#[derive(Debug)]
pub struct ConnectionPool {
	max_size:   usize,
	idle:       VecDeque<PooledTransport>,
	open:       usize,
	generation: usize,
	next_id:    usize
}

impl ConnectionPool {
	pub(crate) fn new(max_size: usize) -> Self {
		Self {
			max_size,
			idle:       VecDeque::new(),
			open:       0,
			generation: 0,
			next_id:    0
		}
	}

	pub(crate) fn next_id(&mut self) -> usize {
		self.next_id += 1;
		self.next_id
	}

	pub(crate) fn generation(&self) -> usize {
		self.generation
	}

	pub(crate) fn checkout(&mut self) -> Checkout {
		if let Some(transport) = self.idle.pop_back() {
			return Checkout::Idle(transport);
		}

		if self.open < self.max_size {
			self.open += 1;
			return Checkout::Reserved { id: self.next_id(), generation: self.generation };
		}

		Checkout::Exhausted
	}

	/// Gives back a slot whose transport could not be opened.
	pub(crate) fn cancel_reservation(&mut self) {
		self.open = self.open.saturating_sub(1);
	}

	/// Returns the transport to the idle set, or drops it and says why.
	pub(crate) fn check_in(
		&mut self,
		transport: PooledTransport,
		reusable:  bool
	) -> std::result::Result<(), ConnectionClosedReason> {
		let reason = match (reusable, transport.generation == self.generation) {
			(true, true) => {
				self.idle.push_back(transport);
				return Ok(());
			}
			(false, _)    => ConnectionClosedReason::Error,
			(true, false) => ConnectionClosedReason::Stale
		};

		self.open = self.open.saturating_sub(1);
		Err(reason)
	}

	/// Closes all idle transports and marks checked out ones as stale.
	/// Returns the ids of the closed transports.
	pub(crate) fn clear(&mut self) -> Vec<usize> {
		self.generation += 1;
		self.open = self.open.saturating_sub(self.idle.len());
		self.idle.drain(..).map(|t| t.id).collect()
	}

	pub fn stats(&self) -> PoolStats {
		PoolStats {
			max_size:   self.max_size,
			open:       self.open,
			idle:       self.idle.len(),
			in_use:     self.open - self.idle.len(),
			generation: self.generation
		}
	}
}

/// A checked out connection, exclusively owned until dropped.
/// Dropping it hands the transport back to the instance's pool.
#[derive(Debug)]
pub struct Connection {
	instance:  Arc<ServerInstance>,
	inner:     Option<PooledTransport>,
	has_error: bool
}

impl Connection {
	pub(crate) fn new(instance: Arc<ServerInstance>, inner: PooledTransport) -> Self {
		Self { instance, inner: Some(inner), has_error: false }
	}

	pub fn id(&self) -> usize {
		self.inner.as_ref().map_or(0, |t| t.id)
	}

	pub fn instance(&self) -> &Arc<ServerInstance> {
		&self.instance
	}

	pub fn is_authenticated(&self, database: &str) -> bool {
		self.inner.as_ref().map_or(false, |t| t.authenticated.contains(database))
	}

	pub(crate) fn set_authenticated(&mut self, database: &str) {
		if let Some(t) = self.inner.as_mut() {
			t.authenticated.insert(database.to_string());
		}
	}

	/// Sends `request`, returning the reply if the server answers it.
	pub fn round_trip(&mut self, request: &Request) -> Result<Option<Reply>> {
		let request_id = self.instance.next_request_id();
		let address = self.instance.address();
		let command_name = request.command_name();
		let connection_id = self.id();
		let max_message_length = self.instance.max_message_length();
		let listeners = self.instance.listeners().clone();

		listeners.dispatch(&Event::CommandStarted {
			address:       address.clone(),
			command_name:  command_name.clone(),
			request_id,
			connection_id
		});

		let start = Instant::now();
		let result = match self.inner.as_mut() {
			Some(transport) => transport.round_trip(request_id, request, max_message_length),
			None => Err(Error::Invariant("connection was already released"))
		};

		match &result {
			Ok(_) => listeners.dispatch(&Event::CommandSucceeded {
				address,
				command_name,
				request_id,
				connection_id,
				duration: start.elapsed()
			}),
			Err(e) => {
				if e.is_transport_error() {
					debug!("connection {} to {} failed: {}", connection_id, address, e);
					self.has_error = true;
				}

				listeners.dispatch(&Event::CommandFailed {
					address,
					command_name,
					request_id,
					connection_id,
					duration: start.elapsed(),
					failure:  e.to_string()
				});
			}
		}

		result
	}

	/// Like `round_trip`, for requests that are always answered.
	pub fn query(&mut self, request: &Request) -> Result<Reply> {
		Ok(self.round_trip(request)?.ok_or(InvalidReplyError::Empty)?)
	}

	pub fn run_command(&mut self, database: &str, command: Document) -> Result<Document> {
		let doc = self.query(&command_request(database, command))?
			.documents
			.into_iter()
			.next()
			.ok_or(InvalidReplyError::Empty)?;
		check_command_reply(&doc)?;
		Ok(doc)
	}

	pub fn release(self) {}
}

impl Drop for Connection {
	fn drop(&mut self) {
		if let Some(transport) = self.inner.take() {
			self.instance.release(transport, !self.has_error);
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::io};

	fn transport(pool: &mut ConnectionPool) -> PooledTransport {
		match pool.checkout() {
			Checkout::Reserved { id, generation } => PooledTransport::new(id, generation, Box::new(io::Cursor::new(Vec::new()))),
			Checkout::Idle(t) => t,
			Checkout::Exhausted => panic!("pool exhausted")
		}
	}

	#[test]
	fn bounded_checkout() {
		let mut pool = ConnectionPool::new(2);
		let a = transport(&mut pool);
		let b = transport(&mut pool);
		assert!(matches!(pool.checkout(), Checkout::Exhausted));
		assert_ne!(a.id, b.id);

		pool.check_in(a, true).unwrap();
		assert_eq!(pool.stats(), PoolStats { max_size: 2, open: 2, idle: 1, in_use: 1, generation: 0 });
		assert!(matches!(pool.checkout(), Checkout::Idle(_)));
		drop(b);
	}

	#[test]
	fn clear_discards_idle_and_stale() {
		let mut pool = ConnectionPool::new(4);
		let a = transport(&mut pool);
		let b = transport(&mut pool);
		let c = transport(&mut pool);
		let a_id = a.id;
		pool.check_in(a, true).unwrap();

		assert_eq!(pool.clear(), vec![a_id]);
		assert_eq!(pool.check_in(b, true), Err(ConnectionClosedReason::Stale));
		assert_eq!(pool.stats().open, 1);

		let d = transport(&mut pool);
		assert_eq!(d.generation, 1);
		pool.check_in(d, true).unwrap();
		assert_eq!(pool.check_in(c, false), Err(ConnectionClosedReason::Error));
		assert_eq!(pool.stats(), PoolStats { max_size: 4, open: 1, idle: 1, in_use: 0, generation: 1 });
	}

	#[test]
	fn cancelled_reservation_frees_slot() {
		let mut pool = ConnectionPool::new(1);
		assert!(matches!(pool.checkout(), Checkout::Reserved { .. }));
		assert!(matches!(pool.checkout(), Checkout::Exhausted));
		pool.cancel_reservation();
		assert!(matches!(pool.checkout(), Checkout::Reserved { .. }));
	}
}
