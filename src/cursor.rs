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
		policy::ReadSelectionPolicy,
		server::ServerInstance,
		topology::ClusterView,
		wire::{Request, Reply, QueryFlags, ReplyFlags}
	},
	std::{collections::VecDeque, sync::Arc},
	bson::{doc, Document},
	log::{debug, warn}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CursorState {
	NotStarted,
	/// A batch is being consumed.
	Started,
	/// The batch is consumed, the server side cursor is still open.
	AwaitingMore,
	Done
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
	pub skip:              i32,
	/// Negative values ask for a single batch of at most `-limit` documents.
	pub limit:             i32,
	pub batch_size:        i32,
	pub projection:        Option<Document>,
	/// Merged into the query as `{ "$query": <query>, ..modifiers }`.
	pub modifiers:         Option<Document>,
	pub tailable:          bool,
	pub await_data:        bool,
	pub no_cursor_timeout: bool
}

/// `numberToReturn` of the initial query.
pub fn first_number_to_return(limit: i32, batch_size: i32) -> i32 {
	match (limit, batch_size) {
		(limit, _) if limit < 0 => limit,
		(0, batch_size) => batch_size,
		(limit, 0) => limit,
		(limit, batch_size) if limit < batch_size => limit,
		(_, batch_size) => batch_size
	}
}

/// `numberToReturn` of a get-more, `positive_limit` being 0 for unbounded cursors.
pub fn get_more_number_to_return(positive_limit: i32, count: i32, batch_size: i32) -> i32 {
	if positive_limit == 0 {
		return batch_size;
	}

	let remaining = positive_limit - count;
	match batch_size {
		batch_size if batch_size != 0 && batch_size < remaining => batch_size,
		_ => remaining
	}
}

/// Streams the result of one query, batch by batch, from a single member.
///
/// The member answering the initial query is pinned: get-more and
/// kill-cursors requests go to it and nowhere else. Dropping the session
/// kills a still open server side cursor.
#[derive(Debug)]
pub struct CursorSession {
	cluster:        Arc<ClusterView>,
	namespace:      String,
	query:          Document,
	options:        FindOptions,
	read_policy:    Arc<ReadSelectionPolicy>,
	state:          CursorState,
	instance:       Option<Arc<ServerInstance>>,
	cursor_id:      i64,
	batch:          VecDeque<Document>,
	current:        Option<Document>,
	count:          i32,
	positive_limit: i32,
	dead:           bool,
	await_capable:  bool,
	disposed:       bool
}

impl CursorSession {
	pub fn new(
		cluster:     Arc<ClusterView>,
		namespace:   impl Into<String>,
		query:       Document,
		options:     FindOptions,
		read_policy: Arc<ReadSelectionPolicy>
	) -> Self {
		Self {
			cluster,
			namespace:      namespace.into(),
			query,
			positive_limit: options.limit.saturating_abs(),
			options,
			read_policy,
			state:          CursorState::NotStarted,
			instance:       None,
			cursor_id:      0,
			batch:          VecDeque::new(),
			current:        None,
			count:          0,
			dead:           false,
			await_capable:  false,
			disposed:       false
		}
	}

	pub fn state(&self) -> CursorState {
		self.state
	}

	/// The open server side cursor, 0 if there is none.
	pub fn cursor_id(&self) -> i64 {
		self.cursor_id
	}

	/// The member this cursor is pinned to, once the initial query was sent.
	pub fn instance(&self) -> Option<&Arc<ServerInstance>> {
		self.instance.as_ref()
	}

	/// Whether the server closed the cursor with its last reply.
	pub fn is_dead(&self) -> bool {
		self.dead
	}

	pub fn is_await_capable(&self) -> bool {
		self.await_capable
	}

	pub fn current(&self) -> Option<&Document> {
		self.current.as_ref()
	}

	/// Number of documents yielded so far.
	pub fn yielded(&self) -> i32 {
		self.count
	}

	/// Advances to the next document, fetching a batch if needed. Returns
	/// false when no document is available. For tailable cursors in
	/// `AwaitingMore` this is not final: a later call may yield more.
	pub fn move_next(&mut self) -> Result<bool> {
		if self.disposed {
			return Err(Error::Invariant("cursor session was disposed"));
		}

		self.current = None;

		if self.positive_limit != 0 && self.count >= self.positive_limit {
			self.kill_cursor();
			self.state = CursorState::Done;
			return Ok(false);
		}

		if self.batch.is_empty() {
			let result = match self.state {
				CursorState::NotStarted => self.first_batch(),
				CursorState::Started | CursorState::AwaitingMore if self.cursor_id != 0 => self.get_more(),
				CursorState::Started | CursorState::AwaitingMore => {
					self.state = CursorState::Done;
					Ok(())
				}
				CursorState::Done => Ok(())
			};

			if let Err(e) = result {
				self.batch.clear();
				self.state = CursorState::Done;
				return Err(e);
			}
		}

		match self.batch.pop_front() {
			Some(doc) => {
				self.count += 1;
				self.current = Some(doc);
				if self.batch.is_empty() && self.cursor_id != 0 {
					self.state = CursorState::AwaitingMore;
				}
				Ok(true)
			}
			None => Ok(false)
		}
	}

	/// Kills the server side cursor if it is still open. Teardown is best
	/// effort, the session is disposed afterwards regardless.
	pub fn dispose(&mut self) {
		if self.disposed { return; }

		self.kill_cursor();
		self.batch.clear();
		self.current = None;
		self.state = CursorState::Done;
		self.disposed = true;
	}

	fn database(&self) -> Result<&str> {
		match self.namespace.find('.') {
			Some(i) if i > 0 && i + 1 < self.namespace.len() => Ok(&self.namespace[..i]),
			_ => Err(Error::Invariant("namespace must be `<database>.<collection>`"))
		}
	}

	fn wire_query(&self) -> Document {
		match &self.options.modifiers {
			None => self.query.clone(),
			Some(modifiers) => {
				let mut wrapped = doc! { "$query": self.query.clone() };
				for (key, value) in modifiers {
					wrapped.insert(key.clone(), value.clone());
				}
				wrapped
			}
		}
	}

	fn query_flags(&self, instance: &ServerInstance) -> QueryFlags {
		let mut flags = QueryFlags::empty();
		flags.set(QueryFlags::SLAVE_OK, self.read_policy.is_secondary_ok() || !instance.is_primary());
		flags.set(QueryFlags::TAILABLE_CURSOR, self.options.tailable);
		flags.set(QueryFlags::AWAIT_DATA, self.options.await_data);
		flags.set(QueryFlags::NO_CURSOR_TIMEOUT, self.options.no_cursor_timeout);
		flags
	}

	fn first_batch(&mut self) -> Result<()> {
		let instance = self.cluster.choose(&self.read_policy)?;
		let mut connection = self.cluster.acquire_connection_on(&instance, self.database()?)?;
		self.instance = Some(instance.clone());

		let reply = connection.query(&Request::Query {
			namespace:             self.namespace.clone(),
			flags:                 self.query_flags(&instance),
			number_to_skip:        self.options.skip,
			number_to_return:      first_number_to_return(self.options.limit, self.options.batch_size),
			query:                 self.wire_query(),
			return_field_selector: self.options.projection.clone()
		})?;

		drop(connection);
		self.absorb(reply, true)
	}

	fn get_more(&mut self) -> Result<()> {
		let instance = self.instance.clone().ok_or(Error::Invariant("cursor is not pinned to an instance"))?;
		let mut connection = self.cluster.acquire_connection_on(&instance, self.database()?)?;

		let reply = connection.query(&Request::GetMore {
			namespace:        self.namespace.clone(),
			number_to_return: get_more_number_to_return(self.positive_limit, self.count, self.options.batch_size),
			cursor_id:        self.cursor_id
		})?;

		drop(connection);
		self.absorb(reply, false)
	}

	fn absorb(&mut self, reply: Reply, first: bool) -> Result<()> {
		if reply.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
			let cursor_id = std::mem::replace(&mut self.cursor_id, 0);
			self.dead = true;
			return Err(Error::CursorNotFound(cursor_id));
		}

		self.cursor_id = reply.cursor_id;
		self.dead = reply.cursor_id == 0;
		self.await_capable = reply.flags.contains(ReplyFlags::AWAIT_CAPABLE);
		self.batch.extend(reply.documents);

		if !self.batch.is_empty() {
			self.state = CursorState::Started;
		} else if !first && self.options.tailable && self.cursor_id != 0 {
			// a tailable cursor that ran dry may still receive documents
			self.state = CursorState::AwaitingMore;
		} else {
			self.kill_cursor();
			self.state = CursorState::Done;
		}

		Ok(())
	}

	fn kill_cursor(&mut self) {
		let cursor_id = std::mem::replace(&mut self.cursor_id, 0);
		if cursor_id == 0 { return; }

		let instance = match &self.instance {
			Some(instance) => instance.clone(),
			None => return
		};

		let result = self.database()
			.and_then(|database| self.cluster.acquire_connection_on(&instance, database))
			.and_then(|mut connection| connection.round_trip(&Request::KillCursors { cursor_ids: vec![cursor_id] }));

		match result {
			Ok(_) => debug!("killed cursor {} on {}", cursor_id, instance.address()),
			Err(e) => warn!("failed to kill cursor {} on {}: {}", cursor_id, instance.address(), e)
		}
	}
}

impl Iterator for CursorSession {
	type Item = Result<Document>;

	fn next(&mut self) -> Option<Self::Item> {
		match self.move_next() {
			Ok(true)  => self.current.clone().map(Ok),
			Ok(false) => None,
			Err(e)    => Some(Err(e))
		}
	}
}

impl Drop for CursorSession {
	fn drop(&mut self) {
		self.dispose();
	}
}
