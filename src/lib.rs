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

#![warn(clippy::all)]
#![forbid(unsafe_code)]

//! Replication-aware connectivity core for MongoDB.
//!
//! Monitors the members of a deployment, pools connections to each of them,
//! selects a member per read policy and drives the legacy cursor protocol.

use {
	self::{wire::{Connector, TcpConnector, Request}, topology::Monitor, apm::ListenerError},
	std::{ops::Deref, sync::Arc},
	bson::{Bson, Document},
	log::info
};

pub use self::{
	common::*,
	policy::*,
	cursor::{CursorSession, CursorState, FindOptions},
	server::{ServerInstance, ServerState, ServerDescription, ServerVersion, BuildInfo, InstanceSnapshot, ProbeOutcome},
	topology::{ClusterView, InstanceIds},
	pool::{Connection, PoolStats},
	apm::{Event, ConnectionClosedReason}
};

pub mod apm;
pub mod common;
pub mod cursor;
pub mod latency;
pub mod policy;
pub mod pool;
pub mod server;
pub mod topology;
pub mod wire;
mod auth;
#[cfg(test)]
mod mock;

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

#[derive(Debug)]
pub struct ClientInner {
	pub settings: Arc<ClientSettings>,
	cluster:      Arc<ClusterView>
}

impl Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Client {
	pub fn new(settings: ClientSettings) -> Self {
		Self::with_connector(settings, Arc::new(TcpConnector))
	}

	/// Parses a `mongodb://` connection string.
	pub fn parse(uri: &str) -> Result<Self> {
		Ok(Self::new(uri.parse()?))
	}

	pub fn with_connector(settings: ClientSettings, connector: Arc<dyn Connector>) -> Self {
		let settings = Arc::new(settings);
		let cluster = ClusterView::new(settings.clone(), connector, Arc::new(apm::Listeners::new()));
		Self(Arc::new(ClientInner { settings, cluster: Arc::new(cluster) }))
	}

	pub fn cluster(&self) -> &Arc<ClusterView> {
		&self.cluster
	}

	pub fn connect(&self) -> Result<()> {
		self.cluster.connect()?;
		info!("connected to {} of {} members",
			self.cluster.instances().iter().filter(|i| i.state() == ServerState::Connected).count(),
			self.cluster.instances().len());
		Ok(())
	}

	/// A not yet started cursor over `namespace`, reading per the configured policy.
	pub fn find(&self, namespace: &str, query: Document, options: FindOptions) -> CursorSession {
		self.find_with(namespace, query, options, self.settings.read_policy().clone())
	}

	pub fn find_with(
		&self,
		namespace:   &str,
		query:       Document,
		options:     FindOptions,
		read_policy: Arc<ReadSelectionPolicy>
	) -> CursorSession {
		CursorSession::new(self.cluster.clone(), namespace, query, options, read_policy)
	}

	/// Runs `command` against `database` on the primary.
	pub fn run_command(&self, database: &str, command: Document) -> Result<Document> {
		self.cluster.acquire_connection(database, &ReadSelectionPolicy::primary())?
			.run_command(database, command)
	}

	/// Inserts `documents` on the primary. With acknowledgement enabled the
	/// getlasterror reply is returned, a reported `err` fails the insert.
	pub fn insert(&self, namespace: &str, documents: Vec<Document>) -> Result<Option<Document>> {
		let database = match namespace.find('.') {
			Some(i) if i > 0 && i + 1 < namespace.len() => &namespace[..i],
			_ => return Err(Error::Invariant("namespace must be `<database>.<collection>`"))
		};

		let mut connection = self.cluster.acquire_connection(database, &ReadSelectionPolicy::primary())?;
		connection.round_trip(&Request::Insert {
			namespace:         namespace.to_string(),
			continue_on_error: false,
			documents
		})?;

		let command = match self.settings.write_acknowledgement().last_error_command() {
			Some(command) => command,
			None => return Ok(None)
		};

		let reply = connection.run_command(database, command)?;
		match reply.get("err") {
			Some(Bson::String(err)) => Err(Error::Command {
				code:    reply.get_i32("code").unwrap_or(0),
				message: err.clone()
			}),
			_ => Ok(Some(reply))
		}
	}

	/// Registers an observer for state, pool and command events. A failing
	/// or panicking listener is logged and skipped.
	pub fn add_event_listener(
		&self,
		listener: impl Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static
	) -> Result<()> {
		self.cluster.listeners().add(Box::new(listener))
	}

	pub fn start_monitor(&self) -> Result<Monitor> {
		self.cluster.start_monitor()
	}

	pub fn disconnect(&self) -> Result<()> {
		self.cluster.disconnect()
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::mock::{MockConnector, MockServer},
		bson::doc,
		std::sync::{Mutex, atomic::{AtomicUsize, Ordering}}
	};

	fn client(settings: ClientSettingsBuilder) -> (Arc<MockServer>, Client) {
		let connector = MockConnector::new();
		let server = connector.add("db1:27017", MockServer::primary());
		let client = Client::with_connector(settings.server(ServerAddress::new("db1", 27017)).build().unwrap(), connector);
		client.connect().unwrap();
		(server, client)
	}

	#[test]
	fn find_and_run_command() {
		let (server, client) = client(ClientSettings::builder());
		server.state().batches.extend(vec![vec![doc! { "x": 1 }], vec![doc! { "x": 2 }]]);

		let xs = client.find("test.coll", Document::new(), FindOptions::default())
			.map(|doc| doc.unwrap().get_i32("x").unwrap())
			.collect::<Vec<_>>();
		assert_eq!(xs, vec![1, 2]);

		assert!(client.run_command("admin", doc! { "ping": 1 }).is_ok());
		assert!(matches!(client.run_command("admin", doc! { "frobnicate": 1 }), Err(Error::Command { code: 59, .. })));
	}

	#[test]
	fn acknowledged_insert() {
		let (server, client) = client(ClientSettings::builder()
			.write_acknowledgement(WriteAcknowledgement::enabled()));

		let reply = client.insert("test.coll", vec![doc! { "_id": 1 }]).unwrap().unwrap();
		assert_eq!(reply.get("err"), Some(&Bson::Null));
		assert_eq!(server.state().inserted.len(), 1);
		assert_eq!(server.commands("getlasterror"), 1);

		server.state().last_error = Some("E11000 duplicate key error".to_string());
		match client.insert("test.coll", vec![doc! { "_id": 1 }]) {
			Err(Error::Command { message, .. }) => assert!(message.starts_with("E11000")),
			other => panic!("unexpected result {:?}", other)
		}
	}

	#[test]
	fn unacknowledged_insert() {
		let (server, client) = client(ClientSettings::builder()
			.write_acknowledgement(WriteAcknowledgement::disabled()));

		assert_eq!(client.insert("test.coll", vec![doc! { "a": 1 }, doc! { "a": 2 }]).unwrap(), None);
		assert_eq!(server.state().inserted.len(), 2);
		assert_eq!(server.commands("getlasterror"), 0);
		assert!(client.insert("coll", Vec::new()).is_err());
	}

	#[test]
	fn listeners_observe_commands() {
		let (_server, client) = client(ClientSettings::builder());
		let started = Arc::new(AtomicUsize::new(0));
		let names = Arc::new(Mutex::new(Vec::new()));
		let (started_, names_) = (started.clone(), names.clone());

		client.add_event_listener(move |event| {
			match event {
				Event::CommandStarted { .. } => { started_.fetch_add(1, Ordering::SeqCst); }
				Event::CommandSucceeded { command_name, .. } => names_.lock().unwrap().push(command_name.clone()),
				_ => ()
			}
			Ok(())
		}).unwrap();

		client.run_command("test", doc! { "ping": 1 }).unwrap();
		assert_eq!(started.load(Ordering::SeqCst), 1);
		assert_eq!(*names.lock().unwrap(), vec!["ping".to_string()]);
	}

	#[test]
	fn disconnect_stops_operations() {
		let (_server, client) = client(ClientSettings::builder());
		client.disconnect().unwrap();
		assert!(client.run_command("admin", doc! { "ping": 1 }).is_err());
		client.connect().unwrap();
		assert!(client.run_command("admin", doc! { "ping": 1 }).is_ok());
	}

	#[test]
	fn parse_connection_string() {
		let client = Client::parse("mongodb://db1,db2:27018/?replicaSet=rs0&slaveOk=true").unwrap();
		assert_eq!(client.settings.servers().len(), 2);
		assert_eq!(client.cluster().instances().len(), 2);
		assert!(client.settings.read_policy().is_secondary_ok());
		assert!(Client::parse("mongodb://db1/?bogus=1").is_err());
	}
}
