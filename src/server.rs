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
		apm::{Event, Listeners, ConnectionClosedReason},
		policy::Tag,
		pool::{ConnectionPool, PooledTransport, Checkout, Connection, PoolStats},
		wire::Connector
	},
	std::{
		fmt,
		collections::{BTreeSet, HashMap},
		sync::{Arc, Mutex, Condvar, RwLock, PoisonError, atomic::{AtomicI32, Ordering}},
		time::{Duration, Instant}
	},
	bson::doc,
	serde::Deserialize,
	log::{debug, info, warn}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerState {
	Disconnected,
	Connecting,
	Connected,
	Disconnecting
}

impl Default for ServerState {
	fn default() -> Self {
		Self::Disconnected
	}
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerVersion {
	pub major:    u32,
	pub minor:    u32,
	pub build:    u32,
	pub revision: u32
}

impl ServerVersion {
	pub fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
		Self { major, minor, build, revision }
	}

	/// Parses `major.minor.build[.revision][-suffix]`. Anything else yields 0.0.0.0.
	pub fn parse(s: &str) -> Self {
		let numbers = s.splitn(2, '-').next().unwrap_or_default();
		let parts = numbers.split('.')
			.map(|part| match part.bytes().all(|b| b.is_ascii_digit()) {
				true  => part.parse::<u32>().ok(),
				false => None
			})
			.collect::<Option<Vec<_>>>();

		match parts.as_deref() {
			Some(&[major, minor, build]) => Self::new(major, minor, build, 0),
			Some(&[major, minor, build, revision]) => Self::new(major, minor, build, revision),
			_ => Self::default()
		}
	}
}

impl fmt::Display for ServerVersion {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
	}
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BuildInfo {
	pub bits:           i64,
	pub git_version:    String,
	pub sys_info:       String,
	pub version_string: String,
	pub version:        ServerVersion
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BuildInfoReply {
	bits:        i64,
	git_version: String,
	sys_info:    String,
	version:     String
}

impl From<BuildInfoReply> for BuildInfo {
	fn from(reply: BuildInfoReply) -> Self {
		Self {
			bits:           reply.bits,
			git_version:    reply.git_version,
			sys_info:       reply.sys_info,
			version:        ServerVersion::parse(&reply.version),
			version_string: reply.version
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct IsMasterReply {
	pub(crate) ismaster:             bool,
	pub(crate) secondary:            bool,
	pub(crate) passive:              bool,
	pub(crate) arbiter_only:         bool,
	pub(crate) max_bson_object_size: Option<i64>,
	pub(crate) set_name:             Option<String>,
	pub(crate) hosts:                Vec<String>,
	pub(crate) passives:             Vec<String>,
	pub(crate) tags:                 HashMap<String, String>
}

/// Result of the last successful role probe.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerDescription {
	is_primary:         bool,
	is_secondary:       bool,
	is_passive:         bool,
	is_arbiter:         bool,
	max_document_size:  usize,
	max_message_length: usize,
	set_name:           Option<String>,
	hosts:              Vec<ServerAddress>,
	tags:               BTreeSet<Tag>,
	build_info:         BuildInfo,
	ping_time:          Duration
}

impl ServerDescription {
	pub(crate) fn new(reply: IsMasterReply, build_info: BuildInfo, ping_time: Duration) -> Self {
		let max_document_size = reply.max_bson_object_size
			.filter(|size| *size > 0)
			.map_or(DEFAULT_MAX_DOCUMENT_SIZE, |size| size as usize);

		let hosts = reply.hosts.iter()
			.chain(reply.passives.iter())
			.filter_map(|host| match host.parse() {
				Ok(address) => Some(address),
				Err(e) => {
					warn!("ignoring member reported by server: {}", e);
					None
				}
			})
			.collect();

		Self {
			is_primary:         reply.ismaster,
			is_secondary:       reply.secondary,
			// a member cannot be both, arbiter wins
			is_passive:         reply.passive && !reply.arbiter_only,
			is_arbiter:         reply.arbiter_only,
			max_document_size,
			max_message_length: DEFAULT_MAX_MESSAGE_LENGTH.max(max_document_size + 1024),
			set_name:           reply.set_name,
			hosts,
			tags:               reply.tags.into_iter().map(|(k, v)| Tag::new(k, v)).collect(),
			build_info,
			ping_time
		}
	}

	pub fn is_primary(&self) -> bool {
		self.is_primary
	}

	pub fn is_secondary(&self) -> bool {
		self.is_secondary
	}

	pub fn is_passive(&self) -> bool {
		self.is_passive
	}

	pub fn is_arbiter(&self) -> bool {
		self.is_arbiter
	}

	pub fn max_document_size(&self) -> usize {
		self.max_document_size
	}

	pub fn max_message_length(&self) -> usize {
		self.max_message_length
	}

	pub fn set_name(&self) -> Option<&str> {
		self.set_name.as_deref()
	}

	/// Members (hosts and passives) this server knows about.
	pub fn hosts(&self) -> &[ServerAddress] {
		&self.hosts
	}

	pub fn tags(&self) -> &BTreeSet<Tag> {
		&self.tags
	}

	pub fn build_info(&self) -> &BuildInfo {
		&self.build_info
	}

	pub fn ping_time(&self) -> Duration {
		self.ping_time
	}
}

/// A consistent view of an instance, readable without taking its lock.
/// `description` is only present while `state` is `Connected`.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
	pub state:       ServerState,
	pub address:     ServerAddress,
	pub description: Option<Arc<ServerDescription>>,
	pub last_error:  Option<Arc<Error>>
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
	Healthy(Arc<ServerDescription>),
	Unhealthy(Arc<Error>)
}

impl ProbeOutcome {
	pub fn is_healthy(&self) -> bool {
		matches!(self, Self::Healthy(_))
	}
}

#[derive(Debug)]
struct InstanceInner {
	state:       ServerState,
	address:     ServerAddress,
	description: Option<Arc<ServerDescription>>,
	last_error:  Option<Arc<Error>>,
	pool:        ConnectionPool,
	/// Dedicated transport for health checks, outside the pool's capacity.
	monitor:     Option<PooledTransport>
}

/// One member of a deployment: its health and role state machine plus the
/// pool of connections to it.
///
/// All state transitions and pool mutations happen under a single lock per
/// instance. Events raised while holding it are dispatched after it is released.
#[derive(Debug)]
pub struct ServerInstance {
	id:          usize,
	settings:    Arc<ClientSettings>,
	connector:   Arc<dyn Connector>,
	listeners:   Arc<Listeners>,
	request_ids: Arc<AtomicI32>,
	inner:       Mutex<InstanceInner>,
	available:   Condvar,
	snapshot:    RwLock<Arc<InstanceSnapshot>>
}

impl ServerInstance {
	pub(crate) fn new(
		id:          usize,
		address:     ServerAddress,
		settings:    Arc<ClientSettings>,
		connector:   Arc<dyn Connector>,
		listeners:   Arc<Listeners>,
		request_ids: Arc<AtomicI32>
	) -> Arc<Self> {
		let snapshot = InstanceSnapshot {
			state:       ServerState::Disconnected,
			address:     address.clone(),
			description: None,
			last_error:  None
		};

		Arc::new(Self {
			id,
			inner: Mutex::new(InstanceInner {
				state:       ServerState::Disconnected,
				address,
				description: None,
				last_error:  None,
				pool:        ConnectionPool::new(settings.max_connection_pool_size()),
				monitor:     None
			}),
			available: Condvar::new(),
			snapshot:  RwLock::new(Arc::new(snapshot)),
			settings,
			connector,
			listeners,
			request_ids
		})
	}

	pub fn id(&self) -> usize {
		self.id
	}

	/// The last published state. May lag behind a probe in flight.
	pub fn snapshot(&self) -> Arc<InstanceSnapshot> {
		self.snapshot.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	pub fn state(&self) -> ServerState {
		self.snapshot().state
	}

	pub fn address(&self) -> ServerAddress {
		self.snapshot().address.clone()
	}

	pub fn description(&self) -> Option<Arc<ServerDescription>> {
		self.snapshot().description.clone()
	}

	pub fn last_error(&self) -> Option<Arc<Error>> {
		self.snapshot().last_error.clone()
	}

	pub fn is_primary(&self) -> bool {
		self.description().map_or(false, |d| d.is_primary())
	}

	pub fn is_secondary(&self) -> bool {
		self.description().map_or(false, |d| d.is_secondary())
	}

	pub fn is_passive(&self) -> bool {
		self.description().map_or(false, |d| d.is_passive())
	}

	pub fn is_arbiter(&self) -> bool {
		self.description().map_or(false, |d| d.is_arbiter())
	}

	pub fn max_message_length(&self) -> usize {
		self.description().map_or(DEFAULT_MAX_MESSAGE_LENGTH, |d| d.max_message_length())
	}

	pub fn pool_stats(&self) -> Result<PoolStats> {
		Ok(self.inner.lock()?.pool.stats())
	}

	pub(crate) fn listeners(&self) -> &Arc<Listeners> {
		&self.listeners
	}

	pub(crate) fn next_request_id(&self) -> i32 {
		self.request_ids.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
	}

	pub fn set_address(&self, address: ServerAddress) -> Result<()> {
		let mut inner = self.inner.lock()?;
		if inner.state != ServerState::Disconnected {
			return Err(Error::Invariant("the address can only change while disconnected"));
		}

		inner.address = address;
		inner.monitor = None;
		self.publish(&inner);
		Ok(())
	}

	/// Probes the server and moves to `Connected`, or to `Disconnected` with
	/// the failure recorded and returned. A server that is not primary only
	/// counts as connected if `secondary_ok` is set.
	pub fn connect(&self, secondary_ok: bool) -> Result<()> {
		let mut events = Vec::new();
		let result = self.connect_locked(secondary_ok, &mut events);
		self.listeners.dispatch_all(events);
		result
	}

	fn connect_locked(&self, secondary_ok: bool, events: &mut Vec<Event>) -> Result<()> {
		let mut inner = self.inner.lock()?;
		match inner.state {
			ServerState::Disconnected | ServerState::Connected => (),
			_ => return Err(Error::Invariant("connect requires a disconnected or connected instance"))
		}

		self.transition(&mut inner, ServerState::Connecting, events);

		let error = match self.probe(&mut inner) {
			Ok(description) if description.is_primary || secondary_ok => {
				info!("connected to {} (primary: {}, secondary: {})",
					inner.address, description.is_primary, description.is_secondary);
				inner.description = Some(Arc::new(description));
				inner.last_error = None;
				self.transition(&mut inner, ServerState::Connected, events);
				return Ok(());
			}
			Ok(_) => Error::Probe {
				address: inner.address.clone(),
				reason:  "server is not a primary and secondaryOk is not set".to_string()
			},
			Err(e) => e
		};

		debug!("connect to {} failed: {}", inner.address, error);
		let error = Arc::new(error);
		inner.description = None;
		inner.last_error = Some(error.clone());
		self.transition(&mut inner, ServerState::Disconnected, events);
		self.clear_locked(&mut inner, events);
		Err(Error::Shared(error))
	}

	/// Health check for periodic callers. Never fails, the outcome is
	/// reflected in the instance state and returned.
	pub fn verify_state(&self) -> ProbeOutcome {
		let mut events = Vec::new();
		let outcome = match self.inner.lock() {
			Ok(mut inner) => self.verify_locked(&mut inner, &mut events),
			Err(_) => ProbeOutcome::Unhealthy(Arc::new(Error::Poisoned))
		};

		self.listeners.dispatch_all(events);
		outcome
	}

	fn verify_locked(&self, inner: &mut InstanceInner, events: &mut Vec<Event>) -> ProbeOutcome {
		let initial = inner.state;

		if let Err(e) = self.ping(inner) {
			warn!("liveness check of {} failed: {}", inner.address, e);
			self.clear_locked(inner, events);
			inner.last_error = Some(Arc::new(e));
		}

		match self.probe(inner) {
			Ok(description) => {
				let description = Arc::new(description);
				inner.description = Some(description.clone());
				inner.last_error = None;
				self.transition(inner, ServerState::Connected, events);
				ProbeOutcome::Healthy(description)
			}
			Err(e) => {
				debug!("role probe of {} failed: {}", inner.address, e);
				let error = Arc::new(e);
				inner.description = None;
				inner.last_error = Some(error.clone());
				self.transition(inner, ServerState::Disconnected, events);
				if initial != ServerState::Disconnected {
					self.clear_locked(inner, events);
				}
				ProbeOutcome::Unhealthy(error)
			}
		}
	}

	/// Moves through `Disconnecting` to `Disconnected`, closing the pool.
	pub fn disconnect(&self) -> Result<()> {
		if self.state() == ServerState::Disconnecting {
			return Err(Error::Invariant("disconnect called while already disconnecting"));
		}

		let mut events = Vec::new();
		{
			let mut inner = self.inner.lock()?;
			match inner.state {
				ServerState::Disconnected => return Ok(()),
				ServerState::Disconnecting => return Err(Error::Invariant("disconnect called while already disconnecting")),
				_ => ()
			}

			self.transition(&mut inner, ServerState::Disconnecting, &mut events);
			self.clear_locked(&mut inner, &mut events);
			inner.description = None;
			self.transition(&mut inner, ServerState::Disconnected, &mut events);
		}

		self.listeners.dispatch_all(events);
		Ok(())
	}

	/// Closes idle connections; checked out ones are closed when released.
	pub fn clear_pool(&self) -> Result<()> {
		let mut events = Vec::new();
		self.clear_locked(&mut *self.inner.lock()?, &mut events);
		self.listeners.dispatch_all(events);
		Ok(())
	}

	/// Checks out a connection, authenticated for `database` if credentials
	/// apply. Blocks while the pool is exhausted, up to the wait queue timeout.
	pub fn acquire_connection(self: &Arc<Self>, database: &str) -> Result<Connection> {
		let transport = self.checkout()?;
		let mut connection = Connection::new(self.clone(), transport);

		if let Some((auth_database, credentials)) = self.settings.credentials_for(database) {
			if !connection.is_authenticated(auth_database) {
				// the connection goes back to the pool on drop, also on failure
				crate::auth::authenticate(&mut connection, auth_database, credentials)?;
				connection.set_authenticated(auth_database);
			}
		}

		Ok(connection)
	}

	fn checkout(&self) -> Result<PooledTransport> {
		let deadline = Instant::now() + self.settings.wait_queue_timeout();
		let mut events = Vec::new();

		let transport = {
			let mut inner = self.inner.lock()?;
			loop {
				if inner.state != ServerState::Connected {
					return Err(Error::NotConnected { address: inner.address.clone(), state: inner.state });
				}

				match inner.pool.checkout() {
					Checkout::Idle(transport) => break transport,
					Checkout::Reserved { id, generation } => {
						let address = inner.address.clone();
						drop(inner);

						match self.connector.connect(&address, &self.settings) {
							Ok(transport) => {
								events.push(Event::ConnectionCreated { address, connection_id: id });
								break PooledTransport::new(id, generation, transport);
							}
							Err(e) => {
								let mut inner = self.inner.lock()?;
								inner.pool.cancel_reservation();
								self.available.notify_one();
								return Err(e);
							}
						}
					}
					Checkout::Exhausted => {
						let now = Instant::now();
						if now >= deadline {
							return Err(Error::PoolTimeout(inner.address.clone()));
						}

						inner = self.available.wait_timeout(inner, deadline - now)?.0;
					}
				}
			}
		};

		events.push(Event::ConnectionCheckedOut { address: self.address(), connection_id: transport.id });
		self.listeners.dispatch_all(events);
		Ok(transport)
	}

	pub(crate) fn release(&self, transport: PooledTransport, reusable: bool) {
		let connection_id = transport.id;
		let event = match self.inner.lock() {
			Ok(mut inner) => {
				let address = inner.address.clone();
				let event = match inner.pool.check_in(transport, reusable) {
					Ok(()) => Event::ConnectionCheckedIn { address, connection_id },
					Err(reason) => Event::ConnectionClosed { address, connection_id, reason }
				};
				self.available.notify_one();
				event
			}
			Err(_) => return
		};

		self.listeners.dispatch(&event);
	}

	fn ping(&self, inner: &mut InstanceInner) -> Result<()> {
		let max_message_length = self.locked_max_message_length(inner);
		let result = self.monitor_transport(inner)
			.and_then(|t| t.command(self.next_request_id(), ADMIN_DATABASE, doc! { "ping": 1 }, max_message_length));

		if result.is_err() {
			inner.monitor = None;
		}

		result.map(drop)
	}

	/// Role probe followed by build info.
	fn probe(&self, inner: &mut InstanceInner) -> Result<ServerDescription> {
		let result = self.probe_unchecked(inner);
		if result.is_err() {
			inner.monitor = None;
		}
		result
	}

	fn probe_unchecked(&self, inner: &mut InstanceInner) -> Result<ServerDescription> {
		let max_message_length = self.locked_max_message_length(inner);
		let address = inner.address.clone();
		let transport = self.monitor_transport(inner)?;

		let start = Instant::now();
		let reply = transport.command(self.next_request_id(), ADMIN_DATABASE, doc! { "ismaster": 1 }, max_message_length)?;
		let ping_time = start.elapsed();
		let reply = bson::from_document::<IsMasterReply>(reply)?;

		let build_info = transport.command(self.next_request_id(), ADMIN_DATABASE, doc! { "buildinfo": 1 }, max_message_length)?;
		let build_info = BuildInfo::from(bson::from_document::<BuildInfoReply>(build_info)?);

		if let Some(expected) = self.settings.replica_set_name() {
			if reply.set_name.as_deref() != Some(expected) {
				return Err(Error::Probe {
					address,
					reason: format!("expected replica set `{}`, server reports {:?}", expected, reply.set_name)
				});
			}
		}

		Ok(ServerDescription::new(reply, build_info, ping_time))
	}

	fn monitor_transport<'a>(&self, inner: &'a mut InstanceInner) -> Result<&'a mut PooledTransport> {
		if inner.monitor.is_none() {
			let transport = self.connector.connect(&inner.address, &self.settings)?;
			inner.monitor = Some(PooledTransport::new(inner.pool.next_id(), inner.pool.generation(), transport));
		}

		inner.monitor.as_mut().ok_or(Error::Invariant("monitor transport is missing"))
	}

	fn locked_max_message_length(&self, inner: &InstanceInner) -> usize {
		inner.description.as_ref().map_or(DEFAULT_MAX_MESSAGE_LENGTH, |d| d.max_message_length)
	}

	fn clear_locked(&self, inner: &mut InstanceInner, events: &mut Vec<Event>) {
		inner.monitor = None;
		for connection_id in inner.pool.clear() {
			events.push(Event::ConnectionClosed {
				address: inner.address.clone(),
				connection_id,
				reason:  ConnectionClosedReason::PoolCleared
			});
		}

		events.push(Event::PoolCleared { address: inner.address.clone(), generation: inner.pool.generation() });
		self.available.notify_all();
	}

	fn transition(&self, inner: &mut InstanceInner, state: ServerState, events: &mut Vec<Event>) {
		let old = inner.state;
		inner.state = state;
		if state != ServerState::Connected {
			inner.description = None;
		}

		self.publish(inner);

		if old != state {
			debug!("server instance {} ({}) {:?} -> {:?}", self.id, inner.address, old, state);
			events.push(Event::ServerStateChanged {
				instance: self.id,
				address:  inner.address.clone(),
				old,
				new:      state
			});
		}
	}

	fn publish(&self, inner: &InstanceInner) {
		let snapshot = Arc::new(InstanceSnapshot {
			state:       inner.state,
			address:     inner.address.clone(),
			description: match inner.state {
				ServerState::Connected => inner.description.clone(),
				_ => None
			},
			last_error:  inner.last_error.clone()
		});

		*self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
	}
}
