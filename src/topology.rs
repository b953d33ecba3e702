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
		apm::Listeners,
		latency::LatencyBuckets,
		policy::ReadSelectionPolicy,
		pool::Connection,
		server::{ServerInstance, ServerState, ProbeOutcome},
		wire::Connector
	},
	std::{
		collections::HashSet,
		sync::{Arc, Weak, Mutex, Condvar, RwLock, PoisonError, atomic::{AtomicUsize, AtomicI32, Ordering}},
		thread::{self, JoinHandle},
		time::{Duration, Instant}
	},
	rand::Rng,
	log::{debug, info, warn}
};

/// Hands out instance ids. Owned by whoever creates the views sharing it.
#[derive(Debug, Default)]
pub struct InstanceIds(AtomicUsize);

impl InstanceIds {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next(&self) -> usize {
		self.0.fetch_add(1, Ordering::SeqCst) + 1
	}
}

/// All members of one deployment, plus the latency classification used to
/// pick among them.
#[derive(Debug)]
pub struct ClusterView {
	settings:    Arc<ClientSettings>,
	connector:   Arc<dyn Connector>,
	listeners:   Arc<Listeners>,
	ids:         Arc<InstanceIds>,
	request_ids: Arc<AtomicI32>,
	instances:   RwLock<Vec<Arc<ServerInstance>>>,
	buckets:     Mutex<LatencyBuckets<usize>>
}

impl ClusterView {
	pub fn new(settings: Arc<ClientSettings>, connector: Arc<dyn Connector>, listeners: Arc<Listeners>) -> Self {
		Self::with_ids(settings, connector, listeners, Arc::new(InstanceIds::new()))
	}

	pub fn with_ids(
		settings:  Arc<ClientSettings>,
		connector: Arc<dyn Connector>,
		listeners: Arc<Listeners>,
		ids:       Arc<InstanceIds>
	) -> Self {
		let view = Self {
			settings,
			connector,
			listeners,
			ids,
			request_ids: Arc::new(AtomicI32::new(0)),
			instances:   RwLock::new(Vec::new()),
			buckets:     Mutex::new(LatencyBuckets::new())
		};

		let instances = view.settings.servers().iter()
			.map(|address| view.create_instance(address.clone()))
			.collect();
		*view.instances.write().unwrap_or_else(PoisonError::into_inner) = instances;
		view
	}

	fn create_instance(&self, address: ServerAddress) -> Arc<ServerInstance> {
		ServerInstance::new(
			self.ids.next(),
			address,
			self.settings.clone(),
			self.connector.clone(),
			self.listeners.clone(),
			self.request_ids.clone()
		)
	}

	pub fn settings(&self) -> &Arc<ClientSettings> {
		&self.settings
	}

	pub fn listeners(&self) -> &Arc<Listeners> {
		&self.listeners
	}

	pub fn instances(&self) -> Vec<Arc<ServerInstance>> {
		self.instances.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	pub fn find(&self, address: &ServerAddress) -> Option<Arc<ServerInstance>> {
		self.instances().into_iter().find(|i| &i.address() == address)
	}

	/// Adds a member, or returns the existing one with that address.
	pub fn add_instance(&self, address: ServerAddress) -> Result<Arc<ServerInstance>> {
		let mut instances = self.instances.write()?;
		if let Some(instance) = instances.iter().find(|i| i.address() == address) {
			return Ok(instance.clone());
		}

		let instance = self.create_instance(address);
		info!("added server instance {} ({})", instance.id(), instance.address());
		instances.push(instance.clone());
		Ok(instance)
	}

	/// Removes a member and disconnects it. Returns false if it was unknown.
	pub fn remove_instance(&self, address: &ServerAddress) -> Result<bool> {
		let instance = {
			let mut instances = self.instances.write()?;
			match instances.iter().position(|i| &i.address() == address) {
				Some(i) => instances.remove(i),
				None => return Ok(false)
			}
		};

		self.buckets.lock()?.remove(&instance.id());
		info!("removed server instance {} ({})", instance.id(), address);
		instance.disconnect()?;
		Ok(true)
	}

	pub fn primary(&self) -> Option<Arc<ServerInstance>> {
		self.instances().into_iter().find(|i| i.is_primary())
	}

	/// Copy of the current latency classification, by instance id.
	pub fn latency_buckets(&self) -> Result<LatencyBuckets<usize>> {
		Ok(self.buckets.lock()?.clone())
	}

	fn secondary_ok(&self) -> bool {
		self.settings.is_replica_set() || self.settings.read_policy().is_secondary_ok()
	}

	/// Reclassifies a freshly probed instance and picks up members it reports.
	fn observe(&self, instance: &ServerInstance) {
		let description = match instance.description() {
			Some(description) => description,
			None => return self.forget(instance)
		};

		if let Ok(mut buckets) = self.buckets.lock() {
			buckets.add(instance.id(), description.ping_time());
		}

		if !self.settings.is_replica_set() { return; }

		for host in description.hosts() {
			if self.find(host).is_none() {
				if let Err(e) = self.add_instance(host.clone()) {
					warn!("failed to add discovered member {}: {}", host, e);
				}
			}
		}
	}

	fn forget(&self, instance: &ServerInstance) {
		if let Ok(mut buckets) = self.buckets.lock() {
			buckets.remove(&instance.id());
		}
	}

	/// Connects every member, including the ones discovered on the way.
	/// Succeeds if at least one member is connected.
	pub fn connect(&self) -> Result<()> {
		let secondary_ok = self.secondary_ok();
		let mut attempted = HashSet::new();
		let mut connected = false;
		let mut last_error = None;

		loop {
			let pending = self.instances().into_iter()
				.filter(|i| attempted.insert(i.id()))
				.collect::<Vec<_>>();

			if pending.is_empty() { break; }

			for instance in pending {
				match instance.connect(secondary_ok) {
					Ok(()) => {
						connected = true;
						self.observe(&instance);
					}
					Err(e) => {
						warn!("failed to connect to {}: {}", instance.address(), e);
						self.forget(&instance);
						last_error = Some(e);
					}
				}
			}
		}

		match (connected, last_error) {
			(true, _) => Ok(()),
			(false, Some(e)) => Err(e),
			(false, None) => Err(Error::NoMatchingServer(self.settings.read_policy().to_string()))
		}
	}

	/// Health checks every member. Returns the number of healthy ones.
	pub fn verify_state(&self) -> usize {
		let mut healthy = 0;
		for instance in self.instances() {
			match instance.verify_state() {
				ProbeOutcome::Healthy(_) => {
					healthy += 1;
					self.observe(&instance);
				}
				ProbeOutcome::Unhealthy(e) => {
					debug!("server instance {} is unhealthy: {}", instance.address(), e);
					self.forget(&instance);
				}
			}
		}
		healthy
	}

	/// One monitor pass: disconnected members get a connect attempt,
	/// the others a health check.
	pub fn check(&self) {
		let secondary_ok = self.secondary_ok();
		for instance in self.instances() {
			match instance.state() {
				ServerState::Disconnected => match instance.connect(secondary_ok) {
					Ok(()) => self.observe(&instance),
					Err(e) => {
						debug!("reconnect to {} failed: {}", instance.address(), e);
						self.forget(&instance);
					}
				},
				ServerState::Connected => match instance.verify_state() {
					ProbeOutcome::Healthy(_) => self.observe(&instance),
					ProbeOutcome::Unhealthy(_) => self.forget(&instance)
				},
				_ => ()
			}
		}
	}

	/// Picks a member for `policy`: the primary for primary reads, otherwise a
	/// random eligible member from the fastest bucket that has one. Secondary
	/// reads fall back to the primary, tagged reads do not.
	pub fn choose(&self, policy: &ReadSelectionPolicy) -> Result<Arc<ServerInstance>> {
		let no_match = || Error::NoMatchingServer(policy.to_string());

		if policy.is_primary() {
			return self.primary().ok_or_else(no_match);
		}

		let instances = self.instances();
		{
			let buckets = self.buckets.lock()?;
			for bucket in buckets.iter() {
				let eligible = bucket.iter()
					.filter_map(|id| instances.iter().find(|i| i.id() == *id))
					.filter(|i| i.description().map_or(false, |d| policy.admits(&d)))
					.collect::<Vec<_>>();

				if !eligible.is_empty() {
					return Ok(eligible[rand::thread_rng().gen_range(0, eligible.len())].clone());
				}
			}
		}

		match policy.is_tagged() {
			true  => Err(no_match()),
			false => self.primary().ok_or_else(no_match)
		}
	}

	pub fn acquire_connection(&self, database: &str, policy: &ReadSelectionPolicy) -> Result<Connection> {
		self.choose(policy)?.acquire_connection(database)
	}

	/// For follow-up requests that must reach the member that served the first one.
	pub fn acquire_connection_on(&self, instance: &Arc<ServerInstance>, database: &str) -> Result<Connection> {
		instance.acquire_connection(database)
	}

	/// Disconnects every member. All are attempted, the first failure is returned.
	pub fn disconnect(&self) -> Result<()> {
		let mut result = Ok(());
		for instance in self.instances() {
			if let Err(e) = instance.disconnect() {
				warn!("failed to disconnect {}: {}", instance.address(), e);
				if result.is_ok() {
					result = Err(e);
				}
			}
		}

		self.buckets.lock()?.clear();
		result
	}

	/// Starts a thread that runs `check` every heartbeat until the returned
	/// handle or the view is dropped.
	pub fn start_monitor(self: &Arc<Self>) -> Result<Monitor> {
		let shared = Arc::new(MonitorShared {
			flags:   Mutex::new(MonitorFlags { running: true, pending: false }),
			condvar: Condvar::new()
		});

		let view = Arc::downgrade(self);
		let heartbeat = self.settings.heartbeat_frequency();
		let shared_ = shared.clone();
		let handle = thread::Builder::new()
			.name("server-monitor".to_string())
			.spawn(move || run_monitor(view, shared_, heartbeat))?;

		Ok(Monitor { shared, handle: Some(handle) })
	}
}

#[derive(Debug)]
struct MonitorFlags {
	running: bool,
	pending: bool
}

#[derive(Debug)]
struct MonitorShared {
	flags:   Mutex<MonitorFlags>,
	condvar: Condvar
}

/// Handle to the monitor thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct Monitor {
	shared: Arc<MonitorShared>,
	handle: Option<JoinHandle<()>>
}

impl Monitor {
	/// Wakes the monitor for an immediate pass.
	pub fn request_check(&self) {
		if let Ok(mut flags) = self.shared.flags.lock() {
			flags.pending = true;
			self.shared.condvar.notify_one();
		}
	}

	pub fn stop(self) {}
}

impl Drop for Monitor {
	fn drop(&mut self) {
		if let Ok(mut flags) = self.shared.flags.lock() {
			flags.running = false;
			self.shared.condvar.notify_one();
		}

		if let Some(handle) = self.handle.take() {
			if handle.join().is_err() {
				warn!("server monitor panicked");
			}
		}
	}
}

fn run_monitor(view: Weak<ClusterView>, shared: Arc<MonitorShared>, heartbeat: Duration) {
	debug!("server monitor started");

	'monitor: loop {
		match view.upgrade() {
			Some(view) => view.check(),
			None => break
		}

		let deadline = Instant::now() + heartbeat;
		let mut flags = match shared.flags.lock() {
			Ok(flags) => flags,
			Err(_) => break
		};

		loop {
			if !flags.running { break 'monitor; }
			if flags.pending {
				flags.pending = false;
				break;
			}

			let now = Instant::now();
			if now >= deadline { break; }

			flags = match shared.condvar.wait_timeout(flags, deadline - now) {
				Ok((flags, _)) => flags,
				Err(_) => break 'monitor
			};
		}
	}

	debug!("server monitor stopped");
}
