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
	crate::{common::ServerAddress, server::ServerState},
	std::{fmt, panic::{self, AssertUnwindSafe}, sync::RwLock, time::Duration},
	log::warn
};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// An observer. Returning `Err` or panicking only gets the listener skipped,
/// the emitting instance carries on with its transition.
pub type EventListener = Box<dyn Fn(&Event) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
	ServerStateChanged {
		instance: usize,
		address:  ServerAddress,
		old:      ServerState,
		new:      ServerState
	},
	PoolCleared {
		address:    ServerAddress,
		generation: usize
	},
	ConnectionCreated {
		address:       ServerAddress,
		connection_id: usize
	},
	ConnectionCheckedOut {
		address:       ServerAddress,
		connection_id: usize
	},
	ConnectionCheckedIn {
		address:       ServerAddress,
		connection_id: usize
	},
	ConnectionClosed {
		address:       ServerAddress,
		connection_id: usize,
		reason:        ConnectionClosedReason
	},
	CommandStarted {
		address:       ServerAddress,
		command_name:  String,
		request_id:    i32,
		connection_id: usize
	},
	CommandSucceeded {
		address:       ServerAddress,
		command_name:  String,
		request_id:    i32,
		connection_id: usize,
		duration:      Duration
	},
	CommandFailed {
		address:       ServerAddress,
		command_name:  String,
		request_id:    i32,
		connection_id: usize,
		duration:      Duration,
		failure:       String
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	/// The pool was cleared while the connection was checked out.
	Stale,
	Error,
	PoolCleared
}

#[derive(Default)]
pub struct Listeners(RwLock<Vec<EventListener>>);

impl fmt::Debug for Listeners {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let len = self.0.read().map_or(0, |listeners| listeners.len());
		f.debug_struct("Listeners")
			.field("len", &len)
			.finish()
	}
}

impl Listeners {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, listener: EventListener) -> crate::Result<()> {
		self.0.write()?.push(listener);
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.0.read().map_or(0, |listeners| listeners.len())
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn dispatch(&self, event: &Event) {
		let listeners = match self.0.read() {
			Ok(listeners) => listeners,
			Err(_) => return
		};

		for (i, listener) in listeners.iter().enumerate() {
			match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
				Ok(Ok(())) => (),
				Ok(Err(e)) => warn!("event listener #{} failed on {:?}: {}", i, event, e),
				Err(_) => warn!("event listener #{} panicked on {:?}", i, event)
			}
		}
	}

	pub fn dispatch_all(&self, events: Vec<Event>) {
		if events.is_empty() || self.is_empty() { return; }
		for event in &events {
			self.dispatch(event);
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::sync::{Arc, atomic::{AtomicUsize, Ordering}}};

	fn cleared() -> Event {
		Event::PoolCleared { address: ServerAddress::new("localhost", 27017), generation: 1 }
	}

	#[test]
	fn failing_listeners_do_not_stop_dispatch() {
		let listeners = Listeners::new();
		let seen = Arc::new(AtomicUsize::new(0));

		listeners.add(Box::new(|_| Err("nope".into()))).unwrap();
		listeners.add(Box::new(|_| panic!("listener bug"))).unwrap();
		let seen_ = seen.clone();
		listeners.add(Box::new(move |_| {
			seen_.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})).unwrap();

		listeners.dispatch(&cleared());
		listeners.dispatch_all(vec![cleared(), cleared()]);
		assert_eq!(seen.load(Ordering::SeqCst), 3);
	}
}
