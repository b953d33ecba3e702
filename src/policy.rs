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
	crate::{common::*, server::ServerDescription},
	std::{fmt, str::FromStr, sync::Arc, time::Duration, collections::BTreeSet, convert::TryFrom},
	bson::{doc, Document},
	lazy_static::lazy_static
};

const NO_TIMEOUT: Duration = Duration::from_secs(0);

lazy_static! {
	static ref ACK_DISABLED: Arc<WriteAcknowledgement> = Arc::new(WriteAcknowledgement::raw(false, false, 0));
	static ref ACK_ENABLED:  Arc<WriteAcknowledgement> = Arc::new(WriteAcknowledgement::raw(true, false, 0));
	static ref ACK_W2:       Arc<WriteAcknowledgement> = Arc::new(WriteAcknowledgement::raw(true, false, 2));
	static ref ACK_W3:       Arc<WriteAcknowledgement> = Arc::new(WriteAcknowledgement::raw(true, false, 3));
	static ref ACK_W4:       Arc<WriteAcknowledgement> = Arc::new(WriteAcknowledgement::raw(true, false, 4));

	static ref READ_PRIMARY:   Arc<ReadSelectionPolicy> = Arc::new(ReadSelectionPolicy { secondary_ok: false, tags: BTreeSet::new() });
	static ref READ_SECONDARY: Arc<ReadSelectionPolicy> = Arc::new(ReadSelectionPolicy { secondary_ok: true, tags: BTreeSet::new() });
}

/// Acknowledgement requested after writes ("safe mode").
///
/// Values are immutable. The common combinations are interned, so `create`
/// hands out the same `Arc` for equal inputs.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WriteAcknowledgement {
	enabled:  bool,
	fsync:    bool,
	w:        u32,
	wtimeout: Duration
}

impl WriteAcknowledgement {
	const fn raw(enabled: bool, fsync: bool, w: u32) -> Self {
		Self { enabled, fsync, w, wtimeout: NO_TIMEOUT }
	}

	pub fn create(enabled: bool, fsync: bool, w: u32, wtimeout: Duration) -> Result<Arc<Self>> {
		if fsync && !enabled {
			return Err(Error::Invariant("fsync requires write acknowledgement to be enabled"));
		}

		if w != 0 && !enabled {
			return Err(Error::Invariant("w requires write acknowledgement to be enabled"));
		}

		if wtimeout != NO_TIMEOUT && w == 0 {
			return Err(Error::Invariant("wtimeout requires w to be set"));
		}

		Ok(match (enabled, fsync, w, wtimeout == NO_TIMEOUT) {
			(false, _, _, _)       => ACK_DISABLED.clone(),
			(true, false, 0, true) => ACK_ENABLED.clone(),
			(true, false, 2, true) => ACK_W2.clone(),
			(true, false, 3, true) => ACK_W3.clone(),
			(true, false, 4, true) => ACK_W4.clone(),
			_ => Arc::new(Self { enabled, fsync, w, wtimeout })
		})
	}

	pub fn disabled() -> Arc<Self> {
		ACK_DISABLED.clone()
	}

	pub fn enabled() -> Arc<Self> {
		ACK_ENABLED.clone()
	}

	pub fn replicated(w: u32) -> Result<Arc<Self>> {
		Self::create(true, false, w, NO_TIMEOUT)
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	pub fn fsync(&self) -> bool {
		self.fsync
	}

	pub fn w(&self) -> u32 {
		self.w
	}

	pub fn wtimeout(&self) -> Duration {
		self.wtimeout
	}

	/// The `getlasterror` command to send after a write, `None` if disabled.
	pub fn last_error_command(&self) -> Option<Document> {
		if !self.enabled { return None; }

		let mut command = doc! { "getlasterror": 1 };
		if self.fsync {
			command.insert("fsync", true);
		}

		if self.w != 0 {
			command.insert("w", i32::try_from(self.w).unwrap_or(i32::MAX));
		}

		if self.wtimeout != NO_TIMEOUT {
			command.insert("wtimeout", i32::try_from(self.wtimeout.as_millis()).unwrap_or(i32::MAX));
		}

		Some(command)
	}
}

impl fmt::Display for WriteAcknowledgement {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "safe={}", self.enabled)?;
		if self.fsync { write!(f, ",fsync=true")?; }
		if self.w != 0 { write!(f, ",w={}", self.w)?; }
		if self.wtimeout != NO_TIMEOUT { write!(f, ",wtimeout={}ms", self.wtimeout.as_millis())?; }
		Ok(())
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tag {
	name:  String,
	value: String
}

impl Tag {
	pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self { name: name.into(), value: value.into() }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn value(&self) -> &str {
		&self.value
	}
}

impl FromStr for Tag {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let mut split = s.splitn(2, ':');
		match (split.next(), split.next()) {
			(Some(name), Some(value)) if !name.is_empty() => Ok(Self::new(name, value)),
			_ => Err(Error::InvalidSettings(format!("invalid tag `{}`, expected `name:value`", s)))
		}
	}
}

impl fmt::Display for Tag {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.name, self.value)
	}
}

/// Which members a read may be sent to.
///
/// * primary: `secondary_ok == false`, no tags
/// * secondary: `secondary_ok == true`, no tags
/// * tagged: `secondary_ok == true`, at least one tag
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ReadSelectionPolicy {
	secondary_ok: bool,
	tags:         BTreeSet<Tag>
}

impl ReadSelectionPolicy {
	pub fn primary() -> Arc<Self> {
		READ_PRIMARY.clone()
	}

	pub fn secondary() -> Arc<Self> {
		READ_SECONDARY.clone()
	}

	/// An empty tag set yields the secondary policy.
	pub fn tagged(tags: impl IntoIterator<Item = Tag>) -> Arc<Self> {
		let tags = tags.into_iter().collect::<BTreeSet<_>>();
		match tags.is_empty() {
			true  => Self::secondary(),
			false => Arc::new(Self { secondary_ok: true, tags })
		}
	}

	pub fn is_secondary_ok(&self) -> bool {
		self.secondary_ok
	}

	pub fn is_primary(&self) -> bool {
		!self.secondary_ok
	}

	pub fn is_tagged(&self) -> bool {
		!self.tags.is_empty()
	}

	pub fn tags(&self) -> &BTreeSet<Tag> {
		&self.tags
	}

	/// Equal policies match, as do two tagged policies sharing at least one tag.
	pub fn matches(&self, other: &Self) -> bool {
		self == other || (self.is_tagged() && other.is_tagged() && !self.tags.is_disjoint(&other.tags))
	}

	/// Whether a member with `description` may serve this policy directly.
	/// Falling back to the primary for secondary reads is left to the caller.
	pub fn admits(&self, description: &ServerDescription) -> bool {
		if description.is_arbiter() { return false; }

		if !self.secondary_ok {
			return description.is_primary();
		}

		if !description.is_secondary() { return false; }

		!self.is_tagged() || self.matches(&Self {
			secondary_ok: true,
			tags:         description.tags().clone()
		})
	}
}

impl fmt::Display for ReadSelectionPolicy {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match (self.secondary_ok, self.is_tagged()) {
			(false, _)    => f.write_str("primary"),
			(true, false) => f.write_str("secondary"),
			(true, true)  => write!(f, "tagged[{}]", self.tags.iter()
				.map(Tag::to_string)
				.collect::<Vec<_>>()
				.join(","))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acknowledgement_invariants() {
		let ms = Duration::from_millis(100);
		assert!(WriteAcknowledgement::create(false, true, 0, NO_TIMEOUT).is_err());
		assert!(WriteAcknowledgement::create(false, false, 2, NO_TIMEOUT).is_err());
		assert!(WriteAcknowledgement::create(true, false, 0, ms).is_err());
		assert!(WriteAcknowledgement::create(true, true, 2, ms).is_ok());
	}

	#[test]
	fn acknowledgement_is_interned() {
		let a = WriteAcknowledgement::create(true, false, 2, NO_TIMEOUT).unwrap();
		let b = WriteAcknowledgement::create(true, false, 2, NO_TIMEOUT).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert!(Arc::ptr_eq(&WriteAcknowledgement::create(false, false, 0, NO_TIMEOUT).unwrap(), &WriteAcknowledgement::disabled()));
		assert!(Arc::ptr_eq(&WriteAcknowledgement::create(true, false, 0, NO_TIMEOUT).unwrap(), &WriteAcknowledgement::enabled()));
		assert!(Arc::ptr_eq(&WriteAcknowledgement::replicated(4).unwrap(), &WriteAcknowledgement::replicated(4).unwrap()));

		let fsync = WriteAcknowledgement::create(true, true, 0, NO_TIMEOUT).unwrap();
		assert_eq!(*fsync, *WriteAcknowledgement::create(true, true, 0, NO_TIMEOUT).unwrap());
		assert_ne!(*fsync, *WriteAcknowledgement::enabled());
	}

	#[test]
	fn last_error_command() {
		assert_eq!(WriteAcknowledgement::disabled().last_error_command(), None);
		assert_eq!(WriteAcknowledgement::enabled().last_error_command(), Some(doc! { "getlasterror": 1 }));

		let ack = WriteAcknowledgement::create(true, true, 3, Duration::from_millis(250)).unwrap();
		assert_eq!(ack.last_error_command(), Some(doc! {
			"getlasterror": 1,
			"fsync":        true,
			"w":            3,
			"wtimeout":     250
		}));
		assert_eq!(ack.to_string(), "safe=true,fsync=true,w=3,wtimeout=250ms");

		let ack = WriteAcknowledgement::create(true, false, 2, Duration::from_secs(u64::from(u32::MAX))).unwrap();
		let command = ack.last_error_command().unwrap();
		assert_eq!(command.get_i32("wtimeout").unwrap(), i32::MAX);
	}

	#[test]
	fn read_policy_matching() {
		let ny = ReadSelectionPolicy::tagged(vec![Tag::new("dc", "ny"), Tag::new("rack", "1")]);
		let ny_other_rack = ReadSelectionPolicy::tagged(vec![Tag::new("dc", "ny"), Tag::new("rack", "2")]);
		let sf = ReadSelectionPolicy::tagged(vec![Tag::new("dc", "sf")]);

		assert!(ny.matches(&ny_other_rack));
		assert!(!ny.matches(&sf));
		assert!(!ny.matches(&ReadSelectionPolicy::secondary()));
		assert!(ReadSelectionPolicy::secondary().matches(&ReadSelectionPolicy::secondary()));
		assert!(ReadSelectionPolicy::primary().matches(&ReadSelectionPolicy::primary()));
		assert!(!ReadSelectionPolicy::primary().matches(&ReadSelectionPolicy::secondary()));
		assert!(!ReadSelectionPolicy::secondary().matches(&ReadSelectionPolicy::primary()));
		assert!(Arc::ptr_eq(&ReadSelectionPolicy::tagged(Vec::new()), &ReadSelectionPolicy::secondary()));
		assert_eq!(ny.to_string(), "tagged[dc:ny,rack:1]");
	}

	#[test]
	fn parse_tag() {
		assert_eq!("dc:ny".parse::<Tag>().unwrap(), Tag::new("dc", "ny"));
		assert_eq!("url:a:b".parse::<Tag>().unwrap().value(), "a:b");
		assert!("dc".parse::<Tag>().is_err());
		assert!(":ny".parse::<Tag>().is_err());
	}
}
