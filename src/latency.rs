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

use std::time::Duration;

/// Members grouped by order of magnitude of their ping time in milliseconds.
///
/// Bucket `i` holds members with `10^i <= ms < 10^(i + 1)`, where anything
/// below one millisecond counts as one. A member lives in at most one bucket.
#[derive(Debug, Clone)]
pub struct LatencyBuckets<T> {
	buckets: Vec<Vec<T>>
}

impl<T> Default for LatencyBuckets<T> {
	fn default() -> Self {
		Self { buckets: Vec::new() }
	}
}

impl<T: PartialEq> LatencyBuckets<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn bucket_index(ping: Duration) -> usize {
		let mut ms = ping.as_millis().max(1);
		let mut index = 0;
		while ms >= 10 {
			ms /= 10;
			index += 1;
		}
		index
	}

	/// Inserts `member`, moving it if it was already classified.
	pub fn add(&mut self, member: T, ping: Duration) {
		self.remove(&member);
		let index = Self::bucket_index(ping);
		if index >= self.buckets.len() {
			self.buckets.resize_with(index + 1, Vec::new);
		}
		self.buckets[index].push(member);
	}

	pub fn remove(&mut self, member: &T) -> bool {
		for bucket in &mut self.buckets {
			if let Some(i) = bucket.iter().position(|m| m == member) {
				bucket.remove(i);
				return true;
			}
		}
		false
	}

	pub fn position(&self, member: &T) -> Option<usize> {
		self.buckets.iter().position(|bucket| bucket.contains(member))
	}

	pub fn bucket(&self, index: usize) -> Option<&[T]> {
		self.buckets.get(index).map(Vec::as_slice)
	}

	/// Number of buckets, including empty ones below the highest occupied one.
	pub fn len(&self) -> usize {
		self.buckets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buckets.iter().all(Vec::is_empty)
	}

	/// Buckets from lowest to highest latency.
	pub fn iter(&self) -> impl Iterator<Item = &[T]> {
		self.buckets.iter().map(Vec::as_slice)
	}

	pub fn clear(&mut self) {
		self.buckets.clear();
	}
}
