use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the orchestrator retries a pass that failed transiently.
///
/// `max_attempts` immediate tries spaced by `delay`, then, if configured,
/// one deferred try after `deferred_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	#[serde(with = "secs")]
	pub delay: Duration,
	#[serde(with = "opt_secs")]
	pub deferred_delay: Option<Duration>,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			max_attempts: 3,
			delay: Duration::from_secs(2),
			deferred_delay: Some(Duration::from_secs(30)),
		}
	}
}

impl RetryPolicy {
	/// A policy that tries exactly once.
	pub fn none() -> Self {
		RetryPolicy { max_attempts: 1, delay: Duration::ZERO, deferred_delay: None }
	}

	/// Delay before attempt `attempt + 1`, or `None` once the immediate
	/// attempts are used up. Attempts count from 1.
	pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
		(attempt < self.max_attempts.max(1)).then_some(self.delay)
	}
}

mod secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		u64::deserialize(d).map(Duration::from_secs)
	}
}

mod opt_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_u64(d.as_secs()),
			None => s.serialize_none(),
		}
	}

	/// Zero disables the deferred retry.
	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let secs = Option::<u64>::deserialize(d)?;
		Ok(secs.filter(|s| *s > 0).map(Duration::from_secs))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_is_three_quick_tries_then_one_deferred() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.delay_after(1), Some(Duration::from_secs(2)));
		assert_eq!(policy.delay_after(2), Some(Duration::from_secs(2)));
		assert_eq!(policy.delay_after(3), None);
		assert_eq!(policy.deferred_delay, Some(Duration::from_secs(30)));
	}

	#[test]
	fn none_never_waits() {
		assert_eq!(RetryPolicy::none().delay_after(1), None);
	}

	#[test]
	fn reads_seconds_from_toml() {
		let policy: RetryPolicy = toml::from_str("max_attempts = 5\ndelay = 1\ndeferred_delay = 0").unwrap();
		assert_eq!(policy.max_attempts, 5);
		assert_eq!(policy.delay, Duration::from_secs(1));
		assert_eq!(policy.deferred_delay, None);
	}

	#[test]
	fn missing_keys_fall_back_to_defaults() {
		let policy: RetryPolicy = toml::from_str("max_attempts = 2").unwrap();
		assert_eq!(policy.delay, Duration::from_secs(2));
		assert_eq!(policy.deferred_delay, Some(Duration::from_secs(30)));
	}
}
