//! Label sets and fingerprints.
//!
//! A label set is an unordered name→value mapping; its fingerprint is a
//! deterministic 64-bit hash over the sorted pairs and serves as the
//! identity of an alert.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::error::ValidationError;

/// Separators hashed between names and values so that `{a="bc"}` and
/// `{ab="c"}` cannot collide.
const SEP_NAME: u8 = 0xfe;
const SEP_VALUE: u8 = 0xff;

/// 64-bit identity of a label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// An unordered mapping from label name to label value.
///
/// Backed by a sorted map so that iteration order, and therefore the
/// fingerprint, is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
	pub fn new() -> Self {
		Self(BTreeMap::new())
	}

	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.insert(name.into(), value.into());
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.get(name).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	/// The subset of this label set naming only `names`, in their order of
	/// appearance here. Missing names are simply absent from the result.
	pub fn project(&self, names: &[String]) -> LabelSet {
		let mut out = LabelSet::new();
		for name in names {
			if let Some(value) = self.0.get(name) {
				out.insert(name.clone(), value.clone());
			}
		}
		out
	}

	/// Deterministic 64-bit hash over the sorted (name, value) pairs.
	pub fn fingerprint(&self) -> Fingerprint {
		let mut hasher = Xxh64::new(0);
		for (name, value) in &self.0 {
			hasher.update(name.as_bytes());
			hasher.update(&[SEP_NAME]);
			hasher.update(value.as_bytes());
			hasher.update(&[SEP_VALUE]);
		}
		Fingerprint(hasher.digest())
	}

	/// Rejects empty sets, empty names, and names that are not identifiers.
	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.0.is_empty() {
			return Err(ValidationError::EmptyLabelSet);
		}
		for name in self.0.keys() {
			if !is_valid_label_name(name) {
				return Err(ValidationError::InvalidLabelName(name.clone()));
			}
		}
		Ok(())
	}
}

impl FromIterator<(String, String)> for LabelSet {
	fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl<const N: usize> From<[(&str, &str); N]> for LabelSet {
	fn from(pairs: [(&str, &str); N]) -> Self {
		pairs
			.into_iter()
			.map(|(n, v)| (n.to_string(), v.to_string()))
			.collect()
	}
}

impl fmt::Display for LabelSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{")?;
		for (i, (name, value)) in self.0.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{name}={value:?}")?;
		}
		write!(f, "}}")
	}
}

pub fn is_valid_label_name(name: &str) -> bool {
	let mut chars = name.chars();
	match chars.next() {
		Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
		_ => return false,
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprint_is_order_independent() {
		let mut a = LabelSet::new();
		a.insert("alertname", "HighErrorRate");
		a.insert("severity", "critical");

		let mut b = LabelSet::new();
		b.insert("severity", "critical");
		b.insert("alertname", "HighErrorRate");

		assert_eq!(a.fingerprint(), b.fingerprint());
	}

	#[test]
	fn fingerprint_distinguishes_pair_boundaries() {
		let a = LabelSet::from([("a", "bc")]);
		let b = LabelSet::from([("ab", "c")]);
		assert_ne!(a.fingerprint(), b.fingerprint());

		let c = LabelSet::from([("a", "b"), ("c", "d")]);
		let d = LabelSet::from([("a", "bc"), ("", "d")]);
		assert_ne!(c.fingerprint(), d.fingerprint());
	}

	#[test]
	fn fingerprint_differs_on_value_change() {
		let a = LabelSet::from([("alertname", "x")]);
		let b = LabelSet::from([("alertname", "y")]);
		assert_ne!(a.fingerprint(), b.fingerprint());
	}

	#[test]
	fn projection_keeps_only_requested_names() {
		let set = LabelSet::from([("alertname", "x"), ("cluster", "A"), ("pod", "p1")]);
		let projected = set.project(&["cluster".into(), "alertname".into()]);
		assert_eq!(projected.len(), 2);
		assert_eq!(projected.get("cluster"), Some("A"));
		assert_eq!(projected.get("pod"), None);
	}

	#[test]
	fn validation_rejects_bad_names() {
		let empty = LabelSet::new();
		assert!(empty.validate().is_err());

		let bad = LabelSet::from([("0numeric", "x")]);
		assert!(bad.validate().is_err());

		let ok = LabelSet::from([("alert_name", "x"), ("_private", "y")]);
		assert!(ok.validate().is_ok());
	}

	#[test]
	fn display_is_sorted_and_quoted() {
		let set = LabelSet::from([("b", "2"), ("a", "1")]);
		assert_eq!(set.to_string(), r#"{a="1", b="2"}"#);
	}
}
