//! Label matchers: the `=`, `!=`, `=~`, `!~` triples used by routes,
//! silences, and inhibition rules.
//!
//! Regex matchers are anchored at both ends. An absent label evaluates as
//! the empty string, so `env=""` matches alerts without an `env` label.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
	error::ValidationError,
	labels::{LabelSet, is_valid_label_name},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOperator {
	#[serde(rename = "=")]
	Equal,
	#[serde(rename = "!=")]
	NotEqual,
	#[serde(rename = "=~")]
	Regex,
	#[serde(rename = "!~")]
	NotRegex,
}

impl fmt::Display for MatchOperator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Equal => "=",
			Self::NotEqual => "!=",
			Self::Regex => "=~",
			Self::NotRegex => "!~",
		})
	}
}

/// Wire form of a matcher; the compiled regex lives only in [`Matcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMatcher {
	name: String,
	value: String,
	op: MatchOperator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawMatcher", into = "RawMatcher")]
pub struct Matcher {
	name: String,
	value: String,
	op: MatchOperator,
	re: Option<Regex>,
}

impl Matcher {
	pub fn new(
		name: impl Into<String>,
		op: MatchOperator,
		value: impl Into<String>,
	) -> Result<Self, ValidationError> {
		let name = name.into();
		let value = value.into();

		if !is_valid_label_name(&name) {
			return Err(ValidationError::InvalidLabelName(name));
		}

		let re = match op {
			MatchOperator::Regex | MatchOperator::NotRegex => {
				// Anchor at both ends so `=~"foo"` means the whole value.
				let anchored = format!("^(?:{value})$");
				Some(Regex::new(&anchored).map_err(|source| ValidationError::InvalidRegex {
					name: name.clone(),
					source,
				})?)
			}
			_ => None,
		};

		Ok(Self {
			name,
			value,
			op,
			re,
		})
	}

	pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
		// Equality matchers cannot fail validation beyond the name check,
		// which callers constructing from static strings have already met.
		Self::new(name, MatchOperator::Equal, value)
			.unwrap_or_else(|err| panic!("invalid equality matcher: {err}"))
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn value(&self) -> &str {
		&self.value
	}

	pub fn op(&self) -> MatchOperator {
		self.op
	}

	/// Whether this is an `=` matcher, usable as an index key.
	pub fn is_equality(&self) -> bool {
		self.op == MatchOperator::Equal
	}

	pub fn matches(&self, labels: &LabelSet) -> bool {
		let value = labels.get(&self.name).unwrap_or("");
		match self.op {
			MatchOperator::Equal => value == self.value,
			MatchOperator::NotEqual => value != self.value,
			MatchOperator::Regex => self.re.as_ref().is_some_and(|re| re.is_match(value)),
			MatchOperator::NotRegex => !self.re.as_ref().is_some_and(|re| re.is_match(value)),
		}
	}
}

impl PartialEq for Matcher {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.value == other.value && self.op == other.op
	}
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}{:?}", self.name, self.op, self.value)
	}
}

impl TryFrom<RawMatcher> for Matcher {
	type Error = ValidationError;

	fn try_from(raw: RawMatcher) -> Result<Self, Self::Error> {
		Self::new(raw.name, raw.op, raw.value)
	}
}

impl From<Matcher> for RawMatcher {
	fn from(matcher: Matcher) -> Self {
		Self {
			name: matcher.name,
			value: matcher.value,
			op: matcher.op,
		}
	}
}

/// A matcher set matches a label set iff every member matches.
pub fn matches_all(matchers: &[Matcher], labels: &LabelSet) -> bool {
	matchers.iter().all(|m| m.matches(labels))
}
