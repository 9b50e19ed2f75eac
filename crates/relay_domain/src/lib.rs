#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("identifier must be positive: {0}")]
	NotPositive(i64),
}

/// Account identity assigned by the store when the account is created.
///
/// Stable for the lifetime of the account; always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
	/// Create a `UserId`, rejecting zero and negative values.
	pub fn new(id: i64) -> Result<Self, ParseIdError> {
		if id <= 0 {
			return Err(ParseIdError::NotPositive(id));
		}
		Ok(Self(id))
	}

	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(parse_i64(s)?)
	}
}

/// Group identity assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(i64);

impl GroupId {
	/// Create a `GroupId`, rejecting zero and negative values.
	pub fn new(id: i64) -> Result<Self, ParseIdError> {
		if id <= 0 {
			return Err(ParseIdError::NotPositive(id));
		}
		Ok(Self(id))
	}

	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for GroupId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		GroupId::new(parse_i64(s)?)
	}
}

/// Server-assigned identifier of one accepted connection.
///
/// Never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl ConnId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

fn parse_i64(s: &str) -> Result<i64, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}
	s.parse::<i64>()
		.map_err(|_| ParseIdError::InvalidFormat(format!("expected integer, got {s:?}")))
}
