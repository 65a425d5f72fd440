//! A cheaply-clonable interned string, used anywhere a hostname, scheme, or
//! other small identifier is passed around and compared often.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Strng(Arc<str>);

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng(Arc::from(s.as_ref()))
}

impl Strng {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Deref for Strng {
	type Target = str;
	fn deref(&self) -> &str {
		&self.0
	}
}

impl Borrow<str> for Strng {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl From<&str> for Strng {
	fn from(value: &str) -> Self {
		new(value)
	}
}

impl From<String> for Strng {
	fn from(value: String) -> Self {
		Strng(Arc::from(value.as_str()))
	}
}

impl fmt::Display for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Debug for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.0, f)
	}
}
