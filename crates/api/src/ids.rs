use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! slug_type {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub String);

		impl $name {
			/// Returns the identifier as a string slice.
			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $name {
			fn from(value: &str) -> Self {
				Self(value.to_owned())
			}
		}

		impl From<String> for $name {
			fn from(value: String) -> Self {
				Self(value)
			}
		}
	};
}

slug_type!(
	/// Stable slug of the project owning a lockable resource.
	ProjectSlug
);
slug_type!(
	/// Stable identifier of a lockable document.
	ResourceId
);
slug_type!(
	/// Slug of the course section an attempt belongs to.
	SectionSlug
);
slug_type!(
	/// Identifier of one activity attempt.
	AttemptGuid
);
slug_type!(
	/// Identifier of the part attempt targeted by a queued update.
	TargetId
);
slug_type!(
	/// Server-assigned slug of a saved document revision.
	RevisionSlug
);
