use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Canonical work identifier.
    SeriesId
);
uuid_id!(
    /// Binding of a series to one upstream source.
    SeriesSourceId
);
uuid_id!(
    /// Logical chapter identifier, shared across sources.
    ChapterId
);
uuid_id!(
    /// One source's copy of a chapter.
    ChapterSourceId
);
uuid_id!(UserId);
uuid_id!(
    /// A user's library entry (subscription).
    EntryId
);
uuid_id!(ImportJobId);
