//! Resource identifiers.
//!
//! Every entity gets its own newtype so a `JobId` can never be passed where a
//! `RunId` is expected. All ids are UUIDv7, which keeps them time-ordered.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new unique id using UUIDv7.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

resource_id!(
    /// Identity of an indexed workflow file.
    WorkflowId
);
resource_id!(
    /// Identity of the repository a workflow belongs to.
    RepositoryId
);
resource_id!(
    /// Identity of a workflow run.
    RunId
);
resource_id!(
    /// Identity of a job within a run.
    JobId
);
resource_id!(
    /// Identity of a step within a job attempt.
    StepId
);
resource_id!(
    /// Identity of an execution agent.
    RunnerId
);
resource_id!(
    /// Identity of a dispatch queue entry.
    EntryId
);
