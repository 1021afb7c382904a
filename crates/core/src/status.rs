//! Status enums mapping to SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table. The wire name is the
//! `SCREAMING_SNAKE_CASE` label also stored in the lookup table.

use serde::{Deserialize, Serialize};

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label)] $variant = $val ),+
        }

        impl $name {
            /// Every variant in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Wire / lookup-table label.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_status_enum! {
    /// Lifecycle of a rollout task.
    TaskStatus {
        NotStarted = 1 => "NOT_STARTED",
        Pending = 2 => "PENDING",
        Running = 3 => "RUNNING",
        Done = 4 => "DONE",
        Failed = 5 => "FAILED",
        Canceled = 6 => "CANCELED",
        Skipped = 7 => "SKIPPED",
    }
}

define_status_enum! {
    /// Lifecycle of one execution attempt of a task.
    TaskRunStatus {
        Pending = 1 => "PENDING",
        Running = 2 => "RUNNING",
        Done = 3 => "DONE",
        Failed = 4 => "FAILED",
        Canceled = 5 => "CANCELED",
    }
}

define_status_enum! {
    /// Issue lifecycle.
    IssueStatus {
        Open = 1 => "OPEN",
        Done = 2 => "DONE",
        Canceled = 3 => "CANCELED",
    }
}

impl TaskStatus {
    /// Statuses that hold an outstanding task run.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Skipped
        )
    }
}

impl TaskRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskRunStatus::Done | TaskRunStatus::Failed | TaskRunStatus::Canceled
        )
    }

    /// The task status a finished run leaves its task in.
    pub fn task_status(self) -> TaskStatus {
        match self {
            TaskRunStatus::Pending => TaskStatus::Pending,
            TaskRunStatus::Running => TaskStatus::Running,
            TaskRunStatus::Done => TaskStatus::Done,
            TaskRunStatus::Failed => TaskStatus::Failed,
            TaskRunStatus::Canceled => TaskStatus::Canceled,
        }
    }
}
