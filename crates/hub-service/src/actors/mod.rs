//! Actor model for the hub.
//!
//! # Hierarchy
//!
//! ```text
//! HubActor (singleton, owns registries and pending operations)
//! ├── ConnectionActor (one per signaling connection)
//! └── RecordingControllerActor (singleton, see crate::recording)
//! ```
//!
//! Each actor owns its state and is reached only through its handle. Parent
//! cancellation tokens propagate shutdown to children.

pub mod connection;
pub mod hub;
pub mod messages;
pub mod metrics;
pub mod pending;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use hub::{HubActor, HubActorHandle, HubDependencies, HubSettings};
pub use messages::{ConnectionMessage, HubMessage, StreamerInfo, TopologySnapshot};
pub use metrics::{ActorMetrics, ActorMetricsSnapshot, ActorType, MailboxMonitor};
pub use pending::{OperationKey, PendingOperation, PendingTable};
