//! Control plane for the tunnel mesh: brokers node descriptors between agents
//! and clients
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod peer;
pub mod propagation;
pub mod session;
pub mod subscriptions;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use directory::{DirectoryEntry, InstanceId, NodeDirectory, Origin, SessionId};
pub use error::CoordinatorError;
pub use peer::{serve_coordinator, PeerConnection};
pub use propagation::{
    Binding, MemoryBus, NoopPropagation, PeerUpdate, Propagation, PropagationError,
};
pub use session::SessionState;
pub use subscriptions::{Subscription, SubscriptionRegistry};
