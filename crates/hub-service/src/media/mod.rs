//! Media engine seam and the resource lifecycle adapter built on it.

mod adapter;
mod engine;
mod loopback;

pub use adapter::{MediaAdapter, OwnedCounts, Owner, ResourceEvent};
pub use engine::{
    CloseCause, ConsumerDescriptor, EngineError, EngineEvent, MediaEngine, TransportDescriptor,
};
pub use loopback::{LoopbackCounts, LoopbackEngine};
