//! # Hub Test Utilities
//!
//! Shared test utilities for the Camera Hub service.
//!
//! ## Modules
//!
//! - `mock_engine` - Media engine with injectable latency and close counters
//! - `mock_encoder` - Scripted encoder launcher (no child processes)
//! - `fixtures` - A fully wired hub plus channel-backed signaling clients
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hub_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let hub = TestHub::builder().build();
//!     let mut camera = hub.connect("camera-1").await;
//!     let mut viewer = hub.connect("viewer-1").await;
//!
//!     camera.register_streamer("Porch").await;
//!     viewer.register_viewer().await;
//!
//!     let send = camera.create_transport("send").await;
//!     camera.connect_transport(&send).await;
//!     let producer_id = camera.produce(&send, "video").await;
//!
//!     let announced = viewer.expect("new-producer").await;
//!     assert_eq!(announced["payload"]["producerId"], producer_id);
//! }
//! ```

pub mod fixtures;
pub mod mock_encoder;
pub mod mock_engine;

pub use fixtures::*;
pub use mock_encoder::*;
pub use mock_engine::*;
