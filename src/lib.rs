//! Edge worker node for the Iris distributed video analytics platform
//!
//! A node acquires RTSP camera streams, decodes them into JPEG frames with
//! hardware acceleration when available, publishes frames and detections on
//! an embedded message broker, keeps a crash-safe at-least-once event queue
//! on local disk, and manages its own lifecycle (registration, heartbeat,
//! configuration sync, VPN provisioning) against a central coordinator.

pub mod broker;
pub mod config;
pub mod decoder;
pub mod forwarder;
pub mod hardware;
pub mod mjpeg;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod service;

// Re-exports for convenience
pub use broker::{Broker, BrokerClient, BrokerServer, BrokerStats, Subscription};
pub use config::{CameraSpec, ConfigStore, NodeConfig, NodeState};
pub use decoder::{Decoder, DecoderConfig, DecoderStats, Frame};
pub use forwarder::{CentralForwarder, ForwarderStats};
pub use hardware::{Backend, Capabilities, HardwareType};
pub use pipeline::StreamPipeline;
pub use platform::PlatformAgent;
pub use queue::{Event, EventQueue, EventSender, EventStatus, EventType};
