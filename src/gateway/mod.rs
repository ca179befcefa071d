//! Export gateway
//!
//! ```text
//! alarms:processed ─▶ EventSubscriber ─▶ worker queue ─▶ GatewayDispatcher
//!                                                           │
//!                         TargetRegistry (snapshot swap) ◀──┤
//!                         TargetRunner ─ FailureProtector ──┴▶ HTTP/S3/FILE/MQTT
//! ```

pub mod context;
pub mod handlers;
pub mod heartbeat;
pub mod protector;
pub mod registry;
pub mod runner;
pub mod service;
pub mod subscriber;
pub mod template;

pub use context::GatewayContext;
pub use handlers::{TargetHandler, TargetHandlerFactory};
pub use heartbeat::HeartbeatService;
pub use protector::{FailureProtector, ProtectorConfig, ProtectorState};
pub use registry::TargetRegistry;
pub use runner::{GatewayStats, TargetRunner};
pub use service::{GatewayDispatcher, GatewayService};
pub use subscriber::{EventDispatcher, EventSubscriber, SubscriberConfig};
