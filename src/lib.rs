pub mod admission;
pub mod cache;
pub mod command;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod downtime;
pub mod effects;
pub mod entitlement;
pub mod error;
pub mod handlers;
pub mod load_balancer;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod state;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use admission::{AdmissionDecision, AdmissionPipeline, AdmissionRequest, CommandClass, RejectKind};
pub use config::{AdmissionConfig, Args, BotConfig};
pub use dispatch::{Dispatcher, Handled};
pub use entitlement::{EntitlementResolver, EntitlementStore, UserEntitlement};
pub use rate_limit::SlidingWindowLimiter;
