pub mod discovery;
pub mod http_client;
pub mod probe_engine;
pub mod reporter;
pub mod routing;
pub mod scheduler;
pub mod types;

pub use discovery::AgentDiscovery;
pub use probe_engine::ProbeEngine;
pub use routing::{classify_link_type, RoutingAdapter};
pub use scheduler::MonitorScheduler;
pub use types::*;
