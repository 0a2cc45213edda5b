pub mod monitor;
pub mod probe;
pub mod queue;
pub mod rtp;
pub mod sip;
pub mod types;

pub use monitor::PhoneQualityMonitor;
pub use queue::ResponseQueue;
pub use types::*;
