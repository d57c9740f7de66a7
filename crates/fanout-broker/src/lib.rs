pub mod broker;
pub mod ports;
pub mod sse;
pub mod upstream;

pub use broker::{BrokerConfig, BrokerHandle, Port};
pub use upstream::{HttpUpstream, MockUpstream, Upstream, UpstreamEvent};
