pub mod bus;
pub mod shared;
pub mod transport;

pub use bus::{BusConfig, EventBus, Subscription};
pub use shared::SharedBrokerRegistry;
pub use transport::{select_transport, RunMode, TransportKind, TransportOptions};
