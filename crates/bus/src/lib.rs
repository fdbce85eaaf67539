//! Message bus connecting job submission to the dispatcher.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{BusError, MessageBus, Subscription};
pub use in_memory_bus::InMemoryMessageBus;
