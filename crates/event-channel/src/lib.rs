pub mod channel;
pub mod error;
pub mod event;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use channel::{Delivery, EventChannel, Subscription};
pub use error::{ChannelError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaChannelConfig, KafkaEventChannel, KafkaSubscription};
pub use memory::InMemoryEventChannel;
