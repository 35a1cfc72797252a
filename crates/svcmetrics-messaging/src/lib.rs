pub mod error;
pub mod memory;
pub mod message;
pub mod observation;
pub mod publisher;
pub mod subscriber;
pub mod traits;

pub use error::{MessagingError, Result};
pub use memory::InMemoryBroker;
pub use message::{AckOutcome, InboundMessage, Message, MessageStream};
pub use observation::{MessageObservation, MessageOutcome};
pub use publisher::{PublisherMetrics, instrument_publisher};
pub use subscriber::{SubscriberMetrics, instrument_subscriber};
pub use traits::{Publisher, Subscriber};
