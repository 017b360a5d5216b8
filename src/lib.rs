//! Client side of the notification channel: a reconnecting websocket, a
//! message store reconciled against server pushes, and push-based
//! subscriptions for display code.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod protocol;
pub mod store;
pub mod transport;

pub use channel::Channel;
pub use config::ClientConfig;
pub use dispatch::{DisplaySubscriber, TagAction};
pub use error::{EndpointError, ProtocolError};
pub use message::Message;
pub use protocol::{Command, Envelope};
pub use store::{MessageStore, Snapshot};
pub use transport::{Backoff, FrameSink, Transport, TransportConfig, TransportEvent, TransportHandle};
