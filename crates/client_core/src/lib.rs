//! Client-side synchronization engine for a real-time chat service.
//!
//! A [`ChatSession`] owns one live connection to the message router and an
//! in-memory view of the user's conversations. Everything that mutates that
//! view runs on a single actor task; the application drives it through the
//! session handle and renders from the [`SessionEvent`] feed.

pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod outbound;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod side_channel;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{EngineConfig, ReconnectPolicy};
pub use connection::ConnectionStatus;
pub use delivery::DeliveryStatus;
pub use error::{ClientError, ClientResult};
pub use gateway::{AttachmentUpload, ComposeDraft, SendRoute};
pub use session::{ChatSession, Notice, SendReceipt, SessionEvent, SessionSnapshot};
pub use side_channel::{HttpMessageStore, MessageStore};
pub use transport::{Connection, Connector, WsConnector};
pub use types::{Attachment, Conversation, Message, MessageKey};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
