pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod logging;
pub mod peer;
pub mod process;
pub mod utilities;
pub mod view;

pub use broadcast::{BroadcastId, Message, Payload, SessionState};
pub use config::DbrbConfig;
pub use crypto::Keypair;
pub use peer::ProcessId;
pub use process::runner::{mailbox, DbrbCommand, DbrbHandle};
pub use process::{DbrbError, DbrbProcess, MessageSender, SessionStore};
pub use view::{ViewData, ViewFetcher};
