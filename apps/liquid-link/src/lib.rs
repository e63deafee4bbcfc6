pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod signaling;

pub use config::{IceServer, LinkConfig};
pub use error::LinkError;
pub use protocol::PeerRole;
pub use session::SignalingSession;
