pub mod config;
pub mod net;
pub mod peer;
pub mod seed;
pub mod types;

pub use config::{load_seed_directory, ConfigError, NodeConfig};
pub use net::{Message, WireError};
pub use peer::{PeerHandle, PeerShared};
pub use seed::SeedHandle;
pub use types::{majority, now, NodeError, NodeId};
