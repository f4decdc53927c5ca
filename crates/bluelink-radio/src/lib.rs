// Radio abstraction and per-peer link lifecycle: discovery scanning,
// connection state machine, and the adapter/link traits a platform radio
// backend implements.

pub mod adapter;
pub mod connection;
pub mod error;
pub mod loopback;
pub mod scanner;
pub mod signal;

pub use adapter::{Advertisement, RadioAdapter, RadioLink};
pub use connection::{ConnectionManager, LinkState};
pub use error::{ConnectionError, DiscoveryError};
pub use scanner::{DiscoveredPeer, DiscoveryScanner};
pub use signal::signal_strength;
