use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Radio adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("A scan is already running on this adapter")]
    AlreadyScanning,
}

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Connection failed after retry: {0}")]
    Failed(String),

    #[error("Connection lost")]
    Lost,

    #[error("No open link to peer")]
    NotConnected,
}
