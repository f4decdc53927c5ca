/// Protocol version string exchanged during pairing
pub const PROTOCOL_VERSION: &str = "/bluelink/1.0.0";

/// Application name
pub const APP_NAME: &str = "BlueLink";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric session key size in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Default file chunk size in bytes (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Default discovery scan window in seconds
pub const DEFAULT_SCAN_WINDOW_SECS: u64 = 10;

/// Connection attempt timeout in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Number of automatic retries after a failed connection attempt
pub const CONNECT_RETRIES: u32 = 1;

/// Pairing exchange timeout in seconds
pub const PAIRING_TIMEOUT_SECS: u64 = 30;

/// Number of public-key digest bytes used for the fingerprint
pub const FINGERPRINT_BYTES: usize = 8;

/// Number of digits in the pairing verification PIN
pub const PIN_DIGITS: usize = 6;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SESSION_KEY: &str = "bluelink-session-key-v1";
pub const KDF_CONTEXT_FINGERPRINT: &str = "bluelink-fingerprint-v1";
