pub mod config;
pub mod cryptography;
pub mod hops;
pub mod networking;
pub mod relay;
pub mod rps;
pub mod tunnel;
pub mod wire;

pub const HOSTKEY_SIZE: usize = 32;
pub const FINGERPRINT_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 4;
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;
pub const SEAL_OVERHEAD: usize = HOSTKEY_SIZE + 16;

/// Module type tag the peer sampling service uses for onion relays in its portmap.
pub const ONION_MODULE_TYPE: u16 = 560;

pub const DEFAULT_RPS_ADDR: &str = "127.0.0.1:7101";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MINIMUM_HOPS: usize = 2;
