pub mod archive;
pub mod code;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod payload;
pub mod rendezvous;
pub mod session;
pub mod transit;

pub use error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Application namespace on the rendezvous server; both peers must agree on it.
pub const APP_ID: &str = "lothar.com/wormhole/text-or-file-xfer";

pub const DEFAULT_MAILBOX_URL: &str = "wss://relay.magic-wormhole.io:4000/v1";
