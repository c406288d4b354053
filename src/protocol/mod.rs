//! Protocol module for encoding commands and interpreting notifications.
//!
//! This module contains the implementations for:
//! - The 2-byte command, 9-byte init token and status frame codecs
//! - Notification classification and stale-status filtering

pub mod classifier;
pub mod codec;

pub use classifier::{classify, Confirmation, FilterDecision, Notification, StaleFilter};
pub use codec::{
    decode_status, encode_command, is_confirmation, select_init_token, Command, InitToken, Level,
    TokenSelection, TokenSource,
};
