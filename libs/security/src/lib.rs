//! Security helpers shared by the hookgram gateway and core crates.

mod hash;
pub mod oauth1;

pub use hash::{compact_hash, constant_time_eq, keyed_hash, telegram_webhook_secret};
