//! Chat-bot front end: transports feed the message bus, the bridge runs
//! turns and publishes replies.

pub mod bridge;
pub mod utils;

pub mod channels {
    #[cfg(feature = "telegram")]
    pub mod telegram;
}

pub use bridge::{ChatBridge, ChatThreads};
