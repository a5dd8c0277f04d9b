#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub type ChannelId = u64;

pub mod logging;
pub mod rendezvous;
pub mod secret;
