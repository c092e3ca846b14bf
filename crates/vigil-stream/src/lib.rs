//! Wire schema and incremental decoder for supervised coding-agent output.
//!
//! The agent subprocess emits newline-delimited JSON records through a
//! terminal layer that injects carriage returns and can split or wrap
//! records arbitrarily. This crate turns that byte stream back into
//! discrete, strongly-typed messages.

pub mod decoder;
pub mod message;

pub use decoder::{DecoderItem, StreamDecoder, MAX_BUFFER_BYTES};
pub use message::{AgentMessage, CacheTokenUsage, StepTokenUsage};
