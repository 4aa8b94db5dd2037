//! Tower layers that sit between typed envelopes and byte-level senders.

mod json;
pub use json::{JsonLayer, JsonService};
