//! Desired-state snapshots and how they reach the agent: the descriptor
//! data model, the long-poll HTTP client, and the event-bus watcher.

pub mod client;
pub mod descriptor;
pub mod watcher;

pub use client::{DescriptorSource, MetadataClient};
pub use descriptor::Descriptor;
pub use watcher::{MetadataWatcher, DESCRIPTOR_EVENT};
