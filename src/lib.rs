//! Streaming media pipeline core.
//!
//! Producers feed shared [`buffer::MediaBuffer`]s through a graph of
//! [`flow::Flow`] nodes into sinks. Stages are created by name through the
//! [`registry`], wired with `add_down`, and scheduled per-flow: in the
//! caller's thread (sync), on a worker with a bounded FIFO and
//! backpressure (async common), or on a periodic worker with a
//! latest-wins cell (async atomic).

pub mod buffer;
pub mod config;
pub mod error;
pub mod flow;
pub mod image;
pub mod media_type;
pub mod param;
pub mod registry;
pub mod sound;
pub mod stage;
pub mod stream;

pub use buffer::{ImageBuffer, MediaBuffer, MemKind, SampleBuffer};
pub use config::MediaConfig;
pub use error::{MediaError, Result};
pub use flow::{Flow, FlowCore, FullPolicy, Model, SlotMap};
pub use media_type::MediaType;
pub use param::ParamMap;
pub use registry::{Registry, StageKind};
