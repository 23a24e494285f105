//! Abstract stage contracts consumed by the flow engine.
//!
//! Stages are plain trait objects created through the registry; optional
//! entry points default to `Err(Unimplemented)` so wrappers can probe what a
//! concrete stage supports.

pub mod codec;
pub mod filter;
pub mod muxer;

use std::any::Any;
use std::io::SeekFrom;

use strum_macros::FromRepr;

use crate::buffer::MediaBuffer;
use crate::config::MediaConfig;
use crate::error::{MediaError, Result};

/// Control requests understood by the core. The numeric block leaves room
/// for device-private codes below it; unknown codes are passed through to
/// the wrapped stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum ControlRequest {
	/// Forward a device-private request.
	SubRequest = 10001,
	/// `ImageRect` payload: crop rectangle on the producer side.
	SourceRect,
	/// `ImageRect` payload: placement rectangle on a display sink.
	DestinationRect,
	/// `[ImageRect; 2]` payload: both rectangles at once.
	SrcDstRect,
	/// `ImageInfo` payload, filled by a display sink.
	GetPlaneImageInfo,
	/// `bool` payload, filled by a display sink.
	GetPlaneSupportScale,
	/// Stop producing without tearing down graph edges.
	StreamOff,
}

impl ControlRequest {
	pub fn code(&self) -> u32 {
		*self as u32
	}
}

/// Mutable, type-erased payload of a control request.
pub type ControlArg<'a> = &'a mut dyn Any;

/// A producer of media buffers (capture device, file reader, demuxer).
pub trait Source: Send {
	fn init(&mut self) -> Result<()> {
		Ok(())
	}

	fn config(&self) -> Option<&MediaConfig> {
		None
	}

	fn set_config(&mut self, config: MediaConfig) -> Result<()> {
		let _ = config;
		Err(MediaError::Unimplemented)
	}

	/// Produces the next buffer. `Err(Eof)` is the terminal condition for
	/// finite sources; long-lived sources block or return `Err(Again)`.
	fn read(&mut self) -> Result<MediaBuffer>;

	/// True once the source has no further data.
	fn eof(&self) -> bool {
		false
	}

	fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
		let _ = pos;
		Err(MediaError::Unimplemented)
	}

	fn tell(&mut self) -> Result<u64> {
		Err(MediaError::Unimplemented)
	}

	fn control(&mut self, request: u32, arg: ControlArg) -> Result<()> {
		let _ = (request, arg);
		Err(MediaError::Unimplemented)
	}
}
