use std::sync::Arc;
use std::time::Duration;

use crate::buffer::MediaBuffer;
use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::stream::Stream;

/// A container writer. Streams are declared up front, the header is written
/// once, then buffers are fed per stream index.
///
/// `write_header` and `write` return the muxed bytes for the caller to push
/// into the output stream; a muxer with integrated io returns `None` and
/// writes through the stream handed to `set_io_stream`.
pub trait Muxer: Send {
	fn init(&mut self) -> Result<()> {
		Ok(())
	}

	fn control(&mut self, request: u32, arg: crate::stage::ControlArg) -> Result<()> {
		let _ = (request, arg);
		Err(MediaError::Unimplemented)
	}

	/// Declares a new muxer stream from a stage config plus codec extradata;
	/// returns the stream index used for subsequent writes.
	fn new_stream(&mut self, config: &MediaConfig, extra_data: &[u8]) -> Result<usize>;

	fn set_io_stream(&mut self, output: Box<dyn Stream>) -> Result<()> {
		let _ = output;
		Err(MediaError::Unimplemented)
	}

	fn write_header(&mut self, index: usize) -> Result<Option<MediaBuffer>>;

	fn write(&mut self, buffer: &Arc<MediaBuffer>, index: usize) -> Result<Option<MediaBuffer>>;
}

/// A container reader: binds to an input stream, reports the discovered
/// config, then produces packet buffers until `Err(Eof)`.
pub trait Demuxer: Send {
	/// Some demuxers decode internally and emit raw frames.
	fn includes_decoder(&self) -> bool {
		false
	}

	fn init(&mut self, input: Box<dyn Stream>) -> Result<Option<MediaConfig>>;

	/// `request_size` of zero lets the demuxer pick its natural packet size.
	fn read(&mut self, request_size: usize) -> Result<MediaBuffer>;

	fn total_time(&self) -> Option<Duration> {
		None
	}
}
