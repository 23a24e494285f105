use std::sync::Arc;

use crate::buffer::MediaBuffer;
use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::stage::ControlArg;

/// An in-place or out-of-place transform over typed buffers. Same contract
/// shape as [`Codec`](crate::stage::codec::Codec): sync `process`, or the
/// async pair for filters that buffer internally (a filter may emit several
/// buffers for one input).
pub trait Filter: Send {
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

	/// Synchronous transform into a caller-allocated output buffer.
	fn process(&mut self, input: &Arc<MediaBuffer>, output: &mut MediaBuffer) -> Result<()> {
		let _ = (input, output);
		Err(MediaError::Unimplemented)
	}

	/// `None` is the sync-detection probe; async filters must accept it.
	fn send_input(&mut self, input: Option<Arc<MediaBuffer>>) -> Result<()> {
		let _ = input;
		Err(MediaError::Unimplemented)
	}

	fn fetch_output(&mut self) -> Result<Arc<MediaBuffer>> {
		Err(MediaError::Unimplemented)
	}

	fn control(&mut self, request: u32, arg: ControlArg) -> Result<()> {
		let _ = (request, arg);
		Err(MediaError::Unimplemented)
	}
}

/// Probes whether a filter supports the asynchronous contract.
pub fn supports_async(filter: &mut dyn Filter) -> bool {
	!matches!(filter.send_input(None), Err(MediaError::Unimplemented))
}
