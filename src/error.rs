use std::io;

/// Error kinds surfaced by the pipeline core.
///
/// `Again` and `Eof` are flow-control signals rather than failures: `Again`
/// asks the caller to retry after backpressure clears, `Eof` marks a terminal
/// stream condition and is always forwarded, never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
	#[error("no factory named '{0}'")]
	NotFound(String),

	#[error("invalid parameter: {0}")]
	InvalidParam(String),

	#[error("allocation refused")]
	OutOfMemory,

	#[error("resource temporarily unavailable")]
	Again,

	#[error("end of stream")]
	Eof,

	#[error("i/o error: {0}")]
	Io(#[from] io::Error),

	#[error("entry point not implemented")]
	Unimplemented,
}

impl MediaError {
	pub fn invalid_param(message: impl Into<String>) -> Self {
		MediaError::InvalidParam(message.into())
	}

	pub fn is_again(&self) -> bool {
		matches!(self, MediaError::Again)
	}

	pub fn is_eof(&self) -> bool {
		matches!(self, MediaError::Eof)
	}

	pub fn is_unimplemented(&self) -> bool {
		matches!(self, MediaError::Unimplemented)
	}
}

pub type Result<T> = std::result::Result<T, MediaError>;
