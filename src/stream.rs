//! Byte streams backing sources and sinks (files here; ALSA/V4L2/DRM live
//! in device adapter crates and only implement this trait).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::buffer::{MediaBuffer, MemKind};
use crate::error::{MediaError, Result};
use crate::param::{keys, ParamMap};
use crate::stage::{ControlArg, ControlRequest, Source};

/// A byte stream with capability bits. `close` is idempotent; `eof` is the
/// poll used by source flows to detect end-of-stream.
pub trait Stream: Send {
	fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

	fn write(&mut self, buf: &[u8]) -> Result<usize>;

	fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
		let _ = pos;
		Err(MediaError::Unimplemented)
	}

	fn tell(&mut self) -> Result<u64> {
		Err(MediaError::Unimplemented)
	}

	fn close(&mut self) -> Result<()>;

	fn eof(&self) -> bool;

	fn readable(&self) -> bool {
		true
	}

	fn writeable(&self) -> bool {
		true
	}

	fn seekable(&self) -> bool {
		true
	}

	fn io_ctrl(&mut self, request: u32, arg: ControlArg) -> Result<()> {
		let _ = (request, arg);
		Err(MediaError::Unimplemented)
	}

	/// Reads the next chunk into a fresh media buffer. `Err(Eof)` once the
	/// stream is exhausted.
	fn read_buffer(&mut self, size: usize) -> Result<MediaBuffer> {
		if self.eof() {
			return Err(MediaError::Eof);
		}
		let mut buffer = MediaBuffer::alloc(size, MemKind::Common)?;
		let n = self.read(buffer.payload_mut())?;
		if n == 0 {
			return Err(MediaError::Eof);
		}
		buffer.set_valid_len(n);
		Ok(buffer)
	}
}

/// A file-backed stream. The open mode string follows fopen: `r` read, `w`
/// write+truncate, `a` append, `+` read and write.
pub struct FileStream {
	file: Option<File>,
	readable: bool,
	writeable: bool,
	eof: bool,
}

impl FileStream {
	pub fn open(params: &ParamMap) -> Result<FileStream> {
		let path = params
			.get(keys::PATH)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::PATH)))?;
		let mode = params
			.get(keys::OPEN_MODE)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::OPEN_MODE)))?;

		let read = mode.contains('r') || mode.contains('+');
		let write = mode.contains('w') || mode.contains('a') || mode.contains('+');
		if !read && !write {
			return Err(MediaError::invalid_param(format!("bad open mode '{mode}'")));
		}

		let mut options = OpenOptions::new();
		options.read(read).write(write);
		if mode.contains('w') {
			options.create(true).truncate(true);
		}
		if mode.contains('a') {
			options.create(true).append(true);
		}
		let file = options.open(path).map_err(|e| {
			tracing::error!("Failed to open '{path}': {e}");
			MediaError::Io(e)
		})?;

		Ok(FileStream {
			file: Some(file),
			readable: read,
			writeable: write,
			eof: false,
		})
	}
}

impl Stream for FileStream {
	fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
		if !self.readable {
			return Err(MediaError::invalid_param("stream is not readable"));
		}
		let Some(file) = &mut self.file else {
			return Err(MediaError::Eof);
		};
		let n = file.read(buf)?;
		if n == 0 && !buf.is_empty() {
			self.eof = true;
		}
		Ok(n)
	}

	fn write(&mut self, buf: &[u8]) -> Result<usize> {
		if !self.writeable {
			return Err(MediaError::invalid_param("stream is not writeable"));
		}
		let Some(file) = &mut self.file else {
			return Err(MediaError::Eof);
		};
		Ok(file.write(buf)?)
	}

	fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
		let Some(file) = &mut self.file else {
			return Err(MediaError::Eof);
		};
		let offset = file.seek(pos)?;
		self.eof = false;
		Ok(offset)
	}

	fn tell(&mut self) -> Result<u64> {
		let Some(file) = &mut self.file else {
			return Err(MediaError::Eof);
		};
		Ok(file.stream_position()?)
	}

	fn close(&mut self) -> Result<()> {
		// Dropping the handle closes it; a second close is a no-op.
		self.file.take();
		self.eof = true;
		Ok(())
	}

	fn eof(&self) -> bool {
		self.eof || self.file.is_none()
	}

	fn readable(&self) -> bool {
		self.readable
	}

	fn writeable(&self) -> bool {
		self.writeable
	}

	fn io_ctrl(&mut self, request: u32, _arg: ControlArg) -> Result<()> {
		match ControlRequest::from_repr(request) {
			Some(ControlRequest::StreamOff) => self.close(),
			_ => Err(MediaError::Unimplemented),
		}
	}
}

/// Adapts a readable stream into the engine's [`Source`] contract: each
/// `read` produces one buffer of up to `read_size` bytes.
pub struct StreamSource {
	stream: Box<dyn Stream>,
	read_size: usize,
}

impl StreamSource {
	pub fn new(stream: Box<dyn Stream>, read_size: usize) -> StreamSource {
		StreamSource { stream, read_size }
	}
}

impl Source for StreamSource {
	fn read(&mut self) -> Result<MediaBuffer> {
		self.stream.read_buffer(self.read_size)
	}

	fn eof(&self) -> bool {
		self.stream.eof()
	}

	fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
		if !self.stream.seekable() {
			return Err(MediaError::Unimplemented);
		}
		self.stream.seek(pos)
	}

	fn tell(&mut self) -> Result<u64> {
		self.stream.tell()
	}

	fn control(&mut self, request: u32, arg: ControlArg) -> Result<()> {
		self.stream.io_ctrl(request, arg)
	}
}

/// Factory constructor for `file_read_stream`.
pub(crate) fn file_read_stream(params: &ParamMap) -> Result<Box<dyn Stream>> {
	let mut stream = FileStream::open(params)?;
	stream.writeable = false;
	Ok(Box::new(stream))
}

/// Factory constructor for `file_write_stream`.
pub(crate) fn file_write_stream(params: &ParamMap) -> Result<Box<dyn Stream>> {
	let mut stream = FileStream::open(params)?;
	stream.readable = false;
	Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn params_for(path: &std::path::Path, mode: &str) -> ParamMap {
		let mut params = ParamMap::new();
		params.set(keys::PATH, path.to_str().unwrap());
		params.set(keys::OPEN_MODE, mode);
		params
	}

	#[test]
	fn write_then_read_back() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.bin");

		let mut writer = FileStream::open(&params_for(&path, "w")).unwrap();
		assert!(!writer.readable());
		assert_eq!(writer.write(b"abcdef").unwrap(), 6);
		writer.close().unwrap();

		let mut reader = FileStream::open(&params_for(&path, "r")).unwrap();
		assert!(!reader.writeable());
		let mut buf = [0u8; 16];
		assert_eq!(reader.read(&mut buf).unwrap(), 6);
		assert_eq!(&buf[..6], b"abcdef");
		assert!(!reader.eof());
		assert_eq!(reader.read(&mut buf).unwrap(), 0);
		assert!(reader.eof());
	}

	#[test]
	fn seek_and_tell() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.bin");
		std::fs::write(&path, b"0123456789").unwrap();

		let mut stream = FileStream::open(&params_for(&path, "r")).unwrap();
		assert_eq!(stream.seek(SeekFrom::Start(4)).unwrap(), 4);
		assert_eq!(stream.tell().unwrap(), 4);
		let mut buf = [0u8; 2];
		stream.read(&mut buf).unwrap();
		assert_eq!(&buf, b"45");
	}

	#[test]
	fn close_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.bin");
		std::fs::write(&path, b"x").unwrap();

		let mut stream = FileStream::open(&params_for(&path, "r")).unwrap();
		stream.close().unwrap();
		stream.close().unwrap();
		assert!(stream.eof());
	}

	#[test]
	fn stream_source_adapts_a_stream() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.bin");
		std::fs::write(&path, b"abcdef").unwrap();

		let stream = file_read_stream(&params_for(&path, "r")).unwrap();
		let mut source = StreamSource::new(stream, 4);
		assert_eq!(source.read().unwrap().valid_data(), b"abcd");
		assert_eq!(source.read().unwrap().valid_data(), b"ef");
		assert!(matches!(source.read(), Err(MediaError::Eof)));
		assert!(source.eof());

		// Seeking clears the EOF state and resumes producing.
		source.seek(SeekFrom::Start(0)).unwrap();
		assert!(!source.eof());
		assert_eq!(source.tell().unwrap(), 0);
		assert_eq!(source.read().unwrap().valid_data(), b"abcd");
	}

	#[test]
	fn read_buffer_reports_eof() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.bin");
		std::fs::write(&path, b"abc").unwrap();

		let mut stream = FileStream::open(&params_for(&path, "r")).unwrap();
		let buffer = stream.read_buffer(8).unwrap();
		assert_eq!(buffer.valid_data(), b"abc");
		assert!(matches!(stream.read_buffer(8), Err(MediaError::Eof)));
	}
}
