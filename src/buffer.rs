//! Shared-ownership media buffers.
//!
//! A buffer is built mutably by its producer (payload filled, metadata set),
//! then frozen into an `Arc<MediaBuffer>` to travel along graph edges. The
//! payload is released exactly once when the last reference drops, by the
//! deleter stored at allocation time. Typed views (`ImageBuffer`,
//! `SampleBuffer`) share the underlying buffer's lifetime.

use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::error::{MediaError, Result};
use crate::image::ImageInfo;
use crate::media_type::MediaType;
use crate::sound::SampleInfo;

/// Per-codec hint flags carried in the user-flag bitset.
pub mod flags {
	/// The buffer holds a keyframe / intra frame.
	pub const KEY_FRAME: u32 = 1 << 0;
	/// The buffer holds codec extradata (SPS/PPS and friends).
	pub const EXTRA_INTRA: u32 = 1 << 1;
	/// The buffer holds exactly one NAL unit.
	pub const SINGLE_NAL_UNIT: u32 = 1 << 2;
}

/// Backing memory of a buffer payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemKind {
	#[default]
	Common,
	/// Fd-backed mapping that can be shared with hardware.
	Hardware,
}

impl MemKind {
	/// Parses the `mem_type` parameter value, falling back to `Common` for
	/// memory kinds this build does not integrate.
	pub fn from_param(value: &str) -> MemKind {
		match value {
			"hardware" => MemKind::Hardware,
			"common" => MemKind::Common,
			other => {
				tracing::warn!("Memory type '{other}' is not integrated, falling back to common.");
				MemKind::Common
			},
		}
	}
}

type Deleter = Box<dyn FnOnce() + Send>;

/// The owned payload region. The pointer is stable for the payload's
/// lifetime; the deleter runs exactly once, on drop.
struct Payload {
	ptr: *mut u8,
	len: usize,
	fd: Option<RawFd>,
	deleter: Option<Deleter>,
}

// The region is exclusively owned by this Payload and only mutated through
// `&mut MediaBuffer`, which cannot exist once the buffer is shared.
unsafe impl Send for Payload {}
unsafe impl Sync for Payload {}

impl Drop for Payload {
	fn drop(&mut self) {
		if let Some(deleter) = self.deleter.take() {
			deleter();
		}
	}
}

fn alloc_common(size: usize) -> Result<Payload> {
	// calloc, so handing out an initialized payload slice is sound.
	let ptr = unsafe { libc::calloc(1, size) } as *mut u8;
	if ptr.is_null() {
		return Err(MediaError::OutOfMemory);
	}
	let addr = ptr as usize;
	Ok(Payload {
		ptr,
		len: size,
		fd: None,
		deleter: Some(Box::new(move || unsafe {
			libc::free(addr as *mut libc::c_void);
		})),
	})
}

fn alloc_hardware(size: usize) -> Result<Payload> {
	let fd = unsafe { libc::memfd_create(c"mediaflow".as_ptr(), 0) };
	if fd < 0 {
		tracing::error!(
			"memfd_create failed: {}",
			std::io::Error::last_os_error()
		);
		return Err(MediaError::OutOfMemory);
	}
	if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
		tracing::error!("ftruncate failed: {}", std::io::Error::last_os_error());
		unsafe { libc::close(fd) };
		return Err(MediaError::OutOfMemory);
	}
	let ptr = unsafe {
		libc::mmap(
			ptr::null_mut(),
			size,
			libc::PROT_READ | libc::PROT_WRITE,
			libc::MAP_SHARED,
			fd,
			0,
		)
	};
	if ptr == libc::MAP_FAILED {
		tracing::error!("mmap failed: {}", std::io::Error::last_os_error());
		unsafe { libc::close(fd) };
		return Err(MediaError::OutOfMemory);
	}
	let addr = ptr as usize;
	Ok(Payload {
		ptr: ptr as *mut u8,
		len: size,
		fd: Some(fd),
		deleter: Some(Box::new(move || unsafe {
			libc::munmap(addr as *mut libc::c_void, size);
			libc::close(fd);
		})),
	})
}

/// A reference-counted data container with metadata and typed views.
pub struct MediaBuffer {
	payload: Payload,
	valid_len: usize,
	timestamp_us: i64,
	user_flags: u32,
	eof: bool,
	media_type: MediaType,
	image_info: Option<ImageInfo>,
	sample_info: Option<SampleInfo>,
}

impl MediaBuffer {
	/// Allocates a zeroed payload of `size` bytes. `Hardware` payloads are
	/// backed by a sharable file descriptor.
	pub fn alloc(size: usize, kind: MemKind) -> Result<MediaBuffer> {
		if size == 0 {
			return Err(MediaError::invalid_param("zero-size allocation"));
		}
		let payload = match kind {
			MemKind::Common => alloc_common(size)?,
			MemKind::Hardware => alloc_hardware(size)?,
		};
		Ok(Self::with_payload(payload))
	}

	/// Adopts an externally owned region. The deleter is called exactly once
	/// when the last reference drops.
	///
	/// # Safety
	///
	/// `[ptr, ptr + len)` must be valid for reads and writes and must stay
	/// valid until `deleter` runs; nothing else may access the region while
	/// the buffer is alive. The deleter must not panic.
	pub unsafe fn wrap(
		ptr: *mut u8,
		len: usize,
		fd: Option<RawFd>,
		deleter: impl FnOnce() + Send + 'static,
	) -> MediaBuffer {
		Self::with_payload(Payload {
			ptr,
			len,
			fd,
			deleter: Some(Box::new(deleter)),
		})
	}

	/// Takes ownership of a `Vec`, making its full length valid payload.
	pub fn from_vec(data: Vec<u8>) -> MediaBuffer {
		struct Region(*mut [u8]);
		unsafe impl Send for Region {}

		let len = data.len();
		let mut boxed = data.into_boxed_slice();
		let ptr = boxed.as_mut_ptr();
		let region = Region(Box::into_raw(boxed));
		let mut buffer = unsafe {
			Self::wrap(ptr, len, None, move || {
				let region = region;
				drop(unsafe { Box::from_raw(region.0) });
			})
		};
		buffer.valid_len = len;
		buffer
	}

	fn with_payload(payload: Payload) -> MediaBuffer {
		MediaBuffer {
			payload,
			valid_len: 0,
			timestamp_us: 0,
			user_flags: 0,
			eof: false,
			media_type: MediaType::None,
			image_info: None,
			sample_info: None,
		}
	}

	/// Deep copy of the valid region, with attributes. Fails with
	/// `InvalidParam` when there is nothing valid to copy.
	pub fn clone_buffer(&self, kind: MemKind) -> Result<MediaBuffer> {
		if self.valid_len == 0 {
			return Err(MediaError::invalid_param("clone of empty buffer"));
		}
		let mut dst = Self::alloc(self.valid_len, kind)?;
		dst.payload_mut()[..self.valid_len].copy_from_slice(self.valid_data());
		dst.copy_attributes(self);
		Ok(dst)
	}

	/// Copies valid length, content type, user flags, timestamp and the EOF
	/// marker from `src`.
	pub fn copy_attributes(&mut self, src: &MediaBuffer) {
		self.valid_len = src.valid_len.min(self.payload.len);
		self.media_type = src.media_type;
		self.user_flags = src.user_flags;
		self.timestamp_us = src.timestamp_us;
		self.eof = src.eof;
	}

	pub fn len(&self) -> usize {
		self.payload.len
	}

	pub fn is_empty(&self) -> bool {
		self.payload.len == 0
	}

	pub fn fd(&self) -> Option<RawFd> {
		self.payload.fd
	}

	pub fn payload(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.payload.ptr, self.payload.len) }
	}

	pub fn payload_mut(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.payload.ptr, self.payload.len) }
	}

	/// The prefix of the payload that carries valid data.
	pub fn valid_data(&self) -> &[u8] {
		&self.payload()[..self.valid_len]
	}

	pub fn valid_len(&self) -> usize {
		self.valid_len
	}

	pub fn set_valid_len(&mut self, len: usize) {
		assert!(len <= self.payload.len, "valid length exceeds payload length");
		self.valid_len = len;
	}

	/// True when the buffer carries data. An EOF buffer may be invalid.
	pub fn is_valid(&self) -> bool {
		self.valid_len > 0
	}

	pub fn timestamp_us(&self) -> i64 {
		self.timestamp_us
	}

	pub fn set_timestamp_us(&mut self, timestamp_us: i64) {
		self.timestamp_us = timestamp_us;
	}

	pub fn user_flags(&self) -> u32 {
		self.user_flags
	}

	pub fn set_user_flags(&mut self, flags: u32) {
		self.user_flags = flags;
	}

	pub fn has_user_flag(&self, flag: u32) -> bool {
		self.user_flags & flag != 0
	}

	pub fn is_eof(&self) -> bool {
		self.eof
	}

	pub fn set_eof(&mut self, eof: bool) {
		self.eof = eof;
	}

	pub fn media_type(&self) -> MediaType {
		self.media_type
	}

	pub fn set_media_type(&mut self, media_type: MediaType) {
		self.media_type = media_type;
	}

	/// Tags the buffer as an image so downstream stages can recover the view.
	pub fn set_image_info(&mut self, info: ImageInfo) {
		self.media_type = MediaType::Image;
		self.image_info = Some(info);
	}

	pub fn image_info(&self) -> Option<&ImageInfo> {
		self.image_info.as_ref()
	}

	pub fn set_sample_info(&mut self, info: SampleInfo) {
		self.media_type = MediaType::Audio;
		self.sample_info = Some(info);
	}

	pub fn sample_info(&self) -> Option<&SampleInfo> {
		self.sample_info.as_ref()
	}

	/// Constructs an image view sharing this buffer.
	pub fn as_image(self: &Arc<Self>, info: ImageInfo) -> Result<ImageBuffer> {
		ImageBuffer::new(self.clone(), info)
	}

	/// Constructs a sample view sharing this buffer.
	pub fn as_sample(self: &Arc<Self>, info: SampleInfo) -> Result<SampleBuffer> {
		SampleBuffer::new(self.clone(), info)
	}
}

impl std::fmt::Debug for MediaBuffer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MediaBuffer")
			.field("len", &self.payload.len)
			.field("valid_len", &self.valid_len)
			.field("fd", &self.payload.fd)
			.field("timestamp_us", &self.timestamp_us)
			.field("user_flags", &self.user_flags)
			.field("eof", &self.eof)
			.field("media_type", &self.media_type)
			.finish()
	}
}

/// A typed image reinterpretation sharing the underlying buffer.
#[derive(Clone, Debug)]
pub struct ImageBuffer {
	buffer: Arc<MediaBuffer>,
	info: ImageInfo,
}

impl ImageBuffer {
	pub fn new(buffer: Arc<MediaBuffer>, info: ImageInfo) -> Result<ImageBuffer> {
		if !info.is_valid() {
			return Err(MediaError::invalid_param(format!(
				"image stride {}x{} smaller than {}x{}",
				info.vir_width, info.vir_height, info.width, info.height
			)));
		}
		Ok(ImageBuffer { buffer, info })
	}

	/// Recovers the view from a buffer tagged by `set_image_info`.
	pub fn from_tagged(buffer: &Arc<MediaBuffer>) -> Option<ImageBuffer> {
		let info = *buffer.image_info()?;
		Some(ImageBuffer { buffer: buffer.clone(), info })
	}

	pub fn buffer(&self) -> &Arc<MediaBuffer> {
		&self.buffer
	}

	pub fn info(&self) -> &ImageInfo {
		&self.info
	}

	pub fn width(&self) -> u32 {
		self.info.width
	}

	pub fn height(&self) -> u32 {
		self.info.height
	}

	pub fn vir_width(&self) -> u32 {
		self.info.vir_width
	}

	pub fn vir_height(&self) -> u32 {
		self.info.vir_height
	}

	pub fn pixel_format(&self) -> crate::image::PixelFormat {
		self.info.pix_fmt
	}
}

impl Deref for ImageBuffer {
	type Target = MediaBuffer;

	fn deref(&self) -> &MediaBuffer {
		&self.buffer
	}
}

/// A typed audio reinterpretation sharing the underlying buffer.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
	buffer: Arc<MediaBuffer>,
	info: SampleInfo,
}

impl SampleBuffer {
	pub fn new(buffer: Arc<MediaBuffer>, info: SampleInfo) -> Result<SampleBuffer> {
		if !info.is_valid() {
			return Err(MediaError::invalid_param(format!(
				"bad sample layout: {} channels at {} Hz",
				info.channels, info.sample_rate
			)));
		}
		Ok(SampleBuffer { buffer, info })
	}

	pub fn from_tagged(buffer: &Arc<MediaBuffer>) -> Option<SampleBuffer> {
		let info = *buffer.sample_info()?;
		Some(SampleBuffer { buffer: buffer.clone(), info })
	}

	pub fn buffer(&self) -> &Arc<MediaBuffer> {
		&self.buffer
	}

	pub fn info(&self) -> &SampleInfo {
		&self.info
	}

	pub fn frames(&self) -> u32 {
		self.info.frames
	}
}

impl Deref for SampleBuffer {
	type Target = MediaBuffer;

	fn deref(&self) -> &MediaBuffer {
		&self.buffer
	}
}

/// Microseconds since the first call in this process; the timestamp source
/// for buffers produced by the built-in sources.
pub fn monotonic_us() -> i64 {
	static EPOCH: OnceLock<Instant> = OnceLock::new();
	EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::image::PixelFormat;

	#[test]
	fn alloc_postconditions() {
		let buffer = MediaBuffer::alloc(4096, MemKind::Common).unwrap();
		assert_eq!(buffer.len(), 4096);
		assert_eq!(buffer.valid_len(), 0);
		assert_eq!(buffer.timestamp_us(), 0);
		assert_eq!(buffer.user_flags(), 0);
		assert!(!buffer.is_eof());
		assert!(buffer.fd().is_none());
	}

	#[test]
	fn hardware_alloc_is_fd_backed() {
		let mut buffer = MediaBuffer::alloc(4096, MemKind::Hardware).unwrap();
		assert!(buffer.fd().is_some());
		buffer.payload_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
		buffer.set_valid_len(4);
		assert_eq!(buffer.valid_data(), &[1, 2, 3, 4]);
	}

	#[test]
	fn zero_size_alloc_is_rejected() {
		assert!(matches!(
			MediaBuffer::alloc(0, MemKind::Common),
			Err(MediaError::InvalidParam(_))
		));
	}

	#[test]
	fn wrap_runs_deleter_exactly_once() {
		static DROPS: AtomicUsize = AtomicUsize::new(0);
		let mut region = Box::new([0u8; 16]);
		let ptr = region.as_mut_ptr();
		let raw = Box::into_raw(region) as usize;
		let buffer = unsafe {
			MediaBuffer::wrap(ptr, 16, None, move || {
				DROPS.fetch_add(1, Ordering::SeqCst);
				drop(unsafe { Box::from_raw(raw as *mut [u8; 16]) });
			})
		};
		let shared = Arc::new(buffer);
		let other = shared.clone();
		drop(shared);
		assert_eq!(DROPS.load(Ordering::SeqCst), 0);
		drop(other);
		assert_eq!(DROPS.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn clone_copies_bytes_and_attributes() {
		let mut src = MediaBuffer::from_vec(vec![9, 8, 7, 6]);
		src.set_timestamp_us(42);
		src.set_user_flags(flags::KEY_FRAME);
		src.set_eof(true);
		src.set_media_type(MediaType::Video);

		let copy = src.clone_buffer(MemKind::Common).unwrap();
		assert_eq!(copy.valid_data(), &[9, 8, 7, 6]);
		assert_eq!(copy.timestamp_us(), 42);
		assert!(copy.has_user_flag(flags::KEY_FRAME));
		assert!(copy.is_eof());
		assert_eq!(copy.media_type(), MediaType::Video);

		let empty = MediaBuffer::alloc(8, MemKind::Common).unwrap();
		assert!(empty.clone_buffer(MemKind::Common).is_err());
	}

	#[test]
	fn image_view_shares_and_validates() {
		let mut buffer = MediaBuffer::alloc(1920 * 1088 * 3 / 2, MemKind::Common).unwrap();
		let info = ImageInfo::new(PixelFormat::Nv12, 1920, 1080);
		buffer.set_image_info(info);
		let shared = Arc::new(buffer);

		let view = ImageBuffer::from_tagged(&shared).unwrap();
		assert_eq!(view.width(), 1920);
		assert_eq!(view.vir_height(), 1088);
		assert_eq!(view.len(), shared.len());
		assert_eq!(Arc::strong_count(&shared), 2);

		let mut bad = info;
		bad.vir_width = 100;
		assert!(shared.as_image(bad).is_err());
	}
}
