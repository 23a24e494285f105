//! `video_dec` and `video_enc`: wrapper flows hosting a codec.
//!
//! Async codecs get the send/fetch treatment with `Again` retries that never
//! drop the input; sync-only codecs (detected by the probe) are downgraded
//! to in-transaction `process` calls.

use std::sync::{Arc, Mutex};

use crate::buffer::{flags, MediaBuffer, MemKind};
use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::param::{keys, ParamMap};
use crate::registry::{self, StageKind};
use crate::stage::codec::{supports_async, Codec};

use super::{BufferSlot, Flow, FlowCore, FullPolicy, Model, SlotMap, ADMISSION_POLL};

/// Feeds an async codec, sleeping through `Again` without dropping the
/// input. Gives up only when the flow shuts down or the codec fails hard.
fn send_with_retry(codec: &mut dyn Codec, input: &Arc<MediaBuffer>, core: &FlowCore) -> Result<()> {
	loop {
		match codec.send_input(Some(input.clone())) {
			Ok(()) => return Ok(()),
			Err(MediaError::Again) => {
				if !core.is_enabled() || core.should_quit() {
					return Err(MediaError::Eof);
				}
				std::thread::sleep(ADMISSION_POLL);
			},
			Err(e) => return Err(e),
		}
	}
}

/// Drains an async codec into an output slot. Returns (emitted anything,
/// saw an EOF-flagged buffer).
fn drain_outputs(codec: &mut dyn Codec, core: &FlowCore, out_slot: usize) -> (bool, bool) {
	let mut any = false;
	let mut saw_eof = false;
	loop {
		match codec.fetch_output() {
			Ok(buffer) => {
				saw_eof |= buffer.is_eof();
				let _ = core.set_output(Some(buffer), out_slot);
				any = true;
			},
			Err(MediaError::Again) => break,
			Err(MediaError::Eof) => {
				emit_eof(core, out_slot);
				any = true;
				saw_eof = true;
				break;
			},
			Err(e) => {
				tracing::error!("{}: fetch_output failed: {e}", core.name());
				break;
			},
		}
	}
	(any, saw_eof)
}

fn emit_eof(core: &FlowCore, out_slot: usize) {
	let mut tail = MediaBuffer::from_vec(Vec::new());
	tail.set_eof(true);
	let _ = core.set_output(Some(Arc::new(tail)), out_slot);
}

/// Worst-case output payload for the sync path, from the codec config.
fn sync_output_size(config: Option<&MediaConfig>) -> Option<usize> {
	match config? {
		MediaConfig::Image(cfg) => Some(cfg.image_info.buffer_size()),
		MediaConfig::Video(cfg) => Some(cfg.image_cfg.image_info.buffer_size()),
		MediaConfig::Audio(cfg) => Some(cfg.sample_info.buffer_size().max(4096)),
	}
}

pub(crate) fn video_decoder_flow(param: &str) -> Result<Arc<Flow>> {
	let parts = ParamMap::parse_list(param, ' ');
	if parts.len() != 2 {
		return Err(MediaError::invalid_param(
			"video_dec expects '<flow params> <codec params>'",
		));
	}
	let params = ParamMap::parse(&parts[0]);
	let name = params
		.get(keys::NAME)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::NAME)))?;
	let codec = registry::global().create_codec(name, &parts[1])?;
	video_decoder_flow_with_codec(codec, &params)
}

/// Builds a decoder flow around an already-constructed codec. Public so
/// adapter crates (and tests) can wire codecs without registry entries.
pub fn video_decoder_flow_with_codec(
	mut codec: Box<dyn Codec>,
	params: &ParamMap,
) -> Result<Arc<Flow>> {
	codec.init()?;
	let support_async = supports_async(codec.as_mut());
	let output_size = sync_output_size(codec.config());
	if !support_async && output_size.is_none() {
		return Err(MediaError::invalid_param(
			"sync codec without a config to size outputs from",
		));
	}

	let codec = Mutex::new(codec);
	let slot_map = SlotMap::new()
		.input(0)
		.output(0)
		.transaction(Box::new(move |core: &FlowCore, inputs: &mut [BufferSlot]| {
			let Some(input) = inputs[0].take() else {
				return false;
			};
			let mut codec = codec.lock().unwrap();
			if support_async {
				if let Err(e) = send_with_retry(codec.as_mut(), &input, core) {
					tracing::error!("{}: send_input failed: {e}", core.name());
					return false;
				}
				let (mut any, saw_eof) = drain_outputs(codec.as_mut(), core, 0);
				if input.is_eof() && !saw_eof {
					emit_eof(core, 0);
					any = true;
				}
				any
			} else {
				process_sync(codec.as_mut(), core, &input, output_size.unwrap(), false)
			}
		}))
		.apply_params(params)?
		.default_model(Model::AsyncCommon)
		.default_when_full(FullPolicy::Block);

	let flow = Flow::builder("video_dec").slot_map(slot_map).build()?;
	Ok(Arc::new(flow))
}

fn process_sync(
	codec: &mut dyn Codec,
	core: &FlowCore,
	input: &Arc<MediaBuffer>,
	output_size: usize,
	extra_output: bool,
) -> bool {
	let mut output = match MediaBuffer::alloc(output_size, MemKind::Common) {
		Ok(output) => output,
		Err(e) => {
			tracing::error!("{}: output allocation failed: {e}", core.name());
			return false;
		},
	};
	let mut extra = if extra_output {
		match MediaBuffer::alloc(output_size, MemKind::Common) {
			Ok(extra) => Some(extra),
			Err(e) => {
				tracing::error!("{}: extra output allocation failed: {e}", core.name());
				return false;
			},
		}
	} else {
		None
	};
	if let Err(e) = codec.process(input, &mut output, extra.as_mut()) {
		tracing::error!("{}: process failed: {e}", core.name());
		return false;
	}
	if input.is_eof() {
		output.set_eof(true);
	}
	let _ = core.set_output(Some(Arc::new(output)), 0);
	if let Some(mut extra) = extra {
		if input.is_eof() {
			extra.set_eof(true);
		}
		let _ = core.set_output(Some(Arc::new(extra)), 1);
	}
	true
}

pub(crate) fn video_encoder_flow(param: &str) -> Result<Arc<Flow>> {
	let params = ParamMap::parse(param);
	if params.is_empty() {
		return Err(MediaError::invalid_param("empty video_enc parameters"));
	}
	let codec_name = params
		.get(keys::CODEC_NAME)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::CODEC_NAME)))?;

	// Type compatibility check before instantiating the codec.
	let mut rule = ParamMap::new();
	for key in [keys::INPUT_DATA_TYPE, keys::OUTPUT_DATA_TYPE] {
		let value = params
			.get(key)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {key}")))?;
		rule.set(key, value);
	}
	if !registry::global().is_match(StageKind::Codec, codec_name, &rule.to_string()) {
		return Err(MediaError::invalid_param(format!(
			"codec '{codec_name}' does not match [{rule}]"
		)));
	}

	let codec_param = params.get(keys::CODEC_PARAM).unwrap_or("");
	let codec = registry::global().create_codec(codec_name, codec_param)?;
	video_encoder_flow_with_codec(codec, &params)
}

/// Builds an encoder flow around an already-constructed codec.
pub fn video_encoder_flow_with_codec(
	mut codec: Box<dyn Codec>,
	params: &ParamMap,
) -> Result<Arc<Flow>> {
	let config = MediaConfig::from_params(params)?;
	codec.set_config(config)?;
	codec.init()?;

	let extra_output = params.get(keys::EXTRA_OUTPUT) == Some("y");
	let support_async = supports_async(codec.as_mut());
	let output_size = sync_output_size(codec.config()).unwrap_or_else(|| sync_output_size(Some(&config)).unwrap());
	let extra_data = codec.extra_data();

	let codec = Mutex::new(codec);
	let mut slot_map = SlotMap::new()
		.input(0)
		.max_cache(vec![3])
		.output(0)
		.transaction(Box::new(move |core: &FlowCore, inputs: &mut [BufferSlot]| {
			let Some(input) = inputs[0].take() else {
				return false;
			};
			let mut codec = codec.lock().unwrap();
			if support_async {
				if let Err(e) = send_with_retry(codec.as_mut(), &input, core) {
					tracing::error!("{}: send_input failed: {e}", core.name());
					return false;
				}
				let (mut any, saw_eof) = drain_outputs(codec.as_mut(), core, 0);
				if input.is_eof() && !saw_eof {
					emit_eof(core, 0);
					any = true;
				}
				any
			} else {
				process_sync(codec.as_mut(), core, &input, output_size, extra_output)
			}
		}));
	if extra_output {
		slot_map = slot_map.output(1);
	}
	let slot_map = slot_map
		.apply_params(params)?
		.default_model(Model::AsyncCommon)
		.default_when_full(FullPolicy::DropFront);

	let flow = Flow::builder("video_enc").slot_map(slot_map).build()?;

	// Extradata goes out ahead of the first frame.
	if let Some(extra_data) = extra_data {
		let mut buffer = MediaBuffer::from_vec(extra_data);
		buffer.set_user_flags(flags::EXTRA_INTRA);
		flow.core().set_output(Some(Arc::new(buffer)), 0)?;
		if extra_output {
			flow.core().set_output(None, 1)?;
		}
	}
	Ok(Arc::new(flow))
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;
	use crate::image::{ImageInfo, PixelFormat};

	fn capture_sink(tx: crossbeam_channel::Sender<Arc<MediaBuffer>>) -> Flow {
		let slot_map = SlotMap::new()
			.input(0)
			.model(Model::Sync)
			.transaction(Box::new(move |_core, inputs: &mut [BufferSlot]| {
				if let Some(buffer) = inputs[0].take() {
					let _ = tx.send(buffer);
				}
				true
			}));
		Flow::builder("capture_sink").slot_map(slot_map).build().unwrap()
	}

	/// Returns `Again` for the first two sends, then accepts and emits one
	/// output per accepted input.
	struct RetryCodec {
		rejected: AtomicUsize,
		pending: Mutex<Vec<Arc<MediaBuffer>>>,
	}

	impl RetryCodec {
		fn new() -> RetryCodec {
			RetryCodec {
				rejected: AtomicUsize::new(0),
				pending: Mutex::new(Vec::new()),
			}
		}
	}

	impl Codec for RetryCodec {
		fn send_input(&mut self, input: Option<Arc<MediaBuffer>>) -> crate::error::Result<()> {
			let Some(input) = input else {
				return Ok(());
			};
			if self.rejected.fetch_add(1, Ordering::SeqCst) < 2 {
				return Err(MediaError::Again);
			}
			self.pending.lock().unwrap().push(input);
			Ok(())
		}

		fn fetch_output(&mut self) -> crate::error::Result<Arc<MediaBuffer>> {
			let mut pending = self.pending.lock().unwrap();
			match pending.pop() {
				Some(input) => {
					let mut output = input.clone_buffer(MemKind::Common).map_err(|_| MediaError::Again)?;
					output.set_user_flags(flags::KEY_FRAME);
					Ok(Arc::new(output))
				},
				None => Err(MediaError::Again),
			}
		}
	}

	#[test]
	fn again_is_retried_and_output_delivered_once() {
		let params = ParamMap::parse("thread_model=async_common\nmode_when_full=block");
		let decoder = video_decoder_flow_with_codec(Box::new(RetryCodec::new()), &params).unwrap();

		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		decoder.add_down(&sink, 0, 0).unwrap();

		let mut input = MediaBuffer::from_vec(vec![42]);
		input.set_timestamp_us(5);
		decoder.send_input(Some(Arc::new(input)), 0).unwrap();

		let output = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert_eq!(output.valid_data(), &[42]);
		assert!(output.has_user_flag(flags::KEY_FRAME));
		// Exactly once.
		assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
	}

	/// Sync-only: inverts payload bytes.
	struct InvertCodec {
		config: MediaConfig,
	}

	impl InvertCodec {
		fn new() -> InvertCodec {
			InvertCodec {
				config: MediaConfig::Image(crate::config::ImageConfig {
					image_info: ImageInfo::new(PixelFormat::Rgb888, 2, 2),
					qp_init: 0,
				}),
			}
		}
	}

	impl Codec for InvertCodec {
		fn config(&self) -> Option<&MediaConfig> {
			Some(&self.config)
		}

		fn process(
			&mut self,
			input: &Arc<MediaBuffer>,
			output: &mut MediaBuffer,
			_extra_output: Option<&mut MediaBuffer>,
		) -> crate::error::Result<()> {
			let data = input.valid_data();
			for (dst, src) in output.payload_mut().iter_mut().zip(data) {
				*dst = !*src;
			}
			output.set_valid_len(data.len().min(output.len()));
			output.set_timestamp_us(input.timestamp_us());
			Ok(())
		}
	}

	#[test]
	fn sync_only_codec_is_downgraded_and_forwards_eof() {
		let params = ParamMap::parse("thread_model=sync");
		let decoder = video_decoder_flow_with_codec(Box::new(InvertCodec::new()), &params).unwrap();

		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		decoder.add_down(&sink, 0, 0).unwrap();

		let mut input = MediaBuffer::from_vec(vec![0x0f, 0xf0]);
		input.set_eof(true);
		decoder.send_input(Some(Arc::new(input)), 0).unwrap();

		let output = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert_eq!(output.valid_data(), &[0xf0, 0x0f]);
		assert!(output.is_eof());
	}

	/// Sync encoder that records its config and exposes extradata.
	struct HeaderEncoder {
		config: Option<MediaConfig>,
	}

	impl Codec for HeaderEncoder {
		fn config(&self) -> Option<&MediaConfig> {
			self.config.as_ref()
		}

		fn set_config(&mut self, config: MediaConfig) -> crate::error::Result<()> {
			self.config = Some(config);
			Ok(())
		}

		fn extra_data(&self) -> Option<Vec<u8>> {
			Some(vec![0, 0, 0, 1, 0x67])
		}

		fn process(
			&mut self,
			input: &Arc<MediaBuffer>,
			output: &mut MediaBuffer,
			_extra_output: Option<&mut MediaBuffer>,
		) -> crate::error::Result<()> {
			let data = input.valid_data();
			output.payload_mut()[..data.len()].copy_from_slice(data);
			output.set_valid_len(data.len());
			Ok(())
		}
	}

	const ENC_PARAMS: &str = "output_data_type=video:h264\npixel_format=nv12\nwidth=16\nheight=16\nqp_init=24\nqp_step=2\nqp_min=12\nqp_max=40\nbitrate=1000000\nfps=30\nlevel=40\ngop=30\nprofile=100\nrc_quality=medium\nrc_mode=vbr\nthread_model=async_common\nmode_when_full=block";

	#[test]
	fn encoder_emits_extradata_before_frames() {
		let params = ParamMap::parse(ENC_PARAMS);
		let encoder =
			video_encoder_flow_with_codec(Box::new(HeaderEncoder { config: None }), &params).unwrap();

		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		encoder.add_down(&sink, 0, 0).unwrap();

		// One FIFO cache entry is forwarded per iteration, so the second
		// frame's iteration flushes the first frame behind the extradata.
		encoder
			.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![9, 9]))), 0)
			.unwrap();
		encoder
			.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![8, 8]))), 0)
			.unwrap();

		let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert!(first.has_user_flag(flags::EXTRA_INTRA));
		assert_eq!(first.valid_data(), &[0, 0, 0, 1, 0x67]);
		let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert_eq!(second.valid_data(), &[9, 9]);
	}
}
