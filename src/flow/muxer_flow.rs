//! `muxer`: a terminal sink feeding a container writer. Streams are
//! declared at construction, the header is written exactly once before the
//! first packet, then every accepted buffer is muxed in arrival order.

use std::sync::{Arc, Mutex};

use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::param::{keys, ParamMap};
use crate::registry;
use crate::stage::muxer::Muxer;
use crate::stream::Stream;

use super::{BufferSlot, Flow, FlowCore, FullPolicy, Model, SlotMap};

pub(crate) fn muxer_flow(param: &str) -> Result<Arc<Flow>> {
	let parts = ParamMap::parse_list(param, ' ');
	if parts.len() != 2 {
		return Err(MediaError::invalid_param(
			"muxer expects '<flow params> <muxer params>'",
		));
	}
	let params = ParamMap::parse(&parts[0]);
	let name = params
		.get(keys::NAME)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::NAME)))?;
	let muxer = registry::global().create_muxer(name, &parts[1])?;

	// A path in the flow part selects a file output for the muxed bytes.
	let output = match params.get(keys::PATH) {
		Some(path) => {
			let mut stream_params = ParamMap::new();
			stream_params.set(keys::PATH, path);
			stream_params.set(keys::OPEN_MODE, params.get(keys::OPEN_MODE).unwrap_or("w"));
			Some(registry::global().create_stream("file_write_stream", &stream_params.to_string())?)
		},
		None => None,
	};
	let config = MediaConfig::from_params(&params)?;
	muxer_flow_with_muxer(muxer, output, &[config], &params)
}

/// Builds a muxer flow around an already-constructed muxer: one input slot
/// per declared stream config. Muxed bytes returned by the muxer are
/// written to `output`; a muxer with integrated io returns none.
pub fn muxer_flow_with_muxer(
	mut muxer: Box<dyn Muxer>,
	output: Option<Box<dyn Stream>>,
	configs: &[MediaConfig],
	params: &ParamMap,
) -> Result<Arc<Flow>> {
	if configs.is_empty() {
		return Err(MediaError::invalid_param("muxer flow without stream configs"));
	}
	muxer.init()?;
	let mut stream_indices = Vec::with_capacity(configs.len());
	for config in configs {
		stream_indices.push(muxer.new_stream(config, &[])?);
	}

	let mut slot_map = SlotMap::new();
	for i in 0..configs.len() {
		slot_map = slot_map.input(i);
	}

	let state = Mutex::new(MuxState {
		muxer,
		output,
		header_written: false,
	});
	let slot_map = slot_map
		.transaction(Box::new(move |core: &FlowCore, inputs: &mut [BufferSlot]| {
			let mut state = state.lock().unwrap();
			let mut ok = true;
			for (i, &stream_index) in stream_indices.iter().enumerate() {
				let Some(buffer) = inputs[i].take() else {
					continue;
				};
				if let Err(e) = state.mux(&buffer, stream_index) {
					tracing::error!("{}: mux failed: {e}", core.name());
					ok = false;
				}
			}
			ok
		}))
		.apply_params(params)?
		.default_model(Model::AsyncCommon)
		.default_when_full(FullPolicy::Block);

	let flow = Flow::builder("muxer").slot_map(slot_map).build()?;
	Ok(Arc::new(flow))
}

struct MuxState {
	muxer: Box<dyn Muxer>,
	output: Option<Box<dyn Stream>>,
	header_written: bool,
}

impl MuxState {
	fn mux(&mut self, buffer: &Arc<crate::buffer::MediaBuffer>, stream_index: usize) -> Result<()> {
		if !self.header_written {
			let header = self.muxer.write_header(stream_index)?;
			self.header_written = true;
			if let (Some(header), Some(output)) = (header, self.output.as_mut()) {
				output.write(header.valid_data())?;
			}
		}
		let packet = self.muxer.write(buffer, stream_index)?;
		if let (Some(packet), Some(output)) = (packet, self.output.as_mut()) {
			output.write(packet.valid_data())?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::buffer::MediaBuffer;
	use crate::config::{AudioConfig, ImageConfig};
	use crate::image::{ImageInfo, PixelFormat};
	use crate::sound::{SampleFormat, SampleInfo};

	/// Frames length-prefixed packets; header is a fixed magic.
	struct RecordMuxer {
		streams: usize,
	}

	impl Muxer for RecordMuxer {
		fn new_stream(&mut self, _config: &MediaConfig, _extra_data: &[u8]) -> Result<usize> {
			let index = self.streams;
			self.streams += 1;
			Ok(index)
		}

		fn write_header(&mut self, _index: usize) -> Result<Option<MediaBuffer>> {
			Ok(Some(MediaBuffer::from_vec(b"RECS".to_vec())))
		}

		fn write(
			&mut self,
			buffer: &Arc<MediaBuffer>,
			index: usize,
		) -> Result<Option<MediaBuffer>> {
			let data = buffer.valid_data();
			let mut packet = Vec::with_capacity(data.len() + 2);
			packet.push(index as u8);
			packet.push(data.len() as u8);
			packet.extend_from_slice(data);
			Ok(Some(MediaBuffer::from_vec(packet)))
		}
	}

	fn image_config() -> MediaConfig {
		MediaConfig::Image(ImageConfig {
			image_info: ImageInfo::new(PixelFormat::Nv12, 16, 16),
			qp_init: 10,
		})
	}

	fn audio_config() -> MediaConfig {
		MediaConfig::Audio(AudioConfig {
			sample_info: SampleInfo {
				fmt: SampleFormat::S16,
				channels: 2,
				sample_rate: 48000,
				frames: 256,
			},
			bit_rate: 128_000,
			quality: 0.0,
		})
	}

	#[test]
	fn header_once_then_packets_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.recs");
		let mut stream_params = ParamMap::new();
		stream_params.set(keys::PATH, path.to_str().unwrap());
		stream_params.set(keys::OPEN_MODE, "w");
		let output = crate::stream::FileStream::open(&stream_params).unwrap();

		let params = ParamMap::parse("mode_when_full=block");
		let flow = muxer_flow_with_muxer(
			Box::new(RecordMuxer { streams: 0 }),
			Some(Box::new(output)),
			&[image_config()],
			&params,
		)
		.unwrap();

		flow.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![1, 2]))), 0).unwrap();
		flow.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![3]))), 0).unwrap();
		std::thread::sleep(Duration::from_millis(50));
		flow.stop_all();

		let written = std::fs::read(&path).unwrap();
		assert_eq!(written, b"RECS\x00\x02\x01\x02\x00\x01\x03");
	}

	#[test]
	fn two_streams_mux_every_packet() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("av.recs");
		let mut stream_params = ParamMap::new();
		stream_params.set(keys::PATH, path.to_str().unwrap());
		stream_params.set(keys::OPEN_MODE, "w");
		let output = crate::stream::FileStream::open(&stream_params).unwrap();

		let params = ParamMap::parse("mode_when_full=block");
		let flow = muxer_flow_with_muxer(
			Box::new(RecordMuxer { streams: 0 }),
			Some(Box::new(output)),
			&[image_config(), audio_config()],
			&params,
		)
		.unwrap();

		// Video on slot 0, audio on slot 1. The worker must hold a popped
		// video packet while it waits for the matching audio packet, never
		// dropping either.
		flow.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![1, 2]))), 0).unwrap();
		flow.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![9]))), 1).unwrap();
		flow.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![3]))), 0).unwrap();
		flow.send_input(Some(Arc::new(MediaBuffer::from_vec(vec![8, 7]))), 1).unwrap();
		std::thread::sleep(Duration::from_millis(100));
		flow.stop_all();

		let written = std::fs::read(&path).unwrap();
		// Header once, then per iteration one packet per stream, slot order,
		// per-stream FIFO order preserved.
		assert_eq!(
			written,
			b"RECS\x00\x02\x01\x02\x01\x01\x09\x00\x01\x03\x01\x02\x08\x07"
		);
	}

	#[test]
	fn needs_at_least_one_stream_config() {
		assert!(matches!(
			muxer_flow_with_muxer(
				Box::new(RecordMuxer { streams: 0 }),
				None,
				&[],
				&ParamMap::new()
			),
			Err(MediaError::InvalidParam(_))
		));
	}
}
