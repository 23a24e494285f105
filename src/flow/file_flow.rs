//! `file_read_flow`: a source that reads fixed-size or image-sized records
//! from a file stream and feeds them into the graph.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer::{monotonic_us, MediaBuffer, MemKind};
use crate::error::{MediaError, Result};
use crate::image::ImageInfo;
use crate::param::{keys, ParamMap};
use crate::registry;
use crate::stream::Stream;

use super::{passthrough_transaction, Flow, FlowCore, FullPolicy, Model, SlotMap};

enum RecordSize {
	/// `size_pertime` bytes per read.
	Fixed(usize),
	/// One full frame per read, sized from the image geometry.
	Image(ImageInfo),
}

pub(crate) fn file_read_flow(param: &str) -> Result<Arc<Flow>> {
	let params = ParamMap::parse(param);
	if params.is_empty() {
		return Err(MediaError::invalid_param("empty file_read_flow parameters"));
	}
	let path = params
		.get(keys::PATH)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::PATH)))?
		.to_string();
	let mode = params
		.get(keys::OPEN_MODE)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::OPEN_MODE)))?;

	let mut stream_params = ParamMap::new();
	stream_params.set(keys::PATH, path.as_str());
	stream_params.set(keys::OPEN_MODE, mode);
	let stream = registry::global().create_stream("file_read_stream", &stream_params.to_string())?;

	let mem_kind = params
		.get(keys::MEM_TYPE)
		.map(MemKind::from_param)
		.unwrap_or_default();
	let record = match params.get_as::<usize>(keys::MEM_SIZE_PERTIME) {
		Some(size) if size > 0 => RecordSize::Fixed(size),
		Some(_) => return Err(MediaError::invalid_param(format!("bad {}", keys::MEM_SIZE_PERTIME))),
		None => RecordSize::Image(ImageInfo::from_params(&params)?),
	};
	let fps = params.get_as::<u64>(keys::FPS).unwrap_or(0);
	let loop_time = params.get_as::<u32>(keys::LOOP_TIME).unwrap_or(0);

	let slot_map = SlotMap::new()
		.input(0)
		.output(0)
		.model(Model::Sync)
		.when_full(FullPolicy::DropFront)
		.transaction(passthrough_transaction());

	let flow = Flow::builder(format!("file_read_flow:{path}"))
		.source()
		.slot_map(slot_map)
		.build()?;

	let stream = Mutex::new(stream);
	flow.spawn_source_worker(move |core| {
		read_loop(&core, stream, mem_kind, record, fps, loop_time);
	})?;
	Ok(Arc::new(flow))
}

fn read_loop(
	core: &FlowCore,
	stream: Mutex<Box<dyn Stream>>,
	mem_kind: MemKind,
	record: RecordSize,
	fps: u64,
	mut loop_time: u32,
) {
	if !core.wait_for_downstream() {
		return;
	}
	let mut stream = stream.into_inner().unwrap();
	let alloc_size = match &record {
		RecordSize::Fixed(size) => *size,
		RecordSize::Image(info) => info.buffer_size(),
	};

	let mut sent_eof = false;
	while !core.should_quit() && core.is_enabled() {
		if stream.eof() {
			if loop_time > 0 {
				loop_time -= 1;
				if let Err(e) = stream.seek(SeekFrom::Start(0)) {
					tracing::error!("{}: rewind failed: {e}", core.name());
					break;
				}
				continue;
			}
			// Terminal: tell downstream, once, with an empty EOF buffer.
			if !sent_eof {
				let mut tail = MediaBuffer::from_vec(Vec::new());
				tail.set_eof(true);
				tail.set_timestamp_us(monotonic_us());
				let _ = core.send_input(Some(Arc::new(tail)), 0);
			}
			break;
		}
		let mut buffer = match MediaBuffer::alloc(alloc_size, mem_kind) {
			Ok(buffer) => buffer,
			Err(e) => {
				tracing::error!("{}: allocation failed: {e}", core.name());
				core.set_disable();
				break;
			},
		};
		let n = match stream.read(buffer.payload_mut()) {
			Ok(n) => n,
			Err(e) => {
				tracing::error!("{}: read failed: {e}", core.name());
				core.set_disable();
				break;
			},
		};
		if n == 0 {
			// Clean EOF at a record boundary; the check at the top of the
			// loop rewinds or terminates.
			continue;
		}
		buffer.set_valid_len(n);
		if let RecordSize::Image(info) = &record {
			buffer.set_image_info(*info);
		}
		// A short read is the truncated tail of the file; unless the flow
		// is looping, that record is the last one.
		if (n != alloc_size || stream.eof()) && loop_time == 0 {
			buffer.set_eof(true);
			sent_eof = true;
		}
		buffer.set_timestamp_us(monotonic_us());
		if core.send_input(Some(Arc::new(buffer)), 0).is_err() {
			break;
		}
		if sent_eof {
			break;
		}
		if fps != 0 {
			std::thread::sleep(Duration::from_millis(1000 / fps));
		}
	}
	let _ = stream.close();
	tracing::debug!("{}: reader stopped.", core.name());
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use crossbeam_channel::Sender;

	use super::*;
	use crate::flow::BufferSlot;

	/// A sink flow that forwards every received buffer into a channel.
	fn capture_sink(tx: Sender<Arc<MediaBuffer>>) -> Flow {
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

	#[test]
	fn reads_fixed_records_until_eof() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("frames.raw");
		std::fs::write(&path, [1u8; 32]).unwrap();

		let param = format!("path={}\nmode=r\nsize_pertime=16", path.display());
		let source = file_read_flow(&param).unwrap();

		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		source.add_down(&sink, 0, 0).unwrap();

		let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert_eq!(first.valid_len(), 16);
		assert_eq!(second.valid_len(), 16);
		assert!(second.timestamp_us() >= first.timestamp_us());
	}

	#[test]
	fn flags_eof_on_the_final_record() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tail.raw");
		std::fs::write(&path, [7u8; 8]).unwrap();

		let param = format!("path={}\nmode=r\nsize_pertime=8", path.display());
		let source = file_read_flow(&param).unwrap();

		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		source.add_down(&sink, 0, 0).unwrap();

		// Either the only record carries EOF, or a follow-up empty buffer
		// ends the stream; the last delivered buffer must be flagged.
		let mut received = vec![rx.recv_timeout(Duration::from_secs(1)).unwrap()];
		while let Ok(buffer) = rx.recv_timeout(Duration::from_millis(200)) {
			received.push(buffer);
		}
		assert_eq!(received[0].valid_data(), &[7u8; 8]);
		assert!(received.last().unwrap().is_eof());
	}

	#[test]
	fn missing_path_is_invalid_param() {
		assert!(matches!(
			file_read_flow("mode=r"),
			Err(MediaError::InvalidParam(_))
		));
	}
}
