//! `source_stream`: a source flow hosting any [`Source`] stage. The
//! registry factory adapts a registered readable stream through
//! [`StreamSource`]; adapter crates hand their own `Source` implementors to
//! [`source_flow_with_source`]. The parameter string has two
//! space-separated parts: the flow options (with `name=` naming the stream
//! factory) and the stream's own parameters.

use std::sync::{Arc, Mutex};

use crate::buffer::{monotonic_us, MediaBuffer};
use crate::error::{MediaError, Result};
use crate::param::{keys, ParamMap};
use crate::registry;
use crate::stage::Source;
use crate::stream::StreamSource;

use super::{passthrough_transaction, Flow, FlowCore, FullPolicy, Model, SlotMap, ADMISSION_POLL};

const DEFAULT_READ_SIZE: usize = 4096;

pub(crate) fn source_stream_flow(param: &str) -> Result<Arc<Flow>> {
	let parts = ParamMap::parse_list(param, ' ');
	if parts.len() != 2 {
		return Err(MediaError::invalid_param(
			"source_stream expects '<flow params> <stream params>'",
		));
	}
	let params = ParamMap::parse(&parts[0]);
	let stream_name = params
		.get(keys::NAME)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::NAME)))?;
	let stream = registry::global().create_stream(stream_name, &parts[1])?;
	let read_size = params
		.get_as::<usize>(keys::MEM_SIZE_PERTIME)
		.unwrap_or(DEFAULT_READ_SIZE);
	source_flow_with_source(Box::new(StreamSource::new(stream, read_size)), &params)
}

/// Builds a source flow around an already-constructed source: its worker
/// gates on the downstream counter, reads until `Err(Eof)`, announces the
/// end with an EOF-flagged buffer and disables the flow.
pub fn source_flow_with_source(mut source: Box<dyn Source>, params: &ParamMap) -> Result<Arc<Flow>> {
	source.init()?;
	let name = params.get(keys::NAME).unwrap_or("source");

	let slot_map = SlotMap::new()
		.input(0)
		.output(0)
		.model(Model::Sync)
		.when_full(FullPolicy::DropFront)
		.transaction(passthrough_transaction());
	let flow = Flow::builder(format!("source_stream:{name}")).source().slot_map(slot_map).build()?;

	let source = Arc::new(Mutex::new(source));
	let control_source = source.clone();
	flow.set_controller(Box::new(move |request, arg| {
		control_source.lock().unwrap().control(request, arg)
	}));
	flow.spawn_source_worker(move |core| read_loop(&core, &source))?;
	Ok(Arc::new(flow))
}

fn read_loop(core: &FlowCore, source: &Mutex<Box<dyn Source>>) {
	if !core.wait_for_downstream() {
		return;
	}
	while !core.should_quit() && core.is_enabled() {
		let result = {
			let mut source = source.lock().unwrap();
			if source.eof() {
				Err(MediaError::Eof)
			} else {
				source.read()
			}
		};
		match result {
			Ok(mut buffer) => {
				if buffer.timestamp_us() == 0 {
					buffer.set_timestamp_us(monotonic_us());
				}
				if core.send_input(Some(Arc::new(buffer)), 0).is_err() {
					break;
				}
			},
			Err(MediaError::Again) => {
				std::thread::sleep(ADMISSION_POLL);
			},
			Err(MediaError::Eof) => {
				// Tell downstream before going silent.
				let mut tail = MediaBuffer::from_vec(Vec::new());
				tail.set_eof(true);
				tail.set_timestamp_us(monotonic_us());
				let _ = core.send_input(Some(Arc::new(tail)), 0);
				core.set_disable();
				break;
			},
			Err(e) => {
				tracing::error!("{}: source read failed: {e}", core.name());
				core.set_disable();
				break;
			},
		}
	}
	tracing::debug!("{}: reader stopped.", core.name());
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::flow::BufferSlot;
	use crate::stage::ControlRequest;

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

	#[test]
	fn wraps_a_registered_stream_and_forwards_eof() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("payload.bin");
		std::fs::write(&path, b"0123456789").unwrap();

		let param = format!(
			"name=file_read_stream\nsize_pertime=4 path={}\nmode=r",
			path.display()
		);
		let source = source_stream_flow(&param).unwrap();
		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		source.add_down(&sink, 0, 0).unwrap();

		let mut received = Vec::new();
		while let Ok(buffer) = rx.recv_timeout(Duration::from_secs(1)) {
			let eof = buffer.is_eof();
			received.push(buffer);
			if eof {
				break;
			}
		}
		let data: Vec<u8> = received
			.iter()
			.flat_map(|buffer| buffer.valid_data().to_vec())
			.collect();
		assert_eq!(data, b"0123456789");
		assert!(received.last().unwrap().is_eof());
		// The worker disables the flow right after the EOF send.
		for _ in 0..100 {
			if !source.is_enabled() {
				break;
			}
			std::thread::sleep(Duration::from_millis(5));
		}
		assert!(!source.is_enabled());
	}

	/// Emits `remaining` one-byte buffers, then ends.
	struct CountingSource {
		remaining: u8,
	}

	impl Source for CountingSource {
		fn read(&mut self) -> crate::error::Result<MediaBuffer> {
			if self.remaining == 0 {
				return Err(MediaError::Eof);
			}
			self.remaining -= 1;
			Ok(MediaBuffer::from_vec(vec![self.remaining]))
		}

		fn eof(&self) -> bool {
			self.remaining == 0
		}
	}

	#[test]
	fn custom_source_feeds_the_graph() {
		let params = ParamMap::parse("name=counter");
		let source =
			source_flow_with_source(Box::new(CountingSource { remaining: 3 }), &params).unwrap();
		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		source.add_down(&sink, 0, 0).unwrap();

		let mut received = Vec::new();
		while let Ok(buffer) = rx.recv_timeout(Duration::from_secs(1)) {
			let eof = buffer.is_eof();
			received.push(buffer);
			if eof {
				break;
			}
		}
		let payloads: Vec<Vec<u8>> = received
			.iter()
			.map(|buffer| buffer.valid_data().to_vec())
			.collect();
		assert_eq!(payloads, vec![vec![2], vec![1], vec![0], Vec::new()]);
		assert!(received.last().unwrap().is_eof());
		// The engine stamped the unstamped buffers in production order.
		assert!(received
			.windows(2)
			.all(|w| w[0].timestamp_us() <= w[1].timestamp_us()));
	}

	#[test]
	fn control_reaches_the_wrapped_stream() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("payload.bin");
		std::fs::write(&path, b"x").unwrap();

		let param = format!("name=file_read_stream path={}\nmode=r", path.display());
		let source = source_stream_flow(&param).unwrap();
		// StreamOff reaches the file stream and closes it; an unknown code
		// comes back as Unimplemented rather than vanishing.
		let mut arg = ();
		source
			.control(ControlRequest::StreamOff.code(), &mut arg)
			.unwrap();
		assert!(matches!(
			source.control(424242, &mut arg),
			Err(MediaError::Unimplemented)
		));
	}

	#[test]
	fn requires_both_parameter_parts() {
		assert!(matches!(
			source_stream_flow("name=file_read_stream"),
			Err(MediaError::InvalidParam(_))
		));
	}
}
