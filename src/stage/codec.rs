//! The codec contract and the threaded adapter that lifts a synchronous
//! codec into the asynchronous send/fetch shape.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use crate::buffer::{MediaBuffer, MemKind};
use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::stage::ControlArg;

/// Runtime change requests accepted by video encoders.
pub mod change {
	pub const QP: u32 = 1 << 0;
	pub const FRAME_RATE: u32 = 1 << 1;
	pub const BIT_RATE: u32 = 1 << 2;
	pub const FORCE_IDR: u32 = 1 << 3;
}

/// A decoder or encoder. Concrete adapters implement either the synchronous
/// `process` or the asynchronous `send_input`/`fetch_output` pair; a codec
/// whose `send_input(None)` probe reports `Unimplemented` is sync-only and
/// wrapper flows downgrade accordingly.
pub trait Codec: Send {
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

	/// Out-of-band codec data (SPS/PPS and friends) emitted before the first
	/// frame, if the codec has any.
	fn extra_data(&self) -> Option<Vec<u8>> {
		None
	}

	/// Synchronous transform into a caller-allocated output buffer.
	fn process(
		&mut self,
		input: &Arc<MediaBuffer>,
		output: &mut MediaBuffer,
		extra_output: Option<&mut MediaBuffer>,
	) -> Result<()> {
		let _ = (input, output, extra_output);
		Err(MediaError::Unimplemented)
	}

	/// Feeds one buffer to an asynchronous codec. `Err(Again)` signals
	/// backpressure; the caller retries with the same buffer. `None` is the
	/// sync-detection probe and must be accepted by async codecs.
	fn send_input(&mut self, input: Option<Arc<MediaBuffer>>) -> Result<()> {
		let _ = input;
		Err(MediaError::Unimplemented)
	}

	/// Fetches the next finished buffer from an asynchronous codec.
	/// `Err(Again)` means drained for now, `Err(Eof)` is terminal.
	fn fetch_output(&mut self) -> Result<Arc<MediaBuffer>> {
		Err(MediaError::Unimplemented)
	}

	/// Queues a runtime change (`change::*` code plus value).
	fn request_change(&mut self, request: u32, value: i32) -> Result<()> {
		let _ = (request, value);
		Err(MediaError::Unimplemented)
	}

	fn control(&mut self, request: u32, arg: ControlArg) -> Result<()> {
		let _ = (request, arg);
		Err(MediaError::Unimplemented)
	}
}

/// Probes whether a codec supports the asynchronous contract.
pub fn supports_async(codec: &mut dyn Codec) -> bool {
	!matches!(codec.send_input(None), Err(MediaError::Unimplemented))
}

/// Pending change requests of a video encoder, drained by the adapter on
/// its next frame.
#[derive(Default)]
pub struct ChangeQueue {
	list: Mutex<VecDeque<(u32, i32)>>,
}

impl ChangeQueue {
	pub fn push(&self, request: u32, value: i32) {
		self.list.lock().unwrap().push_back((request, value));
	}

	pub fn pop(&self) -> Option<(u32, i32)> {
		self.list.lock().unwrap().pop_front()
	}

	pub fn has_pending(&self) -> bool {
		!self.list.lock().unwrap().is_empty()
	}
}

enum WorkerMessage {
	Input(Arc<MediaBuffer>),
	Flush,
}

/// Lifts a sync-only codec into the asynchronous contract with a worker
/// thread and bounded channels. A full input queue reports `Again`, a
/// drained output queue reports `Again`, a disconnected worker reports
/// `Eof`.
pub struct ThreadedCodec {
	input_tx: Option<Sender<WorkerMessage>>,
	output_rx: Option<Receiver<Arc<MediaBuffer>>>,
	worker: Option<JoinHandle<()>>,
}

impl ThreadedCodec {
	/// `output_size` is the payload allocation for each produced buffer,
	/// normally the frame size from the codec config.
	pub fn new(mut codec: Box<dyn Codec>, output_size: usize, queue_depth: usize) -> Result<ThreadedCodec> {
		if output_size == 0 || queue_depth == 0 {
			return Err(MediaError::invalid_param("bad threaded codec geometry"));
		}
		codec.init()?;

		let (input_tx, input_rx) = crossbeam_channel::bounded::<WorkerMessage>(queue_depth);
		let (output_tx, output_rx) = crossbeam_channel::bounded::<Arc<MediaBuffer>>(queue_depth);

		let worker = std::thread::Builder::new()
			.name("threaded-codec".to_string())
			.spawn(move || {
				while let Ok(message) = input_rx.recv() {
					let input = match message {
						WorkerMessage::Input(input) => input,
						WorkerMessage::Flush => continue,
					};
					let mut output = match MediaBuffer::alloc(output_size, MemKind::Common) {
						Ok(output) => output,
						Err(e) => {
							tracing::error!("Failed to allocate codec output: {e}");
							break;
						},
					};
					if let Err(e) = codec.process(&input, &mut output, None) {
						tracing::error!("Codec process failed: {e}");
						continue;
					}
					// EOF travels with the buffer, whatever the codec did.
					if input.is_eof() {
						output.set_eof(true);
					}
					if output_tx.send(Arc::new(output)).is_err() {
						break;
					}
				}
			})
			.map_err(|e| {
				tracing::error!("Failed to start codec worker: {e}");
				MediaError::OutOfMemory
			})?;

		Ok(ThreadedCodec {
			input_tx: Some(input_tx),
			output_rx: Some(output_rx),
			worker: Some(worker),
		})
	}
}

impl Codec for ThreadedCodec {
	fn send_input(&mut self, input: Option<Arc<MediaBuffer>>) -> Result<()> {
		let Some(tx) = &self.input_tx else {
			return Err(MediaError::Eof);
		};
		let message = match input {
			Some(input) => WorkerMessage::Input(input),
			None => WorkerMessage::Flush,
		};
		match tx.try_send(message) {
			Ok(()) => Ok(()),
			Err(TrySendError::Full(_)) => Err(MediaError::Again),
			Err(TrySendError::Disconnected(_)) => Err(MediaError::Eof),
		}
	}

	fn fetch_output(&mut self) -> Result<Arc<MediaBuffer>> {
		let Some(rx) = &self.output_rx else {
			return Err(MediaError::Eof);
		};
		match rx.try_recv() {
			Ok(buffer) => Ok(buffer),
			Err(TryRecvError::Empty) => Err(MediaError::Again),
			Err(TryRecvError::Disconnected) => Err(MediaError::Eof),
		}
	}
}

impl Drop for ThreadedCodec {
	fn drop(&mut self) {
		// Disconnect both channels so the worker fails out of recv and out
		// of a blocked output send.
		self.input_tx.take();
		self.output_rx.take();
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Doubles each payload byte, sync contract only.
	struct DoublingCodec;

	impl Codec for DoublingCodec {
		fn process(
			&mut self,
			input: &Arc<MediaBuffer>,
			output: &mut MediaBuffer,
			_extra_output: Option<&mut MediaBuffer>,
		) -> Result<()> {
			let data = input.valid_data();
			for (dst, src) in output.payload_mut().iter_mut().zip(data) {
				*dst = src.wrapping_mul(2);
			}
			output.set_valid_len(data.len().min(output.len()));
			output.set_timestamp_us(input.timestamp_us());
			Ok(())
		}
	}

	#[test]
	fn sync_probe() {
		let mut sync_only = DoublingCodec;
		assert!(!supports_async(&mut sync_only));
		let mut threaded = ThreadedCodec::new(Box::new(DoublingCodec), 64, 2).unwrap();
		assert!(supports_async(&mut threaded));
	}

	#[test]
	fn threaded_codec_round_trip() {
		let mut codec = ThreadedCodec::new(Box::new(DoublingCodec), 64, 2).unwrap();
		let mut input = MediaBuffer::from_vec(vec![1, 2, 3]);
		input.set_timestamp_us(7);
		codec.send_input(Some(Arc::new(input))).unwrap();

		let output = loop {
			match codec.fetch_output() {
				Ok(output) => break output,
				Err(MediaError::Again) => std::thread::sleep(std::time::Duration::from_millis(1)),
				Err(e) => panic!("unexpected error: {e}"),
			}
		};
		assert_eq!(output.valid_data(), &[2, 4, 6]);
		assert_eq!(output.timestamp_us(), 7);
	}

	#[test]
	fn eof_flag_travels_through_worker() {
		let mut codec = ThreadedCodec::new(Box::new(DoublingCodec), 64, 2).unwrap();
		let mut input = MediaBuffer::from_vec(vec![5]);
		input.set_eof(true);
		codec.send_input(Some(Arc::new(input))).unwrap();
		let output = loop {
			match codec.fetch_output() {
				Ok(output) => break output,
				Err(MediaError::Again) => std::thread::sleep(std::time::Duration::from_millis(1)),
				Err(e) => panic!("unexpected error: {e}"),
			}
		};
		assert!(output.is_eof());
	}

	#[test]
	fn full_input_queue_reports_again() {
		// Depth-1 queues and no consumer: the second or third send must see
		// a full queue.
		let mut codec = ThreadedCodec::new(Box::new(DoublingCodec), 64, 1).unwrap();
		let mut saw_again = false;
		for _ in 0..16 {
			let input = Arc::new(MediaBuffer::from_vec(vec![0u8; 8]));
			match codec.send_input(Some(input)) {
				Ok(()) => continue,
				Err(MediaError::Again) => {
					saw_again = true;
					break;
				},
				Err(e) => panic!("unexpected error: {e}"),
			}
		}
		assert!(saw_again);
	}

	#[test]
	fn change_queue_orders_requests() {
		let queue = ChangeQueue::default();
		assert!(!queue.has_pending());
		queue.push(change::FORCE_IDR, 0);
		queue.push(change::BIT_RATE, 2_000_000);
		assert_eq!(queue.pop(), Some((change::FORCE_IDR, 0)));
		assert_eq!(queue.pop(), Some((change::BIT_RATE, 2_000_000)));
		assert_eq!(queue.pop(), None);
	}
}
