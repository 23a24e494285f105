//! The flow graph engine.
//!
//! A [`Flow`] is a scheduled node wrapping one stage. Its [`SlotMap`]
//! declares input/output topology, the scheduling model and the admission
//! policy; `add_down` wires flows together; `send_input` on a source entry
//! point propagates buffers through the graph. Each async flow owns exactly
//! one worker thread, so failure domains stay per-flow.

mod codec_flow;
mod coroutine;
mod file_flow;
mod filter_flow;
mod muxer_flow;
mod output_flow;
mod source_flow;

pub use codec_flow::{video_decoder_flow_with_codec, video_encoder_flow_with_codec};
pub use filter_flow::filter_flow_with_filters;
pub use muxer_flow::muxer_flow_with_muxer;
pub use source_flow::source_flow_with_source;

pub(crate) use codec_flow::{video_decoder_flow, video_encoder_flow};
pub(crate) use file_flow::file_read_flow;
pub(crate) use filter_flow::filter_flow;
pub(crate) use muxer_flow::muxer_flow;
pub(crate) use output_flow::output_stream_flow;
pub(crate) use source_flow::source_stream_flow;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::MediaBuffer;
use crate::error::{MediaError, Result};
use crate::param::{keys, ParamMap};
use crate::stage::ControlArg;

use coroutine::Coroutine;

/// How long a full-queue `Block` admission sleeps between capacity checks,
/// and how long codec wrappers wait before retrying `Again`.
pub(crate) const ADMISSION_POLL: Duration = Duration::from_millis(5);

/// A slot's content: `None` is the null buffer used to signal failed or
/// absent input downstream.
pub type BufferSlot = Option<Arc<MediaBuffer>>;

/// The per-iteration stage callback: reads the input vector, calls
/// `set_output` zero or more times, returns success. On failure the engine
/// propagates one null buffer per output slot.
pub type TransactionFn = Box<dyn Fn(&FlowCore, &mut [BufferSlot]) -> bool + Send + Sync>;

/// Control forwarding into the wrapped stage.
pub type ControllerFn = Box<dyn FnMut(u32, ControlArg) -> Result<()> + Send>;

/// Scheduling model of a flow's coroutine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Model {
	/// No worker; the whole chain runs on the caller's `send_input`.
	Sync,
	/// One worker per flow, FIFO input with backpressure.
	AsyncCommon,
	/// One periodic worker per flow, single latest-wins input cell.
	AsyncAtomic,
}

impl FromStr for Model {
	type Err = MediaError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"sync" => Ok(Model::Sync),
			"async_common" => Ok(Model::AsyncCommon),
			"async_atomic" => Ok(Model::AsyncAtomic),
			other => Err(MediaError::invalid_param(format!(
				"unknown thread model '{other}'"
			))),
		}
	}
}

/// What `send_input` does when a bounded FIFO input is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FullPolicy {
	/// Poll until capacity appears or the flow is disabled.
	Block,
	/// Discard the oldest queued buffer.
	DropFront,
	/// Discard the incoming buffer.
	DropCurrent,
}

impl FromStr for FullPolicy {
	type Err = MediaError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"block" => Ok(FullPolicy::Block),
			"drop_front" => Ok(FullPolicy::DropFront),
			"drop_current" => Ok(FullPolicy::DropCurrent),
			other => Err(MediaError::invalid_param(format!(
				"unknown full-queue policy '{other}'"
			))),
		}
	}
}

/// Declaration of a flow's topology and scheduling, consumed by
/// [`FlowBuilder::slot_map`].
pub struct SlotMap {
	pub(crate) input_slots: Vec<usize>,
	pub(crate) output_slots: Vec<usize>,
	pub(crate) model: Option<Model>,
	pub(crate) when_full: Option<FullPolicy>,
	/// Empty = default for all; one entry = scalar for all; otherwise one
	/// entry per input slot.
	pub(crate) input_max_cache: Vec<usize>,
	pub(crate) interval: Duration,
	pub(crate) transaction: Option<TransactionFn>,
}

pub(crate) const DEFAULT_INPUT_MAX_CACHE: usize = 2;

impl Default for SlotMap {
	fn default() -> Self {
		Self::new()
	}
}

impl SlotMap {
	pub fn new() -> SlotMap {
		SlotMap {
			input_slots: Vec::new(),
			output_slots: Vec::new(),
			model: None,
			when_full: None,
			input_max_cache: Vec::new(),
			interval: Duration::from_millis(16),
			transaction: None,
		}
	}

	pub fn input(mut self, slot: usize) -> Self {
		self.input_slots.push(slot);
		self
	}

	pub fn output(mut self, slot: usize) -> Self {
		self.output_slots.push(slot);
		self
	}

	pub fn model(mut self, model: Model) -> Self {
		self.model = Some(model);
		self
	}

	pub fn default_model(mut self, model: Model) -> Self {
		self.model.get_or_insert(model);
		self
	}

	pub fn when_full(mut self, policy: FullPolicy) -> Self {
		self.when_full = Some(policy);
		self
	}

	pub fn default_when_full(mut self, policy: FullPolicy) -> Self {
		self.when_full.get_or_insert(policy);
		self
	}

	pub fn max_cache(mut self, per_slot: Vec<usize>) -> Self {
		self.input_max_cache = per_slot;
		self
	}

	pub fn interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	pub fn transaction(mut self, transaction: TransactionFn) -> Self {
		self.transaction = Some(transaction);
		self
	}

	/// Applies the scheduling options a parameter string may carry:
	/// `thread_model`, `mode_when_full`, `input_maxcachenum`, `interval_us`,
	/// and the `fps` shorthand (implies `async_atomic` with a matching
	/// period when `thread_model` is unset).
	pub fn apply_params(mut self, params: &ParamMap) -> Result<Self> {
		if let Some(value) = params.get(keys::THREAD_MODEL) {
			self.model = Some(value.parse()?);
		}
		if let Some(value) = params.get(keys::MODE_WHEN_FULL) {
			self.when_full = Some(value.parse()?);
		}
		if let Some(value) = params.get(keys::INPUT_MAX_CACHE_NUM) {
			let cache: usize = value.parse().map_err(|_| {
				MediaError::invalid_param(format!("bad {}", keys::INPUT_MAX_CACHE_NUM))
			})?;
			self.input_max_cache = vec![cache];
		}
		if let Some(value) = params.get(keys::INTERVAL_US) {
			let us: u64 = value
				.parse()
				.ok()
				.filter(|us| *us > 0)
				.ok_or_else(|| MediaError::invalid_param(format!("bad {}", keys::INTERVAL_US)))?;
			self.interval = Duration::from_micros(us);
		}
		if let Some(fps) = params.get_as::<u64>(keys::FPS) {
			if fps == 0 {
				return Err(MediaError::invalid_param(format!("bad {}", keys::FPS)));
			}
			if self.model.is_none() {
				self.model = Some(Model::AsyncAtomic);
				self.interval = Duration::from_micros(1_000_000 / fps);
			}
		}
		Ok(self)
	}
}

/// The passthrough transaction: forwards input slot 0 to output slot 0.
pub fn passthrough_transaction() -> TransactionFn {
	Box::new(|core, inputs| {
		let _ = core.set_output(inputs[0].clone(), 0);
		true
	})
}

struct InputSlot {
	valid: bool,
	model: Model,
	max_cache: usize,
	when_full: FullPolicy,
	/// FIFO for `AsyncCommon`.
	queue: Mutex<VecDeque<BufferSlot>>,
	available: Condvar,
	/// Single cell for `Sync` and `AsyncAtomic`.
	cell: Mutex<BufferSlot>,
	/// Coroutine invoked in-thread for `Sync` slots.
	coroutine: usize,
}

impl InputSlot {
	fn invalid() -> InputSlot {
		InputSlot {
			valid: false,
			model: Model::Sync,
			max_cache: 0,
			when_full: FullPolicy::DropCurrent,
			queue: Mutex::new(VecDeque::new()),
			available: Condvar::new(),
			cell: Mutex::new(None),
			coroutine: 0,
		}
	}
}

struct Edge {
	down: Arc<FlowCore>,
	in_slot: usize,
}

impl Clone for Edge {
	fn clone(&self) -> Self {
		Edge {
			down: self.down.clone(),
			in_slot: self.in_slot,
		}
	}
}

struct OutputSlot {
	valid: bool,
	/// FIFO cache for `AsyncCommon`, latest-wins cell otherwise.
	fifo: bool,
	edges: Mutex<Vec<Edge>>,
	cache_queue: Mutex<VecDeque<BufferSlot>>,
	cache_cell: Mutex<BufferSlot>,
}

impl OutputSlot {
	fn invalid() -> OutputSlot {
		OutputSlot {
			valid: false,
			fifo: false,
			edges: Mutex::new(Vec::new()),
			cache_queue: Mutex::new(VecDeque::new()),
			cache_cell: Mutex::new(None),
		}
	}
}

/// The start gate of a source flow: its worker waits here until at least
/// one downstream edge exists, so no buffers are produced into an unwired
/// graph.
struct SourceGate {
	count: Mutex<usize>,
	cond: Condvar,
}

/// Shared state of a flow: slots, flags, gate and coroutines. Worker
/// threads and graph edges reference the core; the public [`Flow`] handle
/// owns the join handles.
pub struct FlowCore {
	name: String,
	enable: AtomicBool,
	quit: AtomicBool,
	inputs: Vec<InputSlot>,
	outputs: Vec<OutputSlot>,
	coroutines: Vec<Arc<Coroutine>>,
	source_gate: Option<SourceGate>,
	controller: Mutex<Option<ControllerFn>>,
}

impl FlowCore {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn is_enabled(&self) -> bool {
		self.enable.load(Ordering::SeqCst)
	}

	pub fn should_quit(&self) -> bool {
		self.quit.load(Ordering::SeqCst)
	}

	/// Sticky disable: subsequent `send_input` calls are no-ops and blocked
	/// waits wake within one sleep quantum.
	pub fn set_disable(&self) {
		self.enable.store(false, Ordering::SeqCst);
		for input in self.inputs.iter().filter(|input| input.valid) {
			let _guard = input.queue.lock().unwrap();
			input.available.notify_all();
		}
		if let Some(gate) = &self.source_gate {
			let _guard = gate.count.lock().unwrap();
			gate.cond.notify_all();
		}
	}

	/// Feeds a buffer into an input slot, applying the slot's admission
	/// policy. A disabled flow accepts and discards; an unaddressed slot is
	/// an error.
	pub fn send_input(&self, buffer: BufferSlot, in_slot: usize) -> Result<()> {
		let input = self
			.inputs
			.get(in_slot)
			.filter(|input| input.valid)
			.ok_or_else(|| {
				MediaError::invalid_param(format!("{}: no input slot {in_slot}", self.name))
			})?;
		if !self.is_enabled() {
			return Ok(());
		}
		match input.model {
			Model::Sync => {
				*input.cell.lock().unwrap() = buffer;
				let coroutine = self.coroutines[input.coroutine].clone();
				coroutine.run_once(self);
			},
			Model::AsyncCommon => {
				let mut queue = input.queue.lock().unwrap();
				if input.max_cache > 0 && queue.len() >= input.max_cache {
					match input.when_full {
						FullPolicy::Block => loop {
							drop(queue);
							std::thread::sleep(ADMISSION_POLL);
							if !self.is_enabled() {
								return Ok(());
							}
							queue = input.queue.lock().unwrap();
							if queue.len() < input.max_cache {
								break;
							}
						},
						FullPolicy::DropFront => {
							queue.pop_front();
						},
						FullPolicy::DropCurrent => {
							return Ok(());
						},
					}
				}
				queue.push_back(buffer);
				input.available.notify_one();
			},
			Model::AsyncAtomic => {
				// Latest wins; the previous cell content is dropped silently.
				*input.cell.lock().unwrap() = buffer;
			},
		}
		Ok(())
	}

	/// Writes a buffer into an output slot's cache. Called by transactions;
	/// the coroutine forwards the cache downstream after the transaction
	/// returns.
	pub fn set_output(&self, buffer: BufferSlot, out_slot: usize) -> Result<()> {
		let output = self
			.outputs
			.get(out_slot)
			.filter(|output| output.valid)
			.ok_or_else(|| {
				MediaError::invalid_param(format!("{}: no output slot {out_slot}", self.name))
			})?;
		if !self.is_enabled() {
			return Ok(());
		}
		if output.fifo {
			output.cache_queue.lock().unwrap().push_back(buffer);
		} else {
			*output.cache_cell.lock().unwrap() = buffer;
		}
		Ok(())
	}

	/// Forwards one output slot downstream: snapshots the edge list, then
	/// sends the cached buffer (or the null buffer after a failed
	/// transaction) to every edge.
	pub(crate) fn send_down(&self, out_slot: usize, process_ok: bool) {
		let Some(output) = self.outputs.get(out_slot).filter(|output| output.valid) else {
			return;
		};
		let edges = output.edges.lock().unwrap().clone();
		if edges.is_empty() {
			// Still consume the cache so a FIFO does not grow unbounded.
			if output.fifo {
				output.cache_queue.lock().unwrap().pop_front();
			}
			return;
		}
		let buffer: BufferSlot = if !process_ok {
			None
		} else if output.fifo {
			// An empty FIFO at send time takes the null-propagation path.
			output.cache_queue.lock().unwrap().pop_front().flatten()
		} else {
			output.cache_cell.lock().unwrap().clone()
		};
		for edge in &edges {
			if let Err(e) = edge.down.send_input(buffer.clone(), edge.in_slot) {
				tracing::warn!("{}: downstream rejected buffer: {e}", self.name);
			}
		}
	}

	pub(crate) fn fetch_sync(&self, in_slots: &[usize], inputs: &mut [BufferSlot]) {
		for (holder, &idx) in inputs.iter_mut().zip(in_slots) {
			*holder = self.inputs[idx].cell.lock().unwrap().take();
		}
	}

	/// Gathers one queued element per bound slot. Returns false when the
	/// first slot's wait timed out with nothing queued: an idle poll, the
	/// iteration is skipped. Once any slot has been popped the fetch is
	/// committed — later slots are waited on for as long as it takes, and a
	/// disable mid-gather pushes the popped elements back so no buffer is
	/// dropped out of its FIFO order.
	pub(crate) fn fetch_async_common(&self, in_slots: &[usize], inputs: &mut [BufferSlot]) -> bool {
		for i in 0..in_slots.len() {
			let input = &self.inputs[in_slots[i]];
			let mut queue = input.queue.lock().unwrap();
			loop {
				if let Some(element) = queue.pop_front() {
					inputs[i] = element;
					break;
				}
				if !self.is_enabled() {
					drop(queue);
					// Return what was already popped to the front of its
					// queue; the transaction sees all nulls.
					for j in 0..i {
						self.inputs[in_slots[j]]
							.queue
							.lock()
							.unwrap()
							.push_front(inputs[j].take());
					}
					return true;
				}
				// A parked worker wakes on notify; the timeout is a backstop
				// against a notify that fired before the park.
				let (guard, timeout) = input
					.available
					.wait_timeout(queue, Duration::from_millis(500))
					.unwrap();
				queue = guard;
				if timeout.timed_out() && queue.is_empty() && i == 0 && self.is_enabled() {
					return false;
				}
			}
		}
		true
	}

	pub(crate) fn fetch_async_atomic(&self, in_slots: &[usize], inputs: &mut [BufferSlot]) {
		for (holder, &idx) in inputs.iter_mut().zip(in_slots) {
			// Snapshot without clearing: a periodic flow re-reads the newest
			// buffer until a fresh one overwrites the cell.
			*holder = self.inputs[idx].cell.lock().unwrap().clone();
		}
	}

	fn add_down_core(&self, down: Arc<FlowCore>, out_slot: usize, in_slot: usize) -> Result<()> {
		let output = self
			.outputs
			.get(out_slot)
			.filter(|output| output.valid)
			.ok_or_else(|| {
				MediaError::invalid_param(format!("{}: no output slot {out_slot}", self.name))
			})?;
		let mut edges = output.edges.lock().unwrap();
		if let Some(edge) = edges.iter_mut().find(|edge| Arc::ptr_eq(&edge.down, &down)) {
			tracing::debug!("{}: edge to {} already exists, updating input slot.", self.name, down.name);
			edge.in_slot = in_slot;
			return Ok(());
		}
		edges.push(Edge { down, in_slot });
		drop(edges);
		if let Some(gate) = &self.source_gate {
			let mut count = gate.count.lock().unwrap();
			*count += 1;
			gate.cond.notify_all();
		}
		Ok(())
	}

	fn remove_down_core(&self, down: &Arc<FlowCore>) {
		for output in self.outputs.iter().filter(|output| output.valid) {
			let mut edges = output.edges.lock().unwrap();
			let before = edges.len();
			edges.retain(|edge| !Arc::ptr_eq(&edge.down, down));
			let removed = before - edges.len();
			drop(edges);
			if removed > 0 {
				if let Some(gate) = &self.source_gate {
					let mut count = gate.count.lock().unwrap();
					*count = count.saturating_sub(removed);
					gate.cond.notify_all();
				}
			}
		}
	}

	/// Blocks a source worker until at least one downstream edge exists.
	/// Returns false if the flow was disabled or told to quit while waiting.
	pub fn wait_for_downstream(&self) -> bool {
		let Some(gate) = &self.source_gate else {
			return self.is_enabled() && !self.should_quit();
		};
		let mut count = gate.count.lock().unwrap();
		while *count == 0 && self.is_enabled() && !self.should_quit() {
			count = gate.cond.wait(count).unwrap();
		}
		*count > 0 && self.is_enabled() && !self.should_quit()
	}

	/// Number of live downstream edges, as tracked by the source gate.
	pub fn downstream_count(&self) -> usize {
		self.source_gate
			.as_ref()
			.map(|gate| *gate.count.lock().unwrap())
			.unwrap_or(0)
	}

	pub(crate) fn set_controller(&self, controller: ControllerFn) {
		*self.controller.lock().unwrap() = Some(controller);
	}

	/// Forwards a control request to the wrapped stage.
	pub fn control(&self, request: u32, arg: ControlArg) -> Result<()> {
		match self.controller.lock().unwrap().as_mut() {
			Some(controller) => controller(request, arg),
			None => Err(MediaError::Unimplemented),
		}
	}

	#[cfg(test)]
	pub(crate) fn input_queue_len(&self, in_slot: usize) -> usize {
		self.inputs[in_slot].queue.lock().unwrap().len()
	}

	fn stop(&self) {
		for input in self.inputs.iter().filter(|input| input.valid) {
			let _guard = input.queue.lock().unwrap();
			self.enable.store(false, Ordering::SeqCst);
			self.quit.store(true, Ordering::SeqCst);
			input.available.notify_all();
		}
		// Flows without inputs (pure sources) still need the flags set.
		self.enable.store(false, Ordering::SeqCst);
		self.quit.store(true, Ordering::SeqCst);
		if let Some(gate) = &self.source_gate {
			let _guard = gate.count.lock().unwrap();
			gate.cond.notify_all();
		}
	}

	fn clear_caches(&self) {
		for input in self.inputs.iter().filter(|input| input.valid) {
			input.queue.lock().unwrap().clear();
			input.cell.lock().unwrap().take();
		}
		for output in self.outputs.iter().filter(|output| output.valid) {
			output.cache_queue.lock().unwrap().clear();
			output.cache_cell.lock().unwrap().take();
		}
	}
}

/// A scheduled node in the graph. Dropping the handle performs the shutdown
/// ordering: disable and quit under the input locks, wake every blocked
/// wait, join the workers, then release the cached buffers.
pub struct Flow {
	core: Arc<FlowCore>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Flow {
	pub fn builder(name: impl Into<String>) -> FlowBuilder {
		FlowBuilder {
			name: name.into(),
			is_source: false,
			slot_map: None,
		}
	}

	pub fn name(&self) -> &str {
		self.core.name()
	}

	pub fn core(&self) -> &Arc<FlowCore> {
		&self.core
	}

	pub fn is_enabled(&self) -> bool {
		self.core.is_enabled()
	}

	pub fn set_disable(&self) {
		self.core.set_disable()
	}

	pub fn send_input(&self, buffer: BufferSlot, in_slot: usize) -> Result<()> {
		self.core.send_input(buffer, in_slot)
	}

	/// Connects `self`'s output slot to `down`'s input slot. Adding an edge
	/// that already exists updates its input slot instead of duplicating.
	pub fn add_down(&self, down: &Flow, out_slot: usize, in_slot: usize) -> Result<()> {
		self.core.add_down_core(down.core.clone(), out_slot, in_slot)
	}

	/// Removes every edge from `self` to `down`.
	pub fn remove_down(&self, down: &Flow) {
		self.core.remove_down_core(&down.core)
	}

	pub fn control(&self, request: u32, arg: ControlArg) -> Result<()> {
		self.core.control(request, arg)
	}

	/// Registers the control forwarder for the wrapped stage.
	pub fn set_controller(&self, controller: ControllerFn) {
		self.core.set_controller(controller)
	}

	/// Spawns an extra producer thread owned by this flow (source read
	/// loops). The closure should gate on
	/// [`FlowCore::wait_for_downstream`] and poll
	/// [`FlowCore::should_quit`].
	pub fn spawn_source_worker<F>(&self, f: F) -> Result<()>
	where
		F: FnOnce(Arc<FlowCore>) + Send + 'static,
	{
		let core = self.core.clone();
		let handle = std::thread::Builder::new()
			.name(format!("{}-source", self.core.name))
			.spawn(move || f(core))
			.map_err(|e| {
				tracing::error!("Failed to spawn source worker: {e}");
				MediaError::OutOfMemory
			})?;
		self.workers.lock().unwrap().push(handle);
		Ok(())
	}

	/// Stops the flow: flags, wakeups, joins, cache release. Idempotent.
	pub fn stop_all(&self) {
		self.core.stop();
		let workers = std::mem::take(&mut *self.workers.lock().unwrap());
		for worker in workers {
			if let Err(e) = worker.join() {
				tracing::error!("{}: worker panicked: {e:?}", self.core.name);
			}
		}
		self.core.clear_caches();
	}
}

impl Drop for Flow {
	fn drop(&mut self) {
		self.stop_all();
	}
}

pub struct FlowBuilder {
	name: String,
	is_source: bool,
	slot_map: Option<SlotMap>,
}

impl FlowBuilder {
	/// Marks the flow as a source: its workers gate on the downstream
	/// counter before producing.
	pub fn source(mut self) -> Self {
		self.is_source = true;
		self
	}

	pub fn slot_map(mut self, slot_map: SlotMap) -> Self {
		self.slot_map = Some(slot_map);
		self
	}

	/// Validates the slot map, initializes the addressed slots, binds the
	/// coroutine and starts its worker.
	pub fn build(self) -> Result<Flow> {
		let slot_map = self
			.slot_map
			.ok_or_else(|| MediaError::invalid_param("flow without a slot map"))?;
		let transaction = slot_map
			.transaction
			.ok_or_else(|| MediaError::invalid_param("slot map without a transaction"))?;

		check_unique(&slot_map.input_slots, "input")?;
		check_unique(&slot_map.output_slots, "output")?;

		let model = slot_map.model.unwrap_or(Model::Sync);
		let when_full = slot_map.when_full.unwrap_or(FullPolicy::DropCurrent);

		let max_cache_of = |i: usize| -> Result<usize> {
			match slot_map.input_max_cache.len() {
				0 => Ok(DEFAULT_INPUT_MAX_CACHE),
				1 => Ok(slot_map.input_max_cache[0]),
				n if n == slot_map.input_slots.len() => Ok(slot_map.input_max_cache[i]),
				n => Err(MediaError::invalid_param(format!(
					"{} max-cache entries for {} input slots",
					n,
					slot_map.input_slots.len()
				))),
			}
		};

		if model == Model::AsyncAtomic && slot_map.interval.is_zero() {
			return Err(MediaError::invalid_param("async_atomic flow without a period"));
		}

		let input_len = slot_map.input_slots.iter().max().map_or(0, |max| max + 1);
		let mut inputs: Vec<InputSlot> = (0..input_len).map(|_| InputSlot::invalid()).collect();
		for (i, &idx) in slot_map.input_slots.iter().enumerate() {
			let slot = &mut inputs[idx];
			slot.valid = true;
			slot.model = model;
			slot.max_cache = if model == Model::AsyncCommon {
				max_cache_of(i)?
			} else {
				0
			};
			slot.when_full = when_full;
			slot.coroutine = 0;
		}

		let output_len = slot_map.output_slots.iter().max().map_or(0, |max| max + 1);
		let mut outputs: Vec<OutputSlot> = (0..output_len).map(|_| OutputSlot::invalid()).collect();
		for &idx in &slot_map.output_slots {
			let slot = &mut outputs[idx];
			slot.valid = true;
			slot.fifo = model == Model::AsyncCommon;
		}

		let coroutine = Arc::new(Coroutine::new(
			model,
			slot_map.interval,
			slot_map.input_slots.clone(),
			slot_map.output_slots.clone(),
			transaction,
		));

		let core = Arc::new(FlowCore {
			name: self.name,
			enable: AtomicBool::new(true),
			quit: AtomicBool::new(false),
			inputs,
			outputs,
			coroutines: vec![coroutine.clone()],
			source_gate: self.is_source.then(|| SourceGate {
				count: Mutex::new(0),
				cond: Condvar::new(),
			}),
			controller: Mutex::new(None),
		});

		let workers = coroutine.start(&core)?.into_iter().collect();
		Ok(Flow {
			core,
			workers: Mutex::new(workers),
		})
	}
}

fn check_unique(slots: &[usize], what: &str) -> Result<()> {
	let mut seen = slots.to_vec();
	seen.sort_unstable();
	seen.dedup();
	if seen.len() != slots.len() {
		return Err(MediaError::invalid_param(format!("duplicate {what} slot index")));
	}
	Ok(())
}
