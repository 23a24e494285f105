//! The per-flow worker loop.
//!
//! Every model funnels through [`Coroutine::run_once`]: fetch inputs the
//! model's way, run the transaction, drop the input references, forward each
//! bound output slot downstream (null buffers on failure).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{MediaError, Result};

use super::{BufferSlot, FlowCore, Model, TransactionFn};

pub(crate) struct Coroutine {
	model: Model,
	interval: Duration,
	in_slots: Vec<usize>,
	out_slots: Vec<usize>,
	transaction: TransactionFn,
}

impl Coroutine {
	pub(crate) fn new(
		model: Model,
		interval: Duration,
		in_slots: Vec<usize>,
		out_slots: Vec<usize>,
		transaction: TransactionFn,
	) -> Coroutine {
		Coroutine {
			model,
			interval,
			in_slots,
			out_slots,
			transaction,
		}
	}

	/// Starts the worker for the async models; `Sync` coroutines run on the
	/// caller's thread and have none.
	pub(crate) fn start(self: &Arc<Self>, core: &Arc<FlowCore>) -> Result<Option<JoinHandle<()>>> {
		match self.model {
			Model::Sync => Ok(None),
			Model::AsyncCommon | Model::AsyncAtomic => {
				let coroutine = self.clone();
				let core = core.clone();
				let handle = std::thread::Builder::new()
					.name(core.name().to_string())
					.spawn(move || match coroutine.model {
						Model::AsyncCommon => coroutine.run_loop(&core),
						Model::AsyncAtomic => coroutine.run_periodic(&core),
						Model::Sync => unreachable!(),
					})
					.map_err(|e| {
						tracing::error!("Failed to spawn flow worker: {e}");
						MediaError::OutOfMemory
					})?;
				Ok(Some(handle))
			},
		}
	}

	/// One scheduling step: fetch, transact, reset, send down.
	pub(crate) fn run_once(&self, core: &FlowCore) {
		let mut inputs: Vec<BufferSlot> = vec![None; self.in_slots.len()];
		match self.model {
			Model::Sync => core.fetch_sync(&self.in_slots, &mut inputs),
			Model::AsyncCommon => {
				if !core.fetch_async_common(&self.in_slots, &mut inputs) {
					return;
				}
			},
			Model::AsyncAtomic => core.fetch_async_atomic(&self.in_slots, &mut inputs),
		}
		let ok = (self.transaction)(core, &mut inputs);
		// Drop the strong references before fanning out so upstream pool
		// slots free up immediately.
		drop(inputs);
		for &out_slot in &self.out_slots {
			core.send_down(out_slot, ok);
		}
	}

	fn run_loop(&self, core: &FlowCore) {
		while !core.should_quit() {
			self.run_once(core);
		}
		tracing::debug!("{}: worker stopped.", core.name());
	}

	fn run_periodic(&self, core: &FlowCore) {
		let mut times: u32 = 0;
		let mut start = Instant::now();
		while !core.should_quit() {
			if times == 0 {
				start = Instant::now();
			}
			self.run_once(core);
			times += 1;
			// Catch-up pacing: sleep toward interval * times from the cycle
			// start, so one slow iteration does not shift the whole cadence.
			let target = self.interval * times;
			let elapsed = start.elapsed();
			if target > elapsed {
				std::thread::sleep(target - elapsed);
			}
			if times >= 10_000 {
				times = 0;
			}
		}
		tracing::debug!("{}: periodic worker stopped.", core.name());
	}
}
