//! `filter`: a wrapper flow hosting one or more same-named filters, one
//! input slot per filter, one merged output slot.
//!
//! Parameter string: `<flow params> <filter params>`; in the filter part
//! each line constructs one filter instance, with `;` separating that
//! filter's own `key=value` entries.

use std::sync::{Arc, Mutex};

use crate::buffer::{MediaBuffer, MemKind};
use crate::error::{MediaError, Result};
use crate::image::ImageInfo;
use crate::param::{keys, ParamMap};
use crate::registry::{self, StageKind};
use crate::stage::filter::{supports_async, Filter};

use super::{BufferSlot, Flow, FlowCore, FullPolicy, Model, SlotMap};

pub(crate) fn filter_flow(param: &str) -> Result<Arc<Flow>> {
	let parts = ParamMap::parse_list(param, ' ');
	if parts.len() != 2 {
		return Err(MediaError::invalid_param(
			"filter expects '<flow params> <filter params>'",
		));
	}
	let params = ParamMap::parse(&parts[0]);
	let name = params
		.get(keys::NAME)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::NAME)))?
		.to_string();

	let mut rule = ParamMap::new();
	for key in [keys::INPUT_DATA_TYPE, keys::OUTPUT_DATA_TYPE] {
		if let Some(value) = params.get(key) {
			rule.set(key, value);
		}
	}
	if !registry::global().is_match(StageKind::Filter, &name, &rule.to_string()) {
		return Err(MediaError::invalid_param(format!(
			"filter '{name}' does not match [{rule}]"
		)));
	}

	let mut filters = Vec::new();
	for line in parts[1].split('\n').filter(|line| !line.is_empty()) {
		let filter_param = line.replace(';', "\n");
		filters.push(registry::global().create_filter(&name, &filter_param)?);
	}
	if filters.is_empty() {
		return Err(MediaError::invalid_param("filter flow without filter instances"));
	}
	filter_flow_with_filters(filters, &params)
}

/// Builds a filter flow around already-constructed filters, one input slot
/// per filter.
pub fn filter_flow_with_filters(
	mut filters: Vec<Box<dyn Filter>>,
	params: &ParamMap,
) -> Result<Arc<Flow>> {
	if filters.is_empty() {
		return Err(MediaError::invalid_param("filter flow without filter instances"));
	}
	for filter in &mut filters {
		filter.init()?;
	}
	let support_async = supports_async(filters[0].as_mut());
	let out_info = if support_async {
		None
	} else {
		// The sync path allocates output frames itself.
		Some(ImageInfo::from_params(params)?)
	};

	let mut slot_map = SlotMap::new().output(0);
	for i in 0..filters.len() {
		slot_map = slot_map.input(i);
	}
	let filters = Mutex::new(filters);
	let slot_map = slot_map
		.transaction(Box::new(move |core: &FlowCore, inputs: &mut [BufferSlot]| {
			run_filters(core, inputs, &filters, support_async, out_info.as_ref())
		}))
		.apply_params(params)?
		.default_model(Model::Sync)
		.default_when_full(FullPolicy::DropCurrent);

	let flow = Flow::builder("filter").slot_map(slot_map).build()?;
	Ok(Arc::new(flow))
}

fn run_filters(
	core: &FlowCore,
	inputs: &mut [BufferSlot],
	filters: &Mutex<Vec<Box<dyn Filter>>>,
	support_async: bool,
	out_info: Option<&ImageInfo>,
) -> bool {
	let mut filters = filters.lock().unwrap();
	let mut has_valid_input = false;
	let mut last_async: Option<usize> = None;

	let mut sync_output = match out_info {
		Some(info) if inputs.iter().any(Option::is_some) => match alloc_frame(info) {
			Ok(output) => Some(output),
			Err(e) => {
				tracing::error!("{}: output allocation failed: {e}", core.name());
				return false;
			},
		},
		_ => None,
	};

	for (i, filter) in filters.iter_mut().enumerate() {
		let Some(input) = inputs[i].take() else {
			continue;
		};
		has_valid_input = true;
		if support_async {
			match filter.send_input(Some(input.clone())) {
				Ok(()) => {},
				Err(MediaError::Again) => {
					// Keep the buffer queued for the next iteration.
					let _ = core.send_input(Some(input), i);
				},
				Err(e) => {
					tracing::error!("{}: filter input failed: {e}", core.name());
					return false;
				},
			}
			last_async = Some(i);
		} else if let Some(output) = sync_output.as_mut() {
			if let Err(e) = filter.process(&input, output) {
				tracing::error!("{}: filter process failed: {e}", core.name());
				return false;
			}
			if input.is_eof() {
				output.set_eof(true);
			}
		}
	}
	if !has_valid_input {
		return true;
	}

	if let Some(output) = sync_output {
		let _ = core.set_output(Some(Arc::new(output)), 0);
	} else if let Some(last) = last_async {
		loop {
			match filters[last].fetch_output() {
				Ok(output) => {
					let _ = core.set_output(Some(output), 0);
				},
				Err(MediaError::Again) => break,
				Err(e) => {
					tracing::error!("{}: filter output failed: {e}", core.name());
					return false;
				},
			}
		}
	}
	true
}

fn alloc_frame(info: &ImageInfo) -> Result<MediaBuffer> {
	// Prefer sharable memory; the hardware allocator may refuse.
	let mut buffer = MediaBuffer::alloc(info.buffer_size(), MemKind::Hardware)
		.or_else(|_| MediaBuffer::alloc(info.buffer_size(), MemKind::Common))?;
	buffer.set_image_info(*info);
	buffer.set_valid_len(info.buffer_size());
	Ok(buffer)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::image::PixelFormat;

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

	/// Sync filter: copies the input darkened by a constant.
	struct DarkenFilter;

	impl Filter for DarkenFilter {
		fn process(&mut self, input: &Arc<MediaBuffer>, output: &mut MediaBuffer) -> Result<()> {
			for (dst, src) in output.payload_mut().iter_mut().zip(input.valid_data()) {
				*dst = src.saturating_sub(0x10);
			}
			output.set_timestamp_us(input.timestamp_us());
			Ok(())
		}
	}

	fn image_params() -> ParamMap {
		ParamMap::parse("pixel_format=rgb888\nwidth=2\nheight=1\nvirtual_width=2\nvirtual_height=1")
	}

	#[test]
	fn sync_filter_emits_typed_frames() {
		let flow =
			filter_flow_with_filters(vec![Box::new(DarkenFilter)], &image_params()).unwrap();
		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		flow.add_down(&sink, 0, 0).unwrap();

		let input = Arc::new(MediaBuffer::from_vec(vec![0x80; 6]));
		flow.send_input(Some(input), 0).unwrap();

		let output = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert_eq!(output.valid_data(), &[0x70; 6]);
		assert!(output.image_info().is_some());
	}

	#[test]
	fn null_inputs_produce_nothing() {
		let flow =
			filter_flow_with_filters(vec![Box::new(DarkenFilter)], &image_params()).unwrap();
		let (tx, rx) = crossbeam_channel::unbounded();
		let sink = capture_sink(tx);
		flow.add_down(&sink, 0, 0).unwrap();

		flow.send_input(None, 0).unwrap();
		// Transaction succeeds without output; the latest-wins cache is
		// empty, so the sink sees a null, which it ignores.
		assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
	}

	#[test]
	fn sync_filters_need_image_geometry() {
		assert!(matches!(
			filter_flow_with_filters(vec![Box::new(DarkenFilter)], &ParamMap::new()),
			Err(MediaError::InvalidParam(_))
		));
	}
}
