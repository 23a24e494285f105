//! `output_stream`: a terminal sink writing buffers into any registered
//! writeable stream. Parameter string: `<flow params> <stream params>`.

use std::sync::{Arc, Mutex};

use crate::error::{MediaError, Result};
use crate::param::{keys, ParamMap};
use crate::registry;

use super::{BufferSlot, Flow, FlowCore, FullPolicy, Model, SlotMap};

pub(crate) fn output_stream_flow(param: &str) -> Result<Arc<Flow>> {
	let parts = ParamMap::parse_list(param, ' ');
	if parts.len() != 2 {
		return Err(MediaError::invalid_param(
			"output_stream expects '<flow params> <stream params>'",
		));
	}
	let params = ParamMap::parse(&parts[0]);
	let stream_name = params
		.get(keys::NAME)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::NAME)))?;
	let stream = registry::global().create_stream(stream_name, &parts[1])?;
	let stream = Arc::new(Mutex::new(stream));

	let default_model = if params.contains(keys::FPS) {
		Model::AsyncAtomic
	} else {
		Model::AsyncCommon
	};
	let write_stream = stream.clone();
	let slot_map = SlotMap::new()
		.input(0)
		.max_cache(vec![1])
		.transaction(Box::new(move |core: &FlowCore, inputs: &mut [BufferSlot]| {
			let Some(buffer) = inputs[0].take() else {
				return true;
			};
			match write_stream.lock().unwrap().write(buffer.valid_data()) {
				Ok(_) => true,
				Err(e) => {
					tracing::error!("{}: write failed: {e}", core.name());
					false
				},
			}
		}))
		.apply_params(&params)?
		.default_model(default_model)
		.default_when_full(FullPolicy::DropCurrent);

	let flow = Flow::builder(format!("output_stream:{stream_name}")).slot_map(slot_map).build()?;
	flow.set_controller(Box::new(move |request, arg| {
		stream.lock().unwrap().io_ctrl(request, arg)
	}));
	Ok(Arc::new(flow))
}
