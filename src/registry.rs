//! Named-factory lookup for every stage kind.
//!
//! The registry is built once from constant factory records (names, type
//! strings, fn pointers) and installed process-wide before the graph is
//! wired; after that it is immutable. Capability matching runs over the
//! `input_data_type` / `output_data_type` keys of the parameter map.

use std::sync::{Arc, OnceLock};

use crate::error::{MediaError, Result};
use crate::flow::{self, Flow};
use crate::media_type::has_intersection;
use crate::param::{keys, ParamMap};
use crate::stage::codec::Codec;
use crate::stage::filter::Filter;
use crate::stage::muxer::{Demuxer, Muxer};
use crate::stream::{self, Stream};

/// The stage kinds with their own factory table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
	Flow,
	Stream,
	Codec,
	Filter,
	Muxer,
	Demuxer,
}

/// Identity and capability declaration shared by every factory record.
///
/// Type declarations: `None` matches nothing, `Some("")` accepts anything,
/// otherwise a token list matched by non-empty intersection.
#[derive(Clone, Copy, Debug)]
pub struct FactoryMeta {
	pub name: &'static str,
	pub expected_input: Option<&'static str>,
	pub output: Option<&'static str>,
}

impl FactoryMeta {
	/// The capability predicate: checks the requested data types against
	/// the declared sets. An absent key or an explicitly empty value places
	/// no constraint.
	pub fn accepts(&self, params: &ParamMap) -> bool {
		let rules = [
			(keys::INPUT_DATA_TYPE, self.expected_input),
			(keys::OUTPUT_DATA_TYPE, self.output),
		];
		for (key, declared) in rules {
			let Some(requested) = params.get(key) else {
				continue;
			};
			if requested.is_empty() {
				continue;
			}
			match declared {
				None => return false,
				Some("") => {},
				Some(supported) => {
					if !has_intersection(requested, supported) {
						return false;
					}
				},
			}
		}
		true
	}
}

pub struct FlowFactory {
	pub meta: FactoryMeta,
	/// Takes the raw parameter string: wrapper flows carry a second,
	/// space-separated part with the wrapped stage's parameters.
	pub create: fn(&str) -> Result<Arc<Flow>>,
}

pub struct StreamFactory {
	pub meta: FactoryMeta,
	pub create: fn(&ParamMap) -> Result<Box<dyn Stream>>,
}

pub struct CodecFactory {
	pub meta: FactoryMeta,
	pub create: fn(&ParamMap) -> Result<Box<dyn Codec>>,
}

pub struct FilterFactory {
	pub meta: FactoryMeta,
	pub create: fn(&ParamMap) -> Result<Box<dyn Filter>>,
}

pub struct MuxerFactory {
	pub meta: FactoryMeta,
	pub create: fn(&ParamMap) -> Result<Box<dyn Muxer>>,
}

pub struct DemuxerFactory {
	pub meta: FactoryMeta,
	pub create: fn(&ParamMap) -> Result<Box<dyn Demuxer>>,
}

/// Per-kind factory tables.
#[derive(Default)]
pub struct Registry {
	flows: Vec<FlowFactory>,
	streams: Vec<StreamFactory>,
	codecs: Vec<CodecFactory>,
	filters: Vec<FilterFactory>,
	muxers: Vec<MuxerFactory>,
	demuxers: Vec<DemuxerFactory>,
}

impl Registry {
	/// A registry holding the factories this crate ships: the wrapper flows
	/// and the file streams. Codec, filter and muxer adapters come from
	/// device crates and are registered through [`RegistryBuilder`].
	pub fn with_builtins() -> Registry {
		RegistryBuilder::new()
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "file_read_flow",
					expected_input: None,
					output: Some(""),
				},
				create: flow::file_read_flow,
			})
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "source_stream",
					expected_input: None,
					output: Some(""),
				},
				create: flow::source_stream_flow,
			})
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "output_stream",
					expected_input: Some(""),
					output: None,
				},
				create: flow::output_stream_flow,
			})
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "filter",
					expected_input: Some(""),
					output: Some(""),
				},
				create: flow::filter_flow,
			})
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "video_dec",
					expected_input: Some(""),
					output: Some(""),
				},
				create: flow::video_decoder_flow,
			})
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "video_enc",
					expected_input: Some(""),
					output: Some(""),
				},
				create: flow::video_encoder_flow,
			})
			.flow(FlowFactory {
				meta: FactoryMeta {
					name: "muxer",
					// The flow parameters carry the stream config's
					// output_data_type, so the factory accepts any.
					expected_input: Some(""),
					output: Some(""),
				},
				create: flow::muxer_flow,
			})
			.stream(StreamFactory {
				meta: FactoryMeta {
					name: "file_read_stream",
					expected_input: Some(crate::media_type::STREAM_FILE),
					output: Some(""),
				},
				create: stream::file_read_stream,
			})
			.stream(StreamFactory {
				meta: FactoryMeta {
					name: "file_write_stream",
					expected_input: Some(""),
					output: Some(crate::media_type::STREAM_FILE),
				},
				create: stream::file_write_stream,
			})
			.build()
	}

	pub fn builder() -> RegistryBuilder {
		RegistryBuilder::new()
	}

	pub fn create_flow(&self, name: &str, param: &str) -> Result<Arc<Flow>> {
		let factory = Self::lookup(&self.flows, |f| f.meta.name, name)?;
		if !factory.meta.accepts(&flow_predicate_params(param)) {
			return Err(MediaError::invalid_param(format!(
				"factory '{name}' rejected parameters"
			)));
		}
		(factory.create)(param)
	}

	pub fn create_stream(&self, name: &str, param: &str) -> Result<Box<dyn Stream>> {
		let factory = Self::lookup(&self.streams, |f| f.meta.name, name)?;
		let params = ParamMap::parse(param);
		Self::check(&factory.meta, name, &params)?;
		(factory.create)(&params)
	}

	pub fn create_codec(&self, name: &str, param: &str) -> Result<Box<dyn Codec>> {
		let factory = Self::lookup(&self.codecs, |f| f.meta.name, name)?;
		let params = ParamMap::parse(param);
		Self::check(&factory.meta, name, &params)?;
		(factory.create)(&params)
	}

	pub fn create_filter(&self, name: &str, param: &str) -> Result<Box<dyn Filter>> {
		let factory = Self::lookup(&self.filters, |f| f.meta.name, name)?;
		let params = ParamMap::parse(param);
		Self::check(&factory.meta, name, &params)?;
		(factory.create)(&params)
	}

	pub fn create_muxer(&self, name: &str, param: &str) -> Result<Box<dyn Muxer>> {
		let factory = Self::lookup(&self.muxers, |f| f.meta.name, name)?;
		let params = ParamMap::parse(param);
		Self::check(&factory.meta, name, &params)?;
		(factory.create)(&params)
	}

	pub fn create_demuxer(&self, name: &str, param: &str) -> Result<Box<dyn Demuxer>> {
		let factory = Self::lookup(&self.demuxers, |f| f.meta.name, name)?;
		let params = ParamMap::parse(param);
		Self::check(&factory.meta, name, &params)?;
		(factory.create)(&params)
	}

	/// Non-constructing probe: does the named factory accept the rule
	/// string? Used by wrapper flows to check type compatibility before
	/// instantiating the wrapped stage.
	pub fn is_match(&self, kind: StageKind, name: &str, rule: &str) -> bool {
		let meta = match kind {
			StageKind::Flow => Self::lookup(&self.flows, |f| f.meta.name, name).map(|f| f.meta),
			StageKind::Stream => Self::lookup(&self.streams, |f| f.meta.name, name).map(|f| f.meta),
			StageKind::Codec => Self::lookup(&self.codecs, |f| f.meta.name, name).map(|f| f.meta),
			StageKind::Filter => Self::lookup(&self.filters, |f| f.meta.name, name).map(|f| f.meta),
			StageKind::Muxer => Self::lookup(&self.muxers, |f| f.meta.name, name).map(|f| f.meta),
			StageKind::Demuxer => {
				Self::lookup(&self.demuxers, |f| f.meta.name, name).map(|f| f.meta)
			},
		};
		match meta {
			Ok(meta) => meta.accepts(&ParamMap::parse(rule)),
			Err(_) => false,
		}
	}

	fn lookup<'a, T>(table: &'a [T], name_of: fn(&T) -> &'static str, name: &str) -> Result<&'a T> {
		table
			.iter()
			.find(|factory| name_of(factory) == name)
			.ok_or_else(|| MediaError::NotFound(name.to_string()))
	}

	fn check(meta: &FactoryMeta, name: &str, params: &ParamMap) -> Result<()> {
		if !meta.accepts(params) {
			return Err(MediaError::invalid_param(format!(
				"factory '{name}' rejected parameters"
			)));
		}
		Ok(())
	}
}

/// The predicate map of a flow parameter string: wrapper flows put the flow
/// options in the first space-separated part, the wrapped stage's own
/// parameters after it.
fn flow_predicate_params(param: &str) -> ParamMap {
	ParamMap::parse(param.split(' ').next().unwrap_or(""))
}

/// Assembles a registry from constant factory records; the result is
/// installed once and never mutated afterwards.
#[derive(Default)]
pub struct RegistryBuilder {
	registry: Registry,
}

impl RegistryBuilder {
	pub fn new() -> RegistryBuilder {
		RegistryBuilder {
			registry: Registry::default(),
		}
	}

	pub fn flow(mut self, factory: FlowFactory) -> Self {
		self.warn_duplicate(StageKind::Flow, factory.meta.name);
		self.registry.flows.push(factory);
		self
	}

	pub fn stream(mut self, factory: StreamFactory) -> Self {
		self.warn_duplicate(StageKind::Stream, factory.meta.name);
		self.registry.streams.push(factory);
		self
	}

	pub fn codec(mut self, factory: CodecFactory) -> Self {
		self.warn_duplicate(StageKind::Codec, factory.meta.name);
		self.registry.codecs.push(factory);
		self
	}

	pub fn filter(mut self, factory: FilterFactory) -> Self {
		self.warn_duplicate(StageKind::Filter, factory.meta.name);
		self.registry.filters.push(factory);
		self
	}

	pub fn muxer(mut self, factory: MuxerFactory) -> Self {
		self.warn_duplicate(StageKind::Muxer, factory.meta.name);
		self.registry.muxers.push(factory);
		self
	}

	pub fn demuxer(mut self, factory: DemuxerFactory) -> Self {
		self.warn_duplicate(StageKind::Demuxer, factory.meta.name);
		self.registry.demuxers.push(factory);
		self
	}

	fn warn_duplicate(&self, kind: StageKind, name: &str) {
		let exists = match kind {
			StageKind::Flow => self.registry.flows.iter().any(|f| f.meta.name == name),
			StageKind::Stream => self.registry.streams.iter().any(|f| f.meta.name == name),
			StageKind::Codec => self.registry.codecs.iter().any(|f| f.meta.name == name),
			StageKind::Filter => self.registry.filters.iter().any(|f| f.meta.name == name),
			StageKind::Muxer => self.registry.muxers.iter().any(|f| f.meta.name == name),
			StageKind::Demuxer => self.registry.demuxers.iter().any(|f| f.meta.name == name),
		};
		if exists {
			tracing::warn!("Repeated factory identifier '{name}', later lookups keep the first.");
		}
	}

	pub fn build(self) -> Registry {
		self.registry
	}
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Installs the process-wide registry. Must run before the first
/// [`global`] call; afterwards the tables are immutable.
pub fn install(registry: Registry) -> Result<()> {
	REGISTRY
		.set(registry)
		.map_err(|_| MediaError::invalid_param("registry already installed"))
}

/// The process-wide registry, defaulting to [`Registry::with_builtins`].
pub fn global() -> &'static Registry {
	REGISTRY.get_or_init(Registry::with_builtins)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::media_type::VIDEO_H264;

	fn image_to_video_meta() -> FactoryMeta {
		FactoryMeta {
			name: "test_enc",
			expected_input: Some("image:nv12,image:uyvy422"),
			output: Some(VIDEO_H264),
		}
	}

	#[test]
	fn capability_matching_truth_table() {
		let meta = image_to_video_meta();
		// Matching request.
		assert!(meta.accepts(&ParamMap::parse(
			"input_data_type=image:nv12\noutput_data_type=video:h264"
		)));
		// Wrong input type.
		assert!(!meta.accepts(&ParamMap::parse(
			"input_data_type=image:rgb888\noutput_data_type=video:h264"
		)));
		// Absent keys place no constraint.
		assert!(meta.accepts(&ParamMap::parse("path=/dev/null")));
		// Explicit empty request places no constraint.
		assert!(meta.accepts(&ParamMap::parse("input_data_type=")));

		// A factory declaring no output matches no requested output.
		let sink = FactoryMeta {
			name: "test_sink",
			expected_input: Some(""),
			output: None,
		};
		assert!(sink.accepts(&ParamMap::parse("input_data_type=image:nv12")));
		assert!(!sink.accepts(&ParamMap::parse("output_data_type=video:h264")));

		// Anything-typed factories accept every concrete request.
		let any = FactoryMeta {
			name: "test_any",
			expected_input: Some(""),
			output: Some(""),
		};
		assert!(any.accepts(&ParamMap::parse(
			"input_data_type=image:nv12\noutput_data_type=video:h264"
		)));
	}

	#[test]
	fn lookup_miss_is_not_found() {
		let registry = Registry::with_builtins();
		assert!(matches!(
			registry.create_stream("no_such_stream", ""),
			Err(MediaError::NotFound(_))
		));
		assert!(!registry.is_match(StageKind::Codec, "no_such_codec", ""));
	}

	#[test]
	fn rejected_predicate_is_invalid_param() {
		let registry = Registry::with_builtins();
		// file_write_stream outputs stream:file, not video.
		assert!(matches!(
			registry.create_stream("file_write_stream", "output_data_type=video:h264"),
			Err(MediaError::InvalidParam(_))
		));
	}

	#[test]
	fn is_match_probes_without_constructing() {
		let registry = Registry::with_builtins();
		assert!(registry.is_match(StageKind::Stream, "file_write_stream", "output_data_type=stream:file"));
		assert!(!registry.is_match(StageKind::Stream, "file_write_stream", "output_data_type=stream:ogg"));
	}

	#[test]
	fn constructor_failure_surfaces() {
		let registry = Registry::with_builtins();
		// Parameters pass the predicate but the file does not exist.
		assert!(registry
			.create_stream("file_read_stream", "path=/no/such/file\nmode=r")
			.is_err());
	}
}
