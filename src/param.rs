//! Parameter strings: `key=value` entries separated by `\n`.
//!
//! Every factory in the registry takes its configuration in this form. The
//! map keeps insertion order so serializing it back produces the entries in
//! the order the declaring code appended them.

use std::fmt;
use std::str::FromStr;

/// Well-known parameter keys shared by factories and flows.
pub mod keys {
	pub const NAME: &str = "name";
	pub const PATH: &str = "path";
	pub const OPEN_MODE: &str = "mode";

	pub const CODEC_NAME: &str = "codec_name";
	pub const CODEC_PARAM: &str = "codec_param";

	pub const INPUT_DATA_TYPE: &str = "input_data_type";
	pub const OUTPUT_DATA_TYPE: &str = "output_data_type";

	// image info
	pub const PIXEL_FORMAT: &str = "pixel_format";
	pub const WIDTH: &str = "width";
	pub const HEIGHT: &str = "height";
	pub const VIRTUAL_WIDTH: &str = "virtual_width";
	pub const VIRTUAL_HEIGHT: &str = "virtual_height";

	// video info
	pub const QP_INIT: &str = "qp_init";
	pub const QP_STEP: &str = "qp_step";
	pub const QP_MIN: &str = "qp_min";
	pub const QP_MAX: &str = "qp_max";
	pub const BITRATE: &str = "bitrate";
	pub const FPS: &str = "fps";
	pub const LEVEL: &str = "level";
	pub const GOP: &str = "gop";
	pub const PROFILE: &str = "profile";
	pub const RC_QUALITY: &str = "rc_quality";
	pub const RC_MODE: &str = "rc_mode";

	// audio info
	pub const SAMPLE_FORMAT: &str = "sample_format";
	pub const CHANNEL_NUM: &str = "channel_num";
	pub const SAMPLE_RATE: &str = "sample_rate";
	pub const FRAME_NUM: &str = "frame_num";
	pub const FLOAT_QUALITY: &str = "compress_quality";

	// memory
	pub const MEM_TYPE: &str = "mem_type";
	pub const MEM_SIZE_PERTIME: &str = "size_pertime";

	// flow scheduling
	pub const THREAD_MODEL: &str = "thread_model";
	pub const MODE_WHEN_FULL: &str = "mode_when_full";
	pub const INPUT_MAX_CACHE_NUM: &str = "input_maxcachenum";
	pub const INTERVAL_US: &str = "interval_us";
	pub const OUTPUT_CACHE_NUM: &str = "output_cache_num";
	pub const EXTRA_OUTPUT: &str = "extra_output";

	pub const LOOP_TIME: &str = "loop_time";
}

/// An ordered `key=value` mapping parsed from a parameter string.
///
/// Duplicate keys overwrite in place (last write wins, first position kept).
/// Unknown keys are preserved; consumers read only the keys they recognize.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamMap {
	entries: Vec<(String, String)>,
}

impl ParamMap {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	/// Parses a `key=value\n…` parameter string.
	///
	/// A non-empty entry without `=` is a syntactic error and yields an empty
	/// map. Whitespace is significant inside values; an empty value is valid
	/// and distinct from an absent key.
	pub fn parse(param: &str) -> Self {
		let mut map = Self::new();
		for entry in param.split('\n') {
			if entry.is_empty() {
				continue;
			}
			let Some((key, value)) = entry.split_once('=') else {
				tracing::debug!("Malformed parameter entry '{entry}', dropping map.");
				return Self::new();
			};
			if key.is_empty() {
				tracing::debug!("Empty key in parameter entry '{entry}', dropping map.");
				return Self::new();
			}
			map.set(key, value);
		}
		map
	}

	/// Splits a parameter string into top-level items by `delim`, keeping
	/// non-empty items only. Used for wrapper flows whose parameter string
	/// carries a flow part and a stage part.
	pub fn parse_list(param: &str, delim: char) -> Vec<String> {
		param
			.split(delim)
			.filter(|item| !item.is_empty())
			.map(str::to_string)
			.collect()
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.entries
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}

	/// Typed lookup through `FromStr`. Returns `None` for an absent key and
	/// for a value that does not parse.
	pub fn get_as<T: FromStr>(&self, key: &str) -> Option<T> {
		self.get(key).and_then(|v| v.parse().ok())
	}

	pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
		let key = key.into();
		let value = value.into();
		match self.entries.iter_mut().find(|(k, _)| *k == key) {
			Some(entry) => entry.1 = value,
			None => self.entries.push((key, value)),
		}
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.iter().any(|(k, _)| k == key)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}
}

impl fmt::Display for ParamMap {
	/// Canonical serialization: one `key=value\n` per entry, insertion order.
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (key, value) in &self.entries {
			writeln!(f, "{key}={value}")?;
		}
		Ok(())
	}
}
