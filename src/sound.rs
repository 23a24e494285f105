use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::param::{keys, ParamMap};

/// PCM sample layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
	U8,
	S16,
	S32,
}

impl SampleFormat {
	pub fn bytes_per_sample(&self) -> usize {
		match self {
			SampleFormat::U8 => 1,
			SampleFormat::S16 => 2,
			SampleFormat::S32 => 4,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			SampleFormat::U8 => "u8",
			SampleFormat::S16 => "s16",
			SampleFormat::S32 => "s32",
		}
	}
}

impl FromStr for SampleFormat {
	type Err = MediaError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"u8" => Ok(SampleFormat::U8),
			"s16" => Ok(SampleFormat::S16),
			"s32" => Ok(SampleFormat::S32),
			other => Err(MediaError::invalid_param(format!(
				"unknown sample format '{other}'"
			))),
		}
	}
}

impl fmt::Display for SampleFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Layout of a run of interleaved PCM frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleInfo {
	pub fmt: SampleFormat,
	pub channels: u32,
	pub sample_rate: u32,
	pub frames: u32,
}

impl SampleInfo {
	pub fn is_valid(&self) -> bool {
		self.channels > 0 && self.sample_rate > 0
	}

	/// Byte size of one interleaved frame.
	pub fn frame_size(&self) -> usize {
		self.channels as usize * self.fmt.bytes_per_sample()
	}

	/// Byte size of `frames` interleaved frames.
	pub fn buffer_size(&self) -> usize {
		self.frames as usize * self.frame_size()
	}

	pub fn from_params(params: &ParamMap) -> Result<Self, MediaError> {
		let fmt: SampleFormat = params
			.get(keys::SAMPLE_FORMAT)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::SAMPLE_FORMAT)))?
			.parse()?;
		let channels = params
			.get_as(keys::CHANNEL_NUM)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::CHANNEL_NUM)))?;
		let sample_rate = params
			.get_as(keys::SAMPLE_RATE)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::SAMPLE_RATE)))?;
		let info = Self {
			fmt,
			channels,
			sample_rate,
			frames: params.get_as(keys::FRAME_NUM).unwrap_or(0),
		};
		if !info.is_valid() {
			return Err(MediaError::invalid_param(format!(
				"bad sample layout: {} channels at {} Hz",
				info.channels, info.sample_rate
			)));
		}
		Ok(info)
	}

	pub fn append_to_params(&self, params: &mut ParamMap) {
		params.set(keys::SAMPLE_FORMAT, self.fmt.as_str());
		params.set(keys::CHANNEL_NUM, self.channels.to_string());
		params.set(keys::SAMPLE_RATE, self.sample_rate.to_string());
		params.set(keys::FRAME_NUM, self.frames.to_string());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sizes() {
		let info = SampleInfo {
			fmt: SampleFormat::S16,
			channels: 2,
			sample_rate: 48000,
			frames: 1024,
		};
		assert_eq!(info.frame_size(), 4);
		assert_eq!(info.buffer_size(), 4096);
	}

	#[test]
	fn params_round_trip() {
		let info = SampleInfo {
			fmt: SampleFormat::S32,
			channels: 6,
			sample_rate: 44100,
			frames: 256,
		};
		let mut params = ParamMap::new();
		info.append_to_params(&mut params);
		assert_eq!(SampleInfo::from_params(&params).unwrap(), info);

		let bad = ParamMap::parse("sample_format=s16\nchannel_num=0\nsample_rate=48000");
		assert!(SampleInfo::from_params(&bad).is_err());
	}
}
