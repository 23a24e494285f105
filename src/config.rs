//! Typed stage configuration records, parsed from parameter strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::image::ImageInfo;
use crate::media_type::{AUDIO_PREFIX, IMAGE_PREFIX, VIDEO_PREFIX};
use crate::param::{keys, ParamMap};
use crate::sound::SampleInfo;

/// Rate-control quality preset. `Cqp` selects constant-QP mode, `AqOnly`
/// adaptive quantization only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcQuality {
	Worst,
	Worse,
	#[default]
	Medium,
	Better,
	Best,
	Cqp,
	AqOnly,
}

impl FromStr for RcQuality {
	type Err = MediaError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"worst" => Ok(RcQuality::Worst),
			"worse" => Ok(RcQuality::Worse),
			"medium" => Ok(RcQuality::Medium),
			"better" => Ok(RcQuality::Better),
			"best" => Ok(RcQuality::Best),
			"cqp" => Ok(RcQuality::Cqp),
			"aq_only" => Ok(RcQuality::AqOnly),
			other => Err(MediaError::invalid_param(format!(
				"unknown rc quality '{other}'"
			))),
		}
	}
}

impl fmt::Display for RcQuality {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			RcQuality::Worst => "worst",
			RcQuality::Worse => "worse",
			RcQuality::Medium => "medium",
			RcQuality::Better => "better",
			RcQuality::Best => "best",
			RcQuality::Cqp => "cqp",
			RcQuality::AqOnly => "aq_only",
		};
		f.write_str(s)
	}
}

/// Rate-control mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcMode {
	#[default]
	Vbr,
	Cbr,
}

impl FromStr for RcMode {
	type Err = MediaError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"vbr" => Ok(RcMode::Vbr),
			"cbr" => Ok(RcMode::Cbr),
			other => Err(MediaError::invalid_param(format!("unknown rc mode '{other}'"))),
		}
	}
}

impl fmt::Display for RcMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RcMode::Vbr => "vbr",
			RcMode::Cbr => "cbr",
		})
	}
}

/// Still-image codec configuration. For h264 a higher `qp_init` compresses
/// more at lower quality; for jpeg the scale runs the other way.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
	pub image_info: ImageInfo,
	pub qp_init: i32,
}

/// Video codec configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
	pub image_cfg: ImageConfig,
	pub qp_step: i32,
	pub qp_min: i32,
	pub qp_max: i32,
	pub bit_rate: u32,
	pub frame_rate: u32,
	pub level: i32,
	pub gop_size: u32,
	pub profile: i32,
	pub rc_quality: RcQuality,
	pub rc_mode: RcMode,
}

/// Audio codec configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
	pub sample_info: SampleInfo,
	pub bit_rate: u32,
	/// Encoder-specific float quality (vorbis-style -0.1..1.0 scale).
	pub quality: f32,
}

/// Tagged configuration for a stage, selected by the class of its
/// `output_data_type`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaConfig {
	Image(ImageConfig),
	Video(VideoConfig),
	Audio(AudioConfig),
}

impl MediaConfig {
	/// Parses a config from a parameter map; the `output_data_type` key
	/// decides which record is expected.
	pub fn from_params(params: &ParamMap) -> Result<MediaConfig, MediaError> {
		let out_type = params.get(keys::OUTPUT_DATA_TYPE).ok_or_else(|| {
			MediaError::invalid_param(format!("missing {}", keys::OUTPUT_DATA_TYPE))
		})?;
		if out_type.starts_with(IMAGE_PREFIX) {
			Ok(MediaConfig::Image(ImageConfig {
				image_info: ImageInfo::from_params(params)?,
				qp_init: require(params, keys::QP_INIT)?,
			}))
		} else if out_type.starts_with(VIDEO_PREFIX) {
			Ok(MediaConfig::Video(VideoConfig {
				image_cfg: ImageConfig {
					image_info: ImageInfo::from_params(params)?,
					qp_init: require(params, keys::QP_INIT)?,
				},
				qp_step: require(params, keys::QP_STEP)?,
				qp_min: require(params, keys::QP_MIN)?,
				qp_max: require(params, keys::QP_MAX)?,
				bit_rate: require(params, keys::BITRATE)?,
				frame_rate: require(params, keys::FPS)?,
				level: require(params, keys::LEVEL)?,
				gop_size: require(params, keys::GOP)?,
				profile: require(params, keys::PROFILE)?,
				rc_quality: require(params, keys::RC_QUALITY)?,
				rc_mode: require(params, keys::RC_MODE)?,
			}))
		} else if out_type.starts_with(AUDIO_PREFIX) {
			Ok(MediaConfig::Audio(AudioConfig {
				sample_info: SampleInfo::from_params(params)?,
				bit_rate: require(params, keys::BITRATE)?,
				quality: params.get_as(keys::FLOAT_QUALITY).unwrap_or(0.0),
			}))
		} else {
			Err(MediaError::invalid_param(format!(
				"unsupported output type '{out_type}'"
			)))
		}
	}

	pub fn as_video(&self) -> Option<&VideoConfig> {
		match self {
			MediaConfig::Video(cfg) => Some(cfg),
			_ => None,
		}
	}

	pub fn as_image(&self) -> Option<&ImageConfig> {
		match self {
			MediaConfig::Image(cfg) => Some(cfg),
			_ => None,
		}
	}

	pub fn as_audio(&self) -> Option<&AudioConfig> {
		match self {
			MediaConfig::Audio(cfg) => Some(cfg),
			_ => None,
		}
	}
}

fn require<T: FromStr>(params: &ParamMap, key: &str) -> Result<T, MediaError> {
	params
		.get(key)
		.ok_or_else(|| MediaError::invalid_param(format!("missing {key}")))?
		.parse()
		.map_err(|_| MediaError::invalid_param(format!("bad value for {key}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	const VIDEO_PARAMS: &str = "output_data_type=video:h264\npixel_format=nv12\nwidth=1280\nheight=720\nqp_init=24\nqp_step=2\nqp_min=12\nqp_max=40\nbitrate=4000000\nfps=30\nlevel=40\ngop=60\nprofile=100\nrc_quality=best\nrc_mode=cbr";

	#[test]
	fn parse_video_config() {
		let params = ParamMap::parse(VIDEO_PARAMS);
		let config = MediaConfig::from_params(&params).unwrap();
		let video = config.as_video().unwrap();
		assert_eq!(video.image_cfg.image_info.width, 1280);
		assert_eq!(video.bit_rate, 4_000_000);
		assert_eq!(video.frame_rate, 30);
		assert_eq!(video.rc_quality, RcQuality::Best);
		assert_eq!(video.rc_mode, RcMode::Cbr);
	}

	#[test]
	fn parse_audio_config() {
		let params = ParamMap::parse(
			"output_data_type=audio:vorbis\nsample_format=s16\nchannel_num=2\nsample_rate=48000\nframe_num=1024\nbitrate=128000\ncompress_quality=0.5",
		);
		let config = MediaConfig::from_params(&params).unwrap();
		let audio = config.as_audio().unwrap();
		assert_eq!(audio.sample_info.channels, 2);
		assert_eq!(audio.bit_rate, 128_000);
		assert!((audio.quality - 0.5).abs() < f32::EPSILON);
	}

	#[test]
	fn missing_keys_are_rejected() {
		let params =
			ParamMap::parse("output_data_type=video:h264\npixel_format=nv12\nwidth=64\nheight=64");
		assert!(MediaConfig::from_params(&params).is_err());
		let params = ParamMap::parse("pixel_format=nv12\nwidth=64\nheight=64");
		assert!(MediaConfig::from_params(&params).is_err());
	}
}
