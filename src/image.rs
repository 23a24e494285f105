use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::param::{keys, ParamMap};

/// Pixel layouts understood by the pipeline. The tag only names the layout;
/// stages interpret the payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
	Yuv420p,
	Nv12,
	Nv21,
	Yuv422p,
	Nv16,
	Nv61,
	Yuyv422,
	Uyvy422,
	Rgb565,
	Bgr565,
	Rgb888,
	Bgr888,
	Argb8888,
	Abgr8888,
	Jpeg,
}

impl PixelFormat {
	/// Bytes per pixel as a rational (numerator, denominator), used to size
	/// image allocations from stride dimensions.
	pub fn bpp_ratio(&self) -> (usize, usize) {
		match self {
			PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21 => (3, 2),
			PixelFormat::Yuv422p
			| PixelFormat::Nv16
			| PixelFormat::Nv61
			| PixelFormat::Yuyv422
			| PixelFormat::Uyvy422
			| PixelFormat::Rgb565
			| PixelFormat::Bgr565 => (2, 1),
			PixelFormat::Rgb888 | PixelFormat::Bgr888 => (3, 1),
			PixelFormat::Argb8888 | PixelFormat::Abgr8888 => (4, 1),
			// Compressed; treated as one byte per pixel for worst-case sizing.
			PixelFormat::Jpeg => (1, 1),
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			PixelFormat::Yuv420p => "yuv420p",
			PixelFormat::Nv12 => "nv12",
			PixelFormat::Nv21 => "nv21",
			PixelFormat::Yuv422p => "yuv422p",
			PixelFormat::Nv16 => "nv16",
			PixelFormat::Nv61 => "nv61",
			PixelFormat::Yuyv422 => "yuyv422",
			PixelFormat::Uyvy422 => "uyvy422",
			PixelFormat::Rgb565 => "rgb565",
			PixelFormat::Bgr565 => "bgr565",
			PixelFormat::Rgb888 => "rgb888",
			PixelFormat::Bgr888 => "bgr888",
			PixelFormat::Argb8888 => "argb8888",
			PixelFormat::Abgr8888 => "abgr8888",
			PixelFormat::Jpeg => "jpeg",
		}
	}
}

impl FromStr for PixelFormat {
	type Err = MediaError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"yuv420p" => Ok(PixelFormat::Yuv420p),
			"nv12" => Ok(PixelFormat::Nv12),
			"nv21" => Ok(PixelFormat::Nv21),
			"yuv422p" => Ok(PixelFormat::Yuv422p),
			"nv16" => Ok(PixelFormat::Nv16),
			"nv61" => Ok(PixelFormat::Nv61),
			"yuyv422" => Ok(PixelFormat::Yuyv422),
			"uyvy422" => Ok(PixelFormat::Uyvy422),
			"rgb565" => Ok(PixelFormat::Rgb565),
			"bgr565" => Ok(PixelFormat::Bgr565),
			"rgb888" => Ok(PixelFormat::Rgb888),
			"bgr888" => Ok(PixelFormat::Bgr888),
			"argb8888" => Ok(PixelFormat::Argb8888),
			"abgr8888" => Ok(PixelFormat::Abgr8888),
			"jpeg" => Ok(PixelFormat::Jpeg),
			other => Err(MediaError::invalid_param(format!(
				"unknown pixel format '{other}'"
			))),
		}
	}
}

impl fmt::Display for PixelFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Rounds up to the next multiple of 16, the usual stride alignment of
/// hardware image planes.
pub fn align16(value: u32) -> u32 {
	(value + 15) & !15
}

/// Geometry of an image plane. `vir_*` are the stride dimensions of the
/// backing buffer and must not be smaller than the logical dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
	pub pix_fmt: PixelFormat,
	pub width: u32,
	pub height: u32,
	pub vir_width: u32,
	pub vir_height: u32,
}

impl ImageInfo {
	pub fn new(pix_fmt: PixelFormat, width: u32, height: u32) -> Self {
		Self {
			pix_fmt,
			width,
			height,
			vir_width: align16(width),
			vir_height: align16(height),
		}
	}

	pub fn is_valid(&self) -> bool {
		self.width > 0
			&& self.height > 0
			&& self.vir_width >= self.width
			&& self.vir_height >= self.height
	}

	/// Byte size of a full frame at stride dimensions.
	pub fn buffer_size(&self) -> usize {
		let (num, den) = self.pix_fmt.bpp_ratio();
		self.vir_width as usize * self.vir_height as usize * num / den
	}

	/// Reads `pixel_format`, `width`, `height` and the optional
	/// `virtual_width`/`virtual_height` keys. Missing virtual dimensions
	/// default to 16-aligned logical dimensions.
	pub fn from_params(params: &ParamMap) -> Result<Self, MediaError> {
		let pix_fmt: PixelFormat = params
			.get(keys::PIXEL_FORMAT)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::PIXEL_FORMAT)))?
			.parse()?;
		let width: u32 = params
			.get_as(keys::WIDTH)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::WIDTH)))?;
		let height: u32 = params
			.get_as(keys::HEIGHT)
			.ok_or_else(|| MediaError::invalid_param(format!("missing {}", keys::HEIGHT)))?;
		let info = Self {
			pix_fmt,
			width,
			height,
			vir_width: params.get_as(keys::VIRTUAL_WIDTH).unwrap_or(align16(width)),
			vir_height: params.get_as(keys::VIRTUAL_HEIGHT).unwrap_or(align16(height)),
		};
		if !info.is_valid() {
			return Err(MediaError::invalid_param(format!(
				"bad image geometry {}x{} stride {}x{}",
				info.width, info.height, info.vir_width, info.vir_height
			)));
		}
		Ok(info)
	}

	pub fn append_to_params(&self, params: &mut ParamMap) {
		params.set(keys::PIXEL_FORMAT, self.pix_fmt.as_str());
		params.set(keys::WIDTH, self.width.to_string());
		params.set(keys::HEIGHT, self.height.to_string());
		params.set(keys::VIRTUAL_WIDTH, self.vir_width.to_string());
		params.set(keys::VIRTUAL_HEIGHT, self.vir_height.to_string());
	}
}

/// A rectangle inside an image plane, used by the display control requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRect {
	pub x: i32,
	pub y: i32,
	pub width: u32,
	pub height: u32,
}
