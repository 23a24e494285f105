//! Media-type tokens used for capability matching between stages.
//!
//! Convention: a token is `class:subtype` (`image:nv12`, `video:h264`);
//! several tokens may be concatenated with `\n` or `,`. The empty string
//! matches any type, the absence of a declaration matches nothing.

/// Content-type tag carried by a media buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MediaType {
	#[default]
	None,
	Audio,
	Image,
	Video,
	Text,
}

pub const TYPE_ANYTHING: &str = "";

pub const IMAGE_PREFIX: &str = "image:";
pub const IMAGE_YUV420P: &str = "image:yuv420p";
pub const IMAGE_NV12: &str = "image:nv12";
pub const IMAGE_NV21: &str = "image:nv21";
pub const IMAGE_YUV422P: &str = "image:yuv422p";
pub const IMAGE_NV16: &str = "image:nv16";
pub const IMAGE_NV61: &str = "image:nv61";
pub const IMAGE_YUYV422: &str = "image:yuyv422";
pub const IMAGE_UYVY422: &str = "image:uyvy422";
pub const IMAGE_RGB565: &str = "image:rgb565";
pub const IMAGE_BGR565: &str = "image:bgr565";
pub const IMAGE_RGB888: &str = "image:rgb888";
pub const IMAGE_BGR888: &str = "image:bgr888";
pub const IMAGE_ARGB8888: &str = "image:argb8888";
pub const IMAGE_ABGR8888: &str = "image:abgr8888";
pub const IMAGE_JPEG: &str = "image:jpeg";

pub const VIDEO_PREFIX: &str = "video:";
pub const VIDEO_H264: &str = "video:h264";

pub const AUDIO_PREFIX: &str = "audio:";
pub const AUDIO_PCM_U8: &str = "audio:pcm_u8";
pub const AUDIO_PCM_S16: &str = "audio:pcm_s16";
pub const AUDIO_PCM_S32: &str = "audio:pcm_s32";
pub const AUDIO_VORBIS: &str = "audio:vorbis";

pub const STREAM_PREFIX: &str = "stream:";
pub const STREAM_OGG: &str = "stream:ogg";
pub const STREAM_FILE: &str = "stream:file";

/// Splits a token list on both accepted separators.
pub fn split_tokens(list: &str) -> impl Iterator<Item = &str> {
	list.split(['\n', ',']).filter(|token| !token.is_empty())
}

/// True if the two token lists share at least one token.
pub fn has_intersection(request: &str, supported: &str) -> bool {
	split_tokens(request).any(|token| split_tokens(supported).any(|s| s == token))
}

/// Content-type class of a token, by prefix.
pub fn media_type_of(token: &str) -> MediaType {
	if token.starts_with(IMAGE_PREFIX) {
		MediaType::Image
	} else if token.starts_with(VIDEO_PREFIX) {
		MediaType::Video
	} else if token.starts_with(AUDIO_PREFIX) {
		MediaType::Audio
	} else {
		MediaType::None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn intersection_over_both_separators() {
		assert!(has_intersection("image:nv12", "image:nv12,image:uyvy422"));
		assert!(has_intersection("image:nv12\nimage:nv16", "image:nv16"));
		assert!(!has_intersection("image:nv12", "video:h264"));
		assert!(!has_intersection("", "image:nv12"));
	}

	#[test]
	fn token_classes() {
		assert_eq!(media_type_of(IMAGE_NV12), MediaType::Image);
		assert_eq!(media_type_of(VIDEO_H264), MediaType::Video);
		assert_eq!(media_type_of(AUDIO_PCM_S16), MediaType::Audio);
		assert_eq!(media_type_of(STREAM_FILE), MediaType::None);
	}
}
