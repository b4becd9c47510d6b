//! Codec family selection for NAL header interpretation

use serde::{Deserialize, Serialize};

/// The two supported codec families.
///
/// The family only decides how the first byte of a NAL unit is decoded into a
/// NAL type and which types count as keyframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    /// H.265/HEVC: `type = (byte >> 1) & 0x3F`, keyframes are `16..=21`
    #[default]
    #[serde(alias = "hevc")]
    H265,

    /// H.264/AVC: `type = byte & 0x1F`, keyframe is `5`
    #[serde(alias = "avc")]
    H264,
}

impl CodecFamily {
    /// Extract the NAL unit type from the first header byte
    #[inline]
    pub fn nal_type(self, header: u8) -> u8 {
        match self {
            CodecFamily::H265 => (header >> 1) & 0x3F,
            CodecFamily::H264 => header & 0x1F,
        }
    }

    /// Whether a NAL type is a random access (IDR/IRAP) picture
    #[inline]
    pub fn is_keyframe(self, nal_type: u8) -> bool {
        match self {
            CodecFamily::H265 => (16..=21).contains(&nal_type),
            CodecFamily::H264 => nal_type == 5,
        }
    }

    /// Short lowercase name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            CodecFamily::H265 => "h265",
            CodecFamily::H264 => "h264",
        }
    }
}

impl std::fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h265_header_layout() {
        // IDR_W_RADL (19) is encoded as 0x26 in the first header byte
        assert_eq!(CodecFamily::H265.nal_type(0x26), 19);
        assert!(CodecFamily::H265.is_keyframe(19));
        // TRAIL_R (1) is 0x02
        assert_eq!(CodecFamily::H265.nal_type(0x02), 1);
        assert!(!CodecFamily::H265.is_keyframe(1));
        // VPS (32) is not a picture
        assert!(!CodecFamily::H265.is_keyframe(32));
        assert!(CodecFamily::H265.is_keyframe(16));
        assert!(CodecFamily::H265.is_keyframe(21));
        assert!(!CodecFamily::H265.is_keyframe(22));
    }

    #[test]
    fn h264_header_layout() {
        assert_eq!(CodecFamily::H264.nal_type(0x65), 5);
        assert!(CodecFamily::H264.is_keyframe(5));
        assert_eq!(CodecFamily::H264.nal_type(0x41), 1);
        assert!(!CodecFamily::H264.is_keyframe(1));
        assert!(!CodecFamily::H264.is_keyframe(7));
    }

    #[test]
    fn parses_aliases_from_yaml() {
        let codec: CodecFamily = serde_yaml_ng::from_str("hevc").unwrap();
        assert_eq!(codec, CodecFamily::H265);
        let codec: CodecFamily = serde_yaml_ng::from_str("h264").unwrap();
        assert_eq!(codec, CodecFamily::H264);
    }
}
