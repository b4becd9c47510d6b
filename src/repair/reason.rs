use serde::Serialize;
use std::fmt;

use crate::health::PendingFlag;

/// Why a keyframe was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairReason {
    /// The stream just came up
    StreamUp,
    /// RTP sequence numbers skipped ahead
    RtpGap,
    /// Packets arrive but the decoder produces nothing
    DecodeStall,
    /// The decoder reported corrupt input
    Integrity,
    /// A recording is starting and needs a clean first frame
    RecordStart,
    /// A recording request re-issued once the sender became known
    RecordStartDeferred,
}

impl RepairReason {
    /// Wire-independent label used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            RepairReason::StreamUp => "stream-up",
            RepairReason::RtpGap => "rtp-gap",
            RepairReason::DecodeStall => "decode-stall",
            RepairReason::Integrity => "integrity",
            RepairReason::RecordStart => "record-start",
            RepairReason::RecordStartDeferred => "record-start-deferred",
        }
    }

    /// Whether this reason belongs to the recording family
    pub fn is_recording(self) -> bool {
        self.as_str().starts_with("record-start")
    }

    /// Confirmation flag gating this reason's bursts, if tracked
    pub fn tracking(self) -> Option<PendingFlag> {
        match self {
            RepairReason::StreamUp => Some(PendingFlag::Stream),
            RepairReason::RecordStart | RepairReason::RecordStartDeferred => Some(PendingFlag::Record),
            RepairReason::RtpGap | RepairReason::DecodeStall | RepairReason::Integrity => None,
        }
    }
}

impl fmt::Display for RepairReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_family_is_tracked_by_record_flag() {
        for reason in [RepairReason::RecordStart, RepairReason::RecordStartDeferred] {
            assert!(reason.is_recording());
            assert_eq!(reason.tracking(), Some(PendingFlag::Record));
        }
        assert_eq!(RepairReason::StreamUp.tracking(), Some(PendingFlag::Stream));
        assert!(!RepairReason::StreamUp.is_recording());
    }

    #[test]
    fn one_shot_reasons_are_untracked() {
        for reason in [RepairReason::RtpGap, RepairReason::DecodeStall, RepairReason::Integrity] {
            assert_eq!(reason.tracking(), None);
            assert!(!reason.is_recording());
        }
    }

    #[test]
    fn labels() {
        assert_eq!(RepairReason::RecordStartDeferred.to_string(), "record-start-deferred");
        assert_eq!(RepairReason::RtpGap.as_str(), "rtp-gap");
    }
}
