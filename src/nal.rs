//! Annex-B NAL unit scanning
//!
//! Locates NAL unit boundaries by their `00 00 01` / `00 00 00 01` start codes
//! and classifies keyframes for the configured [`CodecFamily`]. The scanner
//! borrows the input and never allocates, so it is cheap enough to run on
//! every access unit.

use crate::types::CodecFamily;

/// Iterator over the NAL units of an Annex-B byte stream.
///
/// Each item is the unit payload starting at its header byte, with the next
/// start code (and any zero padding before it) excluded. Bytes before the
/// first start code are skipped.
#[derive(Debug, Clone)]
pub struct NalUnits<'a> {
    data: &'a [u8],
    next: Option<usize>,
}

impl<'a> NalUnits<'a> {
    /// Start scanning `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, next: find_start_code(data, 0).map(|sc| sc + 3) }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let begin = self.next?;
        let end = match find_start_code(self.data, begin) {
            Some(sc) => {
                self.next = Some(sc + 3);
                let mut end = sc;
                while end > begin && self.data[end - 1] == 0 {
                    end -= 1;
                }
                end
            }
            None => {
                self.next = None;
                self.data.len()
            }
        };
        Some(&self.data[begin..end])
    }
}

/// Position of the next `00 00 01` pattern at or after `from`.
///
/// A four-byte start code is found one byte late, on its trailing `00 00 01`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..].windows(3).position(|w| w == [0, 0, 1]).map(|pos| pos + from)
}

/// Find the first keyframe NAL unit in `data`.
///
/// Returns the keyframe's NAL type, or `None` when the buffer holds no
/// keyframe (including empty buffers). Scanning stops at the first match.
pub fn find_keyframe(data: &[u8], codec: CodecFamily) -> Option<u8> {
    NalUnits::new(data)
        .filter_map(|unit| unit.first().copied())
        .map(|header| codec.nal_type(header))
        .find(|&nal_type| codec.is_keyframe(nal_type))
}

/// Whether `data` contains a keyframe NAL unit for `codec`.
#[inline]
pub fn contains_keyframe(data: &[u8], codec: CodecFamily) -> bool {
    find_keyframe(data, codec).is_some()
}
