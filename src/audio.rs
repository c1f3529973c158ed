//! Decoded audio and its container.
//!
//! The decoder emits planar stereo at 44.1 kHz; [`wav`] serializes it as
//! 32-bit float PCM.

pub mod wav;

pub use wav::{WavSpec, encode_wav, write_wav};

/// Number of output channels.
pub const CHANNELS: u16 = 2;

/// Two equal-length channels of float samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoAudio {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StereoAudio {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.left.len().min(self.right.len())
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Keep at most `frames` samples per channel.
    pub fn truncate(&mut self, frames: usize) {
        self.left.truncate(frames);
        self.right.truncate(frames);
    }

    pub fn duration_s(&self, sample_rate: u32) -> f32 {
        self.frames() as f32 / sample_rate as f32
    }

    /// Samples interleaved as L, R, L, R, ...
    pub fn interleaved(&self) -> Vec<f32> {
        let n = self.frames();
        let mut out = Vec::with_capacity(n * 2);
        for (&l, &r) in self.left[..n].iter().zip(&self.right[..n]) {
            out.push(l);
            out.push(r);
        }
        out
    }
}

/// Number of frames to keep for a requested duration.
///
/// Never more than the decoder actually produced.
pub fn trimmed_frames(duration_s: f32, sample_rate: u32, available: usize) -> usize {
    let requested = (duration_s * sample_rate as f32) as usize;
    requested.min(available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_clips_to_available() {
        assert_eq!(trimmed_frames(2.0, 44_100, 4 * 44_100), 88_200);
        assert_eq!(trimmed_frames(11.0, 44_100, 44_100), 44_100);
        assert_eq!(trimmed_frames(0.5, 44_100, 1_000_000), 22_050);
    }

    #[test]
    fn interleave_and_truncate() {
        let mut audio = StereoAudio {
            left: vec![1.0, 2.0, 3.0],
            right: vec![-1.0, -2.0, -3.0],
        };
        audio.truncate(2);
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.interleaved(), vec![1.0, -1.0, 2.0, -2.0]);
        assert!((audio.duration_s(2) - 1.0).abs() < 1e-6);
    }
}
