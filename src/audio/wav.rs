//! WAV writer for 32-bit float stereo.
//!
//! Emits the canonical 44-byte header (`fmt ` chunk of 16 bytes, format tag 3,
//! no `fact` chunk) followed by interleaved little-endian samples:
//!
//! | Offset | Field | Value |
//! |--------|-------|-------|
//! | 0 | `RIFF` | |
//! | 4 | RIFF size | 36 + data size |
//! | 8 | `WAVE` `fmt ` | |
//! | 16 | fmt size | 16 |
//! | 20 | format | 3 (IEEE float) |
//! | 22 | channels | 2 |
//! | 24 | sample rate | |
//! | 28 | byte rate | rate × channels × 4 |
//! | 32 | block align | channels × 4 |
//! | 34 | bits | 32 |
//! | 36 | `data` | |
//! | 40 | data size | frames × channels × 4 |

use std::io::{BufWriter, Write};
use std::path::Path;

use super::{CHANNELS, StereoAudio};
use crate::{Error, Result};

pub const HEADER_LEN: usize = 44;
const FORMAT_IEEE_FLOAT: u16 = 3;
const BITS_PER_SAMPLE: u16 = 32;

/// Header fields derived from rate, channel count and frame count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: usize,
}

impl WavSpec {
    pub fn block_align(&self) -> u16 {
        self.channels * (BITS_PER_SAMPLE / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    pub fn data_len(&self) -> usize {
        self.frames * self.block_align() as usize
    }

    pub fn file_len(&self) -> usize {
        HEADER_LEN + self.data_len()
    }

    fn header(&self) -> Result<[u8; HEADER_LEN]> {
        let data_len = u32::try_from(self.data_len())
            .ok()
            .filter(|len| len.checked_add(36).is_some())
            .ok_or_else(|| Error::Audio(format!("{} frames exceed the WAV size limit", self.frames)))?;

        let mut h = [0u8; HEADER_LEN];
        h[0..4].copy_from_slice(b"RIFF");
        h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
        h[8..12].copy_from_slice(b"WAVE");
        h[12..16].copy_from_slice(b"fmt ");
        h[16..20].copy_from_slice(&16u32.to_le_bytes());
        h[20..22].copy_from_slice(&FORMAT_IEEE_FLOAT.to_le_bytes());
        h[22..24].copy_from_slice(&self.channels.to_le_bytes());
        h[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        h[28..32].copy_from_slice(&self.byte_rate().to_le_bytes());
        h[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        h[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
        h[36..40].copy_from_slice(b"data");
        h[40..44].copy_from_slice(&data_len.to_le_bytes());
        Ok(h)
    }
}

fn write_to<W: Write>(mut out: W, audio: &StereoAudio, sample_rate: u32) -> Result<WavSpec> {
    if audio.left.len() != audio.right.len() {
        return Err(Error::Audio(format!(
            "channel length mismatch: left {} right {}",
            audio.left.len(),
            audio.right.len()
        )));
    }
    let spec = WavSpec {
        sample_rate,
        channels: CHANNELS,
        frames: audio.frames(),
    };
    out.write_all(&spec.header()?)?;
    for (l, r) in audio.left.iter().zip(&audio.right) {
        out.write_all(&l.to_le_bytes())?;
        out.write_all(&r.to_le_bytes())?;
    }
    out.flush()?;
    Ok(spec)
}

/// Serialize `audio` into an in-memory WAV image.
pub fn encode_wav(audio: &StereoAudio, sample_rate: u32) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + audio.frames() * 8);
    write_to(&mut bytes, audio, sample_rate)?;
    Ok(bytes)
}

/// Write `audio` to `path`, creating parent directories as needed.
pub fn write_wav(path: impl AsRef<Path>, audio: &StereoAudio, sample_rate: u32) -> Result<WavSpec> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let spec = write_to(BufWriter::new(file), audio, sample_rate)?;
    tracing::debug!(path = %path.display(), frames = spec.frames, bytes = spec.file_len(), "wav written");
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    fn read_u16(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    #[test]
    fn header_fields() {
        let audio = StereoAudio {
            left: vec![0.0; 100],
            right: vec![0.0; 100],
        };
        let bytes = encode_wav(&audio, 44_100).unwrap();
        assert_eq!(bytes.len(), 44 + 100 * 2 * 4);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4), 36 + 800);
        assert_eq!(&bytes[8..16], b"WAVEfmt ");
        assert_eq!(read_u32(&bytes, 16), 16);
        assert_eq!(read_u16(&bytes, 20), 3);
        assert_eq!(read_u16(&bytes, 22), 2);
        assert_eq!(read_u32(&bytes, 24), 44_100);
        assert_eq!(read_u32(&bytes, 28), 44_100 * 8);
        assert_eq!(read_u16(&bytes, 32), 8);
        assert_eq!(read_u16(&bytes, 34), 32);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(read_u32(&bytes, 40), 800);
    }

    #[test]
    fn samples_are_interleaved() {
        let audio = StereoAudio {
            left: vec![0.25, 0.5],
            right: vec![-0.25, -0.5],
        };
        let bytes = encode_wav(&audio, 44_100).unwrap();
        let samples: Vec<f32> = bytes[44..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(samples, vec![0.25, -0.25, 0.5, -0.5]);
    }

    #[test]
    fn file_reads_back_with_hound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.wav");
        let audio = StereoAudio {
            left: vec![0.0, 0.5, -0.5, 1.0],
            right: vec![0.1, 0.2, 0.3, 0.4],
        };
        let spec = write_wav(&path, &audio, 44_100).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, spec.file_len());

        let mut reader = hound::WavReader::open(&path).unwrap();
        let read_spec = reader.spec();
        assert_eq!(read_spec.channels, 2);
        assert_eq!(read_spec.sample_rate, 44_100);
        assert_eq!(read_spec.bits_per_sample, 32);
        assert_eq!(read_spec.sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, audio.interleaved());
    }

    #[test]
    fn empty_audio_is_header_only() {
        let bytes = encode_wav(&StereoAudio::default(), 44_100).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(read_u32(&bytes, 4), 36);
    }

    #[test]
    fn mismatched_channels_rejected() {
        let audio = StereoAudio {
            left: vec![0.0; 3],
            right: vec![0.0; 2],
        };
        assert!(matches!(encode_wav(&audio, 44_100), Err(Error::Audio(_))));
    }
}
