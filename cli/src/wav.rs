//! Load WAV files as raw little-endian PCM.

use std::path::Path;

use anyhow::{Context, Result, bail};
use casabot_proto::AudioFormat;
use hound::{SampleFormat, WavReader};

/// Read an integer PCM WAV file into its format and raw sample bytes.
pub fn read_pcm(path: &Path) -> Result<(AudioFormat, Vec<u8>)> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int {
        bail!("Only integer PCM WAV files are supported");
    }
    let width = spec.bits_per_sample.div_ceil(8);
    if !(1..=4).contains(&width) {
        bail!("Unsupported sample size: {} bits", spec.bits_per_sample);
    }

    let mut audio = Vec::with_capacity(reader.len() as usize * usize::from(width));
    for sample in reader.samples::<i32>() {
        let sample = sample.context("Failed to read WAV samples")?;
        let bytes = sample.to_le_bytes();
        match width {
            // 8-bit WAV is unsigned on the wire.
            1 => audio.push((sample + 128) as u8),
            _ => audio.extend_from_slice(&bytes[..usize::from(width)]),
        }
    }

    let format = AudioFormat {
        rate: spec.sample_rate,
        width,
        channels: spec.channels,
    };
    Ok((format, audio))
}
