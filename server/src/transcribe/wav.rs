//! RIFF/WAVE packaging for raw PCM.

use casabot_proto::AudioFormat;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Wrap little-endian PCM in a WAV container.
///
/// Trailing bytes that do not form a whole frame are dropped.
pub fn encode_wav(pcm: &[u8], format: AudioFormat) -> Result<Vec<u8>, hound::Error> {
    let frame = format.frame_bytes();
    if frame == 0 || format.rate == 0 || format.width > 4 {
        return Err(hound::Error::Unsupported);
    }
    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.rate,
        bits_per_sample: format.width * 8,
        sample_format: SampleFormat::Int,
    };
    let whole = pcm.len() - pcm.len() % frame;

    let mut cursor = Cursor::new(Vec::with_capacity(whole + 44));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for sample in pcm[..whole].chunks_exact(usize::from(format.width)) {
            match *sample {
                // 8-bit WAV is unsigned; hound expects it centred on zero.
                [b] => writer.write_sample((i16::from(b) - 128) as i8)?,
                [b0, b1] => writer.write_sample(i16::from_le_bytes([b0, b1]))?,
                [b0, b1, b2] => writer.write_sample(i32::from_le_bytes([0, b0, b1, b2]) >> 8)?,
                [b0, b1, b2, b3] => writer.write_sample(i32::from_le_bytes([b0, b1, b2, b3]))?,
                _ => return Err(hound::Error::Unsupported),
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
