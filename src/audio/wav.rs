use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Sample rate the worker expects
pub const SAMPLE_RATE: u32 = 16_000;

fn worker_spec() -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Encodes 16 kHz mono samples as an in-memory 16-bit PCM WAV file
///
/// Samples outside [-1, 1] are clamped.
///
/// # Errors
/// Returns error if the WAV writer fails
pub fn encode_pcm16(samples: &[f32]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            WavWriter::new(&mut cursor, worker_spec()).context("failed to create WAV writer")?;
        for &sample in samples {
            writer
                .write_sample(to_pcm16(sample))
                .context("failed to write sample")?;
        }
        writer.finalize().context("failed to finalize WAV data")?;
    }
    Ok(cursor.into_inner())
}

#[allow(clippy::cast_possible_truncation)] // Clamped to the i16 range first
fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Reads a 16 kHz WAV file as mono samples in [-1, 1]
///
/// Multi-channel audio is averaged down to mono.
///
/// # Errors
/// Returns error if the file cannot be read or is not sampled at 16 kHz
#[allow(clippy::cast_precision_loss)] // Sample widths and channel counts are small
pub fn read_mono(path: &Path) -> Result<Vec<f32>> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE {
        bail!(
            "{} is sampled at {} Hz, expected {SAMPLE_RATE} Hz",
            path.display(),
            spec.sample_rate
        );
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .context("failed to read samples")?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()
                .context("failed to read samples")?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    debug!(
        path = %path.display(),
        channels,
        frames = interleaved.len() / channels,
        "read WAV file"
    );
    if channels == 1 {
        return Ok(interleaved);
    }
    let divisor = channels as f32;
    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / divisor)
        .collect())
}

/// Loads a WAV file and re-encodes it in the worker's format
///
/// # Errors
/// Returns error if the file cannot be read or encoded
pub fn load_for_worker(path: &Path) -> Result<Vec<u8>> {
    let samples = read_mono(path)?;
    encode_pcm16(&samples)
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // Test assertions with known exact values
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_and_length() {
        let bytes = encode_pcm16(&[0.0, 0.5, -0.5, 1.0]).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // 44-byte canonical header followed by 2 bytes per sample
        assert_eq!(bytes.len(), 44 + 4 * 2);

        let reader = WavReader::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(reader.spec(), worker_spec());
    }

    #[test]
    fn test_encode_clamps_samples() {
        let bytes = encode_pcm16(&[2.0, -3.0, 0.0]).unwrap();
        let mut reader = WavReader::new(Cursor::new(bytes)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX, 0]);
    }

    #[test]
    fn test_encode_empty() {
        let bytes = encode_pcm16(&[]).unwrap();
        assert_eq!(bytes.len(), 44);
    }

    #[test]
    fn test_read_mono_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for sample in [0.5_f32, 0.25, -1.0, 0.0] {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let samples = read_mono(&path).unwrap();
        assert_eq!(samples, vec![0.375, -0.5]);
    }

    #[test]
    fn test_read_rejects_other_sample_rates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("44k.wav");
        let spec = WavSpec {
            sample_rate: 44_100,
            ..worker_spec()
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0_i16).unwrap();
        writer.finalize().unwrap();

        let err = read_mono(&path).unwrap_err();
        assert!(err.to_string().contains("44100 Hz"));
    }

    #[test]
    fn test_load_for_worker_round_trips_pcm16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, encode_pcm16(&[0.0, 0.5]).unwrap()).unwrap();

        let bytes = load_for_worker(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 2 * 2);
    }
}
