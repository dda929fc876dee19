use rubato::{FftFixedIn, Resampler as _};

use crate::{MetronomeError, Result};

const CHUNK_FRAMES: usize = 1024;

/// Converts interleaved samples between sample rates, trimming the
/// resampler's output delay so the result lines up with the input.
pub(crate) fn resample(
    samples: &[f32],
    channels: usize,
    rate_in: u32,
    rate_out: u32,
) -> Result<Vec<f32>> {
    if rate_in == rate_out || samples.is_empty() || channels == 0 {
        return Ok(samples.to_vec());
    }

    let frames = samples.len() / channels;
    let planar: Vec<Vec<f32>> = (0..channels)
        .map(|channel| samples.iter().skip(channel).step_by(channels).copied().collect())
        .collect();

    let mut fft = FftFixedIn::<f32>::new(
        rate_in as usize,
        rate_out as usize,
        CHUNK_FRAMES,
        2,
        channels,
    )
    .map_err(resample_error)?;

    let delay = fft.output_delay();
    let frames_out = (frames as f64 * f64::from(rate_out) / f64::from(rate_in)).ceil() as usize;
    let wanted = delay + frames_out;
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(wanted); channels];

    let mut offset = 0;
    while frames - offset >= fft.input_frames_next() {
        let next = fft.input_frames_next();
        let chunk: Vec<&[f32]> = planar.iter().map(|ch| &ch[offset..offset + next]).collect();
        append(&mut output, fft.process(&chunk, None).map_err(resample_error)?);
        offset += next;
    }

    if offset < frames {
        let chunk: Vec<&[f32]> = planar.iter().map(|ch| &ch[offset..]).collect();
        append(
            &mut output,
            fft.process_partial(Some(chunk.as_slice()), None)
                .map_err(resample_error)?,
        );
    }

    while output[0].len() < wanted {
        let flushed = fft
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(resample_error)?;
        if flushed[0].is_empty() {
            break;
        }
        append(&mut output, flushed);
    }

    let available = output[0].len().saturating_sub(delay).min(frames_out);
    let mut interleaved = Vec::with_capacity(available * channels);
    for frame in delay..delay + available {
        interleaved.extend(output.iter().map(|ch| ch[frame]));
    }

    Ok(interleaved)
}

fn append(output: &mut [Vec<f32>], block: Vec<Vec<f32>>) {
    for (channel, samples) in output.iter_mut().zip(block) {
        channel.extend(samples);
    }
}

fn resample_error(err: impl std::fmt::Display) -> MetronomeError {
    MetronomeError::Decode(format!("resampling failed: {err}"))
}
