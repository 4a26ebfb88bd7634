//! Media stream information extraction
//!
//! Reads the metadata a playback session needs (duration, frame geometry,
//! frame rate and audio format) from an opened FFmpeg input.

use crate::audio::{AudioFormat, SampleFormat};
use crate::decoder::MediaSource;
use crate::utils::error::DecodeError;
use ffmpeg_next as ffmpeg;
use std::time::Duration;

/// Extract session metadata from an opened input
///
/// Fails with `UnsupportedFormat` when the input has no video stream or the
/// stream does not declare a frame size.
pub fn probe_input(
    input: &ffmpeg::format::context::Input,
    source: &str,
) -> Result<MediaSource, DecodeError> {
    let video = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| DecodeError::UnsupportedFormat(format!("{}: no video stream", source)))?;

    let (width, height) = {
        let params = video.parameters();
        // SAFETY: `params` borrows the stream's codecpar, which lives as long as `input`.
        let par = unsafe { &*params.as_ptr() };
        (par.width, par.height)
    };
    if width <= 0 || height <= 0 {
        return Err(DecodeError::UnsupportedFormat(format!(
            "{}: video stream has no frame size",
            source
        )));
    }

    let rate = video.avg_frame_rate();
    let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0)
        .then(|| rate.numerator() as f32 / rate.denominator() as f32);

    let audio = input
        .streams()
        .best(ffmpeg::media::Type::Audio)
        .and_then(|stream| audio_format(&stream));

    Ok(MediaSource {
        source: source.to_string(),
        duration: container_duration(input.duration()),
        width: width as u32,
        height: height as u32,
        frame_rate,
        audio,
    })
}

/// Format of the f32 payload the audio loader produces for this stream
pub(crate) fn audio_format(stream: &ffmpeg::format::stream::Stream) -> Option<AudioFormat> {
    let params = stream.parameters();
    // SAFETY: as above, the codecpar outlives this borrow.
    let par = unsafe { &*params.as_ptr() };
    let channels = par.ch_layout.nb_channels;
    if par.sample_rate <= 0 || channels <= 0 {
        return None;
    }
    Some(AudioFormat {
        sample_rate: par.sample_rate as u32,
        channels: channels as u16,
        sample_format: SampleFormat::F32,
    })
}

/// Container duration in `AV_TIME_BASE` (microsecond) units; unknown when not positive
pub(crate) fn container_duration(micros: i64) -> Option<Duration> {
    (micros > 0).then(|| Duration::from_micros(micros as u64))
}
