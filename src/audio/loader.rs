//! Whole-track audio loading
//!
//! Decodes the best audio stream of a media into one interleaved f32 buffer.

use crate::audio::resample::F32Converter;
use crate::audio::AudioBuffer;
use crate::decoder::audio_format;
use crate::utils::error::LoadError;
use ffmpeg_next as ffmpeg;
use log::debug;

/// Decode the complete audio track of `source`
///
/// Blocks until the whole stream is decoded. Every sample layout is converted
/// to packed f32 at the stream's own rate and channel count.
pub fn load_audio_file(source: &str) -> Result<AudioBuffer, LoadError> {
    let mut input = ffmpeg::format::input(&source)
        .map_err(|e| LoadError::Load(format!("{}: {}", source, e)))?;

    let (stream_index, format, mut decoder) = {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Audio)
            .ok_or_else(|| LoadError::Load(format!("{}: no audio stream", source)))?;
        let format = audio_format(&stream)
            .ok_or_else(|| LoadError::Load(format!("{}: audio stream has no format", source)))?;
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?
            .decoder()
            .audio()?;
        (stream.index(), format, decoder)
    };

    let mut converter = F32Converter::new(format.channels, format.sample_rate);
    let mut samples = Vec::new();
    let mut frame = ffmpeg::frame::Audio::empty();

    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        // A corrupt packet loses its samples but not the track.
        if let Err(e) = decoder.send_packet(&packet) {
            debug!("Skipping undecodable audio packet: {}", e);
            continue;
        }
        while decoder.receive_frame(&mut frame).is_ok() {
            converter.push(&frame, &mut samples)?;
        }
    }

    decoder.send_eof()?;
    while decoder.receive_frame(&mut frame).is_ok() {
        converter.push(&frame, &mut samples)?;
    }
    converter.finish(&mut samples)?;

    if samples.is_empty() {
        return Err(LoadError::Load(format!("{}: audio stream decoded to no samples", source)));
    }

    Ok(AudioBuffer::new(samples, format))
}
