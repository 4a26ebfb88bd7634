//! Sample conversion through swresample
//!
//! Every decoded layout ends up as packed f32 at a chosen rate and channel
//! count. The context is rebuilt whenever the input format changes.

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{sample::Type, Sample};
use ffmpeg::software::resampling;
use ffmpeg::ChannelLayout;

const PACKED_F32: Sample = Sample::F32(Type::Packed);

/// Frames fed to the resampler per input frame when converting a flat buffer
const CHUNK_FRAMES: usize = 4096;

/// Output headroom on top of the rate-scaled input length
const OUTPUT_SLACK: usize = 256;

fn layout_for(channels: u16) -> ChannelLayout {
    ChannelLayout::default(i32::from(channels))
}

/// Converts audio frames to interleaved f32 at a fixed output rate and layout
pub(crate) struct F32Converter {
    context: Option<resampling::Context>,
    channels: u16,
    layout: ChannelLayout,
    rate: u32,
}

impl F32Converter {
    pub(crate) fn new(channels: u16, rate: u32) -> Self {
        Self {
            context: None,
            channels,
            layout: layout_for(channels),
            rate,
        }
    }

    fn ensure_context(&mut self, frame: &ffmpeg::frame::Audio) -> Result<&mut resampling::Context, ffmpeg::Error> {
        let format = frame.format();
        let rate = frame.rate();
        let layout = frame.channel_layout();

        let stale = self.context.as_ref().map_or(true, |context| {
            let input = context.input();
            input.format != format || input.rate != rate || input.channel_layout != layout
        });
        if stale {
            let context =
                resampling::Context::get(format, layout, rate, PACKED_F32, self.layout, self.rate)?;
            self.context = Some(context);
        }
        self.context.as_mut().ok_or(ffmpeg::Error::Bug)
    }

    /// Convert `frame` and append the result to `out`
    ///
    /// Output the resampler holds back is emitted by later calls or by `finish`.
    pub(crate) fn push(&mut self, frame: &ffmpeg::frame::Audio, out: &mut Vec<f32>) -> Result<(), ffmpeg::Error> {
        if frame.samples() == 0 {
            return Ok(());
        }
        // Some decoders leave the layout unspecified; swresample needs one.
        if frame.channel_layout().is_empty() {
            if frame.channels() == 0 {
                return Err(ffmpeg::Error::InvalidData);
            }
            let mut labeled = frame.clone();
            labeled.set_channel_layout(layout_for(frame.channels()));
            return self.push(&labeled, out);
        }

        let capacity = scale(frame.samples(), frame.rate(), self.rate) + OUTPUT_SLACK;
        let (channels, layout, rate) = (self.channels, self.layout, self.rate);

        let context = self.ensure_context(frame)?;
        let mut output = output_frame(capacity, layout, rate);
        context.run(frame, &mut output)?;
        append_packed(&output, channels, out);
        Ok(())
    }

    /// Drain whatever the resampler still buffers
    pub(crate) fn finish(&mut self, out: &mut Vec<f32>) -> Result<(), ffmpeg::Error> {
        let (channels, layout, rate) = (self.channels, self.layout, self.rate);
        let Some(context) = self.context.as_mut() else { return Ok(()) };

        loop {
            let mut output = output_frame(CHUNK_FRAMES, layout, rate);
            context.flush(&mut output)?;
            if output.samples() == 0 {
                return Ok(());
            }
            append_packed(&output, channels, out);
        }
    }
}

/// Convert interleaved f32 audio between rates and channel counts
///
/// `from` and `to` are `(channels, sample_rate)`.
pub(crate) fn convert_interleaved(
    samples: &[f32],
    from: (u16, u32),
    to: (u16, u32),
) -> Result<Vec<f32>, ffmpeg::Error> {
    let (channels, rate) = from;
    if channels == 0 || rate == 0 {
        return Err(ffmpeg::Error::InvalidData);
    }
    let width = usize::from(channels);
    let layout = layout_for(channels);

    let mut converter = F32Converter::new(to.0, to.1);
    let mut out = Vec::with_capacity(scale(samples.len() / width, rate, to.1) * usize::from(to.0));

    for chunk in samples.chunks(CHUNK_FRAMES * width) {
        let frames = chunk.len() / width;
        if frames == 0 {
            break;
        }
        let mut input = ffmpeg::frame::Audio::new(PACKED_F32, frames, layout);
        input.set_rate(rate);
        let bytes: &[u8] = bytemuck::cast_slice(&chunk[..frames * width]);
        input.data_mut(0)[..bytes.len()].copy_from_slice(bytes);
        converter.push(&input, &mut out)?;
    }
    converter.finish(&mut out)?;
    Ok(out)
}

fn output_frame(capacity: usize, layout: ChannelLayout, rate: u32) -> ffmpeg::frame::Audio {
    let mut frame = ffmpeg::frame::Audio::new(PACKED_F32, capacity, layout);
    frame.set_rate(rate);
    frame
}

fn append_packed(frame: &ffmpeg::frame::Audio, channels: u16, out: &mut Vec<f32>) {
    let plane = frame.data(0);
    let len = (frame.samples() * usize::from(channels) * 4).min(plane.len());
    out.extend(bytemuck::pod_collect_to_vec::<u8, f32>(&plane[..len]));
}

fn scale(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 || from_rate == to_rate {
        return frames;
    }
    (frames as u64 * u64::from(to_rate)).div_ceil(u64::from(from_rate)) as usize
}
