//! FFmpeg-backed file decoder and encoder.
//!
//! Frames are decoded and encoded in memory one at a time. The encoder
//! prefers libx264 and falls back to the container's default video codec.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use image::RgbImage;

use super::{FrameRate, FrameReader, FrameWriter, VideoInfo};

const FALLBACK_RATE: FrameRate = FrameRate::per_second(25);

pub(crate) struct FfmpegReader {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: scaling::Context,
    decoded: ffmpeg::frame::Video,
    rgb: ffmpeg::frame::Video,
    info: VideoInfo,
    eof_sent: bool,
    frames: u64,
}

impl FfmpegReader {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let frame_rate = source_frame_rate(&input_stream);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        if decoder.width() == 0 || decoder.height() == 0 {
            return Err(anyhow!("video track reports zero dimensions"));
        }

        let scaler = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let info = VideoInfo {
            width: decoder.width(),
            height: decoder.height(),
            frame_rate,
        };
        log::info!(
            "video: opened {} ({}x{} @ {}/{} fps)",
            path,
            info.width,
            info.height,
            frame_rate.num,
            frame_rate.den
        );

        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            decoded: ffmpeg::frame::Video::empty(),
            rgb: ffmpeg::frame::Video::empty(),
            info,
            eof_sent: false,
            frames: 0,
        })
    }

    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        let index = self.stream_index;
        self.input
            .packets()
            .find_map(|(stream, packet)| (stream.index() == index).then_some(packet))
    }

    fn convert(&mut self) -> Result<RgbImage> {
        self.scaler
            .run(&self.decoded, &mut self.rgb)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&self.rgb)?;
        self.frames += 1;
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("frame {} of {} has inconsistent size", self.frames, self.path))
    }
}

impl FrameReader for FfmpegReader {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            match self.next_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }
}

pub(crate) struct FfmpegWriter {
    path: String,
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: scaling::Context,
    rgb: ffmpeg::frame::Video,
    yuv: ffmpeg::frame::Video,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    info: VideoInfo,
    next_pts: i64,
    written: u64,
    finished: bool,
}

impl FfmpegWriter {
    pub(crate) fn create(path: &str, info: VideoInfo) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("failed to create output '{}'", path))?;

        let default_codec = output.format().codec(&path, ffmpeg::media::Type::Video);
        let codec = ffmpeg::encoder::find_by_name("libx264")
            .or_else(|| ffmpeg::encoder::find(default_codec))
            .ok_or_else(|| anyhow!("no video encoder available for '{}'", path))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

        let rate = info.frame_rate;
        let (num, den) = match (i32::try_from(rate.num), i32::try_from(rate.den)) {
            (Ok(num), Ok(den)) => (num, den),
            _ => return Err(anyhow!("frame rate {}/{} out of range", rate.num, rate.den)),
        };
        // One tick per frame.
        let encoder_time_base = ffmpeg::Rational::new(den, num);

        let mut stream = output.add_stream(codec).context("add output stream")?;
        let stream_index = stream.index();
        let mut setup = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        setup.set_width(info.width);
        setup.set_height(info.height);
        setup.set_format(Pixel::YUV420P);
        setup.set_time_base(encoder_time_base);
        setup.set_frame_rate(Some(ffmpeg::Rational::new(num, den)));
        if global_header {
            setup.set_flags(ffmpeg::codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = setup
            .open_as(codec)
            .with_context(|| format!("open encoder for {}x{}", info.width, info.height))?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output.write_header().context("write container header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("output stream vanished after header"))?;

        let scaler = scaling::Context::get(
            Pixel::RGB24,
            info.width,
            info.height,
            Pixel::YUV420P,
            info.width,
            info.height,
            scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "video: writing {} ({}x{} @ {}/{} fps, codec {})",
            path,
            info.width,
            info.height,
            num,
            den,
            codec.name()
        );

        Ok(Self {
            path: path.to_string(),
            output,
            encoder,
            scaler,
            rgb: ffmpeg::frame::Video::new(Pixel::RGB24, info.width, info.height),
            yuv: ffmpeg::frame::Video::empty(),
            stream_index,
            encoder_time_base,
            stream_time_base,
            info,
            next_pts: 0,
            written: 0,
            finished: false,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .with_context(|| format!("write packet to {}", self.path))?;
        }
        Ok(())
    }
}

impl FrameWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if self.finished {
            return Err(anyhow!("write after finish"));
        }
        if frame.dimensions() != (self.info.width, self.info.height) {
            return Err(anyhow!(
                "frame size {}x{} does not match stream {}x{}",
                frame.width(),
                frame.height(),
                self.info.width,
                self.info.height
            ));
        }
        pixels_to_frame(frame, &mut self.rgb)?;
        self.scaler
            .run(&self.rgb, &mut self.yuv)
            .context("scale frame to YUV420P")?;
        self.yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;
        self.encoder
            .send_frame(&self.yuv)
            .context("send frame to encoder")?;
        self.drain_packets()?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encoder.send_eof().context("flush encoder")?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .with_context(|| format!("write trailer to {}", self.path))?;
        log::info!("video: finished {} ({} frames)", self.path, self.written);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }
}

fn source_frame_rate(stream: &ffmpeg::format::stream::Stream) -> FrameRate {
    let rate = stream.avg_frame_rate();
    match (u32::try_from(rate.numerator()), u32::try_from(rate.denominator())) {
        (Ok(num), Ok(den)) => FrameRate::new(num, den).unwrap_or(FALLBACK_RATE),
        _ => FALLBACK_RATE,
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

fn pixels_to_frame(image: &RgbImage, frame: &mut ffmpeg::frame::Video) -> Result<()> {
    let row_bytes = image.width() as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data_mut(0);
    for (row, src) in image.as_raw().chunks_exact(row_bytes).enumerate() {
        let start = row * stride;
        data.get_mut(start..start + row_bytes)
            .context("ffmpeg frame row is out of bounds")?
            .copy_from_slice(src);
    }
    Ok(())
}
