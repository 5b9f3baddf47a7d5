//! Demo media backends: a synthetic test-pattern camera, an OpenH264
//! encoder adapter, and an `image`-based JPEG encoder. They let the
//! server stream real video without camera hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use openh264::OpenH264API;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig, FrameRate, IntraFramePeriod, RateControlMode,
    SpsPpsStrategy, UsageType,
};
use openh264::formats::{RgbSliceU8, YUVBuffer};

use camstream::error::Result;
use camstream::media::h264::{nal_type, split_annex_b};
use camstream::{
    CameraDriver, CameraId, EncodedFrame, EncoderSettings, FrameSink, H264Encoder, JpegEncoder,
    MediaBackends, PixelFormat, RawFrame, ServerError,
};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
const FRAME_PERIOD: Duration = Duration::from_millis(33);
const KEYFRAME_INTERVAL: u32 = 60;

/// Build the full demo backend set.
pub fn demo_backends() -> MediaBackends {
    MediaBackends {
        camera_driver: Arc::new(SyntheticCamera::new()),
        h264_factory: Box::new(|camera| {
            tracing::debug!(%camera, "creating OpenH264 encoder");
            Ok(Box::new(OpenH264Adapter::new()))
        }),
        jpeg_encoder: Arc::new(ImageJpegEncoder),
    }
}

/// Camera driver that renders a moving RGB test pattern, one producer
/// thread per started camera.
pub struct SyntheticCamera {
    running: [Arc<AtomicBool>; 2],
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            running: [
                Arc::new(AtomicBool::new(false)),
                Arc::new(AtomicBool::new(false)),
            ],
        }
    }
}

impl CameraDriver for SyntheticCamera {
    fn start(&self, camera: CameraId, sink: FrameSink) -> Result<()> {
        let running = self.running[camera.index()].clone();
        if running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        thread::Builder::new()
            .name(format!("camera-{camera}"))
            .spawn(move || {
                let started = Instant::now();
                let mut tick = 0u32;
                while running.load(Ordering::SeqCst) {
                    sink.publish(RawFrame {
                        data: render_pattern(tick, camera),
                        width: FRAME_WIDTH,
                        height: FRAME_HEIGHT,
                        pts_ns: started.elapsed().as_nanos() as u64,
                        format: PixelFormat::Rgb24,
                        camera,
                    });
                    tick = tick.wrapping_add(1);
                    thread::sleep(FRAME_PERIOD);
                }
            })
            .map_err(ServerError::Io)?;
        Ok(())
    }

    fn stop(&self, camera: CameraId) {
        self.running[camera.index()].store(false, Ordering::SeqCst);
    }
}

/// Moving diagonal gradient; the front camera gets an inverted palette
/// so the two streams are distinguishable.
fn render_pattern(tick: u32, camera: CameraId) -> Bytes {
    let mut data = vec![0u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize];
    let shift = (tick * 3) as u32;
    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let idx = ((y * FRAME_WIDTH + x) * 3) as usize;
            let v = ((x + y + shift) % 256) as u8;
            match camera {
                CameraId::Back => {
                    data[idx] = v;
                    data[idx + 1] = (y % 256) as u8;
                    data[idx + 2] = 255 - v;
                }
                CameraId::Front => {
                    data[idx] = 255 - v;
                    data[idx + 1] = v;
                    data[idx + 2] = (x % 256) as u8;
                }
            }
        }
    }
    Bytes::from(data)
}

/// OpenH264 software encoder behind the [`H264Encoder`] trait.
///
/// Bitrate changes re-initialize the encoder; the stream context resets
/// and the next frame out is an IDR, which downstream clients handle
/// through the normal SPS/PPS gating.
pub struct OpenH264Adapter {
    encoder: Option<Encoder>,
    settings: Option<EncoderSettings>,
}

impl OpenH264Adapter {
    pub fn new() -> Self {
        Self {
            encoder: None,
            settings: None,
        }
    }

    fn init_encoder(&mut self, settings: &EncoderSettings) -> Result<()> {
        let config = EncoderConfig::new()
            .usage_type(UsageType::CameraVideoRealTime)
            .max_frame_rate(FrameRate::from_hz(settings.frame_rate as f32))
            .bitrate(BitRate::from_bps(settings.bitrate))
            .rate_control_mode(RateControlMode::Bitrate)
            .sps_pps_strategy(SpsPpsStrategy::ConstantId)
            .intra_frame_period(IntraFramePeriod::from_num_frames(KEYFRAME_INTERVAL));

        let api = OpenH264API::from_source();
        self.encoder = Some(
            Encoder::with_api_config(api, config)
                .map_err(|e| ServerError::Encoder(e.to_string()))?,
        );
        self.settings = Some(*settings);
        Ok(())
    }
}

impl H264Encoder for OpenH264Adapter {
    fn configure(&mut self, settings: &EncoderSettings) -> Result<()> {
        self.init_encoder(settings)
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>> {
        if frame.format != PixelFormat::Rgb24 {
            return Err(ServerError::Encoder(format!(
                "unsupported pixel format {:?}",
                frame.format
            )));
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| ServerError::Encoder("encoder not configured".to_string()))?;

        let rgb = RgbSliceU8::new(&frame.data, (frame.width as usize, frame.height as usize));
        let yuv = YUVBuffer::from_rgb_source(rgb);
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| ServerError::Encoder(e.to_string()))?;
        let annex_b = bitstream.to_vec();
        if annex_b.is_empty() {
            return Ok(None);
        }

        let mut sps = None;
        let mut pps = None;
        let mut keyframe = false;
        let mut nal_units = Vec::new();
        for nal in split_annex_b(&annex_b) {
            match nal_type(nal) {
                7 => sps = Some(Bytes::copy_from_slice(nal)),
                8 => pps = Some(Bytes::copy_from_slice(nal)),
                5 => {
                    keyframe = true;
                    nal_units.push(Bytes::copy_from_slice(nal));
                }
                _ => nal_units.push(Bytes::copy_from_slice(nal)),
            }
        }

        Ok(Some(EncodedFrame {
            nal_units,
            sps,
            pps,
            pts_ns: frame.pts_ns,
            keyframe,
        }))
    }

    fn set_bitrate(&mut self, bps: u32) {
        let Some(mut settings) = self.settings else {
            return;
        };
        if settings.bitrate == bps {
            return;
        }
        settings.bitrate = bps;
        if let Err(e) = self.init_encoder(&settings) {
            tracing::error!(error = %e, "encoder re-init for bitrate change failed");
        }
    }

    fn force_keyframe(&mut self) {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.force_intra_frame();
        }
    }
}

/// One-shot RGB→JPEG via the `image` crate.
pub struct ImageJpegEncoder;

impl JpegEncoder for ImageJpegEncoder {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Vec<u8>> {
        if frame.format != PixelFormat::Rgb24 {
            return Err(ServerError::Encoder(format!(
                "unsupported pixel format {:?}",
                frame.format
            )));
        }
        let mut out = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(
                &frame.data,
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| ServerError::Encoder(e.to_string()))?;
        Ok(out)
    }
}
