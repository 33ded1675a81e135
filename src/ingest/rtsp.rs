//! RTSP frame source.
//!
//! `stub://` URLs produce a deterministic synthetic scene: a textured background
//! with a dark vehicle carrying a bright plate strip that drives across the frame
//! once per cycle. Anything else is decoded with GStreamer (feature:
//! rtsp-gstreamer). Decoder stalls, errors and EOS are returned as errors so the
//! caller's reconnect path takes over.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use image::{Rgb, RgbImage};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use super::StreamBackend;

/// Frames per synthetic cycle.
pub const SYNTHETIC_CYCLE: u64 = 60;
/// Frames of each cycle during which the vehicle is in view.
pub const SYNTHETIC_PASS: u64 = 30;

#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// e.g. "rtsp://192.168.1.100:554/stream", or "stub://..." for the synthetic scene.
    pub url: String,
    /// Synthetic frame size. Decoded streams keep their native size.
    pub width: u32,
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            width: 640,
            height: 480,
        }
    }
}

pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
            }
        }
    }

    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.frame_count,
        }
    }
}

impl StreamBackend for RtspSource {
    fn name(&self) -> &'static str {
        match &self.backend {
            RtspBackend::Synthetic(_) => "synthetic",
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(_) => "gstreamer",
        }
    }

    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(_) => Ok(()),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => Ok(Some(source.next_image())),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_image().map(Some),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(_) => {}
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.disconnect(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(_) => true,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn next_image(&mut self) -> RgbImage {
        let image = synthetic_scene(self.config.width, self.config.height, self.frame_count);
        self.frame_count += 1;
        image
    }
}

/// Frame `index` of the synthetic scene.
pub fn synthetic_scene(width: u32, height: u32, index: u64) -> RgbImage {
    let mut image = RgbImage::from_fn(width, height, |x, y| {
        let v = if (x / 8 + y / 8) % 2 == 0 { 96 } else { 124 };
        Rgb([v, v, v])
    });
    let phase = index % SYNTHETIC_CYCLE;
    if phase < SYNTHETIC_PASS {
        let vw = (width / 3).max(6) as i64;
        let vh = (height / 3).max(6) as i64;
        let travel = width as i64 + vw;
        let left = -vw + travel * phase as i64 / SYNTHETIC_PASS as i64;
        let top = (height as i64 - vh) / 2;
        draw_vehicle(&mut image, left, top, vw, vh);
    }
    image
}

/// Dark body with a white plate strip carrying dark glyph columns.
pub fn draw_vehicle(image: &mut RgbImage, left: i64, top: i64, w: i64, h: i64) {
    let plate_w = (w / 2).max(4);
    let plate_h = (h / 5).max(3);
    let plate_left = left + (w - plate_w) / 2;
    let plate_top = top + h - plate_h - (h / 8).max(1);
    for y in top..top + h {
        for x in left..left + w {
            if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
                continue;
            }
            let in_plate = x >= plate_left
                && x < plate_left + plate_w
                && y >= plate_top
                && y < plate_top + plate_h;
            let v = if in_plate {
                let glyph = (x - plate_left) % 3 == 1
                    && y > plate_top
                    && y < plate_top + plate_h - 1;
                if glyph {
                    24
                } else {
                    255
                }
            } else {
                40
            };
            image.put_pixel(x as u32, y as u32, Rgb([v, v, v]));
        }
    }
}

// ----------------------------------------------------------------------------
// GStreamer RTSP source
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            appsink: None,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    /// Builds a fresh pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.config.url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;
        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.connected_at = Some(Instant::now());
        self.last_frame_at = None;
        self.last_error = None;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::debug!("RTSP pipeline teardown: {}", e);
            }
        }
        self.appsink = None;
        self.connected_at = None;
    }

    fn next_image(&mut self) -> Result<RgbImage> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            anyhow::bail!(err);
        }
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("RTSP source not connected"))?;
        let sample = appsink
            .try_pull_sample(self.frame_timeout())
            .ok_or_else(|| anyhow::anyhow!("RTSP stream stalled"))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow::anyhow!("RTSP buffer does not fit {}x{}", width, height))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= Duration::from_secs(2)
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        gstreamer::ClockTime::from_mseconds(2_000)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("short RTSP buffer")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
