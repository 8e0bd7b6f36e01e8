//! Frame sources.
//!
//! The camera itself is reached over HTTP: either a continuous MJPEG
//! stream or one JPEG snapshot per request. A synthetic source stands in
//! when no camera is available.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use frame_detect_common::config::CaptureConfig;
use frame_detect_common::frame::{Frame, FrameError};
use futures_util::{Stream, StreamExt};
use image::{Rgb, RgbImage};
use tokio::sync::Notify;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::mjpeg::MjpegParser;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("camera stream ended")]
    StreamEnded,
    #[error("invalid frame from camera: {0}")]
    Frame(#[from] FrameError),
    #[error("capture task stopped")]
    TaskStopped,
    #[error("unknown capture mode '{0}', expected 'mjpeg', 'snapshot' or 'stub'")]
    UnknownMode(String),
}

/// Something that yields successive camera frames on demand.
pub trait FrameSource {
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, CaptureError>> + Send;
}

/// The source selected by `capture.mode`, optionally behind a prefetch task.
pub enum Source {
    Mjpeg(MjpegSource),
    Snapshot(SnapshotSource),
    Stub(StubSource),
    Prefetch(Prefetch),
}

impl Source {
    pub async fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let source = match config.mode.as_str() {
            "mjpeg" => Source::Mjpeg(MjpegSource::connect(&config.url).await?),
            "snapshot" => Source::Snapshot(SnapshotSource::new(&config.url, config.fps)),
            "stub" => Source::Stub(StubSource::new(config.width, config.height, config.fps)),
            other => return Err(CaptureError::UnknownMode(other.to_string())),
        };
        if !config.prefetch {
            return Ok(source);
        }
        info!(mode = config.mode, "capture prefetch enabled");
        Ok(match source {
            Source::Mjpeg(s) => Source::Prefetch(Prefetch::spawn(s)),
            Source::Snapshot(s) => Source::Prefetch(Prefetch::spawn(s)),
            Source::Stub(s) => Source::Prefetch(Prefetch::spawn(s)),
            Source::Prefetch(p) => Source::Prefetch(p),
        })
    }
}

impl FrameSource for Source {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        match self {
            Source::Mjpeg(s) => s.next_frame().await,
            Source::Snapshot(s) => s.next_frame().await,
            Source::Stub(s) => s.next_frame().await,
            Source::Prefetch(s) => s.next_frame().await,
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Continuous `multipart/x-mixed-replace` camera stream.
pub struct MjpegSource {
    stream: ByteStream,
    parser: MjpegParser,
    pending: VecDeque<Bytes>,
    seq: u64,
}

impl MjpegSource {
    pub async fn connect(url: &str) -> Result<Self, CaptureError> {
        info!(url, "connecting to MJPEG stream");
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(CaptureError::HttpConnect)?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(CaptureError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        info!(status = %response.status(), "connected to MJPEG stream");

        Ok(Self {
            stream: Box::pin(response.bytes_stream()),
            parser: MjpegParser::new(),
            pending: VecDeque::new(),
            seq: 0,
        })
    }
}

impl FrameSource for MjpegSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            // Only the newest complete part matters; older ones are stale.
            if let Some(jpeg) = self.pending.pop_back() {
                if !self.pending.is_empty() {
                    debug!(dropped = self.pending.len(), "dropping stale MJPEG parts");
                    self.pending.clear();
                }
                let seq = self.seq;
                self.seq += 1;
                return Ok(Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis(), seq)?);
            }
            let chunk = self
                .stream
                .next()
                .await
                .ok_or(CaptureError::StreamEnded)?
                .map_err(CaptureError::HttpStream)?;
            self.pending.extend(self.parser.push(&chunk));
        }
    }
}

/// One HTTP request per frame, e.g. a camera's `/frame` endpoint.
pub struct SnapshotSource {
    client: reqwest::Client,
    url: String,
    ticker: Interval,
    seq: u64,
}

impl SnapshotSource {
    pub fn new(url: &str, fps: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            ticker: pacing(fps),
            seq: 0,
        }
    }
}

impl FrameSource for SnapshotSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.ticker.tick().await;
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(CaptureError::HttpConnect)?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "non-success response from camera");
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let jpeg = resp.bytes().await.map_err(CaptureError::HttpStream)?;
        let seq = self.seq;
        self.seq += 1;
        Ok(Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis(), seq)?)
    }
}

/// Synthetic moving test pattern.
pub struct StubSource {
    width: u32,
    height: u32,
    ticker: Option<Interval>,
    seq: u64,
}

impl StubSource {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            ticker: Some(pacing(fps)),
            seq: 0,
        }
    }

    /// A stub that never waits between frames.
    #[cfg(test)]
    pub fn unpaced(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ticker: None,
            seq: 0,
        }
    }

    fn pattern(&self) -> RgbImage {
        let shift = (self.seq * 4) as u32;
        let bar = (self.seq as u32 * 8) % self.width.max(1);
        RgbImage::from_fn(self.width, self.height, |x, y| {
            if x >= bar && x < bar + 16 {
                Rgb([255, 255, 255])
            } else {
                Rgb([
                    (x.wrapping_add(shift) % 256) as u8,
                    (y % 256) as u8,
                    ((x + y) / 4 % 256) as u8,
                ])
            }
        })
    }
}

impl FrameSource for StubSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }
        let image = self.pattern();
        let frame = Frame::new(image, Utc::now().timestamp_millis(), self.seq);
        self.seq += 1;
        Ok(frame)
    }
}

fn pacing(fps: f64) -> Interval {
    let period = if fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::from_millis(100)
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

type Slot = Arc<(Mutex<Option<Result<Frame, CaptureError>>>, Notify)>;

/// Captures in a background task into a single slot. A newer frame
/// replaces one the consumer has not taken yet.
pub struct Prefetch {
    slot: Slot,
    task: tokio::task::JoinHandle<()>,
}

impl Prefetch {
    pub fn spawn<S>(mut source: S) -> Self
    where
        S: FrameSource + Send + 'static,
    {
        let slot: Slot = Arc::new((Mutex::new(None), Notify::new()));
        let producer = Arc::clone(&slot);
        let task = tokio::spawn(async move {
            loop {
                let result = source.next_frame().await;
                let failed = result.is_err();
                {
                    let Ok(mut guard) = producer.0.lock() else {
                        return;
                    };
                    if let Some(Ok(stale)) = guard.replace(result) {
                        debug!(seq = stale.seq, "prefetch dropped unconsumed frame");
                    }
                }
                producer.1.notify_one();
                if failed {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });
        Self { slot, task }
    }

    fn take(&self) -> Result<Option<Result<Frame, CaptureError>>, CaptureError> {
        let mut guard = self.slot.0.lock().map_err(|_| CaptureError::TaskStopped)?;
        Ok(guard.take())
    }
}

impl FrameSource for Prefetch {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            if let Some(result) = self.take()? {
                return result;
            }
            if self.task.is_finished() {
                return Err(CaptureError::TaskStopped);
            }
            self.slot.1.notified().await;
        }
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
