use std::time::Instant;

use frame_detect_common::detection::ParameterList;
use frame_detect_common::frame::FrameError;
use tracing::{debug, warn};

use crate::display::{DisplayError, DisplaySink};
use crate::exchange::{DetectionClient, ExchangeError};
use crate::overlay::{self, FpsMeter};
use crate::source::{CaptureError, FrameSource};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("frame capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("frame encoding failed: {0}")]
    Frame(#[from] FrameError),
    #[error("detection exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("display failed: {0}")]
    Display(#[from] DisplayError),
}

/// What was shown for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Overlay drawn from a parsed response with this many entries.
    Decorated { detections: usize },
    /// Response unusable; the captured frame was shown as is.
    Undecorated,
}

/// Capture → detect → render → display, one frame at a time.
pub struct Pipeline<S, D> {
    source: S,
    display: D,
    client: DetectionClient,
    params: ParameterList,
    jpeg_quality: u8,
    fps: FpsMeter,
    frames: u64,
}

impl<S: FrameSource, D: DisplaySink> Pipeline<S, D> {
    pub fn new(
        source: S,
        display: D,
        client: DetectionClient,
        params: ParameterList,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            source,
            display,
            client,
            params,
            jpeg_quality,
            fps: FpsMeter::new(Instant::now()),
            frames: 0,
        }
    }

    /// Run until the first fatal error.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        loop {
            self.step().await?;
        }
    }

    pub async fn step(&mut self) -> Result<FrameOutcome, PipelineError> {
        let fps = self.fps.tick(Instant::now());
        let frame = self.source.next_frame().await?;
        let encoded = frame.encode_jpeg(self.jpeg_quality)?;

        let outcome = match self.client.detect(&encoded, &self.params).await {
            Ok(detections) => {
                let image = overlay::render(&encoded, &detections, fps)?;
                self.display.show(&image).await?;
                FrameOutcome::Decorated {
                    detections: detections.len(),
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(
                    error = %e,
                    seq = frame.seq,
                    captured_at_ms = frame.captured_at_ms,
                    "failed to parse detections"
                );
                self.display.show(&frame.image).await?;
                FrameOutcome::Undecorated
            }
        };

        self.frames += 1;
        if self.frames % 100 == 0 {
            debug!(total = self.frames, fps = format!("{fps:.2}"), "frames processed");
        }
        Ok(outcome)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[cfg(test)]
    pub fn display(&self) -> &D {
        &self.display
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::tests::fake_service;
    use crate::overlay::{BOX_COLOR, METRICS_COLOR};
    use crate::source::StubSource;
    use frame_detect_common::frame::Frame;
    use image::{Rgb, RgbImage};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Keeps every displayed image.
    #[derive(Default)]
    struct Recorder {
        shown: Vec<RgbImage>,
    }

    impl DisplaySink for Recorder {
        async fn show(&mut self, image: &RgbImage) -> Result<(), DisplayError> {
            self.shown.push(image.clone());
            Ok(())
        }
    }

    /// Always yields the same black frame.
    struct Still(RgbImage);

    impl FrameSource for Still {
        async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            Ok(Frame::new(self.0.clone(), 0, 0))
        }
    }

    fn build<S: FrameSource>(source: S, url: String, classes: &[&str]) -> Pipeline<S, Recorder> {
        Pipeline::new(
            source,
            Recorder::default(),
            DetectionClient::new(url),
            ParameterList::new(classes.iter().copied()),
            75,
        )
    }

    #[tokio::test]
    async fn person_frame_is_decorated() {
        let body = r#"[{"class":"person","confidence":0.91,"bbox":[10,20,100,200],"time":0.05}]"#;
        let (addr, mut seen) = fake_service(vec![Message::Text(body.into())]).await;
        let mut pipeline = build(
            Still(RgbImage::new(640, 480)),
            format!("ws://{addr}"),
            &["person"],
        );

        let outcome = pipeline.step().await.unwrap();

        assert_eq!(outcome, FrameOutcome::Decorated { detections: 1 });
        let received = seen.recv().await.unwrap();
        assert_eq!(received.params, ["person"]);
        assert_eq!(received.image_dims, (640, 480));

        let shown = &pipeline.display().shown;
        assert_eq!(shown.len(), 1);
        let image = &shown[0];
        assert_eq!(image.dimensions(), (640, 480));
        assert_eq!(*image.get_pixel(10, 100), BOX_COLOR);
        assert_eq!(*image.get_pixel(100, 100), BOX_COLOR);
        let fps_lit = (490..640)
            .flat_map(|x| (16..30).map(move |y| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) == METRICS_COLOR);
        let process_lit = (490..640)
            .flat_map(|x| (46..60).map(move |y| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) == METRICS_COLOR);
        assert!(fps_lit && process_lit);
        assert_eq!(pipeline.frames(), 1);
    }

    #[tokio::test]
    async fn malformed_response_shows_raw_frame() {
        let (addr, _seen) = fake_service(vec![Message::Text("not-json".into())]).await;
        let raw = RgbImage::from_pixel(64, 48, Rgb([12, 34, 56]));
        let mut pipeline = build(Still(raw.clone()), format!("ws://{addr}"), &["person"]);

        let outcome = pipeline.step().await.unwrap();

        assert_eq!(outcome, FrameOutcome::Undecorated);
        assert_eq!(pipeline.display().shown, [raw]);
    }

    #[tokio::test]
    async fn loop_continues_after_malformed_response() {
        let replies = vec![
            Message::Text("not-json".into()),
            Message::Text("[]".into()),
        ];
        let (addr, _seen) = fake_service(replies).await;
        let mut pipeline = build(StubSource::unpaced(32, 24), format!("ws://{addr}"), &[]);

        assert_eq!(pipeline.step().await.unwrap(), FrameOutcome::Undecorated);
        assert_eq!(
            pipeline.step().await.unwrap(),
            FrameOutcome::Decorated { detections: 0 }
        );
        assert_eq!(pipeline.display().shown.len(), 2);
    }

    #[tokio::test]
    async fn service_down_stops_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut pipeline = build(StubSource::unpaced(32, 24), format!("ws://{addr}"), &["mug"]);
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Exchange(ExchangeError::Connect(..))
        ));
        assert_eq!(pipeline.frames(), 0);
        assert!(pipeline.display().shown.is_empty());
    }
}
