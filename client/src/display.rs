//! Display surfaces for rendered frames.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use frame_detect_common::config::DisplayConfig;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::mjpeg;

const DISPLAY_JPEG_QUALITY: u8 = 85;

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("failed to bind viewer on {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("failed to encode display frame: {0}")]
    Encode(image::ImageError),
    #[error("failed to write {0}: {1}")]
    Write(String, std::io::Error),
    #[error("unknown display mode '{0}', expected 'mjpeg' or 'file'")]
    UnknownMode(String),
}

/// Where rendered frames end up.
pub trait DisplaySink {
    fn show(&mut self, image: &RgbImage) -> impl Future<Output = Result<(), DisplayError>> + Send;
}

pub enum Display {
    Mjpeg(MjpegViewer),
    File(FileSink),
}

impl Display {
    pub async fn open(config: &DisplayConfig) -> Result<Self, DisplayError> {
        match config.mode.as_str() {
            "mjpeg" => Ok(Display::Mjpeg(MjpegViewer::bind(&config.bind).await?)),
            "file" => Ok(Display::File(FileSink::new(&config.path))),
            other => Err(DisplayError::UnknownMode(other.to_string())),
        }
    }
}

impl DisplaySink for Display {
    async fn show(&mut self, image: &RgbImage) -> Result<(), DisplayError> {
        match self {
            Display::Mjpeg(d) => d.show(image).await,
            Display::File(d) => d.show(image).await,
        }
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, DisplayError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, DISPLAY_JPEG_QUALITY)
        .encode_image(image)
        .map_err(DisplayError::Encode)?;
    Ok(buffer)
}

/// Browser-viewable `multipart/x-mixed-replace` stream of the latest frame.
pub struct MjpegViewer {
    latest: watch::Sender<Bytes>,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl MjpegViewer {
    pub async fn bind(addr: &str) -> Result<Self, DisplayError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| DisplayError::Bind(addr.to_string(), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| DisplayError::Bind(addr.to_string(), e))?;

        let (latest, _) = watch::channel(Bytes::new());
        let app = Router::new()
            .route("/", get(stream_frames))
            .route("/frame.jpg", get(latest_frame))
            .with_state(latest.clone());

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "viewer server stopped");
            }
        });

        Ok(Self {
            latest,
            addr: local,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl DisplaySink for MjpegViewer {
    async fn show(&mut self, image: &RgbImage) -> Result<(), DisplayError> {
        let jpeg = encode_jpeg(image)?;
        debug!(bytes = jpeg.len(), viewers = self.latest.receiver_count(), "frame published");
        self.latest.send_replace(Bytes::from(jpeg));
        Ok(())
    }
}

impl Drop for MjpegViewer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn stream_frames(State(latest): State<watch::Sender<Bytes>>) -> impl IntoResponse {
    let rx = latest.subscribe();
    // A new viewer gets the current frame right away, then every update.
    let parts = futures_util::stream::unfold((rx, true), |(mut rx, first)| async move {
        let have_frame = first && !rx.borrow().is_empty();
        if !have_frame {
            rx.changed().await.ok()?;
        }
        let jpeg = rx.borrow_and_update().clone();
        Some((Ok::<_, Infallible>(mjpeg::encode_part(&jpeg)), (rx, false)))
    });
    (
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(parts),
    )
}

async fn latest_frame(State(latest): State<watch::Sender<Bytes>>) -> impl IntoResponse {
    let jpeg = latest.borrow().clone();
    ([(header::CONTENT_TYPE, "image/jpeg")], jpeg)
}

/// Overwrites one JPEG file per frame.
pub struct FileSink {
    path: PathBuf,
    tmp: PathBuf,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp: PathBuf::from(tmp),
        }
    }
}

impl DisplaySink for FileSink {
    async fn show(&mut self, image: &RgbImage) -> Result<(), DisplayError> {
        let jpeg = encode_jpeg(image)?;
        tokio::fs::write(&self.tmp, &jpeg)
            .await
            .map_err(|e| DisplayError::Write(self.tmp.display().to_string(), e))?;
        // Rename so readers never see a half-written frame
        tokio::fs::rename(&self.tmp, &self.path)
            .await
            .map_err(|e| DisplayError::Write(self.path.display().to_string(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mjpeg::MjpegParser;
    use futures_util::StreamExt;
    use image::Rgb;

    fn solid(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([30, 60, 90]))
    }

    #[tokio::test]
    async fn file_sink_writes_jpeg() {
        let path = std::env::temp_dir().join(format!("frame-detect-{}.jpg", std::process::id()));
        let mut sink = FileSink::new(&path);
        sink.show(&solid(40, 30)).await.unwrap();
        sink.show(&solid(40, 30)).await.unwrap();

        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (40, 30));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let config = DisplayConfig {
            mode: "window".into(),
            ..DisplayConfig::default()
        };
        assert!(matches!(
            Display::open(&config).await,
            Err(DisplayError::UnknownMode(_))
        ));
    }

    #[tokio::test]
    async fn viewer_streams_published_frames() {
        let mut viewer = MjpegViewer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", viewer.local_addr());
        viewer.show(&solid(24, 16)).await.unwrap();

        let response = reqwest::get(&url).await.unwrap();
        assert!(response.status().is_success());
        let content_type = response.headers()[reqwest::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("multipart/x-mixed-replace"));

        let mut body = response.bytes_stream();
        let mut parser = MjpegParser::new();
        let mut parts = Vec::new();
        while parts.is_empty() {
            let chunk = body.next().await.unwrap().unwrap();
            parts.extend(parser.push(&chunk));
            if parts.is_empty() {
                // Second frame supplies the closing boundary of the first
                viewer.show(&solid(24, 16)).await.unwrap();
            }
        }
        let decoded = image::load_from_memory(&parts[0]).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
    }

    #[tokio::test]
    async fn latest_frame_endpoint() {
        let mut viewer = MjpegViewer::bind("127.0.0.1:0").await.unwrap();
        viewer.show(&solid(8, 8)).await.unwrap();
        let url = format!("http://{}/frame.jpg", viewer.local_addr());
        let jpeg = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
        assert_eq!(image::load_from_memory(&jpeg).unwrap().width(), 8);
    }
}
