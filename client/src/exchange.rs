use frame_detect_common::detection::{parse_response, Detection, ParameterList, ResponseError};
use frame_detect_common::frame::EncodedFrame;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed to encode parameter list: {0}")]
    Encode(serde_json::Error),
    #[error("failed to connect to detection service {0}: {1}")]
    Connect(String, tungstenite::Error),
    #[error("failed to send {0} message: {1}")]
    Send(&'static str, tungstenite::Error),
    #[error("failed to receive detection response: {0}")]
    Receive(tungstenite::Error),
    #[error("detection service closed the connection before responding")]
    Closed,
    #[error(transparent)]
    Response(#[from] ResponseError),
}

impl ExchangeError {
    /// Everything but an unusable response body ends the program.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ExchangeError::Response(_))
    }
}

/// Talks to the detection service, one connection per frame.
#[derive(Debug, Clone)]
pub struct DetectionClient {
    url: String,
}

impl DetectionClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Run one request/response exchange for `frame`.
    pub async fn detect(
        &self,
        frame: &EncodedFrame,
        params: &ParameterList,
    ) -> Result<Vec<Detection>, ExchangeError> {
        let params_msg = params.to_message().map_err(ExchangeError::Encode)?;

        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ExchangeError::Connect(self.url.clone(), e))?;

        let reply = exchange(&mut ws, params_msg, frame).await;

        if let Err(e) = ws.close(None).await {
            debug!(error = %e, "websocket close failed");
        }

        let body = reply?;
        debug!(seq = frame.seq(), bytes = body.len(), "received detection response");
        Ok(parse_response(&body)?)
    }
}

async fn exchange(
    ws: &mut Socket,
    params_msg: String,
    frame: &EncodedFrame,
) -> Result<Vec<u8>, ExchangeError> {
    ws.send(Message::Text(params_msg))
        .await
        .map_err(|e| ExchangeError::Send("params", e))?;
    ws.send(Message::Binary(frame.bytes().to_vec()))
        .await
        .map_err(|e| ExchangeError::Send("frame", e))?;
    debug!(
        seq = frame.seq(),
        width = frame.width(),
        height = frame.height(),
        bytes = frame.len(),
        "frame sent"
    );

    while let Some(msg) = ws.next().await {
        match msg.map_err(ExchangeError::Receive)? {
            Message::Text(text) => return Ok(text.into_bytes()),
            Message::Binary(data) => return Ok(data),
            Message::Close(_) => return Err(ExchangeError::Closed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
    Err(ExchangeError::Closed)
}
