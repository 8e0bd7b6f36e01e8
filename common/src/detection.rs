//! Detection service message types.
//!
//! Wire format of one exchange:
//!
//!   request 1  text    JSON array of class names, e.g. `["watch","mug"]`
//!   request 2  binary  JPEG bytes of the frame
//!   response   text or binary, JSON array of detections:
//!              `[{"class":"person","confidence":0.91,"bbox":[x0,y0,x1,y1],"time":0.05}]`
//!
//! The service answers `{"error": "..."}` instead when it rejects the
//! request.

use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_CLASSES: [&str; 4] = ["watch", "mug", "person", "keys"];

/// Ordered class names the detector should report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterList(Vec<String>);

impl ParameterList {
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(classes.into_iter().map(Into::into).collect())
    }

    /// JSON text message sent as the first frame of an exchange.
    pub fn to_message(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}

impl Default for ParameterList {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSES)
    }
}

/// One detected object as reported by the service. Missing or `null`
/// fields take their zero value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub class: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub confidence: f64,
    /// `[x_min, y_min, x_max, y_max]` in encoded-frame pixels. Only usable
    /// with exactly four entries.
    #[serde(default, deserialize_with = "null_as_default")]
    pub bbox: Vec<f64>,
    /// Server-side processing time for the whole frame, in seconds.
    #[serde(default, deserialize_with = "null_as_default")]
    pub time: f64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Detection {
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        match self.bbox.as_slice() {
            &[x_min, y_min, x_max, y_max] => Some(BoundingBox {
                x_min,
                y_min,
                x_max,
                y_max,
            }),
            _ => None,
        }
    }

    /// Overlay label, e.g. `person 0.91`.
    pub fn label(&self) -> String {
        format!("{} {:.2}", self.class, self.confidence)
    }
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    error: String,
}

/// Parse a detection response body.
pub fn parse_response(data: &[u8]) -> Result<Vec<Detection>, ResponseError> {
    match serde_json::from_slice::<Vec<Detection>>(data) {
        Ok(detections) => Ok(detections),
        Err(e) => match serde_json::from_slice::<ServiceError>(data) {
            Ok(service) => Err(ResponseError::Service(service.error)),
            Err(_) => Err(ResponseError::Malformed(e)),
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("malformed detection response: {0}")]
    Malformed(serde_json::Error),
    #[error("detection service error: {0}")]
    Service(String),
}
