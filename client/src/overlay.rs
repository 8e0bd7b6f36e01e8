use std::time::Instant;

use frame_detect_common::detection::Detection;
use frame_detect_common::frame::{EncodedFrame, FrameError};
use image::{Rgb, RgbImage};

use crate::font;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const METRICS_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Metrics labels start this many pixels left of the right edge.
pub const METRICS_INSET: i32 = 150;
pub const FPS_BASELINE: i32 = 30;
pub const PROCESS_BASELINE: i32 = 60;

const LINE_THICKNESS: i32 = 2;
const TEXT_SCALE: i32 = 2;

/// Frames per second from the wall-clock gap between consecutive ticks.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    last: Instant,
    fps: f64,
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self { last: now, fps: 0.0 }
    }

    /// Record a frame at `now`. A zero gap keeps the previous value.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.fps = 1.0 / elapsed;
        }
        self.last = now;
        self.fps
    }
}

/// Inclusive pixel rectangle, corners as reported in the bbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    /// Bottom-left corner of the text.
    pub x: i32,
    pub y: i32,
    pub color: Rgb<u8>,
}

/// Everything drawn on top of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub boxes: Vec<Rect>,
    pub labels: Vec<Label>,
}

impl Overlay {
    pub fn compose(width: u32, height: u32, detections: &[Detection], fps: f64) -> Self {
        let mut overlay = Overlay::default();
        let to_x = |v: f64| to_pixel(v, width);
        let to_y = |v: f64| to_pixel(v, height);

        for det in detections {
            let Some(bbox) = det.bounding_box() else {
                continue;
            };
            let rect = Rect {
                x0: to_x(bbox.x_min),
                y0: to_y(bbox.y_min),
                x1: to_x(bbox.x_max),
                y1: to_y(bbox.y_max),
            };
            overlay.boxes.push(rect);
            overlay.labels.push(Label {
                text: det.label(),
                x: rect.x0,
                y: rect.y0,
                color: BOX_COLOR,
            });
        }

        let metrics_x = width as i32 - METRICS_INSET;
        overlay.labels.push(Label {
            text: format!("FPS: {fps:.2}"),
            x: metrics_x,
            y: FPS_BASELINE,
            color: METRICS_COLOR,
        });
        // First entry's server time stands in for the whole frame.
        if let Some(first) = detections.first() {
            overlay.labels.push(Label {
                text: format!("Process: {:.4}s", first.time),
                x: metrics_x,
                y: PROCESS_BASELINE,
                color: METRICS_COLOR,
            });
        }

        overlay
    }

    pub fn draw(&self, image: &mut RgbImage) {
        for rect in &self.boxes {
            stroke_rect(image, *rect, LINE_THICKNESS, BOX_COLOR);
        }
        for label in &self.labels {
            font::draw_text(image, label.x, label.y, &label.text, TEXT_SCALE, label.color);
        }
    }
}

/// Decode the frame that was sent to the service and draw the overlay on it.
pub fn render(
    frame: &EncodedFrame,
    detections: &[Detection],
    fps: f64,
) -> Result<RgbImage, FrameError> {
    let mut image = frame.decode()?;
    Overlay::compose(image.width(), image.height(), detections, fps).draw(&mut image);
    Ok(image)
}

/// Truncate a service coordinate to a pixel index. Values far outside the
/// frame are pulled in to one frame's span beyond either edge, which keeps
/// them off-image while leaving room for line and glyph offsets.
fn to_pixel(value: f64, extent: u32) -> i32 {
    let extent = f64::from(extent);
    value.clamp(-extent, 2.0 * extent) as i32
}

fn stroke_rect(image: &mut RgbImage, rect: Rect, thickness: i32, color: Rgb<u8>) {
    let (left, right) = (rect.x0.min(rect.x1), rect.x0.max(rect.x1));
    let (top, bottom) = (rect.y0.min(rect.y1), rect.y0.max(rect.y1));
    let t = thickness.max(1) - 1;

    fill(image, left, top, right, top.saturating_add(t), color);
    fill(image, left, bottom.saturating_sub(t), right, bottom, color);
    fill(image, left, top, left.saturating_add(t), bottom, color);
    fill(image, right.saturating_sub(t), top, right, bottom, color);
}

/// Fill the inclusive rectangle, clipped to the image.
fn fill(image: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;
    let (x0, x1) = (x0.max(0), x1.min(max_x));
    let (y0, y1) = (y0.max(0), y1.min(max_y));
    if x0 > x1 || y0 > y1 {
        return;
    }
    for y in y0..=y1 {
        for x in x0..=x1 {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_detect_common::detection::parse_response;
    use frame_detect_common::frame::Frame;
    use std::time::Duration;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn person() -> Vec<Detection> {
        parse_response(
            br#"[{"class":"person","confidence":0.91,"bbox":[10,20,100,200],"time":0.05}]"#,
        )
        .unwrap()
    }

    #[test]
    fn fps_is_reciprocal_of_gap() {
        let t0 = Instant::now();
        let mut meter = FpsMeter::new(t0);
        assert_eq!(meter.tick(t0), 0.0);
        let fps = meter.tick(t0 + Duration::from_millis(100));
        assert!((fps - 10.0).abs() < 1e-9);
        let fps = meter.tick(t0 + Duration::from_millis(350));
        assert!((fps - 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_gap_keeps_last_fps() {
        let t0 = Instant::now();
        let mut meter = FpsMeter::new(t0);
        let t1 = t0 + Duration::from_millis(50);
        meter.tick(t1);
        assert!((meter.tick(t1) - 20.0).abs() < 1e-9);
        assert!((meter.tick(t1) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn compose_person_scenario() {
        let overlay = Overlay::compose(640, 480, &person(), 12.5);
        assert_eq!(
            overlay.boxes,
            [Rect {
                x0: 10,
                y0: 20,
                x1: 100,
                y1: 200
            }]
        );
        let labels: Vec<(&str, i32, i32)> = overlay
            .labels
            .iter()
            .map(|l| (l.text.as_str(), l.x, l.y))
            .collect();
        assert_eq!(
            labels,
            [
                ("person 0.91", 10, 20),
                ("FPS: 12.50", 490, 30),
                ("Process: 0.0500s", 490, 60),
            ]
        );
        assert_eq!(overlay.labels[0].color, BOX_COLOR);
        assert_eq!(overlay.labels[1].color, METRICS_COLOR);
    }

    #[test]
    fn no_detections_only_fps() {
        let overlay = Overlay::compose(320, 240, &[], 0.0);
        assert!(overlay.boxes.is_empty());
        assert_eq!(overlay.labels.len(), 1);
        assert_eq!(overlay.labels[0].text, "FPS: 0.00");
        assert_eq!((overlay.labels[0].x, overlay.labels[0].y), (170, 30));
    }

    #[test]
    fn bad_bbox_skipped_but_process_time_kept() {
        let detections = parse_response(
            br#"[
                {"class":"mug","confidence":0.4,"bbox":[1,2,3],"time":0.125},
                {"class":"keys","confidence":0.8,"bbox":[5,6,50,60],"time":0.125}
            ]"#,
        )
        .unwrap();
        let overlay = Overlay::compose(640, 480, &detections, 1.0);
        assert_eq!(overlay.boxes.len(), 1);
        assert_eq!(overlay.boxes[0].x0, 5);
        let texts: Vec<&str> = overlay.labels.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["keys 0.80", "FPS: 1.00", "Process: 0.1250s"]);
    }

    #[test]
    fn fractional_bbox_truncates() {
        let detections =
            parse_response(br#"[{"class":"a","confidence":1,"bbox":[10.9,20.5,99.99,-0.5],"time":0}]"#)
                .unwrap();
        let overlay = Overlay::compose(640, 480, &detections, 0.0);
        assert_eq!(
            overlay.boxes[0],
            Rect {
                x0: 10,
                y0: 20,
                x1: 99,
                y1: 0
            }
        );
    }

    #[test]
    fn draws_box_edges_not_interior() {
        let mut image = RgbImage::new(640, 480);
        Overlay::compose(640, 480, &person(), 30.0).draw(&mut image);
        assert_eq!(*image.get_pixel(10, 100), BOX_COLOR);
        assert_eq!(*image.get_pixel(11, 100), BOX_COLOR);
        assert_eq!(*image.get_pixel(100, 150), BOX_COLOR);
        assert_eq!(*image.get_pixel(60, 200), BOX_COLOR);
        assert_eq!(*image.get_pixel(55, 110), BLACK);
        let metrics_lit = (490..640)
            .flat_map(|x| (16..30).map(move |y| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) == METRICS_COLOR);
        assert!(metrics_lit);
    }

    #[test]
    fn boxes_outside_frame_are_clipped() {
        let detections = parse_response(
            br#"[{"class":"x","confidence":0.5,"bbox":[-50,-50,5000,5000],"time":0}]"#,
        )
        .unwrap();
        let mut image = RgbImage::new(64, 48);
        Overlay::compose(64, 48, &detections, 0.0).draw(&mut image);
        assert_eq!(*image.get_pixel(0, 0), BLACK);
        assert_eq!(*image.get_pixel(32, 24), BLACK);
    }

    #[test]
    fn huge_coordinates_are_clipped() {
        let detections = parse_response(
            br#"[
                {"class":"far","confidence":0.5,"bbox":[1e10,1e10,1e10,1e10],"time":0},
                {"class":"near","confidence":0.5,"bbox":[-1e10,-1e10,5,5],"time":0},
                {"class":"max","confidence":0.5,"bbox":[-1.7e308,-1.7e308,1.7e308,1.7e308],"time":0}
            ]"#,
        )
        .unwrap();
        let overlay = Overlay::compose(64, 48, &detections, 0.0);
        assert_eq!(
            overlay.boxes[0],
            Rect {
                x0: 128,
                y0: 96,
                x1: 128,
                y1: 96
            }
        );
        assert_eq!(
            overlay.boxes[2],
            Rect {
                x0: -64,
                y0: -48,
                x1: 128,
                y1: 96
            }
        );

        let mut image = RgbImage::new(64, 48);
        overlay.draw(&mut image);
        // Right and bottom edges of the second box are on-image.
        assert_eq!(*image.get_pixel(5, 2), BOX_COLOR);
        assert_eq!(*image.get_pixel(2, 5), BOX_COLOR);
        assert_eq!(*image.get_pixel(32, 24), BLACK);
    }

    #[test]
    fn saturated_rect_does_not_overflow() {
        let mut image = RgbImage::new(16, 16);
        let rect = Rect {
            x0: i32::MIN,
            y0: i32::MIN,
            x1: i32::MAX,
            y1: i32::MAX,
        };
        stroke_rect(&mut image, rect, LINE_THICKNESS, BOX_COLOR);
        assert_eq!(*image.get_pixel(8, 8), BLACK);
    }

    #[test]
    fn render_keeps_encoded_dimensions() {
        let encoded = Frame::new(RgbImage::new(640, 480), 0, 0)
            .encode_jpeg(75)
            .unwrap();
        let image = render(&encoded, &person(), 15.0).unwrap();
        assert_eq!(image.dimensions(), (640, 480));
        assert_eq!(*image.get_pixel(10, 100), BOX_COLOR);
    }
}
