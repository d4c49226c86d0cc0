use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: f64,
    pub height: f64,
}

impl ImageDimensions {
    pub fn new(width: f64, height: f64) -> Option<Self> {
        (width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0)
            .then_some(Self { width, height })
    }
}

/// Detector box in source pixels, anchored at its centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn left(&self) -> f64 {
        self.x - self.width / 2.0
    }

    pub fn top(&self) -> f64 {
        self.y - self.height / 2.0
    }

    /// Percentage rectangle relative to the source image, clipped to it.
    pub fn to_region(&self, source: ImageDimensions) -> Region {
        let left = self.left().clamp(0.0, source.width);
        let top = self.top().clamp(0.0, source.height);
        let right = (self.left() + self.width).clamp(0.0, source.width);
        let bottom = (self.top() + self.height).clamp(0.0, source.height);
        Region {
            left: round2(left / source.width * 100.0),
            top: round2(top / source.height * 100.0),
            width: round2((right - left) / source.width * 100.0),
            height: round2((bottom - top) / source.height * 100.0),
        }
    }
}

/// Top-left anchored rectangle in percent of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    #[default]
    Contain,
    Cover,
    Stretch,
}

/// Rectangle in display pixels, top-left anchored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Axis-aligned scale + offset from source pixels to display pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl AffineTransform {
    pub fn between(source: ImageDimensions, display: ImageDimensions, fit: Fit) -> Self {
        let sx = display.width / source.width;
        let sy = display.height / source.height;
        let (scale_x, scale_y) = match fit {
            Fit::Stretch => (sx, sy),
            Fit::Contain => (sx.min(sy), sx.min(sy)),
            Fit::Cover => (sx.max(sy), sx.max(sy)),
        };
        Self {
            scale_x,
            scale_y,
            offset_x: (display.width - source.width * scale_x) / 2.0,
            offset_y: (display.height - source.height * scale_y) / 2.0,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale_x + self.offset_x,
            y * self.scale_y + self.offset_y,
        )
    }

    pub fn map_box(&self, bbox: &BoundingBox) -> DisplayRect {
        let (left, top) = self.apply(bbox.left(), bbox.top());
        DisplayRect {
            left,
            top,
            width: bbox.width * self.scale_x,
            height: bbox.height * self.scale_y,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
