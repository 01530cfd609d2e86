mod glyphs;

use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageError, Rgba, RgbaImage};
use imageproc::drawing::{Blend, draw_filled_rect_mut, draw_hollow_circle_mut};
use imageproc::rect::Rect;
use tracing::warn;

pub use glyphs::LabelFont;

use crate::config::{AgentConfig, EncodeSettings, OverlayStyle};
use crate::grid::{GridSpec, column_letter};
use crate::protocol::{Action, Decision};
use crate::types::EncodedImage;

const LABEL_PADDING: i32 = 4;
const EDGE_MARGIN: i32 = 6;
const MARKER_RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const CLICK_RADIUS: i32 = 40;
const CLICK_RING: i32 = 6;
const CROSSHAIR_LEN: i32 = 60;
const CROSSHAIR_WIDTH: u32 = 4;
const BANNER_TOP: i32 = 20;

/// Draws the coordinate grid onto screenshots and marks executed actions.
pub struct GridOverlay {
    spec: GridSpec,
    style: OverlayStyle,
    encode: EncodeSettings,
    font: LabelFont,
}

impl GridOverlay {
    pub fn new(config: &AgentConfig) -> Self {
        Self::with_style(config.grid, config.style.clone(), config.encode)
    }

    pub fn with_style(spec: GridSpec, style: OverlayStyle, encode: EncodeSettings) -> Self {
        let font = LabelFont::load(style.font_path.as_deref());
        Self {
            spec,
            style,
            encode,
            font,
        }
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    /// Grid geometry in the image's own pixel space.
    fn geometry(&self, width: u32, height: u32) -> GridSpec {
        self.spec.with_screen(width, height).unwrap_or(self.spec)
    }

    pub fn render(&self, image: &DynamicImage) -> RgbaImage {
        let mut canvas = Blend(image.to_rgba8());
        let (width, height) = canvas.0.dimensions();
        let spec = self.geometry(width, height);
        let (cols, rows) = (spec.cols() as i64, spec.rows() as i64);
        let (w, h) = (width as i64, height as i64);

        let line = rgb(self.style.line_color, 255);
        let lw = self.style.line_width.max(1);
        let half = (lw / 2) as i32;
        for i in 0..=cols {
            let x = (i * w / cols) as i32;
            draw_filled_rect_mut(&mut canvas, Rect::at(x - half, 0).of_size(lw, height), line);
        }
        for j in 0..=rows {
            let y = (j * h / rows) as i32;
            draw_filled_rect_mut(&mut canvas, Rect::at(0, y - half).of_size(width, lw), line);
        }

        let size = self.style.label_size;
        let bg = Rgba(self.style.label_bg_color);
        let fg = rgb(self.style.label_color, 255);

        let (_, text_h) = self.font.measure("A", size);
        let top = EDGE_MARGIN + LABEL_PADDING + text_h as i32 / 2;
        let bottom = height as i32 - top;
        for i in 0..cols {
            let x = ((2 * i + 1) * w / (2 * cols)) as i32;
            let letter = column_letter(i as u32).to_string();
            self.draw_label(&mut canvas, &letter, x, top, bg, fg);
            self.draw_label(&mut canvas, &letter, x, bottom, bg, fg);
        }

        let (digits_w, _) = self.font.measure(&spec.rows().to_string(), size);
        let left = EDGE_MARGIN + LABEL_PADDING + digits_w as i32 / 2;
        let right = width as i32 - left;
        for j in 0..rows {
            let y = ((2 * j + 1) * h / (2 * rows)) as i32;
            let number = (j + 1).to_string();
            self.draw_label(&mut canvas, &number, left, y, bg, fg);
            self.draw_label(&mut canvas, &number, right, y, bg, fg);
        }

        if self.style.show_inner_labels {
            self.draw_inner_labels(&mut canvas, &spec);
        }

        canvas.0
    }

    /// Faint `E5`-style labels every `inner_label_interval` cells.
    fn draw_inner_labels(&self, canvas: &mut Blend<RgbaImage>, spec: &GridSpec) {
        let step = self.style.inner_label_interval.max(1);
        let alpha = self.style.inner_label_opacity;
        let [r, g, b, _] = self.style.label_bg_color;
        let bg = Rgba([r, g, b, alpha]);
        let fg = rgb(self.style.label_color, alpha);

        for label in spec.labels() {
            if (label.col() + 1) % step != 0 || label.row() % step != 0 {
                continue;
            }
            if let Ok(center) = spec.to_pixel(&label) {
                self.draw_label(canvas, &label.to_string(), center.x, center.y, bg, fg);
            }
        }
    }

    /// Text centred on `(cx, cy)` over a filled background box.
    fn draw_label(
        &self,
        canvas: &mut Blend<RgbaImage>,
        text: &str,
        cx: i32,
        cy: i32,
        bg: Rgba<u8>,
        fg: Rgba<u8>,
    ) {
        let size = self.style.label_size;
        let (tw, th) = self.font.measure(text, size);
        let (tw, th) = (tw as i32, th as i32);
        let x = cx - tw / 2;
        let y = cy - th / 2;
        let rect = Rect::at(x - LABEL_PADDING, y - LABEL_PADDING)
            .of_size((tw + 2 * LABEL_PADDING) as u32, (th + 2 * LABEL_PADDING) as u32);
        draw_filled_rect_mut(canvas, rect, bg);
        self.font.draw(canvas, text, x, y, size, fg);
    }

    pub fn encode(&self, image: &RgbaImage) -> Result<EncodedImage, ImageError> {
        encode_image(image, self.encode.target_size, self.encode.quality)
    }

    /// Annotate a raw capture and produce the copy sent to the model.
    pub fn process(&self, raw: &DynamicImage) -> Result<(RgbaImage, EncodedImage), ImageError> {
        let annotated = self.render(raw);
        let encoded = self.encode(&annotated)?;
        Ok((annotated, encoded))
    }

    /// Copy of `annotated` showing what `decision` did. Never fails: a
    /// marker that cannot be placed leaves the image unmarked.
    pub fn mark_action(&self, annotated: &RgbaImage, decision: &Decision) -> RgbaImage {
        let mut canvas = Blend(annotated.clone());
        match &decision.action {
            Action::Click { grid } => {
                let spec = self.geometry(annotated.width(), annotated.height());
                match spec.to_pixel(grid) {
                    Ok(center) => {
                        let tag = format!("CLICK {grid}");
                        self.draw_click(&mut canvas, center.x, center.y, &tag);
                    }
                    Err(e) => {
                        warn!("cannot mark CLICK action: {}", e);
                        return annotated.clone();
                    }
                }
            }
            Action::Type { value, .. } if !value.is_empty() => {
                let text = format!("TYPE: \"{value}\"");
                self.draw_banner(&mut canvas, &text, Rgba([0, 128, 255, 200]));
            }
            Action::Awake { package } if !package.is_empty() => {
                self.draw_banner(&mut canvas, &format!("AWAKE: {package}"), Rgba([0, 200, 0, 200]));
            }
            _ => {}
        }
        canvas.0
    }

    fn draw_click(&self, canvas: &mut Blend<RgbaImage>, x: i32, y: i32, tag: &str) {
        for r in CLICK_RADIUS..CLICK_RADIUS + CLICK_RING {
            draw_hollow_circle_mut(canvas, (x, y), r, MARKER_RED);
        }

        let half = CROSSHAIR_WIDTH as i32 / 2;
        let span = (2 * CROSSHAIR_LEN) as u32;
        draw_filled_rect_mut(
            canvas,
            Rect::at(x - CROSSHAIR_LEN, y - half).of_size(span, CROSSHAIR_WIDTH),
            MARKER_RED,
        );
        draw_filled_rect_mut(
            canvas,
            Rect::at(x - half, y - CROSSHAIR_LEN).of_size(CROSSHAIR_WIDTH, span),
            MARKER_RED,
        );

        let size = self.style.label_size;
        let (tw, th) = self.font.measure(tag, size);
        let (tw, th) = (tw as i32, th as i32);
        let label_x = x - tw / 2;
        let label_y = (y - CLICK_RADIUS - th - 10).max(LABEL_PADDING + 1);
        let rect = Rect::at(label_x - 5, label_y - 5).of_size((tw + 10) as u32, (th + 10) as u32);
        draw_filled_rect_mut(canvas, rect, Rgba([255, 0, 0, 200]));
        self.font.draw(canvas, tag, label_x, label_y, size, WHITE);
    }

    fn draw_banner(&self, canvas: &mut Blend<RgbaImage>, text: &str, bg: Rgba<u8>) {
        let size = self.style.label_size;
        let (tw, th) = self.font.measure(text, size);
        let (tw, th) = (tw as i32, th as i32);
        let x = (canvas.0.width() as i32 - tw) / 2;
        let rect = Rect::at(x - 10, BANNER_TOP - 5).of_size((tw + 20) as u32, (th + 10) as u32);
        draw_filled_rect_mut(canvas, rect, bg);
        self.font.draw(canvas, text, x, BANNER_TOP, size, WHITE);
    }
}

fn rgb([r, g, b]: [u8; 3], alpha: u8) -> Rgba<u8> {
    Rgba([r, g, b, alpha])
}

/// Square-resize and JPEG-compress `image`, then base64 it.
pub fn encode_image(
    image: &RgbaImage,
    target_size: u32,
    quality: u8,
) -> Result<EncodedImage, ImageError> {
    let resized = imageops::resize(image, target_size, target_size, FilterType::Lanczos3);
    let rgb = DynamicImage::ImageRgba8(resized).to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(&rgb)?;
    Ok(EncodedImage::jpeg(STANDARD.encode(buffer.into_inner())))
}

pub fn save_jpeg(image: &RgbaImage, path: &Path, quality: u8) -> Result<(), ImageError> {
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(writer, quality).encode_image(&rgb)
}
