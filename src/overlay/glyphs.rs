use std::path::Path;

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{Blend, draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use tracing::warn;

const BITMAP_CELLS: u32 = 8;

/// Text renderer for labels: a TrueType face when one is configured,
/// otherwise the 8x8 bitmap font scaled up to the label size.
pub enum LabelFont {
    TrueType(Font<'static>),
    Bitmap,
}

impl LabelFont {
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return LabelFont::Bitmap;
        };
        match std::fs::read(path).ok().and_then(Font::try_from_vec) {
            Some(font) => LabelFont::TrueType(font),
            None => {
                warn!("cannot load font {}, using bitmap labels", path.display());
                LabelFont::Bitmap
            }
        }
    }

    /// Rendered `(width, height)` of `text` at `size` px.
    pub fn measure(&self, text: &str, size: u32) -> (u32, u32) {
        match self {
            LabelFont::TrueType(font) => {
                let (w, h) = text_size(Scale::uniform(size as f32), font, text);
                (w.max(0) as u32, h.max(0) as u32)
            }
            LabelFont::Bitmap => {
                let px = bitmap_scale(size);
                (text.chars().count() as u32 * BITMAP_CELLS * px, BITMAP_CELLS * px)
            }
        }
    }

    /// Draw `text` with its top-left corner at `(x, y)`.
    pub fn draw(
        &self,
        canvas: &mut Blend<RgbaImage>,
        text: &str,
        x: i32,
        y: i32,
        size: u32,
        color: Rgba<u8>,
    ) {
        match self {
            LabelFont::TrueType(font) => {
                draw_text_mut(canvas, color, x, y, Scale::uniform(size as f32), font, text);
            }
            LabelFont::Bitmap => {
                let px = bitmap_scale(size);
                let advance = (BITMAP_CELLS * px) as i32;
                for (i, ch) in text.chars().enumerate() {
                    let glyph = BASIC_FONTS
                        .get(ch)
                        .or_else(|| BASIC_FONTS.get('?'))
                        .unwrap_or([0; 8]);
                    let origin_x = x + i as i32 * advance;
                    for (row, bits) in glyph.iter().enumerate() {
                        for col in 0..BITMAP_CELLS {
                            if bits & (1 << col) == 0 {
                                continue;
                            }
                            let rect = Rect::at(
                                origin_x + (col * px) as i32,
                                y + (row as u32 * px) as i32,
                            )
                            .of_size(px, px);
                            draw_filled_rect_mut(canvas, rect, color);
                        }
                    }
                }
            }
        }
    }
}

fn bitmap_scale(size: u32) -> u32 {
    (size / BITMAP_CELLS).max(1)
}
