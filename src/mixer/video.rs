//! Per-recipient video composition.
//!
//! Each tick takes the latest RGB frame of every visible source and
//! produces one terminal-ready byte buffer: palette glyphs, optional
//! ANSI color escapes, newline-terminated rows. Pure with respect to its
//! inputs, so frozen inputs yield identical output across ticks.

use super::ascii::{luminance, push_color, push_reset, ColorMode, Palette};
use super::layout::{grid_shape, tile_rects, TileRect};
use crate::config::MixerOptions;
use crate::media::{VideoFormat, VideoFrame};
use std::sync::Arc;

/// Recipient view parameters, from its STREAM_START / TERMINAL_SIZE.
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
    pub color: ColorMode,
}

/// One visible source in stable order. `frame` is `None` when the latest
/// frame failed to decode; the tile renders a no-signal pattern instead.
#[derive(Clone)]
pub struct TileSource {
    pub frame: Option<Arc<VideoFrame>>,
}

#[derive(Clone, Copy, PartialEq)]
struct Cell {
    glyph: char,
    color: Option<(u8, u8, u8)>,
}

const BLANK: Cell = Cell { glyph: ' ', color: None };

/// Compose the recipient's grid. Zero sources produce a stable blank
/// grid rather than nothing, so the viewer keeps a steady screen.
pub fn compose(viewport: Viewport, sources: &[TileSource], options: &MixerOptions) -> Vec<u8> {
    let cols = viewport.cols as usize;
    let rows = viewport.rows as usize;
    let mut cells = vec![BLANK; cols * rows];

    if !sources.is_empty() {
        let palette = Palette::new(&options.palette);
        let spec = grid_shape(sources.len(), viewport.cols, viewport.rows, options.cell_aspect);
        let rects = tile_rects(spec, viewport.cols, viewport.rows, sources.len());

        for (source, rect) in sources.iter().zip(rects.iter()) {
            match source.frame.as_deref() {
                Some(frame) if frame.format == VideoFormat::Rgb24 => {
                    render_tile(&mut cells, cols, *rect, frame, &palette, options.cell_aspect);
                }
                _ => render_no_signal(&mut cells, cols, *rect),
            }
        }
    }

    serialize(&cells, cols, rows, viewport.color)
}

/// Box-average resample of one source into its tile, letterboxed and
/// centered when the aspects disagree.
fn render_tile(
    cells: &mut [Cell],
    grid_cols: usize,
    rect: TileRect,
    frame: &VideoFrame,
    palette: &Palette,
    cell_aspect: f32,
) {
    if rect.width == 0 || rect.height == 0 || frame.width == 0 || frame.height == 0 {
        return;
    }
    let src_w = frame.width as usize;
    let src_h = frame.height as usize;
    let src_aspect = src_w as f32 / src_h as f32;

    let content_w = ((rect.height as f32 * cell_aspect * src_aspect).round() as usize)
        .clamp(1, rect.width as usize);
    let content_h = ((rect.width as f32 / (src_aspect * cell_aspect)).round() as usize)
        .clamp(1, rect.height as usize);
    let off_x = rect.x as usize + (rect.width as usize - content_w) / 2;
    let off_y = rect.y as usize + (rect.height as usize - content_h) / 2;

    for cy in 0..content_h {
        let y0 = cy * src_h / content_h;
        let y1 = ((cy + 1) * src_h / content_h).max(y0 + 1).min(src_h);
        for cx in 0..content_w {
            let x0 = cx * src_w / content_w;
            let x1 = ((cx + 1) * src_w / content_w).max(x0 + 1).min(src_w);

            let (mut r, mut g, mut b) = (0u32, 0u32, 0u32);
            for y in y0..y1 {
                let row = y * src_w * 3;
                for x in x0..x1 {
                    let p = row + x * 3;
                    r += frame.data[p] as u32;
                    g += frame.data[p + 1] as u32;
                    b += frame.data[p + 2] as u32;
                }
            }
            let n = ((y1 - y0) * (x1 - x0)) as u32;
            let (r, g, b) = ((r / n) as u8, (g / n) as u8, (b / n) as u8);

            cells[(off_y + cy) * grid_cols + off_x + cx] = Cell {
                glyph: palette.glyph(luminance(r, g, b)),
                color: Some((r, g, b)),
            };
        }
    }
}

/// Dotted pattern for a source whose latest frame could not be decoded.
fn render_no_signal(cells: &mut [Cell], grid_cols: usize, rect: TileRect) {
    for y in 0..rect.height as usize {
        for x in 0..rect.width as usize {
            let glyph = if (x + y) % 2 == 0 { '.' } else { ' ' };
            cells[(rect.y as usize + y) * grid_cols + rect.x as usize + x] =
                Cell { glyph, color: None };
        }
    }
}

/// Flatten the cell grid into terminal bytes, coalescing runs of one
/// color into a single escape.
fn serialize(cells: &[Cell], cols: usize, rows: usize, mode: ColorMode) -> Vec<u8> {
    let mut out = Vec::with_capacity(cells.len() * 2 + rows);
    for row in 0..rows {
        let mut active: Option<(u8, u8, u8)> = None;
        for cell in &cells[row * cols..(row + 1) * cols] {
            match cell.color {
                Some(color) if mode != ColorMode::Mono => {
                    if active != Some(color) {
                        push_color(&mut out, mode, color.0, color.1, color.2);
                        active = Some(color);
                    }
                }
                _ => {
                    if active.is_some() {
                        push_reset(&mut out, mode);
                        active = None;
                    }
                }
            }
            let mut encoded = [0u8; 4];
            out.extend_from_slice(cell.glyph.encode_utf8(&mut encoded).as_bytes());
        }
        if active.is_some() {
            push_reset(&mut out, mode);
        }
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> MixerOptions {
        MixerOptions::default()
    }

    fn viewport(cols: u16, rows: u16) -> Viewport {
        Viewport { cols, rows, color: ColorMode::Mono }
    }

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Arc<VideoFrame> {
        let pixels: Vec<u8> = rgb.iter().copied().cycle().take((width * height * 3) as usize).collect();
        Arc::new(VideoFrame::rgb24(width, height, 0, 0, pixels))
    }

    #[test]
    fn zero_sources_emit_blank_grid() {
        let out = compose(viewport(4, 2), &[], &options());
        assert_eq!(out, b"    \n    \n");
    }

    #[test]
    fn solid_white_fills_viewport() {
        let source = TileSource { frame: Some(solid_frame(8, 8, [255, 255, 255])) };
        let out = compose(viewport(8, 4), &[source], &options());
        assert_eq!(out, b"@@@@@@@@\n@@@@@@@@\n@@@@@@@@\n@@@@@@@@\n");
    }

    #[test]
    fn solid_black_renders_palette_floor() {
        let source = TileSource { frame: Some(solid_frame(8, 8, [0, 0, 0])) };
        let out = compose(viewport(4, 2), &[source], &options());
        assert_eq!(out, b"    \n    \n");
    }

    #[test]
    fn wide_source_letterboxes_vertically() {
        // 16x8 source (aspect 2) in a 4x4 tile at cell aspect 2: content
        // is 4x1, centered with blank rows around it.
        let source = TileSource { frame: Some(solid_frame(16, 8, [255, 255, 255])) };
        let out = compose(viewport(4, 4), &[source], &options());
        assert_eq!(out, b"    \n@@@@\n    \n    \n");
    }

    #[test]
    fn no_signal_tile_renders_pattern() {
        let source = TileSource { frame: None };
        let out = compose(viewport(4, 2), &[source], &options());
        assert_eq!(out, b". . \n . .\n");
    }

    #[test]
    fn two_sources_get_separate_tiles() {
        let white = TileSource { frame: Some(solid_frame(8, 8, [255, 255, 255])) };
        let black = TileSource { frame: Some(solid_frame(8, 8, [0, 0, 0])) };
        let out = compose(viewport(8, 2), &[white, black], &options());
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // Left tile bright, right tile dark.
        assert!(lines[0].starts_with("@@"));
        assert!(lines[0].ends_with("  "));
    }

    #[test]
    fn frozen_inputs_compose_identically() {
        let sources = vec![
            TileSource { frame: Some(solid_frame(16, 8, [10, 200, 90])) },
            TileSource { frame: None },
            TileSource { frame: Some(solid_frame(8, 16, [250, 8, 8])) },
        ];
        let view = Viewport { cols: 60, rows: 20, color: ColorMode::TrueColor };
        let first = compose(view, &sources, &options());
        let second = compose(view, &sources, &options());
        assert_eq!(first, second);
    }

    #[test]
    fn truecolor_output_carries_escapes_and_resets() {
        let source = TileSource { frame: Some(solid_frame(8, 8, [255, 0, 0])) };
        let view = Viewport { cols: 4, rows: 2, color: ColorMode::TrueColor };
        let out = compose(view, &[source], &options());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\x1b[38;2;255;0;0m"));
        assert!(text.contains("\x1b[0m"));
    }
}
