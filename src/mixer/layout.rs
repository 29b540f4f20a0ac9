//! Grid layout for per-recipient composition.
//!
//! The viewport is partitioned into a rectangular grid of tiles, one per
//! visible source, maximizing per-tile area. Tiles are assigned to
//! sources in a stable order decided by the caller.

/// Chosen grid shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpec {
    pub rows: u16,
    pub cols: u16,
}

/// One tile's cell rectangle within the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Pick `(rows, cols)` with `rows * cols >= sources`, minimizing wasted
/// cells, preferring tile shapes close to the viewport ratio (corrected
/// for the font cell aspect), breaking ties toward more columns.
pub fn grid_shape(sources: usize, term_w: u16, term_h: u16, cell_aspect: f32) -> GridSpec {
    if sources <= 1 {
        return GridSpec { rows: 1, cols: 1 };
    }
    let sources = sources.min(u16::MAX as usize) as u32;
    // Viewport ratio in square-pixel terms: glyph cells are roughly
    // cell_aspect times taller than wide.
    let target = term_w as f32 / (term_h as f32 * cell_aspect).max(1.0);

    let mut best: Option<(GridSpec, u32, f32)> = None;
    for rows in 1..=sources {
        let cols = sources.div_ceil(rows);
        let waste = rows * cols - sources;
        let shape_ratio = cols as f32 / rows as f32;
        let distance = (shape_ratio - target).abs();
        let candidate = (GridSpec { rows: rows as u16, cols: cols as u16 }, waste, distance);

        let better = match &best {
            None => true,
            Some((chosen, best_waste, best_distance)) => {
                if waste != *best_waste {
                    waste < *best_waste
                } else if (distance - *best_distance).abs() > 1e-3 {
                    distance < *best_distance
                } else {
                    candidate.0.cols > chosen.cols
                }
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best.map(|(spec, _, _)| spec).unwrap_or(GridSpec { rows: 1, cols: 1 })
}

/// Carve the viewport into `count` tile rectangles in row-major order.
/// Division remainders go to the leftmost columns and topmost rows.
pub fn tile_rects(spec: GridSpec, term_w: u16, term_h: u16, count: usize) -> Vec<TileRect> {
    let cols = spec.cols.max(1);
    let rows = spec.rows.max(1);

    let base_w = term_w / cols;
    let extra_w = term_w % cols;
    let base_h = term_h / rows;
    let extra_h = term_h % rows;

    let mut rects = Vec::with_capacity(count);
    let mut y = 0u16;
    'outer: for row in 0..rows {
        let height = base_h + u16::from(row < extra_h);
        let mut x = 0u16;
        for col in 0..cols {
            let width = base_w + u16::from(col < extra_w);
            if rects.len() == count {
                break 'outer;
            }
            rects.push(TileRect { x, y, width, height });
            x += width;
        }
        y += height;
    }
    rects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_fills_viewport() {
        let spec = grid_shape(1, 80, 24, 2.0);
        assert_eq!(spec, GridSpec { rows: 1, cols: 1 });
        let rects = tile_rects(spec, 80, 24, 1);
        assert_eq!(rects, vec![TileRect { x: 0, y: 0, width: 80, height: 24 }]);
    }

    #[test]
    fn two_sources_split_side_by_side() {
        // 80x24 at cell aspect 2 is wider than tall, so prefer columns.
        let spec = grid_shape(2, 80, 24, 2.0);
        assert_eq!(spec, GridSpec { rows: 1, cols: 2 });
    }

    #[test]
    fn four_sources_make_a_square() {
        let spec = grid_shape(4, 80, 48, 2.0);
        assert_eq!(spec.rows * spec.cols, 4);
        assert_eq!(spec, GridSpec { rows: 2, cols: 2 });
    }

    #[test]
    fn no_wasted_rows_for_three() {
        let spec = grid_shape(3, 80, 24, 2.0);
        assert_eq!((spec.rows, spec.cols), (1, 3));
    }

    #[test]
    fn waste_minimized_before_ratio() {
        // 5 sources: 1x5 and 5x1 waste nothing; 2x3 wastes one cell.
        let spec = grid_shape(5, 100, 20, 2.0);
        assert_eq!(spec.rows as u32 * spec.cols as u32, 5);
    }

    #[test]
    fn rects_tile_the_viewport_exactly() {
        for &(n, w, h) in &[(1u16, 80u16, 24u16), (3, 81, 25), (4, 79, 23), (6, 100, 31)] {
            let spec = grid_shape(n as usize, w, h, 2.0);
            let rects = tile_rects(spec, w, h, spec.rows as usize * spec.cols as usize);
            // Cells covered equal the viewport area, no overlap by construction.
            let area: u32 = rects.iter().map(|r| r.width as u32 * r.height as u32).sum();
            assert_eq!(area, w as u32 * h as u32, "n={} w={} h={}", n, w, h);
        }
    }

    #[test]
    fn remainder_goes_to_leftmost_and_topmost() {
        let rects = tile_rects(GridSpec { rows: 2, cols: 3 }, 10, 5, 6);
        assert_eq!(rects[0].width, 4); // 10 = 4+3+3
        assert_eq!(rects[1].width, 3);
        assert_eq!(rects[2].width, 3);
        assert_eq!(rects[0].height, 3); // 5 = 3+2
        assert_eq!(rects[3].height, 2);
    }

    #[test]
    fn shape_is_deterministic() {
        for n in 1..=12usize {
            assert_eq!(grid_shape(n, 120, 40, 2.0), grid_shape(n, 120, 40, 2.0));
        }
    }
}
