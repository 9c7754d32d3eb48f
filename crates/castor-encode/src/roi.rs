//! # Region-of-Interest Detection
//!
//! Per captured frame, a G×G grid of importance weights in [0, 1] built
//! from three cues, each contributing a per-cell max:
//!
//! - **pointer proximity** — weight `1 − dist/radius` around the live
//!   pointer position
//! - **motion** — fraction of pixels per cell whose absolute luma difference
//!   against the previous frame exceeds a threshold
//! - **edge density** — Sobel-gradient edge ratio per cell (a stand-in for
//!   "text-likely"), scaled by 0.5 and capped at 1
//!
//! The combined grid is normalized by its maximum when positive. Higher
//! weight means more important, which maps to a *lower* QP delta.
//!
//! The detector is pure with respect to (frame, previous frame, pointer);
//! the only internal state is the previous luma plane.

use crate::encoder::RawFrame;

/// Default pointer influence radius in pixels.
pub const DEFAULT_MOUSE_RADIUS: f32 = 200.0;

/// Per-pixel absolute luma difference counted as motion.
const MOTION_THRESHOLD: u8 = 20;

/// Sobel gradient magnitude counted as an edge.
const EDGE_MAGNITUDE_THRESHOLD: i32 = 128;

/// Edge-density contribution scale.
const EDGE_SCALE: f32 = 0.5;

// ─── Grids ───────────────────────────────────────────────────────────────────

/// G×G importance weights, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiGrid {
    size: usize,
    weights: Vec<f32>,
}

impl RoiGrid {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "grid size must be positive");
        RoiGrid {
            size,
            weights: vec![0.0; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.weights[row * self.size + col]
    }

    /// Raise a cell to at least `weight`.
    fn raise(&mut self, col: usize, row: usize, weight: f32) {
        let cell = &mut self.weights[row * self.size + col];
        if weight > *cell {
            *cell = weight;
        }
    }

    pub fn max_weight(&self) -> f32 {
        self.weights.iter().copied().fold(0.0, f32::max)
    }

    /// Scale so the largest weight becomes 1. A zero grid stays zero.
    fn normalize(&mut self) {
        let max = self.max_weight();
        if max > 0.0 {
            for w in &mut self.weights {
                *w /= max;
            }
        }
    }

    /// Map weights to per-cell QP offsets: `round((1 − w) · max_delta)`.
    /// Important cells get no offset; unimportant cells get coarser
    /// quantization.
    pub fn to_qp_deltas(&self, max_delta: u8) -> QpDeltaGrid {
        QpDeltaGrid {
            size: self.size,
            deltas: self
                .weights
                .iter()
                .map(|w| ((1.0 - w) * max_delta as f32).round() as u8)
                .collect(),
        }
    }
}

/// G×G per-cell QP offsets, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpDeltaGrid {
    size: usize,
    deltas: Vec<u8>,
}

impl QpDeltaGrid {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, col: usize, row: usize) -> u8 {
        self.deltas[row * self.size + col]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.deltas
    }
}

// ─── Detector ────────────────────────────────────────────────────────────────

/// Importance detector with one frame of memory.
pub struct RoiDetector {
    grid_size: usize,
    mouse_radius: f32,
    prev: Option<RawFrame>,
}

impl RoiDetector {
    pub fn new(grid_size: usize) -> Self {
        RoiDetector {
            grid_size,
            mouse_radius: DEFAULT_MOUSE_RADIUS,
            prev: None,
        }
    }

    pub fn with_mouse_radius(mut self, radius: f32) -> Self {
        self.mouse_radius = radius;
        self
    }

    /// Compute the importance grid for one frame.
    pub fn detect(&mut self, frame: &RawFrame, pointer: Option<(u32, u32)>) -> RoiGrid {
        let mut grid = RoiGrid::new(self.grid_size);

        if let Some(pointer) = pointer {
            self.pointer_cue(&mut grid, frame, pointer);
        }
        self.motion_cue(&mut grid, frame);
        self.edge_cue(&mut grid, frame);

        self.prev = Some(frame.clone());
        grid.normalize();
        grid
    }

    fn cell_dims(&self, frame: &RawFrame) -> (f32, f32) {
        (
            frame.width as f32 / self.grid_size as f32,
            frame.height as f32 / self.grid_size as f32,
        )
    }

    fn cell_of(&self, x: u32, y: u32, frame: &RawFrame) -> (usize, usize) {
        let col = (x as usize * self.grid_size / frame.width as usize).min(self.grid_size - 1);
        let row = (y as usize * self.grid_size / frame.height as usize).min(self.grid_size - 1);
        (col, row)
    }

    fn pointer_cue(&self, grid: &mut RoiGrid, frame: &RawFrame, pointer: (u32, u32)) {
        let (cell_w, cell_h) = self.cell_dims(frame);
        let (px, py) = (pointer.0 as f32, pointer.1 as f32);

        for row in 0..self.grid_size {
            for col in 0..self.grid_size {
                let center_x = (col as f32 + 0.5) * cell_w;
                let center_y = (row as f32 + 0.5) * cell_h;
                let dist = ((center_x - px).powi(2) + (center_y - py).powi(2)).sqrt();
                let weight = 1.0 - dist / self.mouse_radius;
                if weight > 0.0 {
                    grid.raise(col, row, weight);
                }
            }
        }
    }

    fn motion_cue(&self, grid: &mut RoiGrid, frame: &RawFrame) {
        let Some(prev) = &self.prev else {
            return;
        };
        if prev.width != frame.width || prev.height != frame.height {
            // Resolution changed; the diff would be meaningless.
            return;
        }

        let mut hot = vec![0u32; self.grid_size * self.grid_size];
        let mut total = vec![0u32; self.grid_size * self.grid_size];

        for y in 0..frame.height {
            for x in 0..frame.width {
                let (col, row) = self.cell_of(x, y, frame);
                let idx = row * self.grid_size + col;
                total[idx] += 1;
                let diff = frame.luma(x, y).abs_diff(prev.luma(x, y));
                if diff > MOTION_THRESHOLD {
                    hot[idx] += 1;
                }
            }
        }

        for row in 0..self.grid_size {
            for col in 0..self.grid_size {
                let idx = row * self.grid_size + col;
                if total[idx] > 0 {
                    grid.raise(col, row, hot[idx] as f32 / total[idx] as f32);
                }
            }
        }
    }

    fn edge_cue(&self, grid: &mut RoiGrid, frame: &RawFrame) {
        if frame.width < 3 || frame.height < 3 {
            return;
        }

        let mut edges = vec![0u32; self.grid_size * self.grid_size];
        let mut total = vec![0u32; self.grid_size * self.grid_size];

        for y in 1..frame.height - 1 {
            for x in 1..frame.width - 1 {
                let (col, row) = self.cell_of(x, y, frame);
                let idx = row * self.grid_size + col;
                total[idx] += 1;
                if sobel_magnitude(frame, x, y) > EDGE_MAGNITUDE_THRESHOLD {
                    edges[idx] += 1;
                }
            }
        }

        for row in 0..self.grid_size {
            for col in 0..self.grid_size {
                let idx = row * self.grid_size + col;
                if total[idx] > 0 {
                    let ratio = edges[idx] as f32 / total[idx] as f32;
                    grid.raise(col, row, (ratio * EDGE_SCALE).min(1.0));
                }
            }
        }
    }
}

/// 3×3 Sobel gradient magnitude (|Gx| + |Gy|) at an interior pixel.
fn sobel_magnitude(frame: &RawFrame, x: u32, y: u32) -> i32 {
    let p = |dx: i32, dy: i32| -> i32 {
        frame.luma((x as i32 + dx) as u32, (y as i32 + dy) as u32) as i32
    };
    let gx = -p(-1, -1) - 2 * p(-1, 0) - p(-1, 1) + p(1, -1) + 2 * p(1, 0) + p(1, 1);
    let gy = -p(-1, -1) - 2 * p(0, -1) - p(1, -1) + p(-1, 1) + 2 * p(0, 1) + p(1, 1);
    gx.abs() + gy.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 160;
    const H: u32 = 160;
    const G: usize = 8;

    fn flat_frame(value: u8) -> RawFrame {
        RawFrame {
            width: W,
            height: H,
            data: vec![value; (W * H) as usize],
        }
    }

    #[test]
    fn flat_static_frame_has_zero_grid() {
        let mut det = RoiDetector::new(G);
        let frame = flat_frame(128);
        det.detect(&frame, None);
        let grid = det.detect(&frame, None);
        assert_eq!(grid.max_weight(), 0.0);
    }

    #[test]
    fn pointer_cell_dominates() {
        let mut det = RoiDetector::new(G).with_mouse_radius(50.0);
        let frame = flat_frame(0);
        // Pointer dead-center of cell (2, 2): cells are 20x20.
        let grid = det.detect(&frame, Some((50, 50)));

        assert!((grid.get(2, 2) - 1.0).abs() < 1e-6, "center cell is the max");
        // Cells beyond the radius stay zero.
        assert_eq!(grid.get(7, 7), 0.0);
        // A neighbor inside the radius gets a smaller positive weight.
        assert!(grid.get(3, 2) > 0.0);
        assert!(grid.get(3, 2) < grid.get(2, 2));
    }

    #[test]
    fn pointer_weight_falls_with_distance() {
        let mut det = RoiDetector::new(G).with_mouse_radius(100.0);
        let frame = flat_frame(0);
        let grid = det.detect(&frame, Some((10, 10)));
        // (0,0) center is (10,10): distance 0. (2,0) center is (50,10):
        // distance 40 → weight 0.6 before normalization (max is 1 already).
        assert!((grid.get(0, 0) - 1.0).abs() < 1e-6);
        assert!((grid.get(2, 0) - 0.6).abs() < 1e-3);
    }

    #[test]
    fn motion_lights_up_changed_cell() {
        let mut det = RoiDetector::new(G);
        det.detect(&flat_frame(0), None);

        // Paint cell (5, 5) fully different: pixels 100..120 in both axes.
        let mut moved = flat_frame(0);
        for y in 100..120 {
            for x in 100..120 {
                moved.set_luma(x, y, 255);
            }
        }
        let grid = det.detect(&moved, None);

        assert!((grid.get(5, 5) - 1.0).abs() < 1e-6, "changed cell maxes out");
        assert_eq!(grid.get(0, 0), 0.0, "static cell stays zero");
    }

    #[test]
    fn small_luma_change_below_threshold_ignored() {
        let mut det = RoiDetector::new(G);
        det.detect(&flat_frame(100), None);
        let grid = det.detect(&flat_frame(110), None);
        assert_eq!(grid.max_weight(), 0.0);
    }

    #[test]
    fn resolution_change_resets_motion() {
        let mut det = RoiDetector::new(G);
        det.detect(&flat_frame(0), None);
        let smaller = RawFrame {
            width: 80,
            height: 80,
            data: vec![255; 80 * 80],
        };
        // Would be 100% motion if diffed; must be skipped instead.
        let grid = det.detect(&smaller, None);
        assert_eq!(grid.max_weight(), 0.0);
    }

    #[test]
    fn edges_raise_text_like_cell() {
        let mut det = RoiDetector::new(G);
        // Vertical bars (2 px on, 2 px off) in cell (1, 1) look like dense
        // edges under the Sobel operator.
        let mut frame = flat_frame(0);
        for y in 20..40 {
            for x in 20..40 {
                if x % 4 < 2 {
                    frame.set_luma(x, y, 255);
                }
            }
        }
        let grid = det.detect(&frame, None);
        assert!(grid.get(1, 1) > 0.0, "striped cell has edge weight");
        assert_eq!(grid.get(6, 6), 0.0, "flat cell has none");
        // Normalization puts the max at 1.
        assert!((grid.max_weight() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn combined_grid_is_normalized() {
        let mut det = RoiDetector::new(G);
        det.detect(&flat_frame(0), None);
        let mut frame = flat_frame(0);
        for y in 0..20 {
            for x in 0..20 {
                frame.set_luma(x, y, 255);
            }
        }
        let grid = det.detect(&frame, Some((150, 150)));
        assert!((grid.max_weight() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn qp_delta_mapping() {
        let mut grid = RoiGrid::new(2);
        grid.raise(0, 0, 1.0);
        grid.raise(1, 0, 0.5);
        // (0,1) and (1,1) stay 0.
        let deltas = grid.to_qp_deltas(10);
        assert_eq!(deltas.get(0, 0), 0, "important cell gets no offset");
        assert_eq!(deltas.get(1, 0), 5);
        assert_eq!(deltas.get(0, 1), 10, "unimportant cell gets the max");
        assert_eq!(deltas.as_slice(), &[0, 5, 10, 10]);
    }
}
