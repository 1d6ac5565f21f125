//! Octant-symmetric integer ray stepper.
//!
//! The ray from a cell toward the upwind side is the same for every origin
//! cell, so it is computed once per directive as a list of relative offsets.
//! Offsets are generated in the first octant (major axis x, 0 ≤ slope ≤ 1)
//! and mirrored into the target octant, which makes a ray and its 90°, 180°
//! and mirrored counterparts visit congruent cell sequences.

/// Fixed-point scale used to turn the bearing into integer deltas.
const DIRECTION_SCALE: f64 = (1u64 << 24) as f64;

/// One visited cell, relative to the ray origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayStep {
    /// Row offset (positive = south).
    pub dr: isize,
    /// Column offset (positive = east).
    pub dc: isize,
    /// Planar distance from the origin cell centre, metres.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RayPath {
    steps: Vec<RayStep>,
}

impl RayPath {
    /// Ray pointing toward `bearing_deg` (degrees clockwise from north) for
    /// `max_major` steps along its major axis.
    ///
    /// Step `i` advances the major axis by `i` cells and the minor axis by
    /// `round_half_up(i * minor / major)`; the arithmetic is exact integer math.
    pub fn toward_bearing(bearing_deg: f64, cell_size: f64, max_major: usize) -> Self {
        let theta = bearing_deg.to_radians();
        let east = (theta.sin() * DIRECTION_SCALE).round() as i64;
        let south = (-theta.cos() * DIRECTION_SCALE).round() as i64;

        let (ax, ay) = (east.abs(), south.abs());
        let swap = ay > ax;
        let (major, minor) = if swap { (ay, ax) } else { (ax, ay) };
        let sign_c: isize = if east < 0 { -1 } else { 1 };
        let sign_r: isize = if south < 0 { -1 } else { 1 };

        let mut steps = Vec::with_capacity(max_major);
        if major == 0 {
            return Self { steps };
        }
        for i in 1..=max_major as i64 {
            let j = (2 * i * minor + major) / (2 * major);
            let (cx, cy) = if swap { (j, i) } else { (i, j) };
            let dc = sign_c * cx as isize;
            let dr = sign_r * cy as isize;
            let distance = cell_size * ((cx * cx + cy * cy) as f64).sqrt();
            steps.push(RayStep { dr, dc, distance });
        }
        Self { steps }
    }

    /// Ray long enough to leave a `rows`×`cols` grid from any origin.
    pub fn for_grid(bearing_deg: f64, cell_size: f64, rows: usize, cols: usize) -> Self {
        Self::toward_bearing(bearing_deg, cell_size, rows.max(cols))
    }

    /// Drops the steps at which no obstacle can reach the sightline:
    /// a step is kept only while `distance * tan_altitude <= max_rise`.
    pub fn truncate_to_reach(&mut self, tan_altitude: f64, max_rise: f64) {
        if max_rise.is_nan() || max_rise < 0.0 {
            self.steps.clear();
            return;
        }
        let keep = self
            .steps
            .iter()
            .take_while(|s| s.distance * tan_altitude <= max_rise)
            .count();
        self.steps.truncate(keep);
    }

    pub fn steps(&self) -> &[RayStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
