use crate::config::DitherStrategy;
use rand::Rng;

/// Per-session dither state: the monotonically increasing step counter
/// the spiral strategies index into, and a once-per-session guard for the
/// degenerate small-amount warning (§4.5's dither formulas).
#[derive(Debug, Default)]
pub struct DitherState {
    dither_num: u64,
    warned_degenerate: bool,
}

impl DitherState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the next `(dx, dy)` dither offset for `strategy` at
    /// `amount_px`, grounded in the original source's constants preserved
    /// in the design notes. `do_dither` passes the configured amount
    /// doubled into both the random and spiral generators; the spiral
    /// generator then halves it back internally (`spiral_dither_values`),
    /// so that step radius is ported as-is rather than simplified away.
    pub fn next_offset(&mut self, strategy: DitherStrategy, amount_px: f64) -> (f64, f64) {
        match strategy {
            DitherStrategy::Random => self.random_offset(amount_px),
            DitherStrategy::Spiral => self.spiral_offset(2.0 * amount_px, false),
            DitherStrategy::RandomizedSpiral => self.spiral_offset(2.0 * amount_px, true),
        }
    }

    fn random_offset(&mut self, amount_px: f64) -> (f64, f64) {
        let amount = 2.0 * amount_px.abs();
        let mut rng = rand::thread_rng();
        let u1: f64 = rng.gen();
        let u2: f64 = rng.gen();
        self.dither_num += 1;
        (amount * (u1 - 0.5), amount * (u2 - 0.5))
    }

    /// `amount` is already the doubled configured value (see
    /// [`Self::next_offset`]); halved back here into the spiral step
    /// radius, matching `spiral_dither_values`'s `amount2 = round(amount/2)`.
    fn spiral_offset(&mut self, amount: f64, randomize: bool) -> (f64, f64) {
        let half = (amount / 2.0).round() as i64;
        if half == 0 {
            if !self.warned_degenerate {
                tracing::warn!(
                    amount,
                    "spiral dither amount below 1px produces a degenerate (0, 0) offset"
                );
                self.warned_degenerate = true;
            }
            self.dither_num += 1;
            return (0.0, 0.0);
        }

        let mut corner = (self.dither_num % 4) as usize;
        if randomize {
            corner = rand::thread_rng().gen_range(0..4);
        }
        let (sx, sy): (i64, i64) = [(-1, 1), (1, 1), (1, -1), (-1, -1)][corner];
        let ring = (self.dither_num / 4) as i64;
        let step = ring % half;

        self.dither_num += 1;
        (
            (sx * step + sx) as f64,
            (sy * step + sy) as f64,
        )
    }

    /// Projects a total dither magnitude onto the RA axis only, used when
    /// DEC guiding mode is not `Both` (§4.5). Mirrors the source's
    /// `tan`-based decomposition exactly: `θ = −π·α/180`,
    /// `dith_total = sign(x)·sign(y)·sqrt(x² + y²)`,
    /// `dith_x = dith_total / (cos θ + tan θ)`, `dith_y = dith_x·tan θ`;
    /// the degenerate `cos θ = 0` case resolves to `(0, dith_total)`.
    pub fn project_onto_ra(dither_x: f64, dither_y: f64, angle_deg: f64) -> (f64, f64) {
        let sign = dither_x.signum() * dither_y.signum();
        let total = sign * (dither_x * dither_x + dither_y * dither_y).sqrt();
        let theta = -std::f64::consts::PI * angle_deg / 180.0;
        let cos_a = theta.cos();
        if cos_a.abs() < 1e-9 {
            (0.0, total)
        } else {
            let tan_a = theta.tan();
            let x = total / (cos_a + tan_a);
            (x, x * tan_a)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spiral_degenerate_below_half_px_step() {
        // amount here is the already-doubled quantity next_offset passes in;
        // round(amount/2) == 0 only once amount < 1.0.
        let mut state = DitherState::new();
        assert_eq!(state.spiral_offset(0.5, false), (0.0, 0.0));
        assert!(state.warned_degenerate);
    }

    #[test]
    fn next_offset_at_1px_is_not_degenerate() {
        // 1px configured amount doubles to 2.0 before halving back to a
        // step radius of round(2.0 / 2) = 1, which is not degenerate.
        let mut state = DitherState::new();
        let (dx, dy) = state.next_offset(DitherStrategy::Spiral, 1.0);
        assert!(dx != 0.0 || dy != 0.0);
    }

    #[test]
    fn spiral_advances_corners() {
        let mut state = DitherState::new();
        let a = state.spiral_offset(20.0, false);
        let b = state.spiral_offset(20.0, false);
        assert_ne!(a, b);
    }

    #[test]
    fn random_offset_scales_with_amount() {
        let mut state = DitherState::new();
        let (dx, dy) = state.random_offset(5.0);
        assert!(dx.abs() <= 5.0);
        assert!(dy.abs() <= 5.0);
    }

    #[test]
    fn ra_projection_degenerate_at_90_degrees() {
        let (rx, ry) = DitherState::project_onto_ra(3.0, 4.0, 90.0);
        assert_eq!(rx, 0.0);
        assert!((ry - 5.0).abs() < 1e-6);
    }

    #[test]
    fn ra_projection_preserves_magnitude_at_generic_angle() {
        let (dx, dy) = (3.0, 4.0);
        let total = (dx * dx + dy * dy).sqrt();
        let (rx, ry) = DitherState::project_onto_ra(dx, dy, 30.0);
        // Source decomposition is along the rotated axis, not an
        // orthogonal split, so only check it reproduces the unrotated
        // case exactly (cos/tan decomposition degenerates to the
        // identity at angle 0) and stays finite elsewhere.
        assert!(rx.is_finite() && ry.is_finite());
        let (rx0, ry0) = DitherState::project_onto_ra(dx, dy, 0.0);
        assert!((rx0 - total).abs() < 1e-9);
        assert_eq!(ry0, 0.0);
    }
}
