//! Compact-support interpolation/deposition kernels.

use crate::Float;
use std::ops::Range;

/// A shape function with integer support `s in {1,2,3,4}`, giving a weight
/// `w(|dx|)` on the reference cell with `integral(w) = 1` and `w(|dx|) = 0`
/// for `|dx| >= s/2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeFunction {
    /// Nearest grid point, support 1.
    Ngp,
    /// Cloud in cell, support 2.
    Cic,
    /// Triangular (quadratic) cloud, support 3.
    Tsc,
    /// Piecewise cubic spline, support 4.
    Pcs,
}

impl ShapeFunction {
    pub fn support(self) -> i32 {
        match self {
            ShapeFunction::Ngp => 1,
            ShapeFunction::Cic => 2,
            ShapeFunction::Tsc => 3,
            ShapeFunction::Pcs => 4,
        }
    }

    /// Shape radius `r = s/2`.
    pub fn radius(self) -> Float {
        self.support() as Float / 2.0
    }

    /// Weight at a signed distance `dx` (in cell-width units) from the
    /// reference point.
    pub fn weight(self, dx: Float) -> Float {
        let dx = dx.abs();
        match self {
            ShapeFunction::Ngp => {
                if dx <= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
            ShapeFunction::Cic => (1.0 - dx).max(0.0),
            ShapeFunction::Tsc => {
                if dx < 0.5 {
                    0.75 - dx * dx
                } else if dx < 1.5 {
                    0.5 * (1.5 - dx) * (1.5 - dx)
                } else {
                    0.0
                }
            }
            ShapeFunction::Pcs => {
                if dx < 1.0 {
                    2.0 / 3.0 - dx * dx * (1.0 - 0.5 * dx)
                } else if dx < 2.0 {
                    (2.0 - dx).powi(3) / 6.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Contributing-cell range `[floor(q - r) + 1, floor(q + r) + 1)` for a
    /// particle at normalized position `q` relative to cell centers.
    pub fn contributing_range(self, q: Float) -> Range<isize> {
        let r = self.radius();
        let lo = (q - r).floor() as isize + 1;
        let hi = (q + r).floor() as isize + 1;
        lo..hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrate(sf: ShapeFunction, step: Float) -> Float {
        let r = sf.radius();
        let mut x = -r;
        let mut sum = 0.0;
        while x < r {
            sum += sf.weight(x) * step;
            x += step;
        }
        sum
    }

    #[test]
    fn weights_integrate_to_one() {
        for sf in [
            ShapeFunction::Ngp,
            ShapeFunction::Cic,
            ShapeFunction::Tsc,
            ShapeFunction::Pcs,
        ] {
            let integral = integrate(sf, 1e-4);
            assert!(
                (integral - 1.0).abs() < 1e-3,
                "{:?} integrates to {}",
                sf,
                integral
            );
        }
    }

    #[test]
    fn weight_vanishes_outside_support() {
        for sf in [ShapeFunction::Cic, ShapeFunction::Tsc, ShapeFunction::Pcs] {
            assert_eq!(sf.weight(sf.radius()), 0.0);
            assert_eq!(sf.weight(sf.radius() + 0.5), 0.0);
        }
    }

    #[test]
    fn cic_is_linear_tent() {
        let sf = ShapeFunction::Cic;
        assert_eq!(sf.weight(0.0), 1.0);
        assert_eq!(sf.weight(0.5), 0.5);
        assert_eq!(sf.weight(1.0), 0.0);
    }

    #[test]
    fn contributing_range_matches_spec_formula() {
        let sf = ShapeFunction::Cic;
        let range = sf.contributing_range(1.5);
        assert_eq!(range, 1..3);
    }
}
