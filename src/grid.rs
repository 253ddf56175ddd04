//! 1-D axes, D-dimensional grids, and the guarded mesh built from them.

use crate::Float;

/// A single logarithmic/linear axis: `lower`, `upper`, and a cell count.
/// `delta = (upper - lower) / dim` is cached since every abscissa lookup
/// needs it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid1D {
    lower: Float,
    upper: Float,
    dim: usize,
    delta: Float,
}

impl Grid1D {
    /// Builds a new axis. Panics if `dim == 0` or `upper <= lower`, since
    /// both violate the grid invariant and can only come from a
    /// configuration bug.
    pub fn new(lower: Float, upper: Float, dim: usize) -> Grid1D {
        assert!(dim >= 1, "grid dimension must be >= 1, got {}", dim);
        assert!(
            upper > lower,
            "grid upper bound {} must exceed lower bound {}",
            upper,
            lower
        );
        let delta = (upper - lower) / dim as Float;
        Grid1D {
            lower,
            upper,
            dim,
            delta,
        }
    }

    pub fn lower(&self) -> Float {
        self.lower
    }

    pub fn upper(&self) -> Float {
        self.upper
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn delta(&self) -> Float {
        self.delta
    }

    /// Abscissa of cell `i` with fractional shift `s` (0 for INSITU, 0.5
    /// for MIDWAY offsets).
    pub fn absc(&self, i: isize, shift: Float) -> Float {
        self.lower + self.delta * (i as Float + shift)
    }

    /// Splits this axis into `num_pieces` equal pieces and returns the
    /// `ith_piece`'th one, clipped to its sub-range. Used by the cartesian
    /// topology to carve per-ensemble sub-grids out of the supergrid.
    pub fn divide(&self, num_pieces: usize, ith_piece: usize) -> Grid1D {
        assert!(
            self.dim % num_pieces == 0,
            "grid dimension {} not divisible into {} pieces",
            self.dim,
            num_pieces
        );
        let piece_dim = self.dim / num_pieces;
        let lower = self.absc((ith_piece * piece_dim) as isize, 0.0);
        let upper = self.absc(((ith_piece + 1) * piece_dim) as isize, 0.0);
        Grid1D::new(lower, upper, piece_dim)
    }
}

/// An ordered sequence of `Grid1D`, one per spatial axis.
pub type Grid<const D: usize> = [Grid1D; D];

/// Per-axis cell counts of a `Grid`.
pub fn dims<const D: usize>(grid: &Grid<D>) -> [usize; D] {
    let mut out = [0usize; D];
    for i in 0..D {
        out[i] = grid[i].dim();
    }
    out
}

/// A `Grid` plus a uniform guard width `g` per side per axis. Index 0 along
/// any axis denotes the first bulk cell; indices in `[-g, 0)` or
/// `[dim, dim+g)` are guard cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mesh<const D: usize> {
    grid: Grid<D>,
    guard: usize,
}

impl<const D: usize> Mesh<D> {
    pub fn new(grid: Grid<D>, guard: usize) -> Mesh<D> {
        Mesh { grid, guard }
    }

    pub fn grid(&self) -> &Grid<D> {
        &self.grid
    }

    pub fn guard(&self) -> usize {
        self.guard
    }

    pub fn bulk_dims(&self) -> [usize; D] {
        dims(&self.grid)
    }

    /// Full per-axis extent including guard cells on both sides.
    pub fn full_dims(&self) -> [usize; D] {
        let mut out = self.bulk_dims();
        for x in out.iter_mut() {
            *x += 2 * self.guard;
        }
        out
    }

    /// `true` if the axis-`k` index lies strictly inside `[0, dim)`.
    pub fn is_bulk(&self, axis: usize, index: isize) -> bool {
        index >= 0 && (index as usize) < self.grid[axis].dim()
    }

    /// `true` if the D-dimensional index lies in the guard region on at
    /// least one axis, i.e. is not a bulk cell.
    pub fn is_guard(&self, index: [isize; D]) -> bool {
        (0..D).any(|k| !self.is_bulk(k, index[k]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absc_matches_linear_spacing() {
        let g = Grid1D::new(0.0, 1.0, 8);
        assert_eq!(g.delta(), 0.125);
        assert!((g.absc(0, 0.5) - 0.0625).abs() < 1e-12);
        assert!((g.absc(7, 0.5) - 0.9375).abs() < 1e-12);
    }

    #[test]
    #[should_panic]
    fn zero_dim_panics() {
        Grid1D::new(0.0, 1.0, 0);
    }

    #[test]
    fn divide_produces_contiguous_pieces() {
        let g = Grid1D::new(0.0, 8.0, 8);
        let left = g.divide(2, 0);
        let right = g.divide(2, 1);
        assert_eq!(left.dim(), 4);
        assert_eq!(right.dim(), 4);
        assert!((left.upper() - right.lower()).abs() < 1e-12);
    }

    #[test]
    fn mesh_bulk_guard_classification() {
        let grid: Grid<2> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)];
        let mesh = Mesh::new(grid, 2);
        assert!(mesh.is_bulk(0, 0));
        assert!(mesh.is_bulk(0, 3));
        assert!(!mesh.is_bulk(0, -1));
        assert!(!mesh.is_bulk(0, 4));
        assert!(!mesh.is_guard([0, 0]));
        assert!(mesh.is_guard([-1, 0]));
    }
}
