//! Multi-component staggered field container on a [`Mesh`].

use crate::grid::Mesh;
use crate::Float;
use ndarray::Array2;

/// Number of spatial grid axes the engine is specialized for. The driving
/// use case (pulsar magnetosphere in log-spherical r-theta coordinates) is
/// inherently 2-D; particles and vector fields still carry 3 components
/// (the azimuthal `phi` direction is invariant under the axisymmetry but
/// not absent).
pub const DGRID: usize = 2;

/// Number of vector components carried by a particle's position/momentum
/// and by E, B, J.
pub const DPTC: usize = 3;

/// Per-axis staggering offset in the Yee lattice: a component sampled at
/// the cell corner (`0`) or the cell center (`1/2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Insitu,
    Midway,
}

impl Offset {
    pub fn shift(self) -> Float {
        match self {
            Offset::Insitu => 0.0,
            Offset::Midway => 0.5,
        }
    }
}

/// Per-axis offsets for one vector component, following the Yee convention:
/// `E_k` is MIDWAY on axis `k` and INSITU on others; `B_k` is INSITU on axis
/// `k` and MIDWAY on others; `J` follows `E`.
pub type OffsetRow = [Offset; DGRID];

pub fn yee_e_offset(component: usize) -> OffsetRow {
    let mut row = [Offset::Insitu; DGRID];
    if component < DGRID {
        row[component] = Offset::Midway;
    }
    row
}

pub fn yee_b_offset(component: usize) -> OffsetRow {
    let mut row = [Offset::Midway; DGRID];
    if component < DGRID {
        row[component] = Offset::Insitu;
    }
    row
}

/// One field component: a 2-D array of cell values (including guard cells)
/// plus its per-axis staggering offsets.
#[derive(Debug, Clone)]
pub struct Component {
    pub data: Array2<Float>,
    pub offset: OffsetRow,
    guard: usize,
}

impl Component {
    pub fn zeros(mesh: &Mesh<DGRID>, offset: OffsetRow) -> Component {
        let [nx, ny] = mesh.full_dims();
        Component {
            data: Array2::zeros((nx, ny)),
            offset,
            guard: mesh.guard(),
        }
    }

    /// Rebuilds a component from a full (guard-included) backing array, for
    /// restoring field state from a checkpoint.
    pub fn from_data(data: Array2<Float>, offset: OffsetRow, guard: usize) -> Component {
        Component { data, offset, guard }
    }

    /// Converts a bulk-relative index (may be negative, i.e. in the guard
    /// region) into the backing array's storage index.
    fn storage_index(&self, i: isize, j: isize) -> (usize, usize) {
        (
            (i + self.guard as isize) as usize,
            (j + self.guard as isize) as usize,
        )
    }

    pub fn get(&self, i: isize, j: isize) -> Float {
        let (si, sj) = self.storage_index(i, j);
        self.data[(si, sj)]
    }

    pub fn get_mut(&mut self, i: isize, j: isize) -> &mut Float {
        let (si, sj) = self.storage_index(i, j);
        &mut self.data[(si, sj)]
    }

    pub fn set(&mut self, i: isize, j: isize, value: Float) {
        *self.get_mut(i, j) = value;
    }

    /// Physical-space abscissa of cell `(i, j)` for this component,
    /// combining the mesh's per-axis spacing with this component's offset.
    pub fn abscissa(&self, mesh: &Mesh<DGRID>, i: isize, j: isize) -> [Float; DGRID] {
        let grid = mesh.grid();
        [
            grid[0].absc(i, self.offset[0].shift()),
            grid[1].absc(j, self.offset[1].shift()),
        ]
    }

    /// The `guard`-wide slab of bulk cells nearest the boundary on `axis`
    /// `side` (`-1` the lower edge, `+1` the upper edge), flattened in
    /// row-major order over the other axis. This is what a neighbor's
    /// guard cells on the facing side should hold after copy-sync.
    pub fn pack_boundary_slab(&self, mesh: &Mesh<DGRID>, axis: usize, side: i32) -> Vec<Float> {
        self.slab(mesh, axis, side, SlabKind::Bulk)
    }

    /// This rank's own guard cells on `axis` `side`, flattened the same way
    /// as [`Component::pack_boundary_slab`].
    pub fn pack_guard_slab(&self, mesh: &Mesh<DGRID>, axis: usize, side: i32) -> Vec<Float> {
        self.slab(mesh, axis, side, SlabKind::Guard)
    }

    /// Overwrites the guard slab on `axis` `side` with `data` (copy-sync).
    pub fn unpack_guard_slab(&mut self, mesh: &Mesh<DGRID>, axis: usize, side: i32, data: &[Float]) {
        self.write_slab(mesh, axis, side, SlabKind::Guard, data, false);
    }

    /// Adds `data` into the bulk boundary slab on `axis` `side` (merge-sync).
    pub fn add_into_boundary_slab(&mut self, mesh: &Mesh<DGRID>, axis: usize, side: i32, data: &[Float]) {
        self.write_slab(mesh, axis, side, SlabKind::Bulk, data, true);
    }

    /// First index, along `axis`, of the `guard`-wide slab denoted by
    /// `(side, kind)`.
    fn slab_origin(&self, mesh: &Mesh<DGRID>, axis: usize, side: i32, kind: SlabKind) -> isize {
        let guard = mesh.guard() as isize;
        let dim = mesh.grid()[axis].dim() as isize;
        match (kind, side) {
            (SlabKind::Bulk, -1) => 0,
            (SlabKind::Bulk, 1) => dim - guard,
            (SlabKind::Guard, -1) => -guard,
            (SlabKind::Guard, 1) => dim,
            _ => unreachable!("side must be -1 or 1"),
        }
    }

    fn slab(&self, mesh: &Mesh<DGRID>, axis: usize, side: i32, kind: SlabKind) -> Vec<Float> {
        let guard = mesh.guard();
        let other = 1 - axis;
        let other_dim = mesh.grid()[other].dim() as isize;
        let origin = self.slab_origin(mesh, axis, side, kind);
        let mut out = Vec::with_capacity(guard * other_dim as usize);
        for d in 0..guard as isize {
            for o in 0..other_dim {
                let (i, j) = if axis == 0 {
                    (origin + d, o)
                } else {
                    (o, origin + d)
                };
                out.push(self.get(i, j));
            }
        }
        out
    }

    fn write_slab(
        &mut self,
        mesh: &Mesh<DGRID>,
        axis: usize,
        side: i32,
        kind: SlabKind,
        data: &[Float],
        accumulate: bool,
    ) {
        let guard = mesh.guard();
        let other = 1 - axis;
        let other_dim = mesh.grid()[other].dim() as isize;
        let origin = self.slab_origin(mesh, axis, side, kind);
        let mut idx = 0;
        for d in 0..guard as isize {
            for o in 0..other_dim {
                let (i, j) = if axis == 0 {
                    (origin + d, o)
                } else {
                    (o, origin + d)
                };
                if accumulate {
                    *self.get_mut(i, j) += data[idx];
                } else {
                    self.set(i, j, data[idx]);
                }
                idx += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabKind {
    Bulk,
    Guard,
}

/// A named bundle of `N` staggered vector-field components over one mesh.
#[derive(Debug, Clone)]
pub struct Field<const N: usize> {
    pub components: [Component; N],
}

impl<const N: usize> Field<N> {
    pub fn new(components: [Component; N]) -> Field<N> {
        Field { components }
    }
}

pub type EField = Field<DPTC>;
pub type BField = Field<DPTC>;
pub type JField = Field<DPTC>;

pub fn new_e_field(mesh: &Mesh<DGRID>) -> EField {
    Field::new([
        Component::zeros(mesh, yee_e_offset(0)),
        Component::zeros(mesh, yee_e_offset(1)),
        Component::zeros(mesh, yee_e_offset(2)),
    ])
}

pub fn new_b_field(mesh: &Mesh<DGRID>) -> BField {
    Field::new([
        Component::zeros(mesh, yee_b_offset(0)),
        Component::zeros(mesh, yee_b_offset(1)),
        Component::zeros(mesh, yee_b_offset(2)),
    ])
}

/// J follows E's offsets.
pub fn new_j_field(mesh: &Mesh<DGRID>) -> JField {
    new_e_field(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid1D;

    fn mesh() -> Mesh<DGRID> {
        Mesh::new([Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)], 2)
    }

    #[test]
    fn yee_offsets_match_convention() {
        assert_eq!(yee_e_offset(0), [Offset::Midway, Offset::Insitu]);
        assert_eq!(yee_e_offset(1), [Offset::Insitu, Offset::Midway]);
        assert_eq!(yee_b_offset(0), [Offset::Insitu, Offset::Midway]);
        assert_eq!(yee_b_offset(1), [Offset::Midway, Offset::Insitu]);
    }

    #[test]
    fn component_guard_indexing_roundtrips() {
        let m = mesh();
        let mut c = Component::zeros(&m, yee_e_offset(0));
        c.set(-2, -2, 42.0);
        c.set(3, 3, 7.0);
        assert_eq!(c.get(-2, -2), 42.0);
        assert_eq!(c.get(3, 3), 7.0);
    }

    #[test]
    fn e_and_j_share_offsets() {
        let m = mesh();
        let e = new_e_field(&m);
        let j = new_j_field(&m);
        for k in 0..DPTC {
            assert_eq!(e.components[k].offset, j.components[k].offset);
        }
    }

    #[test]
    fn boundary_slab_pack_unpack_roundtrips_through_a_neighbor() {
        let m = mesh();
        let mut left = Component::zeros(&m, yee_e_offset(0));
        let mut right = Component::zeros(&m, yee_e_offset(0));
        for j in 0..4 {
            left.set(3, j, 5.0 + j as Float);
        }
        let slab = left.pack_boundary_slab(&m, 0, 1);
        right.unpack_guard_slab(&m, 0, -1, &slab);
        for j in 0..4isize {
            assert_eq!(right.get(-1, j), left.get(3, j));
        }
    }

    #[test]
    fn merge_sync_accumulates_guard_contribution_into_bulk() {
        let m = mesh();
        let mut left = Component::zeros(&m, yee_e_offset(0));
        left.set(3, 0, 1.0);
        left.set(-1, 0, 0.25);
        let spillover = left.pack_guard_slab(&m, 0, -1);
        left.add_into_boundary_slab(&m, 0, -1, &spillover);
        assert_eq!(left.get(0, 0), spillover[0]);
    }
}
