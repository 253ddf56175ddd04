//! Export and checkpoint interfaces. Persisting data to disk is
//! explicitly out of scope — the core only ever talks to a
//! [`CheckpointSink`]/[`ExportSink`], the same boundary-through-a-trait
//! treatment [`crate::transport::Transport`] gives message passing. Both
//! sinks receive a self-describing multi-dimensional array container; this
//! crate names the fields that container holds without committing to a
//! concrete file format.

use crate::field::{BField, Component, EField, Field, JField};
use crate::particle::{ParticleArray, Species};
use crate::rtd::Rtd;
use crate::Float;
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::HashMap;

/// Global, run-wide metadata written alongside every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub timestep: u64,
    pub ensemble_dims: Vec<usize>,
    pub rng_seeds: Vec<[u64; 2]>,
}

/// One ensemble's contribution to a checkpoint: its field state and every
/// species' particle array, labeled by the ensemble that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleCheckpoint {
    pub label: u32,
    pub e: FieldSnapshot,
    pub b: FieldSnapshot,
    pub particles: HashMap<Species, ParticleArray>,
}

/// A bare-array snapshot of one vector field's three components, stripped
/// of the [`crate::field::Component`] wrapper so it serializes plainly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub components: [Array2<Float>; 3],
}

impl FieldSnapshot {
    pub fn of(field: &EField) -> FieldSnapshot {
        FieldSnapshot {
            components: [
                field.components[0].data.clone(),
                field.components[1].data.clone(),
                field.components[2].data.clone(),
            ],
        }
    }

    /// Rebuilds an `EField` from a checkpointed snapshot, restoring the
    /// Yee `E`-offset convention per component.
    pub fn into_e_field(self, mesh: &crate::grid::Mesh<{ crate::field::DGRID }>) -> EField {
        let [c0, c1, c2] = self.components;
        Field::new([
            Component::from_data(c0, crate::field::yee_e_offset(0), mesh.guard()),
            Component::from_data(c1, crate::field::yee_e_offset(1), mesh.guard()),
            Component::from_data(c2, crate::field::yee_e_offset(2), mesh.guard()),
        ])
    }

    /// Rebuilds a `BField` from a checkpointed snapshot, restoring the Yee
    /// `B`-offset convention per component.
    pub fn into_b_field(self, mesh: &crate::grid::Mesh<{ crate::field::DGRID }>) -> BField {
        let [c0, c1, c2] = self.components;
        Field::new([
            Component::from_data(c0, crate::field::yee_b_offset(0), mesh.guard()),
            Component::from_data(c1, crate::field::yee_b_offset(1), mesh.guard()),
            Component::from_data(c2, crate::field::yee_b_offset(2), mesh.guard()),
        ])
    }
}

/// External collaborator that durably stores a checkpoint. A real
/// implementation writes one directory per checkpoint with one file per
/// "part" and enforces `max_num_ckpts` retention and
/// the optional hourly autosave; none of that policy is this crate's
/// concern, only the data it must be handed.
pub trait CheckpointSink {
    fn write_checkpoint(&mut self, meta: &CheckpointMeta, parts: &[EnsembleCheckpoint]) -> std::io::Result<()>;
}

/// The fixed set of exportable quantities. `J4X` is J
/// divided by the cell's metric volume factor `hh`; `Flux` is the
/// exclusive-scan of `B_r * exp(2 ln r) * sin(theta)` along theta followed
/// by an inclusive cross-rank scan; `VolumeScale` is `hhh` at cell center.
#[derive(Debug, Clone)]
pub struct ExportSnapshot {
    pub timestep: u64,
    pub downsample_ratio: usize,
    pub e: FieldSnapshot,
    pub b: FieldSnapshot,
    pub j4x: FieldSnapshot,
    pub e_para_b: Array2<Float>,
    pub e_dot_j: Array2<Float>,
    pub flux: Array2<Float>,
    pub pair_creation_rate: Vec<Float>,
    pub volume_scale: Array2<Float>,
    pub skin_depth: Float,
    /// Fractional current contributed by each species.
    pub j_by_species: HashMap<Species, Float>,
}

/// External collaborator that durably stores one export step: one
/// directory per export step, the concrete layout left to the sink.
pub trait ExportSink {
    fn write_export(&mut self, snapshot: &ExportSnapshot) -> std::io::Result<()>;
}

/// Downsamples a field by averaging `ratio x ratio` blocks: the exported
/// grid has `dim / downsample_ratio` cells per axis.
pub fn coarsen(field: &Array2<Float>, ratio: usize) -> Array2<Float> {
    assert!(ratio >= 1, "downsample ratio must be >= 1");
    let (nx, ny) = field.dim();
    let out_x = nx / ratio;
    let out_y = ny / ratio;
    // One output row's block-average is independent of every other row's,
    // so rows are computed in parallel and assembled back into the output
    // array sequentially.
    let rows: Vec<Vec<Float>> = (0..out_x)
        .into_par_iter()
        .map(|i| {
            (0..out_y)
                .map(|j| {
                    let mut sum = 0.0;
                    for di in 0..ratio {
                        for dj in 0..ratio {
                            sum += field[(i * ratio + di, j * ratio + dj)];
                        }
                    }
                    sum / (ratio * ratio) as Float
                })
                .collect()
        })
        .collect();
    Array2::from_shape_fn((out_x, out_y), |(i, j)| rows[i][j])
}

/// Extracts just the bulk cells of one component, stripping the guard
/// margin `[-g, 0)`/`[dim, dim+g)` out of its backing array. Export
/// quantities are always reported over the bulk grid; checkpoints keep the
/// full guarded array via [`FieldSnapshot::of`] since a restart needs it.
pub fn bulk_of(comp: &Component, grid: &crate::grid::Grid<{ crate::field::DGRID }>) -> Array2<Float> {
    let nx = grid[0].dim();
    let ny = grid[1].dim();
    Array2::from_shape_fn((nx, ny), |(i, j)| comp.get(i as isize, j as isize))
}

/// Computes `J4X = J / hh` component-wise, `hh` being the product of the
/// two in-plane metric scale factors sampled at each component's own
/// abscissa, over the bulk grid.
pub fn j4x(j: &JField, grid: &crate::grid::Grid<{ crate::field::DGRID }>, metric: &dyn crate::metric::Metric) -> FieldSnapshot {
    let mesh = crate::grid::Mesh::new(*grid, 0);
    let nx = grid[0].dim();
    let ny = grid[1].dim();
    let mut out = [
        bulk_of(&j.components[0], grid),
        bulk_of(&j.components[1], grid),
        bulk_of(&j.components[2], grid),
    ];
    for (c, arr) in out.iter_mut().enumerate() {
        for i in 0..nx as isize {
            for jj in 0..ny as isize {
                let q = j.components[c].abscissa(&mesh, i, jj);
                let hh = metric.h(q, 0) * metric.h(q, 1);
                let idx = (i as usize, jj as usize);
                arr[idx] /= hh.max(Float::EPSILON);
            }
        }
    }
    FieldSnapshot { components: out }
}

/// `E . B / |B|`, the field-aligned component of E used both as an export
/// quantity and, upstream, as a diagnostic of how force-free the
/// magnetosphere solution is, over the bulk grid.
pub fn e_para_b(e: &EField, b: &BField, grid: &crate::grid::Grid<{ crate::field::DGRID }>) -> Array2<Float> {
    let nx = grid[0].dim();
    let ny = grid[1].dim();
    Array2::from_shape_fn((nx, ny), |(i, j)| {
        let (ii, jj) = (i as isize, j as isize);
        let ev = crate::vector::Vec3::new(
            e.components[0].get(ii, jj),
            e.components[1].get(ii, jj),
            e.components[2].get(ii, jj),
        );
        let bv = crate::vector::Vec3::new(
            b.components[0].get(ii, jj),
            b.components[1].get(ii, jj),
            b.components[2].get(ii, jj),
        );
        let bn = bv.norm();
        if bn > 0.0 {
            ev.dot(bv) / bn
        } else {
            0.0
        }
    })
}

/// `E . J`, the local rate of work done on the current by the field, over
/// the bulk grid.
pub fn e_dot_j(e: &EField, j: &JField, grid: &crate::grid::Grid<{ crate::field::DGRID }>) -> Array2<Float> {
    let nx = grid[0].dim();
    let ny = grid[1].dim();
    Array2::from_shape_fn((nx, ny), |(i, jidx)| {
        let (ii, jj) = (i as isize, jidx as isize);
        let ev = crate::vector::Vec3::new(
            e.components[0].get(ii, jj),
            e.components[1].get(ii, jj),
            e.components[2].get(ii, jj),
        );
        let jv = crate::vector::Vec3::new(
            j.components[0].get(ii, jj),
            j.components[1].get(ii, jj),
            j.components[2].get(ii, jj),
        );
        ev.dot(jv)
    })
}

/// Rank-local exclusive scan of `B_r * exp(2 ln r) * sin(theta)` along
/// theta, one running sum per radial row. The simulator
/// loop adds [`crate::ensemble::Ensemble::scan_along_axis`]'s cross-rank
/// prefix to every entry of this array to get the global `Flux` quantity.
pub fn flux_local(b: &BField, grid: &crate::grid::Grid<{ crate::field::DGRID }>) -> Array2<Float> {
    let mesh = crate::grid::Mesh::new(*grid, 0);
    let nx = grid[0].dim();
    let ny = grid[1].dim();
    let mut out = Array2::zeros((nx, ny));
    for i in 0..nx {
        let mut running = 0.0;
        for jj in 0..ny {
            out[(i, jj)] = running;
            let q = b.components[0].abscissa(&mesh, i as isize, jj as isize);
            let r = q[0].exp();
            let br = b.components[0].get(i as isize, jj as isize);
            running += br * r * r * q[1].sin();
        }
    }
    out
}

/// Each radial row's total accumulated flux over this rank's theta slice,
/// the per-row contribution [`crate::ensemble::Ensemble::scan_along_axis`]
/// forwards to the next rank along theta.
pub fn flux_local_total(b: &BField, grid: &crate::grid::Grid<{ crate::field::DGRID }>) -> Vec<Float> {
    let mesh = crate::grid::Mesh::new(*grid, 0);
    let nx = grid[0].dim();
    let ny = grid[1].dim();
    (0..nx)
        .map(|i| {
            let mut total = 0.0;
            for jj in 0..ny {
                let q = b.components[0].abscissa(&mesh, i as isize, jj as isize);
                let r = q[0].exp();
                let br = b.components[0].get(i as isize, jj as isize);
                total += br * r * r * q[1].sin();
            }
            total
        })
        .collect()
}

/// Builds the diagnostic export fields the export pre-hook computes from
/// the live field state just before a snapshot is taken: this is the
/// action that writes [`Rtd::skin_depth`].
pub fn export_pre_hook(rtd: &mut Rtd, b: &BField) {
    let (nx, ny) = b.components[0].data.dim();
    let mut sum_b2 = 0.0;
    let mut n = 0usize;
    for i in 0..nx as isize {
        for j in 0..ny as isize {
            let bv = crate::vector::Vec3::new(b.components[0].get(i, j), b.components[1].get(i, j), b.components[2].get(i, j));
            sum_b2 += bv.dot(bv);
            n += 1;
        }
    }
    let mean_b2 = if n > 0 { sum_b2 / n as Float } else { 0.0 };
    rtd.skin_depth = 1.0 / mean_b2.sqrt().max(Float::EPSILON);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn coarsen_averages_each_block() {
        let field = Array2::from_shape_vec((4, 4), (0..16).map(|v| v as Float).collect()).unwrap();
        let coarse = coarsen(&field, 2);
        assert_eq!(coarse.dim(), (2, 2));
        // top-left 2x2 block is 0,1,4,5 -> average 2.5
        assert_relative_eq!(coarse[(0, 0)], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn export_pre_hook_writes_skin_depth_only() {
        let grid: crate::grid::Grid<2> = [crate::grid::Grid1D::new(0.0, 1.0, 4), crate::grid::Grid1D::new(0.0, 1.0, 4)];
        let mesh = crate::grid::Mesh::new(grid, 1);
        let mut b = crate::field::new_b_field(&mesh);
        b.components[2].set(0, 0, 2.0);
        let mut rtd = Rtd::new([Species::Electron]);
        rtd.num_scattered = 5;
        export_pre_hook(&mut rtd, &b);
        assert!(rtd.skin_depth > 0.0);
        assert_eq!(rtd.num_scattered, 5);
    }
}
