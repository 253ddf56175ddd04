//! Named, ranged, clonable operators applied in lockstep order over fields
//! and particles.

use crate::ensemble::Ensemble;
use crate::field::{BField, EField, JField};
use crate::grid::Grid;
use crate::particle::{ParticleArray, Properties, Species};
use crate::rtd::Rtd;
use crate::Float;
use rand_pcg::Pcg64;
use std::collections::HashMap;
use std::ops::Range;

/// Per-axis `[begin, end)` plus an optional per-side guard margin, shared by
/// field and particle actions. A margin of `0` means the action only ever
/// touches bulk cells; a positive margin lets it reach into the guard, e.g.
/// a boundary condition that must see one extra cell to compute a one-sided
/// derivative.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRange<const D: usize> {
    pub range: [Range<isize>; D],
    pub guard: [usize; D],
}

impl<const D: usize> ActionRange<D> {
    pub fn new(range: [Range<isize>; D], guard: [usize; D]) -> ActionRange<D> {
        ActionRange { range, guard }
    }

    /// The whole bulk extent of `grid`, no guard margin.
    pub fn bulk(grid: &Grid<D>) -> ActionRange<D> {
        let mut range: [Range<isize>; D] = std::array::from_fn(|_| 0..0);
        for k in 0..D {
            range[k] = 0..(grid[k].dim() as isize);
        }
        ActionRange::new(range, [0; D])
    }

    pub fn with_guard(mut self, guard: [usize; D]) -> ActionRange<D> {
        self.guard = guard;
        self
    }
}

/// An operator over the field state, applied once per timestep in pipeline
/// order. `name()` is used for logging and for the dynamic-balance-cadence
/// style `ModuleRange` gating in the simulator loop. `j` is mutable since
/// axisymmetrizing the just-deposited current ahead of the solver step is
/// itself one of these actions.
pub trait FieldAction: FieldActionClone + Send {
    fn name(&self) -> &str;

    fn range(&self) -> &ActionRange<{ crate::field::DGRID }>;

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        e: &mut EField,
        b: &mut BField,
        j: &mut JField,
        grid: &Grid<{ crate::field::DGRID }>,
        timestep: u64,
        dt: Float,
    );
}

/// `Box<dyn FieldAction>` needs `Clone`, which object-safe traits cannot
/// require directly; this helper object gets it via a blanket impl, the same
/// trick the standard library uses for `Box<dyn Fn>`-like clonable trait
/// objects.
pub trait FieldActionClone {
    fn clone_box(&self) -> Box<dyn FieldAction>;
}

impl<T> FieldActionClone for T
where
    T: 'static + FieldAction + Clone,
{
    fn clone_box(&self) -> Box<dyn FieldAction> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn FieldAction> {
    fn clone(&self) -> Box<dyn FieldAction> {
        self.clone_box()
    }
}

/// An operator over one species' particle array, applied once per timestep
/// in pipeline order. `j` is the aggregate current field the pusher deposits
/// into. `new_ptc_buf` collects daughter particles created by scattering so
/// they can be appended after the whole pipeline has run.
/// Generic over the message-passing [`Transport`] since some particle
/// actions (the atmosphere injector, migration) are replica- or
/// ensemble-aware.
pub trait ParticleAction<Tr: crate::transport::Transport>: ParticleActionClone<Tr> + Send {
    fn name(&self) -> &str;

    fn range(&self) -> &ActionRange<{ crate::field::DGRID }>;

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        species: Species,
        particles: &mut ParticleArray,
        j: &mut JField,
        new_ptc_buf: &mut HashMap<Species, ParticleArray>,
        properties: &HashMap<Species, Properties>,
        e: &EField,
        b: &BField,
        grid: &Grid<{ crate::field::DGRID }>,
        ensemble: &Ensemble<Tr>,
        rtd: &mut Rtd,
        dt: Float,
        timestep: u64,
        rng: &mut Pcg64,
    );
}

pub trait ParticleActionClone<Tr: crate::transport::Transport> {
    fn clone_box(&self) -> Box<dyn ParticleAction<Tr>>;
}

impl<T, Tr> ParticleActionClone<Tr> for T
where
    Tr: crate::transport::Transport,
    T: 'static + ParticleAction<Tr> + Clone,
{
    fn clone_box(&self) -> Box<dyn ParticleAction<Tr>> {
        Box::new(self.clone())
    }
}

impl<Tr: crate::transport::Transport> Clone for Box<dyn ParticleAction<Tr>> {
    fn clone(&self) -> Box<dyn ParticleAction<Tr>> {
        self.clone_box()
    }
}

/// The two ordered pipelines executed once per timestep. Order within each
/// vector is caller-determined and significant: e.g. axisymmetrize-J must
/// precede the solver, damping must precede axisymmetrize-E/B, and migration
/// must be the last particle action.
pub struct ActionRegistry<Tr: crate::transport::Transport> {
    pub field_pipeline: Vec<Box<dyn FieldAction>>,
    pub particle_pipeline: Vec<Box<dyn ParticleAction<Tr>>>,
}

impl<Tr: crate::transport::Transport> Clone for ActionRegistry<Tr> {
    fn clone(&self) -> ActionRegistry<Tr> {
        ActionRegistry {
            field_pipeline: self.field_pipeline.clone(),
            particle_pipeline: self.particle_pipeline.clone(),
        }
    }
}

impl<Tr: crate::transport::Transport> Default for ActionRegistry<Tr> {
    fn default() -> ActionRegistry<Tr> {
        ActionRegistry {
            field_pipeline: Vec::new(),
            particle_pipeline: Vec::new(),
        }
    }
}

impl<Tr: crate::transport::Transport> ActionRegistry<Tr> {
    pub fn new() -> ActionRegistry<Tr> {
        ActionRegistry::default()
    }

    pub fn push_field(&mut self, action: Box<dyn FieldAction>) {
        self.field_pipeline.push(action);
    }

    pub fn push_particle(&mut self, action: Box<dyn ParticleAction<Tr>>) {
        self.particle_pipeline.push(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid1D;

    #[test]
    fn bulk_range_spans_whole_grid_with_no_guard() {
        let grid: Grid<2> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 6)];
        let r = ActionRange::bulk(&grid);
        assert_eq!(r.range[0], 0..4);
        assert_eq!(r.range[1], 0..6);
        assert_eq!(r.guard, [0, 0]);
    }

    #[test]
    fn with_guard_overrides_margin_only() {
        let grid: Grid<2> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)];
        let r = ActionRange::bulk(&grid).with_guard([1, 2]);
        assert_eq!(r.range[0], 0..4);
        assert_eq!(r.guard, [1, 2]);
    }

    #[derive(Clone)]
    struct NoopField(ActionRange<2>);
    impl FieldAction for NoopField {
        fn name(&self) -> &str {
            "noop"
        }
        fn range(&self) -> &ActionRange<2> {
            &self.0
        }
        fn apply(&self, _e: &mut EField, _b: &mut BField, _j: &mut JField, _g: &Grid<2>, _t: u64, _dt: Float) {}
    }

    #[test]
    fn field_action_trait_objects_are_clonable() {
        let grid: Grid<2> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)];
        let boxed: Box<dyn FieldAction> = Box::new(NoopField(ActionRange::bulk(&grid)));
        let cloned = boxed.clone();
        assert_eq!(cloned.name(), "noop");
        let mut reg: ActionRegistry<crate::transport::LocalTransport> = ActionRegistry::new();
        reg.push_field(boxed);
        assert_eq!(reg.field_pipeline.len(), 1);
    }
}
