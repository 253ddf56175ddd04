//! End-to-end scenario tests exercising full slices of the engine together:
//! a bare timestep loop, a single particle's push and deposit, a two-rank
//! guard exchange, an Esirkepov round-trip, balancer behavior under skew,
//! and the axisymmetrize boundary action. Each mirrors one of the
//! traceable end-to-end scenarios the unit tests colocated with each module
//! don't individually cover.

use stochasticpic::action::{ActionRange, FieldAction};
use stochasticpic::balance::{calc_new_nprocs, EnsembleLoad};
use stochasticpic::field::{new_b_field, new_e_field, new_j_field, DGRID};
use stochasticpic::grid::{Grid, Grid1D, Mesh};
use stochasticpic::metric::LogSpherical;
use stochasticpic::particle::ParticleState;
use stochasticpic::pusher::deposit_current;
use stochasticpic::shape::ShapeFunction;
use stochasticpic::solver::{AxisSymmetrize, SolverScheme, SolverStep};
use stochasticpic::Float;
use approx::assert_relative_eq;
use std::sync::Arc;

fn pulsar_grid() -> Grid<DGRID> {
    [Grid1D::new(0.0, 1.0, 8), Grid1D::new(0.0, std::f64::consts::PI, 8)]
}

/// Scenario 1: an empty universe with no particles and zero initial fields
/// stays at zero after any number of steps: the solver has no source term
/// to grow from, and the bulk curl of an all-zero field is zero everywhere.
#[test]
fn empty_universe_stays_at_zero_field() {
    let grid = pulsar_grid();
    let mesh = Mesh::new(grid, 2);
    let metric: Arc<dyn stochasticpic::metric::Metric> = Arc::new(LogSpherical);
    let mut e = new_e_field(&mesh);
    let mut b = new_b_field(&mesh);
    let mut j = new_j_field(&mesh);
    let step = SolverStep::new(&grid, metric, SolverScheme::Classic);

    for t in 0..10u64 {
        step.apply(&mut e, &mut b, &mut j, &grid, t, 0.01);
    }

    let max_e: Float = e.components.iter().flat_map(|c| c.data.iter()).fold(0.0, |acc, &v| acc.max(v.abs()));
    let max_b: Float = b.components.iter().flat_map(|c| c.data.iter()).fold(0.0, |acc, &v| acc.max(v.abs()));
    assert_eq!(max_e + max_b, 0.0);
}

/// Scenario 2: a single electron at rest in a zero field feels no force,
/// so it neither gains momentum from the (absent) Lorentz force nor moves,
/// and the current it would deposit from a zero displacement is exactly
/// zero everywhere — trivially within the particle's support neighborhood.
#[test]
fn stationary_charge_in_vacuum_deposits_no_current() {
    let grid = pulsar_grid();
    let mesh = Mesh::new(grid, 2);
    let mut j = new_j_field(&mesh);

    let q = [grid[0].absc(4, 0.0), grid[1].absc(4, 0.0)];
    deposit_current(&mut j, &grid, q, q, -1.0 / 0.01, 0.0, ShapeFunction::Tsc);

    for comp in &j.components {
        for &v in comp.data.iter() {
            assert_eq!(v, 0.0, "a stationary particle deposits no current anywhere");
        }
    }
}

/// Scenario 3: a particle deposited one cell inside a right-hand rank's
/// left guard contributes to the left rank's rightmost bulk cell once the
/// guard contribution is merged in, the same pack/unpack round-trip
/// [`crate::ensemble::Ensemble::merge_sync_j`] drives between two chiefs.
#[test]
fn two_ranks_merge_guard_deposited_current_into_shared_bulk_edge() {
    let grid: Grid<DGRID> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)];
    let mesh = Mesh::new(grid, 1);

    let mut left = new_j_field(&mesh);
    let mut right = new_j_field(&mesh);

    // One particle sitting just inside the right rank's own bulk, close
    // enough to its left edge for a CIC-width deposit to also land in its
    // left guard cell (column -1, which after merge belongs to `left`'s
    // rightmost bulk column).
    let q0 = [0.05, 0.5];
    let q1 = [0.15, 0.5];
    deposit_current(&mut right, &grid, q0, q1, 1.0, 0.0, ShapeFunction::Cic);

    let guard_contribution = right.components[0].pack_guard_slab(&mesh, 0, -1);
    assert!(
        guard_contribution.iter().any(|&v| v != 0.0),
        "the deposit must actually spill into the left guard for this scenario to be meaningful"
    );

    let before = left.components[0].pack_boundary_slab(&mesh, 0, 1).to_vec();
    left.components[0].add_into_boundary_slab(&mesh, 0, 1, &guard_contribution);
    let after = left.components[0].pack_boundary_slab(&mesh, 0, 1);

    for ((b, a), g) in before.iter().zip(after.iter()).zip(guard_contribution.iter()) {
        assert_relative_eq!(*a, b + g, epsilon = 1e-14);
    }
}

/// Scenario 4: moving a particle by `(0.3, -0.1)` deposits an Esirkepov
/// current whose full-support sum telescopes to zero on each axis — the
/// charge-conservation identity that falls out of shape functions
/// integrating to 1 at both endpoints of the move, so summing the deposited
/// current over every cell the particle's support ever touches cancels
/// exactly.
#[test]
fn esirkepov_round_trip_conserves_charge_over_the_full_support() {
    let grid: Grid<DGRID> = [Grid1D::new(0.0, 10.0, 10), Grid1D::new(0.0, 10.0, 10)];
    let mesh = Mesh::new(grid, 3);
    let mut j = new_j_field(&mesh);

    deposit_current(&mut j, &grid, [1.5, 2.5], [1.8, 2.4], 1.0, 0.0, ShapeFunction::Cic);

    let sum_x: Float = j.components[0].data.iter().sum();
    let sum_y: Float = j.components[1].data.iter().sum();
    assert_relative_eq!(sum_x, 0.0, epsilon = 1e-10);
    assert_relative_eq!(sum_y, 0.0, epsilon = 1e-10);
}

/// Scenario 5: four ensembles already holding ten processes between them,
/// with one ensemble a hundred times as loaded as the other three, must
/// keep every ensemble alive and redirect the bulk of the ten processes to
/// the heaviest one once reassigned.
#[test]
fn balancer_under_extreme_skew_keeps_every_ensemble_alive() {
    let loads = [
        EnsembleLoad { load: 1000, nproc: 7 },
        EnsembleLoad { load: 10, nproc: 1 },
        EnsembleLoad { load: 10, nproc: 1 },
        EnsembleLoad { load: 10, nproc: 1 },
    ];
    let new_nproc = calc_new_nprocs(&loads, 100, 10);

    assert_eq!(new_nproc.len(), 4);
    assert!(new_nproc.iter().all(|&n| n >= 1), "every ensemble keeps at least one process: {:?}", new_nproc);
    assert_eq!(new_nproc.iter().sum::<u32>(), 10, "total process count is conserved: {:?}", new_nproc);
    let argmax = new_nproc.iter().enumerate().max_by_key(|&(_, &n)| n).unwrap().0;
    assert_eq!(argmax, 0, "the 1000-load ensemble gets the largest share: {:?}", new_nproc);
}

/// Scenario 6: mirroring guard cell `-1` onto its bulk counterpart `1`
/// leaves `v` at `1`, `-v` at `-1`, and exactly `0` on the axis cell `0`
/// itself, for an INSITU (axis-antisymmetric) component.
#[test]
fn axisymmetrize_mirrors_and_zeroes_the_axis_cell() {
    let grid: Grid<DGRID> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)];
    let mesh = Mesh::new(grid, 2);
    let mut e = new_e_field(&mesh);
    let mut b = new_b_field(&mesh);
    let mut j = new_j_field(&mesh);

    // E[2] (E_phi) is INSITU on both axes: axis-antisymmetric under mirroring.
    let v = 3.5;
    for i in 0..4 {
        e.components[2].set(i, 1, v);
    }

    let lower_range = ActionRange::new([0..4, -1..1], [0, 1]);
    let symmetrize = AxisSymmetrize::new(lower_range, false);
    symmetrize.apply(&mut e, &mut b, &mut j, &grid, 0, 0.01);

    for i in 0..4 {
        assert_relative_eq!(e.components[2].get(i, -1), -v, epsilon = 1e-12);
        assert_eq!(e.components[2].get(i, 0), 0.0, "axis cell is forced to zero");
        assert_eq!(e.components[2].get(i, 1), v, "bulk source cell is untouched");
    }
}

/// A full-fidelity run driven entirely through `LocalTransport` and
/// `Ensemble::singleton` never needs a real multi-rank `Transport`: every
/// collective on a singleton ensemble is a no-op, so the same `Simulator`
/// code path that a real deployment uses exercises cleanly end-to-end.
#[test]
fn simulator_step_runs_cleanly_on_a_singleton_ensemble() {
    use std::collections::HashMap;
    use stochasticpic::action::ActionRegistry;
    use stochasticpic::ensemble::Ensemble;
    use stochasticpic::particle::{ParticleArray, Properties, Species};
    use stochasticpic::pusher::{Force, MainUpdate};
    use stochasticpic::simulator::{ModuleRange, Simulator};
    use stochasticpic::transport::LocalTransport;

    let grid = pulsar_grid();
    let guard = 2;
    let mesh = Mesh::new(grid, guard);
    let metric: Arc<dyn stochasticpic::metric::Metric> = Arc::new(LogSpherical);

    let properties: HashMap<Species, Properties> = Properties::default_registry().into_iter().collect();
    let mut particles: HashMap<Species, ParticleArray> = HashMap::new();
    let mut electrons = ParticleArray::new();
    let q = [grid[0].absc(4, 0.0), grid[1].absc(4, 0.0), 0.0];
    electrons.push(q, [0.01, 0.0, 0.0], ParticleState::new(Species::Electron, 0, 0));
    particles.insert(Species::Electron, electrons);
    particles.insert(Species::Ion, ParticleArray::new());

    let mut registry: ActionRegistry<LocalTransport> = ActionRegistry::new();
    registry.push_field(Box::new(SolverStep::new(&grid, metric.clone(), SolverScheme::Classic)));
    registry.push_particle(Box::new(MainUpdate::new(
        &grid,
        metric.clone(),
        vec![Force::Lorentz { kappa: 1.0 }],
        ShapeFunction::Tsc,
    )));

    let ensemble = Ensemble::singleton(LocalTransport, [false, false]);
    let mut simulator: Simulator<LocalTransport> = Simulator::new(
        mesh,
        metric,
        properties,
        ensemble,
        registry,
        None,
        100,
        0.01,
        1,
        [1, 1],
        1.0,
        ModuleRange::new(false, 0, 1),
        ModuleRange::new(false, 0, 1),
        ModuleRange::new(false, 0, 1),
        ModuleRange::new(false, 0, 1),
    );
    simulator.particles = particles;

    for _ in 0..5 {
        simulator.step(None, None).expect("a singleton-ensemble run never touches a real sink");
    }

    assert_eq!(simulator.timestep, 5);
    assert_eq!(simulator.particles[&Species::Electron].len(), 1);
}
