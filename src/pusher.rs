//! Force composition, relativistic Boris push, optional scattering, and
//! charge-conserving Esirkepov deposition.

use crate::action::{ActionRange, ParticleAction};
use crate::ensemble::Ensemble;
use crate::field::{BField, EField, JField, DGRID, DPTC};
use crate::grid::Grid;
use crate::metric::Metric;
use crate::particle::{ParticleArray, ParticleState, Properties, Species};
use crate::rtd::Rtd;
use crate::shape::ShapeFunction;
use crate::transport::Transport;
use crate::vector::Vec3;
use crate::Float;
use rand::Rng;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

/// One term of the force list applied, in order, to update a particle's
/// momentum. `q` is the particle's position on the two grid
/// axes; forces that need a radial distance read it as `exp(q[0])`, matching
/// the log-spherical metric this engine is specialized for.
#[derive(Clone, Copy)]
pub enum Force {
    /// `lorentz(kappa) = kappa*(E + v x B)` applied via a relativistic Boris
    /// split. `kappa` folds in charge/mass and unit-system scaling.
    Lorentz { kappa: Float },
    /// `gravity(g) = -g*rhat/r^2`, applied along the radial (axis 0)
    /// momentum component.
    Gravity { g: Float },
    /// Projects `p` onto the local B direction once `|B| >= b_thr`, modeling
    /// strong-field Landau-level quenching of perpendicular momentum.
    Landau0 { b_thr: Float },
}

impl Force {
    fn apply(self, q: [Float; DGRID], p: Vec3, e: Vec3, b: Vec3, dt: Float) -> Vec3 {
        match self {
            Force::Lorentz { kappa } => boris_push(p, e, b, kappa, dt),
            Force::Gravity { g } => {
                let r = q[0].exp();
                let mut out = p;
                out.x -= g * dt / (r * r);
                out
            }
            Force::Landau0 { b_thr } => {
                let bn = b.norm();
                if bn >= b_thr && bn > 0.0 {
                    let bhat = b.scale(1.0 / bn);
                    bhat.scale(p.dot(bhat))
                } else {
                    p
                }
            }
        }
    }
}

/// Relativistic Boris push: half electric-field kick, magnetic rotation,
/// second half electric-field kick.
fn boris_push(p: Vec3, e: Vec3, b: Vec3, kappa: Float, dt: Float) -> Vec3 {
    let half = kappa * dt * 0.5;
    let u_minus = p + e.scale(half);
    let gamma_minus = (1.0 + u_minus.dot(u_minus)).sqrt();
    let t = b.scale(half / gamma_minus);
    let u_prime = u_minus + u_minus.cross(t);
    let s = t.scale(2.0 / (1.0 + t.dot(t)));
    let u_plus = u_minus + u_prime.cross(s);
    u_plus + e.scale(half)
}

/// Samples a field at a particle position using `sf`, honoring the
/// component's own Yee offset.
pub fn interpolate(field: &EField, component: usize, grid: &Grid<DGRID>, q: [Float; DGRID], sf: ShapeFunction) -> Float {
    let comp = &field.components[component];
    let mut native = [0.0; DGRID];
    let mut ranges: [std::ops::Range<isize>; DGRID] = std::array::from_fn(|_| 0..0);
    for k in 0..DGRID {
        native[k] = (q[k] - grid[k].lower()) / grid[k].delta() - comp.offset[k].shift();
        ranges[k] = sf.contributing_range(native[k]);
    }
    let mut sum = 0.0;
    for i in ranges[0].clone() {
        let wi = sf.weight(native[0] - i as Float);
        if wi == 0.0 {
            continue;
        }
        for j in ranges[1].clone() {
            let wj = sf.weight(native[1] - j as Float);
            sum += wi * wj * comp.get(i, j);
        }
    }
    sum
}

fn interpolate_vector(field: &EField, grid: &Grid<DGRID>, q: [Float; DGRID], sf: ShapeFunction) -> Vec3 {
    Vec3::new(
        interpolate(field, 0, grid, q, sf),
        interpolate(field, 1, grid, q, sf),
        interpolate(field, 2, grid, q, sf),
    )
}

/// `calc_w_2d(a,b,c,d) = ((2b+a)d + (b+2a)c)/6`, the corrected (non-typo'd)
/// Esirkepov weight function. In the 2-D specialization this is exactly
/// what the in-plane weights `W_x`, `W_y` reduce to with the out-of-plane
/// axis trivial, so the same helper drives all three components.
fn calc_w_2d(a: Float, b: Float, c: Float, d: Float) -> Float {
    ((2.0 * b + a) * d + (b + 2.0 * a) * c) / 6.0
}

/// Deposits one particle's charge-conserving current contribution for a
/// move `q0 -> q1` (grid-axis components only; the out-of-plane position is
/// invariant under axisymmetry) into `j`, scaled by `charge_over_dt`.
/// `pz_over_gamma` is the particle's out-of-plane momentum over its Lorentz
/// factor, used for the explicit `W_z` term.
#[allow(clippy::too_many_arguments)]
pub fn deposit_current(
    j: &mut JField,
    grid: &Grid<DGRID>,
    q0: [Float; DGRID],
    q1: [Float; DGRID],
    charge_over_dt: Float,
    pz_over_gamma: Float,
    sf: ShapeFunction,
) {
    for c in 0..DPTC {
        let comp = &mut j.components[c];
        let offset = comp.offset;
        let mut native0 = [0.0; DGRID];
        let mut native1 = [0.0; DGRID];
        let mut range: [std::ops::Range<isize>; DGRID] = std::array::from_fn(|_| 0..0);
        for k in 0..DGRID {
            native0[k] = (q0[k] - grid[k].lower()) / grid[k].delta() - offset[k].shift();
            native1[k] = (q1[k] - grid[k].lower()) / grid[k].delta() - offset[k].shift();
            let r0 = sf.contributing_range(native0[k]);
            let r1 = sf.contributing_range(native1[k]);
            range[k] = r0.start.min(r1.start)..r0.end.max(r1.end);
        }
        for i in range[0].clone() {
            let s0x = sf.weight(native0[0] - i as Float);
            let s1x = sf.weight(native1[0] - i as Float);
            for jj in range[1].clone() {
                let s0y = sf.weight(native0[1] - jj as Float);
                let s1y = sf.weight(native1[1] - jj as Float);
                let w = match c {
                    0 => (s1x - s0x) * 0.5 * (s1y + s0y),
                    1 => (s1y - s0y) * 0.5 * (s1x + s0x),
                    _ => calc_w_2d(s0x, s1x, s0y, s1y) * pz_over_gamma,
                };
                if w != 0.0 {
                    *comp.get_mut(i, jj) += charge_over_dt * w;
                }
            }
        }
    }
}

/// Rebases `J` from cell-integrated flux to volume density: `J[i] *=
/// dx[i]/prod(dx)` for grid axes, `J[i] /= prod(dx)` for the out-of-plane
/// component, then applies the unit-system scale `prej` (see
/// [`crate::consts::prej`]).
pub fn rescale_current(j: &mut JField, grid: &Grid<DGRID>, prej: Float) {
    let dv: Float = (0..DGRID).map(|k| grid[k].delta()).product();
    for c in 0..DPTC {
        let scale = prej * if c < DGRID { grid[c].delta() / dv } else { 1.0 / dv };
        j.components[c].data.mapv_inplace(|v| v * scale);
    }
}

/// Predicate gating whether a particle is eligible for scattering at all
/// this step, given its position and this step's momentum change.
pub type EligibilityFn = fn([Float; DGRID], Vec3) -> bool;

/// Tries to fire a channel; returns the channel parameter on success.
pub type TryFireFn = fn(p: Vec3, dp: Vec3, dt: Float, b: Vec3, rng: &mut Pcg64) -> Option<Float>;

/// Builds daughter particles once a channel fires, consuming and advancing a
/// per-process serial counter so every daughter gets a distinct serial.
pub type EmitFn = fn(Float, [Float; DGRID], Vec3, u32, &mut u32) -> Vec<(Species, [Float; DGRID], Vec3, u32)>;

#[derive(Clone, Copy)]
pub struct ScatterChannel {
    pub name: &'static str,
    pub try_fire: TryFireFn,
    pub emit: EmitFn,
}

/// Eligibility predicates (all must pass, short-circuit) followed by an
/// ordered list of channels tried in turn; the first one to fire wins.
#[derive(Clone)]
pub struct ScatterProcess {
    pub eligibility: Vec<EligibilityFn>,
    pub channels: Vec<ScatterChannel>,
    next_serial: Cell<u32>,
}

impl ScatterProcess {
    pub fn new(eligibility: Vec<EligibilityFn>, channels: Vec<ScatterChannel>) -> ScatterProcess {
        ScatterProcess {
            eligibility,
            channels,
            next_serial: Cell::new(0),
        }
    }
}

fn pair_production_try_fire(_p: Vec3, _dp: Vec3, dt: Float, b: Vec3, rng: &mut Pcg64) -> Option<Float> {
    const B_THR: Float = 10.0;
    const RATE: Float = 0.05;
    let bn = b.norm();
    if bn < B_THR {
        return None;
    }
    let prob = (RATE * dt * (bn / B_THR)).min(1.0);
    if rng.gen::<Float>() < prob {
        Some(prob)
    } else {
        None
    }
}

fn pair_production_emit(
    _param: Float,
    q: [Float; DGRID],
    p_parent: Vec3,
    _birthplace: u32,
    serial: &mut u32,
) -> Vec<(Species, [Float; DGRID], Vec3, u32)> {
    let half = p_parent.scale(0.5);
    let s1 = *serial;
    *serial += 1;
    let s2 = *serial;
    *serial += 1;
    vec![(Species::Electron, q, half, s1), (Species::Positron, q, half, s2)]
}

/// Photon-to-pair conversion mediated by the local field strength, standing
/// in for magnetic pair production in a pulsar magnetosphere.
pub const PAIR_PRODUCTION: ScatterChannel = ScatterChannel {
    name: "pair_production",
    try_fire: pair_production_try_fire,
    emit: pair_production_emit,
};

/// Per-species interpolate -> force -> scatter -> geodesic-move -> deposit
/// pipeline stage. Holds the metric as a captured field rather than a call
/// parameter since `ParticleAction::apply`'s signature carries no metric
/// argument, mirroring how `solver.rs`'s boundary actions capture their own
/// closures.
#[derive(Clone)]
pub struct MainUpdate {
    range: ActionRange<DGRID>,
    pub metric: Arc<dyn Metric>,
    pub forces: Vec<Force>,
    pub shape: ShapeFunction,
    pub scatter: Option<ScatterProcess>,
}

impl MainUpdate {
    pub fn new(grid: &Grid<DGRID>, metric: Arc<dyn Metric>, forces: Vec<Force>, shape: ShapeFunction) -> MainUpdate {
        MainUpdate {
            range: ActionRange::bulk(grid),
            metric,
            forces,
            shape,
            scatter: None,
        }
    }

    pub fn with_scatter(mut self, scatter: ScatterProcess) -> MainUpdate {
        self.scatter = Some(scatter);
        self
    }
}

impl<Tr: crate::transport::Transport> ParticleAction<Tr> for MainUpdate {
    fn name(&self) -> &str {
        "main_update"
    }

    fn range(&self) -> &ActionRange<DGRID> {
        &self.range
    }

    fn apply(
        &self,
        species: Species,
        particles: &mut ParticleArray,
        j: &mut JField,
        new_ptc_buf: &mut HashMap<Species, ParticleArray>,
        properties: &HashMap<Species, Properties>,
        e: &EField,
        b: &BField,
        grid: &Grid<DGRID>,
        _ensemble: &Ensemble<Tr>,
        rtd: &mut Rtd,
        dt: Float,
        _timestep: u64,
        rng: &mut Pcg64,
    ) {
        let Some(props) = properties.get(&species) else {
            return;
        };
        let charge_over_dt = props.charge_x / dt;
        let is_massive = props.mass_x > 0.0;

        for i in 0..particles.len() {
            if !particles.state[i].exists() {
                continue;
            }
            let q0 = particles.position(i);
            let q0_grid = [q0[0], q0[1]];
            let e_at = interpolate_vector(e, grid, q0_grid, self.shape);
            let b_at = interpolate_vector(b, grid, q0_grid, self.shape);

            let p_before = Vec3::from(particles.momentum(i));
            let mut p = p_before;
            for force in &self.forces {
                p = force.apply(q0_grid, p, e_at, b_at, dt);
            }

            if let Some(proc) = &self.scatter {
                let dp = p - p_before;
                if proc.eligibility.iter().all(|f| f(q0_grid, dp)) {
                    for ch in &proc.channels {
                        if let Some(param) = (ch.try_fire)(p, dp, dt, b_at, rng) {
                            let mut serial = proc.next_serial.get();
                            let birthplace = particles.state[i].birthplace();
                            let daughters = (ch.emit)(param, q0_grid, p, birthplace, &mut serial);
                            proc.next_serial.set(serial);
                            rtd.record_scattering(daughters.len() as u64);
                            for (sp, dq, dpm, dserial) in daughters {
                                let mut st = ParticleState::new(sp, dserial, birthplace);
                                st.set_secondary(true);
                                new_ptc_buf
                                    .entry(sp)
                                    .or_insert_with(ParticleArray::new)
                                    .push([dq[0], dq[1], q0[2]], dpm.into(), st);
                            }
                            break;
                        }
                    }
                }
            }

            let gamma = if is_massive { (1.0 + p.dot(p)).sqrt() } else { p.norm() };
            let q1_grid = self.metric.geodesic_move(q0_grid, p, dt, is_massive);

            deposit_current(j, grid, q0_grid, q1_grid, charge_over_dt, p.z / gamma.max(Float::EPSILON), self.shape);

            particles.set_position(i, [q1_grid[0], q1_grid[1], q0[2]]);
            particles.set_momentum(i, p.into());
            rtd.accumulate_current(species, charge_over_dt.abs());
        }
    }
}

fn cell_of(q: [Float; DGRID], grid: &Grid<DGRID>) -> (isize, isize) {
    let mut cell = (0isize, 0isize);
    let idx: [isize; DGRID] = std::array::from_fn(|k| ((q[k] - grid[k].lower()) / grid[k].delta()).floor() as isize);
    cell.0 = idx[0];
    cell.1 = idx[1];
    cell
}

/// Averages the staggered B samples around cell `(i, j)` onto the cell
/// center, one average axis per component per the Yee convention.
fn cell_centered_b(b: &BField, i: isize, j: isize) -> Vec3 {
    let br = 0.5 * (b.components[0].get(i - 1, j) + b.components[0].get(i, j));
    let bt = 0.5 * (b.components[1].get(i, j - 1) + b.components[1].get(i, j));
    let bp = 0.25
        * (b.components[2].get(i - 1, j - 1)
            + b.components[2].get(i - 1, j)
            + b.components[2].get(i, j - 1)
            + b.components[2].get(i, j));
    Vec3::new(br, bt, bp)
}

/// Atmosphere injector. Unlike every
/// other particle action it needs simultaneous read access to every
/// species' particle array just to count the existing positive/negative
/// charge per cell, which the per-species `ParticleAction::apply` contract
/// can't express — so this is a free function the simulator
/// loop calls directly against the whole species map, rather than a
/// `ParticleAction` impl.
#[derive(Clone)]
pub struct AtmosphereInjector {
    pub range: ActionRange<DGRID>,
    /// Target atmosphere density scale `N_atm`.
    pub n_atm: Float,
    /// Deficit floor below which injection for a cell stops this step.
    pub min_frac: Float,
    /// Gaussian jitter standard deviation for injected momentum, along the
    /// local B direction.
    pub v_th: Float,
    /// Corotation angular velocity `Omega(t)`.
    pub omega: Arc<dyn Fn(Float) -> Float + Send + Sync>,
}

impl AtmosphereInjector {
    pub fn new(
        range: ActionRange<DGRID>,
        n_atm: Float,
        min_frac: Float,
        v_th: Float,
        omega: Arc<dyn Fn(Float) -> Float + Send + Sync>,
    ) -> AtmosphereInjector {
        AtmosphereInjector {
            range,
            n_atm,
            min_frac,
            v_th,
            omega,
        }
    }

    /// Counts, reduces, and injects electron/ion pairs:
    /// the replica at rank `timestep mod ensemble.size` is the one
    /// designated to decide and emit for this step.
    #[allow(clippy::too_many_arguments)]
    pub fn apply<Tr: Transport>(
        &self,
        particles: &mut HashMap<Species, ParticleArray>,
        properties: &HashMap<Species, Properties>,
        b: &BField,
        grid: &Grid<DGRID>,
        ensemble: &Ensemble<Tr>,
        dt: Float,
        timestep: u64,
        rng: &mut Pcg64,
        next_serial: &mut u32,
    ) {
        let replica_count = ensemble.intra.size().max(1);
        let designated = (timestep as usize) % replica_count;
        let is_designated = ensemble.intra.rank() == designated;
        let omega_t = (self.omega)(dt * timestep as Float);

        for i in self.range.range[0].clone() {
            for j in self.range.range[1].clone() {
                let (mut count_p, mut count_n) = (0u32, 0u32);
                for (sp, arr) in particles.iter() {
                    let Some(props) = properties.get(sp) else { continue };
                    if props.charge_x == 0.0 {
                        continue;
                    }
                    for k in 0..arr.len() {
                        if !arr.state[k].exists() {
                            continue;
                        }
                        if cell_of([arr.q[0][k], arr.q[1][k]], grid) == (i, j) {
                            if props.charge_x > 0.0 {
                                count_p += 1;
                            } else {
                                count_n += 1;
                            }
                        }
                    }
                }
                let local = ((count_p as u64) << 32) | count_n as u64;
                let Some(total) = ensemble.intra.reduce_sum(local, designated) else {
                    continue;
                };
                if !is_designated {
                    continue;
                }
                let count_p = (total >> 32) as Float;
                let count_n = (total & 0xFFFF_FFFF) as Float;

                let q0 = grid[0].absc(i, 0.5);
                let q1 = grid[1].absc(j, 0.5);
                let target = self.n_atm * q1.sin();
                let mut deficit = target - count_p.min(count_n);

                while deficit >= 1.0 {
                    self.emit_pair(particles, b, grid, i, j, q0, q1, omega_t, rng, next_serial, ensemble.label);
                    deficit -= 1.0;
                }
                if deficit >= self.min_frac && rng.gen::<Float>() < deficit {
                    self.emit_pair(particles, b, grid, i, j, q0, q1, omega_t, rng, next_serial, ensemble.label);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_pair(
        &self,
        particles: &mut HashMap<Species, ParticleArray>,
        b: &BField,
        _grid: &Grid<DGRID>,
        i: isize,
        j: isize,
        q0: Float,
        q1: Float,
        omega_t: Float,
        rng: &mut Pcg64,
        next_serial: &mut u32,
        birthplace: u32,
    ) {
        let b_cell = cell_centered_b(b, i, j);
        let bn = b_cell.norm();
        let bhat = if bn > 0.0 { b_cell.scale(1.0 / bn) } else { Vec3::new(0.0, 0.0, 1.0) };
        let pz = omega_t * q0.exp() * q1.sin();
        let jitter: Float = self.v_th * rng.sample::<Float, _>(StandardNormal);
        let p = bhat.scale(jitter) + Vec3::new(0.0, 0.0, pz);
        for sp in [Species::Electron, Species::Ion] {
            let serial = *next_serial;
            *next_serial += 1;
            let state = ParticleState::new(sp, serial, birthplace);
            particles
                .entry(sp)
                .or_insert_with(ParticleArray::new)
                .push([q0, q1, 0.0], p.into(), state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid1D;

    #[test]
    fn boris_push_conserves_energy_in_pure_b_field() {
        let p0 = Vec3::new(1.0, 0.0, 0.0);
        let b = Vec3::new(0.0, 0.0, 5.0);
        let p1 = boris_push(p0, Vec3::zero(), b, 1.0, 0.01);
        assert!((p1.norm() - p0.norm()).abs() < 1e-10);
    }

    #[test]
    fn lorentz_force_accelerates_along_e() {
        let p0 = Vec3::zero();
        let e = Vec3::new(1.0, 0.0, 0.0);
        let p1 = boris_push(p0, e, Vec3::zero(), 1.0, 1.0);
        assert!(p1.x > 0.0);
    }

    #[test]
    fn calc_w_2d_matches_trivial_out_of_plane_average() {
        // With the third axis trivial (c=d=1), calcW_2D should reduce to a
        // plain average -- the property that makes the typo-fix matter.
        let a = 0.3;
        let b = 0.6;
        assert!((calc_w_2d(a, b, 1.0, 1.0) - (a + b) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn esirkepov_deposition_closes_over_the_full_support() {
        // A single particle's swept-shape contribution to J_x/J_y sums to
        // zero over its whole support box: net current out of an isolated
        // particle's footprint vanishes, which is what makes the per-cell
        // divergence identity exact.
        let grid: Grid<DGRID> = [Grid1D::new(0.0, 10.0, 10), Grid1D::new(0.0, 10.0, 10)];
        let mesh = crate::grid::Mesh::new(grid, 3);
        let mut j = crate::field::new_j_field(&mesh);
        deposit_current(&mut j, &grid, [1.5, 2.5], [1.8, 2.4], 1.0, 0.0, ShapeFunction::Cic);
        let sum_x: Float = j.components[0].data.iter().sum();
        let sum_y: Float = j.components[1].data.iter().sum();
        assert!(sum_x.abs() < 1e-10, "sum_x = {}", sum_x);
        assert!(sum_y.abs() < 1e-10, "sum_y = {}", sum_y);
    }

    #[test]
    fn atmosphere_injector_emits_pairs_into_empty_cells() {
        let grid: Grid<DGRID> = [Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.1, 1.0, 4)];
        let mesh = crate::grid::Mesh::new(grid, 2);
        let b = crate::field::new_b_field(&mesh);
        let ensemble = Ensemble::singleton(crate::transport::LocalTransport, [false, false]);
        let properties = Properties::default_registry().into_iter().collect::<HashMap<_, _>>();
        let mut particles: HashMap<Species, ParticleArray> = HashMap::new();
        let injector = AtmosphereInjector::new(
            ActionRange::new([0..1, 0..4], [0, 0]),
            10.0,
            0.1,
            0.01,
            Arc::new(|_t| 0.1),
        );
        let mut rng = Pcg64::new(1, 1);
        let mut serial = 0u32;
        injector.apply(&mut particles, &properties, &b, &grid, &ensemble, 0.01, 0, &mut rng, &mut serial);
        assert!(particles.get(&Species::Electron).map(|a| a.len()).unwrap_or(0) > 0);
        assert_eq!(
            particles[&Species::Electron].len(),
            particles[&Species::Ion].len(),
            "pairs are emitted in equal numbers"
        );
    }
}
