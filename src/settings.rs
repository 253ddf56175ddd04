//! TOML configuration. Follows a `#[serde(deny_unknown_fields)]` struct tree,
//! `read_parameter_file` that parses then validates, and `bail!` on any
//! invariant violation caught at startup.

use crate::errors::*;
use crate::field::DGRID;
use crate::particle::Species;
use crate::shape::ShapeFunction;
use crate::solver::SolverScheme;
use crate::Float;
use std::fs::File;
use std::io::prelude::*;

/// One axis of the simulation supergrid, mirroring [`crate::grid::Grid1D`]
/// field-for-field so it round-trips through TOML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AxisSettings {
    pub lower: Float,
    pub upper: Float,
    pub dim: usize,
}

impl AxisSettings {
    pub fn to_grid1d(self) -> crate::grid::Grid1D {
        crate::grid::Grid1D::new(self.lower, self.upper, self.dim)
    }
}

/// Selects which build-time solver variant advances the fields, and its
/// parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SolverSettings {
    Classic,
    SemiImplicit { k: u32, theta: Float, order: u32 },
}

impl SolverSettings {
    pub fn to_scheme(self) -> SolverScheme {
        match self {
            SolverSettings::Classic => SolverScheme::Classic,
            SolverSettings::SemiImplicit { k, theta, order } => SolverScheme::SemiImplicit { k, theta, order },
        }
    }
}

/// Per-species registration toggle: electron and ion are auto-registered,
/// positron and photon are opt-in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SpeciesSettings {
    pub electron: bool,
    pub ion: bool,
    #[serde(default)]
    pub positron: bool,
    #[serde(default)]
    pub photon: bool,
}

impl Default for SpeciesSettings {
    fn default() -> SpeciesSettings {
        SpeciesSettings {
            electron: true,
            ion: true,
            positron: false,
            photon: false,
        }
    }
}

impl SpeciesSettings {
    pub fn registered(&self) -> Vec<Species> {
        let mut out = Vec::new();
        if self.electron {
            out.push(Species::Electron);
        }
        if self.ion {
            out.push(Species::Ion);
        }
        if self.positron {
            out.push(Species::Positron);
        }
        if self.photon {
            out.push(Species::Photon);
        }
        out
    }
}

/// Gates a periodic action by an active flag, a start timestep, and a
/// stride.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModuleRangeSettings {
    pub is_active: bool,
    pub start: u64,
    pub stride: u64,
}

impl ModuleRangeSettings {
    pub fn to_module_range(self) -> crate::simulator::ModuleRange {
        crate::simulator::ModuleRange::new(self.is_active, self.start, self.stride)
    }
}

/// What happens to a particle that steps off a non-periodic global
/// boundary: dropped, or reflected back into the bulk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgePolicySettings {
    Drop,
    Reflect,
}

impl Default for EdgePolicySettings {
    fn default() -> EdgePolicySettings {
        EdgePolicySettings::Drop
    }
}

impl EdgePolicySettings {
    pub fn to_edge_policy(self) -> crate::migrate::EdgePolicy {
        match self {
            EdgePolicySettings::Drop => crate::migrate::EdgePolicy::Drop,
            EdgePolicySettings::Reflect => crate::migrate::EdgePolicy::Reflect,
        }
    }
}

/// The cartesian-topology shape of the ensemble decomposition: `dims` is the per-axis ensemble count, `periodic` the per-axis
/// wraparound flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TopologySettings {
    pub dims: [usize; DGRID],
    pub periodic: [bool; DGRID],
    #[serde(default)]
    pub edge_policy: EdgePolicySettings,
}

/// Unit-system scale factors feeding [`crate::consts::prej`]: `4*pi*
/// classic_electron_radius / w_gyro_unit`, multiplied into deposited
/// current before the field solve. Defaults keep `prej() == 1.0`, a no-op,
/// for parameter files that don't specify a unit system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UnitScaleSettings {
    #[serde(default = "default_classic_electron_radius")]
    pub classic_electron_radius: Float,
    #[serde(default = "default_w_gyro_unit")]
    pub w_gyro_unit: Float,
}

impl Default for UnitScaleSettings {
    fn default() -> UnitScaleSettings {
        UnitScaleSettings {
            classic_electron_radius: default_classic_electron_radius(),
            w_gyro_unit: default_w_gyro_unit(),
        }
    }
}

fn default_classic_electron_radius() -> Float {
    1.0 / (4.0 * crate::consts::PI)
}

fn default_w_gyro_unit() -> Float {
    1.0
}

impl UnitScaleSettings {
    pub fn prej(&self) -> Float {
        crate::consts::prej(self.classic_electron_radius, self.w_gyro_unit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DynamicBalanceSettings {
    pub module_range: ModuleRangeSettings,
    pub target_load: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    pub grid: [AxisSettings; DGRID],
    /// Guard width. `None` derives it from `shape.support()` and the solver
    /// variant (see `SimulationSettings::guard_width`).
    #[serde(default)]
    pub guard: Option<usize>,
    pub dt: Float,
    pub num_steps: u64,
    pub shape: ShapeFunction,
    pub solver: SolverSettings,
    pub topology: TopologySettings,
    #[serde(default)]
    pub species: SpeciesSettings,
    pub dynamic_balance: DynamicBalanceSettings,
    pub sort: ModuleRangeSettings,
    pub export: ModuleRangeSettings,
    #[serde(default = "default_downsample_ratio")]
    pub downsample_ratio: usize,
    pub checkpoint: ModuleRangeSettings,
    pub seed: [u64; 2],
    #[serde(default)]
    pub unit_scale: UnitScaleSettings,
}

fn default_downsample_ratio() -> usize {
    1
}

impl SimulationSettings {
    /// `guard = max(1 + solver-dependent term, (shape support + 3) / 2)`:
    /// the uniform guard width wide enough for both the solver's stencil
    /// and the configured shape function's support.
    pub fn guard_width(&self) -> usize {
        if let Some(g) = self.guard {
            return g;
        }
        let solver_term = match self.solver {
            SolverSettings::Classic => 1,
            SolverSettings::SemiImplicit { .. } => 2,
        };
        let from_solver = 1 + solver_term;
        let from_shape = (self.shape.support() as usize + 3) / 2;
        from_solver.max(from_shape)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSettings {
    pub prefix: String,
    #[serde(default)]
    pub init_file: Option<String>,
    #[serde(default = "default_io_queue_size")]
    pub io_queue_size: usize,
    #[serde(default)]
    pub version: String,
}

fn default_io_queue_size() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub simulation: SimulationSettings,
    pub environment: EnvironmentSettings,
}

impl Settings {
    pub fn set_version(&mut self, version: &str) {
        self.environment.version = version.to_string();
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let s = toml::to_string_pretty(self).chain_err(|| "Unable to serialize settings to TOML.")?;
        let mut f = File::create(path).chain_err(|| "Unable to create settings output file.")?;
        f.write_all(s.as_bytes()).chain_err(|| "Unable to write settings output file.")?;
        Ok(())
    }
}

fn read_from_file(filename: &str) -> Result<String> {
    let mut f = File::open(filename).chain_err(|| "Unable to open parameter file.")?;
    let mut content = String::new();
    f.read_to_string(&mut content).chain_err(|| "Unable to read parameter file.")?;
    Ok(content)
}

/// Reads and validates a TOML parameter file, bailing out with a
/// diagnostic on the first invariant violation.
pub fn read_parameter_file(param_file: &str) -> Result<Settings> {
    let toml_string = read_from_file(param_file)?;
    let settings: Settings = toml::from_str(&toml_string).chain_err(|| "Unable to parse parameter file.")?;
    check_settings(&settings)?;
    Ok(settings)
}

fn check_settings(s: &Settings) -> Result<()> {
    for axis in &s.simulation.grid {
        if axis.upper <= axis.lower {
            bail!("Grid axis upper bound {} must exceed lower bound {}", axis.upper, axis.lower);
        }
        if axis.dim == 0 {
            bail!("Grid axis dimension must be >= 1, got 0");
        }
    }
    if s.simulation.dt <= 0.0 {
        bail!("dt must be positive, got {}", s.simulation.dt);
    }
    for (axis, &d) in s.simulation.topology.dims.iter().enumerate() {
        if d == 0 {
            bail!("Topology dims[{}] must be >= 1, got 0", axis);
        }
        if s.simulation.grid[axis].dim % d != 0 {
            bail!(
                "Grid axis {} dimension {} is not evenly divisible by {} ensembles",
                axis,
                s.simulation.grid[axis].dim,
                d
            );
        }
    }
    if !s.simulation.species.electron && !s.simulation.species.ion {
        bail!("At least one of electron/ion must be registered");
    }
    if s.simulation.dynamic_balance.target_load == 0 {
        bail!("dynamic_balance.target_load must be positive");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Settings {
        Settings {
            simulation: SimulationSettings {
                grid: [
                    AxisSettings { lower: 0.0, upper: 1.0, dim: 8 },
                    AxisSettings { lower: 0.0, upper: std::f64::consts::PI, dim: 8 },
                ],
                guard: None,
                dt: 0.01,
                num_steps: 100,
                shape: ShapeFunction::Cic,
                solver: SolverSettings::Classic,
                topology: TopologySettings {
                    dims: [2, 1],
                    periodic: [false, false],
                    edge_policy: EdgePolicySettings::Drop,
                },
                species: SpeciesSettings::default(),
                dynamic_balance: DynamicBalanceSettings {
                    module_range: ModuleRangeSettings { is_active: true, start: 0, stride: 100 },
                    target_load: 1000,
                },
                sort: ModuleRangeSettings { is_active: true, start: 0, stride: 20 },
                export: ModuleRangeSettings { is_active: true, start: 0, stride: 50 },
                downsample_ratio: 1,
                checkpoint: ModuleRangeSettings { is_active: true, start: 0, stride: 500 },
                seed: [42, 7],
                unit_scale: UnitScaleSettings::default(),
            },
            environment: EnvironmentSettings {
                prefix: "run".into(),
                init_file: None,
                io_queue_size: 64,
                version: String::new(),
            },
        }
    }

    #[test]
    fn sample_settings_pass_validation() {
        assert!(check_settings(&sample()).is_ok());
    }

    #[test]
    fn rejects_grid_not_divisible_by_topology() {
        let mut s = sample();
        s.simulation.topology.dims = [3, 1];
        assert!(check_settings(&s).is_err());
    }

    #[test]
    fn rejects_negative_dt() {
        let mut s = sample();
        s.simulation.dt = -0.1;
        assert!(check_settings(&s).is_err());
    }

    #[test]
    fn guard_width_derives_from_shape_support_when_unset() {
        let s = sample();
        assert_eq!(s.simulation.guard_width(), 2); // max(1+1, (2+3)/2=2)
    }

    #[test]
    fn rejects_no_species_registered() {
        let mut s = sample();
        s.simulation.species = SpeciesSettings {
            electron: false,
            ion: false,
            positron: false,
            photon: false,
        };
        assert!(check_settings(&s).is_err());
    }
}
