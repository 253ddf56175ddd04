//! Physical and numerical constants shared across modules.

use crate::Float;

pub const TWOPI: Float = 2.0 * std::f64::consts::PI;
pub const PI: Float = std::f64::consts::PI;

/// `4*pi*r_e / w_gyro_unit`, the factor that scales deposited current `J`
/// into the simulation's unit system. Computed from
/// [`crate::settings::UnitScaleSettings`] and applied by
/// [`crate::pusher::rescale_current`].
pub const fn prej(classic_electron_radius: Float, w_gyro_unit: Float) -> Float {
    4.0 * PI * classic_electron_radius / w_gyro_unit
}
