//! Run-time diagnostics: process-wide state written by designated actions
//! and read by export.

use crate::particle::Species;
use crate::Float;
use std::collections::HashMap;

/// Strictly-phased process-wide counters and accumulators. Initialized once
/// per process at startup; individual fields are written only by the
/// action that owns them (the pair-creation counter by a scattering
/// analyzer, `j_by_species` by the pusher's deposition step, `skin_depth` by
/// the export pre-hook) and the whole struct is reset by the export
/// post-hook. No locks: a single rank never shares this by reference across
/// threads, since the core loop is single-threaded.
#[derive(Debug, Clone)]
pub struct Rtd {
    /// Running count of secondary (pair-production) particles created since
    /// the last export reset.
    pub num_scattered: u64,
    /// Pair-creation rate accumulator, one scalar per diagnostic bin; left
    /// empty until a scattering analyzer action populates it.
    pub pair_creation_rate: Vec<Float>,
    /// Fractional current contributed by each species since the last reset,
    /// written by the pusher's deposition step.
    pub j_by_species: HashMap<Species, Float>,
    /// Local plasma skin depth, written by the export pre-hook from the
    /// current field state just before an export snapshot is taken.
    pub skin_depth: Float,
}

impl Rtd {
    pub fn new(species: impl IntoIterator<Item = Species>) -> Rtd {
        let mut j_by_species = HashMap::new();
        for sp in species {
            j_by_species.insert(sp, 0.0);
        }
        Rtd {
            num_scattered: 0,
            pair_creation_rate: Vec::new(),
            j_by_species,
            skin_depth: 0.0,
        }
    }

    pub fn record_scattering(&mut self, count: u64) {
        self.num_scattered += count;
    }

    pub fn accumulate_current(&mut self, species: Species, contribution: Float) {
        *self.j_by_species.entry(species).or_insert(0.0) += contribution;
    }

    /// Invoked by the export post-hook: clears everything accumulated since
    /// the previous export, leaving per-species keys in place.
    pub fn reset(&mut self) {
        self.num_scattered = 0;
        self.pair_creation_rate.clear();
        for v in self.j_by_species.values_mut() {
            *v = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_counters_but_keeps_species_keys() {
        let mut rtd = Rtd::new([Species::Electron, Species::Ion]);
        rtd.record_scattering(3);
        rtd.accumulate_current(Species::Electron, 0.5);
        rtd.reset();
        assert_eq!(rtd.num_scattered, 0);
        assert_eq!(rtd.j_by_species.get(&Species::Electron), Some(&0.0));
        assert_eq!(rtd.j_by_species.len(), 2);
    }
}
