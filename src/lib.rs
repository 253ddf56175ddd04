//! Core engine for a distributed relativistic particle-in-cell simulator.
//!
//! The library couples a Yee-lattice electromagnetic field solver on a
//! curvilinear grid with a charge-conserving particle pusher, an
//! action-pipeline abstraction for boundary conditions and injection, and a
//! domain-decomposed ensemble/replica concurrency model with dynamic load
//! balancing. Persistence, real message-passing transport, and the exact
//! metric/coordinate functions are external collaborators consumed through
//! fixed interfaces (see [`transport`], [`metric`], [`output`]).

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate serde_derive;

pub mod errors {
    error_chain! {
        foreign_links {
            Io(::std::io::Error);
            Toml(::toml::de::Error);
            Bincode(::bincode::Error);
        }
    }
}

pub mod action;
pub mod balance;
pub mod consts;
pub mod ensemble;
pub mod field;
pub mod grid;
pub mod metric;
pub mod migrate;
pub mod output;
pub mod particle;
pub mod pusher;
pub mod rtd;
pub mod settings;
pub mod shape;
pub mod simulator;
pub mod solver;
pub mod transport;
pub mod vector;

/// Floating point type used throughout the engine.
pub type Float = f64;
