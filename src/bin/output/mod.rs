pub mod path;
pub mod sinks;
