//! Core library for building, mutating and optimizing TAS scripts for
//! Quake-engine games.
//!
//! A TAS script is a frame-indexed sequence of [`FrameBlock`]s: convar
//! assignments, button toggles and console commands. The [`optimizer`]
//! mutates such a script over many simulated iterations and keeps whatever
//! variant best advances the configured goal. The game itself stays outside
//! this crate: the embedding application replays scripts through its own
//! simulator and feeds per-frame telemetry back into the session.

pub mod host;
pub use host::{DefaultHost, Host};

pub mod optimizer;
pub use optimizer::{Optimizer, OptimizerGoal, OptimizerSettings, OptimizerState};

mod ordered_map;
pub use ordered_map::OrderedMap;

pub mod script;
pub use script::{FrameBlock, PlaybackInfo, TasScript};

pub mod utils;
