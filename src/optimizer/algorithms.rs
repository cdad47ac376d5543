//! The pluggable mutation strategies.
//!
//! Every algorithm proposes in-place edits to the working script through the
//! same narrow interface; the driver picks which one runs each iteration by
//! weighted sampling, except that an algorithm with unfinished
//! multi-iteration work is always allowed to continue.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::run::OptimizerRun;
use super::search::{BinSearcher, RollingStone};
use super::OptimRng;
use crate::script::{TasScript, TAS_STRAFE_YAW};

/// Yaw epsilon below which the turn search stops refining.
const TURN_EPSILON: f64 = 0.01;

/// Largest uniform perturbation applied to an existing strafe yaw, degrees.
const MAX_YAW_PERTURB: f64 = 15.;

/// Largest single random block shift, frames.
const MAX_BLOCK_SHIFT: i32 = 36;

/// Bounds for the starting step of the strafe-adjusting stone, degrees.
const STRAFE_DELTA_MIN: f64 = 0.1;
const STRAFE_DELTA_MAX: f64 = 3.;

/// Largest starting step for the block-moving stone, frames.
const MOVER_START_DELTA: i32 = 8;

/// Frames a scripted shot spends turning the view.
const SHOT_TURN_FRAMES: i32 = 6;

/// Steepest pitch a random shot will aim at, degrees either way.
const MAX_SHOT_PITCH: f64 = 70.;

/// Everything an algorithm may use while mutating, besides the script.
pub struct MutationCtx<'a> {
    pub rng: &'a mut OptimRng,
    /// The current best run, for efficacy baselines and telemetry-derived
    /// bounds.
    pub best: &'a OptimizerRun,
    /// Length of the optimization window in frames.
    pub last_frame: u32,
}

/// A mutation strategy driven by the optimizer.
pub trait OptimizerAlgorithm {
    /// Proposes an in-place edit of `script` for the next iteration.
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>);

    /// Receives the efficacy of the iteration this algorithm mutated.
    fn report_result(&mut self, _efficacy: f64) {}

    /// Clears internal state.
    fn reset(&mut self);

    /// Whether the algorithm could do something useful on this script.
    fn wants_to_run(&self, _script: &TasScript) -> bool {
        true
    }

    /// Whether the algorithm has unfinished multi-iteration work and must be
    /// scheduled again next iteration.
    fn wants_to_continue(&self) -> bool;

    /// How many iterations the algorithm expects to run; used as its
    /// scheduling weight.
    fn iterations_expected(&self) -> u32 {
        1
    }
}

/// Which algorithms to instantiate, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    TurnOptimizer,
    RngStrafer,
    RngBlockMover,
    RngShooter,
    StrafeAdjuster,
    FrameBlockMover,
}

pub fn init_algorithms(kinds: &[Algorithm]) -> Vec<Box<dyn OptimizerAlgorithm>> {
    kinds
        .iter()
        .map(|kind| -> Box<dyn OptimizerAlgorithm> {
            match kind {
                Algorithm::TurnOptimizer => Box::<TurnOptimizer>::default(),
                Algorithm::RngStrafer => Box::new(RngStrafer),
                Algorithm::RngBlockMover => Box::new(RngBlockMover),
                Algorithm::RngShooter => Box::new(RngShooter),
                Algorithm::StrafeAdjuster => Box::<StrafeAdjuster>::default(),
                Algorithm::FrameBlockMover => Box::<FrameBlockMover>::default(),
            }
        })
        .collect()
}

/// Normalized prefix sums of the algorithm weights, for sampling with one
/// uniform draw.
pub fn compounding_probs(algorithms: &[Box<dyn OptimizerAlgorithm>]) -> Vec<f64> {
    let total: f64 = algorithms
        .iter()
        .map(|algorithm| f64::from(algorithm.iterations_expected()))
        .sum();
    let mut acc = 0.;
    algorithms
        .iter()
        .map(|algorithm| {
            acc += f64::from(algorithm.iterations_expected()) / total;
            acc
        })
        .collect()
}

/// Index of the first prefix sum at or above `value`.
pub fn select_index(value: f64, compounding_probs: &[f64]) -> usize {
    compounding_probs
        .iter()
        .position(|&prob| value <= prob)
        .unwrap_or(compounding_probs.len().saturating_sub(1))
}

fn strafe_yaw_blocks(script: &TasScript) -> Vec<usize> {
    script
        .blocks
        .iter()
        .enumerate()
        .filter(|(_, block)| block.has_convar(TAS_STRAFE_YAW))
        .map(|(i, _)| i)
        .collect()
}

/// Binary-searches the yaw of a turn between two consecutive strafe blocks.
#[derive(Default)]
pub struct TurnOptimizer {
    turn_index: Option<usize>,
    searcher: BinSearcher,
}

impl TurnOptimizer {
    fn turn_pairs(script: &TasScript) -> Vec<usize> {
        script
            .blocks
            .iter()
            .enumerate()
            .tuple_windows()
            .filter(|((_, a), (_, b))| {
                a.has_convar(TAS_STRAFE_YAW) && b.has_convar(TAS_STRAFE_YAW)
            })
            .map(|((i, _), _)| i)
            .collect()
    }

    fn init_search(&mut self, script: &TasScript, ctx: &mut MutationCtx<'_>) -> bool {
        let candidates = Self::turn_pairs(script);
        if candidates.is_empty() {
            return false;
        }

        let strafe_index = candidates[ctx.rng.random_index(candidates.len())];
        let turn_index = strafe_index + 1;
        let orig_yaw = script.blocks[turn_index]
            .convars
            .get(TAS_STRAFE_YAW)
            .copied()
            .unwrap_or(0.);

        let (min, max) = ctx.best.strafe_bounds(turn_index);
        let bound = if ctx.rng.random(0., 1.) < 0.5 {
            f64::from(max)
        } else {
            f64::from(min)
        };

        self.searcher.init(
            f64::from(orig_yaw),
            ctx.best.run_efficacy(),
            f64::from(orig_yaw) + bound,
            TURN_EPSILON,
        );
        self.turn_index = Some(turn_index);
        true
    }
}

impl OptimizerAlgorithm for TurnOptimizer {
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>) {
        if !self.searcher.in_progress() && !self.init_search(script, ctx) {
            return;
        }

        let Some(block) = self.turn_index.and_then(|i| script.blocks.get_mut(i)) else {
            self.reset();
            return;
        };
        block.convars.insert(TAS_STRAFE_YAW, self.searcher.value() as f32);
    }

    fn report_result(&mut self, efficacy: f64) {
        if !self.searcher.in_progress() {
            return;
        }
        self.searcher.report(efficacy);
        if self.searcher.is_finished() {
            self.reset();
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn wants_to_run(&self, script: &TasScript) -> bool {
        !Self::turn_pairs(script).is_empty()
    }

    fn wants_to_continue(&self) -> bool {
        self.searcher.in_progress()
    }
}

/// Randomly perturbs an existing strafe yaw or drops in a fresh strafe block.
pub struct RngStrafer;

impl OptimizerAlgorithm for RngStrafer {
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>) {
        let candidates = strafe_yaw_blocks(script);

        if !candidates.is_empty() && ctx.rng.random(0., 1.) < 0.5 {
            let index = candidates[ctx.rng.random_index(candidates.len())];
            let block = &mut script.blocks[index];
            let yaw = block.convars.get(TAS_STRAFE_YAW).copied().unwrap_or(0.);
            let perturbed = f64::from(yaw) + ctx.rng.random(-MAX_YAW_PERTURB, MAX_YAW_PERTURB);
            block.convars.insert(TAS_STRAFE_YAW, perturbed as f32);
        } else if ctx.last_frame > 0 {
            let frame = ctx.rng.random_int(1, ctx.last_frame as i32);
            let yaw = ctx.rng.random(0., 360.) as f32;
            script.add_cvar(TAS_STRAFE_YAW, yaw, frame);
        }
    }

    fn reset(&mut self) {}

    fn wants_to_run(&self, script: &TasScript) -> bool {
        !script.blocks.is_empty()
    }

    fn wants_to_continue(&self) -> bool {
        false
    }
}

/// Randomly shifts one block within the gap between its neighbours.
pub struct RngBlockMover;

impl OptimizerAlgorithm for RngBlockMover {
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>) {
        if script.blocks.len() < 2 {
            return;
        }

        // The head block carries the stacked baseline state and stays put.
        let index = 1 + ctx.rng.random_index(script.blocks.len() - 1);
        let mut delta = ctx.rng.random_int(1, MAX_BLOCK_SHIFT);
        if ctx.rng.random(0., 1.) < 0.5 {
            delta = -delta;
        }
        script.shift_single_block(index, delta);
    }

    fn reset(&mut self) {}

    fn wants_to_run(&self, script: &TasScript) -> bool {
        script.blocks.len() >= 2
    }

    fn wants_to_continue(&self) -> bool {
        false
    }
}

/// Inserts a randomly aimed shot, as long as the script fires at all.
pub struct RngShooter;

impl RngShooter {
    fn has_firing_block(script: &TasScript) -> bool {
        script.blocks.iter().any(|block| {
            block.has_toggle("attack")
                || block.commands.iter().any(|command| command.contains("impulse"))
        })
    }
}

impl OptimizerAlgorithm for RngShooter {
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>) {
        if !Self::has_firing_block(script) || ctx.last_frame == 0 {
            return;
        }

        let frame = ctx.rng.random_int(1, ctx.last_frame as i32);
        let pitch = ctx.rng.random(-MAX_SHOT_PITCH, MAX_SHOT_PITCH) as f32;
        let yaw = ctx.rng.random(0., 360.) as f32;
        script.add_shot(pitch, yaw, frame, SHOT_TURN_FRAMES);
    }

    fn reset(&mut self) {}

    fn wants_to_run(&self, script: &TasScript) -> bool {
        Self::has_firing_block(script)
    }

    fn wants_to_continue(&self) -> bool {
        false
    }
}

/// Rolls a [`RollingStone`] along one block's strafe yaw.
#[derive(Default)]
pub struct StrafeAdjuster {
    block_index: Option<usize>,
    stone: RollingStone,
}

impl OptimizerAlgorithm for StrafeAdjuster {
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>) {
        if self.block_index.is_none() {
            let candidates = strafe_yaw_blocks(script);
            if candidates.is_empty() {
                return;
            }

            let index = candidates[ctx.rng.random_index(candidates.len())];
            let yaw = script.blocks[index]
                .convars
                .get(TAS_STRAFE_YAW)
                .copied()
                .unwrap_or(0.);

            let mut delta = ctx.rng.random(STRAFE_DELTA_MIN, STRAFE_DELTA_MAX);
            if ctx.rng.random(0., 1.) < 0.5 {
                delta = -delta;
            }

            self.stone
                .init(ctx.best.run_efficacy(), f64::from(yaw) + delta, delta, 360.);
            self.block_index = Some(index);
        }

        let Some(block) = self.block_index.and_then(|i| script.blocks.get_mut(i)) else {
            self.reset();
            return;
        };
        block
            .convars
            .insert(TAS_STRAFE_YAW, self.stone.current_value as f32);
    }

    fn report_result(&mut self, efficacy: f64) {
        if self.block_index.is_none() {
            return;
        }
        if self.stone.should_continue(efficacy) {
            self.stone.next_value(efficacy);
        } else {
            self.reset();
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn wants_to_run(&self, script: &TasScript) -> bool {
        !strafe_yaw_blocks(script).is_empty()
    }

    fn wants_to_continue(&self) -> bool {
        self.block_index.is_some()
    }
}

/// Rolls a [`RollingStone`] along one block's frame index.
#[derive(Default)]
pub struct FrameBlockMover {
    block_index: Option<usize>,
    stone: RollingStone,
}

impl OptimizerAlgorithm for FrameBlockMover {
    fn mutate(&mut self, script: &mut TasScript, ctx: &mut MutationCtx<'_>) {
        if self.block_index.is_none() {
            if script.blocks.len() < 2 {
                return;
            }

            let index = 1 + ctx.rng.random_index(script.blocks.len() - 1);
            let frame = script.blocks[index].frame;

            let mut delta = ctx.rng.random_int(1, MOVER_START_DELTA);
            if ctx.rng.random(0., 1.) < 0.5 {
                delta = -delta;
            }

            self.stone.init(
                ctx.best.run_efficacy(),
                f64::from(frame + delta),
                f64::from(delta),
                f64::from(ctx.last_frame),
            );
            self.block_index = Some(index);
        }

        let Some(index) = self.block_index else {
            return;
        };
        let Some(frame) = script.blocks.get(index).map(|block| block.frame) else {
            self.reset();
            return;
        };

        let target = self.stone.current_value.round() as i32;
        if !script.shift_single_block(index, target - frame) {
            self.reset();
        }
    }

    fn report_result(&mut self, efficacy: f64) {
        if self.block_index.is_none() {
            return;
        }
        if self.stone.should_continue(efficacy) {
            self.stone.next_value(efficacy);
        } else {
            self.reset();
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn wants_to_run(&self, script: &TasScript) -> bool {
        script.blocks.len() >= 2
    }

    fn wants_to_continue(&self) -> bool {
        self.block_index.is_some()
    }
}
