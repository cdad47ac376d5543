//! The iterative script optimizer.
//!
//! A session owns the working script, the current best run, the RNG and the
//! mutation algorithms. The caller drives it from the outside: play the
//! working script through the simulator, feed every frame to
//! [`Optimizer::on_runner_frame`], and act on the returned state: keep
//! simulating, restart with the freshly mutated script, or stop.

use std::fmt;
use std::io::{Read, Write};

use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub mod algorithms;
pub use algorithms::{Algorithm, MutationCtx, OptimizerAlgorithm};

pub mod run;
pub use run::{
    auto_goal, convert_efficacy_to_time, convert_time_to_efficacy, ExtendedFrameData, FrameData,
    OptimizerRun, RunConditions, INVALID_VEL_THETA, NEVER_TELEPORTED,
};

pub mod search;
pub use search::{BinSearcher, CliffFinder, RollingStone};

use crate::script::{FrameBlock, PlaybackInfo};

/// Seed used until the caller provides one.
const DEFAULT_SEED: u32 = 0;

/// What the caller should do after feeding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    /// Keep simulating the current iteration.
    ContinueIteration,
    /// The iteration ended; replay the (mutated) working script from the top.
    NewIteration,
    /// The search ran out of progress; discard the session.
    Stop,
}

/// What the search is trying to maximize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerGoal {
    /// Resolved from the first run's movement direction.
    #[default]
    Undetermined,
    PlusX,
    NegX,
    PlusY,
    NegY,
    Time,
    PlusZ,
    NegZ,
    Kills,
    Teleporter,
}

impl fmt::Display for OptimizerGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerGoal::Undetermined => "Undetermined",
            OptimizerGoal::PlusX => "+X",
            OptimizerGoal::NegX => "-X",
            OptimizerGoal::PlusY => "+Y",
            OptimizerGoal::NegY => "-Y",
            OptimizerGoal::Time => "Time",
            OptimizerGoal::PlusZ => "+Z",
            OptimizerGoal::NegZ => "-Z",
            OptimizerGoal::Kills => "Kills",
            OptimizerGoal::Teleporter => "Teleporter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("no mutation algorithms configured")]
    NoAlgorithms,
    #[error("optimization window resolved to {0} frames")]
    EmptyFrameWindow(i32),
}

/// Configuration for one search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub goal: OptimizerGoal,
    /// After this many iterations without progress the working script is
    /// reset to the current best.
    pub reset_to_best_iterations: u32,
    /// After this many iterations without progress the session stops.
    pub give_up_after_no_progress: u32,
    /// Frames trimmed from the script tail before optimizing.
    pub end_offset: i32,
    /// If positive, a fixed optimization window length overriding
    /// `end_offset`.
    pub frames: i32,
    /// Which algorithms to instantiate, in order.
    pub algorithms: Vec<Algorithm>,
    /// Baseline node path to enforce instead of sampling the first run.
    pub input_nodes: Vec<Vec3>,
    /// Require kills/secrets/center-prints/HP to match the first run.
    pub secondary_goals: bool,
    /// Require the path taken to match the first run.
    pub use_nodes: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            goal: OptimizerGoal::Undetermined,
            reset_to_best_iterations: 3,
            give_up_after_no_progress: 999,
            end_offset: 36,
            frames: -1,
            algorithms: Vec::new(),
            input_nodes: Vec::new(),
            secondary_goals: false,
            use_nodes: true,
        }
    }
}

impl OptimizerSettings {
    pub fn write_to_buffer<W: Write>(&self, writer: W) -> bincode::Result<()> {
        bincode::serialize_into(writer, self)
    }

    pub fn read_from_buffer<R: Read>(reader: R) -> bincode::Result<OptimizerSettings> {
        bincode::deserialize_from(reader)
    }
}

/// The driver's deterministic random source.
///
/// Every draw any part of the search makes goes through here, so a session
/// seeded the same way proposes the same scripts.
pub struct OptimRng(StdRng);

impl OptimRng {
    pub fn with_seed(seed: u32) -> Self {
        Self(StdRng::seed_from_u64(u64::from(seed)))
    }

    /// Uniform value in `[min, max)`.
    pub fn random(&mut self, min: f64, max: f64) -> f64 {
        if min >= max {
            return min;
        }
        self.0.gen_range(min..max)
    }

    /// Uniform value in `[min, max]`.
    pub fn random_int(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        self.0.gen_range(min..=max)
    }

    /// Uniform index into a collection of `len` elements.
    pub fn random_index(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.0.gen_range(0..len)
    }
}

/// One optimization session.
pub struct Optimizer {
    pub algorithms: Vec<Box<dyn OptimizerAlgorithm>>,
    /// The best run seen so far.
    pub current_best: OptimizerRun,
    /// The run being accumulated, holding the working script.
    pub current_run: OptimizerRun,
    pub settings: OptimizerSettings,
    rng: OptimRng,
    compounding_probs: Vec<f64>,
    current_algorithm: Option<usize>,
    /// Length of the optimization window in frames.
    pub last_frame: u32,
    pub iteration: u32,
    pub iterations_without_progress: u32,
    pub run_conditions: RunConditions,
}

impl Optimizer {
    /// Sets up a session from the full playback state; the optimized part is
    /// the script from the playback cursor onwards.
    pub fn new(
        playback: &PlaybackInfo,
        settings: OptimizerSettings,
    ) -> Result<Self, OptimizerError> {
        if settings.algorithms.is_empty() {
            return Err(OptimizerError::NoAlgorithms);
        }

        let mut shifted = playback.time_shifted(None);
        let window = if settings.frames > 0 {
            settings.frames
        } else {
            shifted.last_frame() - settings.end_offset
        };
        if window <= 0 {
            return Err(OptimizerError::EmptyFrameWindow(window));
        }
        shifted.current_script.remove_blocks_after_frame(window);

        let algorithms = algorithms::init_algorithms(&settings.algorithms);
        let compounding_probs = algorithms::compounding_probs(&algorithms);

        let current_run = OptimizerRun {
            playback_info: shifted,
            ..OptimizerRun::default()
        };
        let current_best = current_run.clone();

        info!(
            goal = %settings.goal,
            window,
            algorithms = algorithms.len(),
            "optimizer session initialized"
        );

        Ok(Self {
            algorithms,
            current_best,
            current_run,
            settings,
            rng: OptimRng::with_seed(DEFAULT_SEED),
            compounding_probs,
            current_algorithm: None,
            last_frame: window as u32,
            iteration: 0,
            iterations_without_progress: 0,
            run_conditions: RunConditions::default(),
        })
    }

    /// Reseeds the session's random source.
    pub fn seed(&mut self, value: u32) {
        self.rng = OptimRng::with_seed(value);
    }

    pub fn random(&mut self, min: f64, max: f64) -> f64 {
        self.rng.random(min, max)
    }

    pub fn random_int(&mut self, min: i32, max: i32) -> i32 {
        self.rng.random_int(min, max)
    }

    /// Uniform index into the working script's blocks.
    pub fn randomize_index(&mut self) -> usize {
        let len = self.current_run.playback_info.current_script.blocks.len();
        self.rng.random_index(len)
    }

    /// The working script's block for the frame about to be simulated, if
    /// that exact frame has one.
    pub fn current_frame_block(&self) -> Option<&FrameBlock> {
        let frame = self.current_run.frames.len() as i32;
        self.current_run.playback_info.current_script.get_block(frame)
    }

    /// Accumulates one simulated frame and decides whether the iteration
    /// goes on.
    pub fn on_runner_frame(&mut self, data: &ExtendedFrameData) -> OptimizerState {
        let run = &mut self.current_run;
        run.frames.push(data.frame_data);
        run.health = data.health;
        run.armor = data.armor;
        run.kills = data.kills;
        run.secrets = data.secrets;
        run.center_prints = data.center_prints;

        if data.teleported && run.teleport_time == NEVER_TELEPORTED {
            run.teleport_time = data.time;
        }

        let mut state = OptimizerState::ContinueIteration;
        if data.died {
            run.died = true;
            self.finish_iteration(&mut state);
        } else if data.intermission {
            run.finished_level = true;
            run.level_time = data.time;
            self.finish_iteration(&mut state);
        } else if run.frames.len() as u32 > self.last_frame {
            self.finish_iteration(&mut state);
        }

        state
    }

    fn finish_iteration(&mut self, state: &mut OptimizerState) {
        *state = OptimizerState::NewIteration;

        if self.settings.goal == OptimizerGoal::Undetermined {
            self.settings.goal = self.current_run.auto_goal();
            debug!(goal = %self.settings.goal, "resolved goal from the first run");
        }

        let conditions = (self.settings.secondary_goals || self.settings.use_nodes)
            .then_some(&self.run_conditions);
        self.current_run
            .calculate_efficacy(self.settings.goal, conditions);
        self.iteration += 1;

        if self.current_run.is_better_than(&self.current_best) {
            self.current_best = self.current_run.clone();
            self.iterations_without_progress = 0;
            if !self.run_conditions.initialized {
                self.run_conditions.init(&self.current_best, &self.settings);
            }
            debug!(
                iteration = self.iteration,
                efficacy = self.current_best.efficacy,
                "new best run"
            );
        } else {
            self.iterations_without_progress += 1;
        }

        if let Some(index) = self.current_algorithm {
            self.algorithms[index].report_result(self.current_run.efficacy);
        }

        if self.iterations_without_progress >= self.settings.reset_to_best_iterations {
            self.current_run.playback_info = self.current_best.playback_info.clone();
            for algorithm in &mut self.algorithms {
                algorithm.reset();
            }
        }

        if self.iterations_without_progress >= self.settings.give_up_after_no_progress {
            info!(
                iteration = self.iteration,
                efficacy = self.current_best.efficacy,
                "no progress, giving up"
            );
            *state = OptimizerState::Stop;
            return;
        }

        self.reset_iteration();
    }

    /// Prepares the next iteration: clears the accumulated run, picks an
    /// algorithm and lets it mutate the working script.
    fn reset_iteration(&mut self) {
        self.current_run.reset_iteration();

        let index = self.select_algorithm();
        self.current_algorithm = Some(index);

        let algorithm = &mut self.algorithms[index];
        let mut ctx = MutationCtx {
            rng: &mut self.rng,
            best: &self.current_best,
            last_frame: self.last_frame,
        };
        algorithm.mutate(&mut self.current_run.playback_info.current_script, &mut ctx);
    }

    /// Weighted draw over the algorithms, except that unfinished
    /// multi-iteration work always continues first.
    fn select_algorithm(&mut self) -> usize {
        if let Some(index) = self
            .algorithms
            .iter()
            .position(|algorithm| algorithm.wants_to_continue())
        {
            return index;
        }

        let draw = self.rng.random(0., 1.);
        let mut index = algorithms::select_index(draw, &self.compounding_probs);

        let script = &self.current_run.playback_info.current_script;
        for _ in 0..self.algorithms.len() {
            if self.algorithms[index].wants_to_run(script) {
                break;
            }
            index = (index + 1) % self.algorithms.len();
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{TasScript, TAS_STRAFE, TAS_STRAFE_YAW};

    fn baseline_playback() -> PlaybackInfo {
        let mut script = TasScript::default();
        script.add_cvar(TAS_STRAFE, 1., 0);
        script.add_cvar(TAS_STRAFE_YAW, 0., 0);
        script.add_cvar(TAS_STRAFE_YAW, 90., 100);
        PlaybackInfo::with_script(script)
    }

    fn basic_settings() -> OptimizerSettings {
        OptimizerSettings {
            frames: 10,
            use_nodes: false,
            algorithms: vec![Algorithm::RngStrafer],
            ..OptimizerSettings::default()
        }
    }

    fn frame_at(x: f32) -> ExtendedFrameData {
        ExtendedFrameData {
            frame_data: FrameData {
                pos: Vec3::new(x, 0., 0.),
                vel_theta: 0.,
            },
            ..ExtendedFrameData::default()
        }
    }

    /// Plays one iteration where the player walks `step` units of +X per
    /// frame.
    fn play_iteration(optimizer: &mut Optimizer, step: f32) -> OptimizerState {
        let mut x = 0.;
        loop {
            x += step;
            match optimizer.on_runner_frame(&frame_at(x)) {
                OptimizerState::ContinueIteration => {}
                state => return state,
            }
        }
    }

    #[test]
    fn init_rejects_bad_configurations() {
        let playback = baseline_playback();

        let no_algorithms = OptimizerSettings {
            frames: 10,
            ..OptimizerSettings::default()
        };
        assert!(matches!(
            Optimizer::new(&playback, no_algorithms),
            Err(OptimizerError::NoAlgorithms)
        ));

        let empty_window = OptimizerSettings {
            end_offset: 500,
            algorithms: vec![Algorithm::RngStrafer],
            ..OptimizerSettings::default()
        };
        assert!(matches!(
            Optimizer::new(&playback, empty_window),
            Err(OptimizerError::EmptyFrameWindow(_))
        ));
    }

    #[test]
    fn window_trims_the_script_tail() {
        let playback = baseline_playback();
        let settings = OptimizerSettings {
            end_offset: 36,
            algorithms: vec![Algorithm::RngStrafer],
            ..OptimizerSettings::default()
        };
        let optimizer = Optimizer::new(&playback, settings).unwrap();

        assert_eq!(optimizer.last_frame, 64);
        // The block at frame 100 is beyond the window.
        assert_eq!(
            optimizer.current_run.playback_info.current_script.blocks.len(),
            1
        );
    }

    #[test]
    fn first_run_resolves_the_goal_and_becomes_best() {
        let playback = baseline_playback();
        let mut optimizer = Optimizer::new(&playback, basic_settings()).unwrap();

        assert_eq!(play_iteration(&mut optimizer, 1.), OptimizerState::NewIteration);
        assert_eq!(optimizer.settings.goal, OptimizerGoal::PlusX);
        assert_eq!(optimizer.iteration, 1);
        assert_eq!(optimizer.current_best.efficacy, 11.);
        assert_eq!(optimizer.current_best.frames.len(), 11);
    }

    #[test]
    fn fruitless_iterations_eventually_stop_the_session() {
        let playback = baseline_playback();
        let settings = OptimizerSettings {
            give_up_after_no_progress: 5,
            ..basic_settings()
        };
        let mut optimizer = Optimizer::new(&playback, settings).unwrap();
        optimizer.seed(1);

        assert_eq!(play_iteration(&mut optimizer, 1.), OptimizerState::NewIteration);
        let best = optimizer.current_best.efficacy;

        // Identical replays never beat the first one.
        let mut iterations = 0;
        loop {
            match play_iteration(&mut optimizer, 1.) {
                OptimizerState::NewIteration => iterations += 1,
                OptimizerState::Stop => break,
                OptimizerState::ContinueIteration => unreachable!(),
            }
            assert!(iterations < 16, "session failed to give up");
        }
        assert_eq!(optimizer.current_best.efficacy, best);
        assert_eq!(optimizer.iterations_without_progress, 5);
    }

    #[test]
    fn improvements_reset_the_no_progress_counter() {
        let playback = baseline_playback();
        let mut optimizer = Optimizer::new(&playback, basic_settings()).unwrap();
        optimizer.seed(2);

        play_iteration(&mut optimizer, 1.);
        play_iteration(&mut optimizer, 0.5);
        assert_eq!(optimizer.iterations_without_progress, 1);
        play_iteration(&mut optimizer, 2.);
        assert_eq!(optimizer.iterations_without_progress, 0);
        assert_eq!(optimizer.current_best.efficacy, 22.);
    }

    #[test]
    fn rng_ranges_are_respected() {
        let mut rng = OptimRng::with_seed(99);
        for _ in 0..1000 {
            let value = rng.random(-2., 3.);
            assert!((-2. ..3.).contains(&value));
            let int = rng.random_int(-4, 4);
            assert!((-4..=4).contains(&int));
            assert!(rng.random_index(5) < 5);
        }
        assert_eq!(rng.random_index(0), 0);
        assert_eq!(rng.random(1., 1.), 1.);
        assert_eq!(rng.random_int(7, 7), 7);
    }

    #[test]
    fn sessions_with_the_same_seed_are_identical() {
        let playback = baseline_playback();

        let run = |seed: u32| {
            let mut optimizer = Optimizer::new(&playback, basic_settings()).unwrap();
            optimizer.seed(seed);
            for _ in 0..50 {
                if play_iteration(&mut optimizer, 1.) == OptimizerState::Stop {
                    break;
                }
            }
            (
                optimizer.current_best.clone(),
                optimizer
                    .current_run
                    .playback_info
                    .current_script
                    .to_text(),
            )
        };

        let (best_a, script_a) = run(7);
        let (best_b, script_b) = run(7);
        assert_eq!(best_a, best_b);
        assert_eq!(script_a, script_b);

        let (_, script_c) = run(8);
        assert_ne!(script_a, script_c);
    }

    #[test]
    fn current_frame_block_tracks_the_cursor() {
        let playback = baseline_playback();
        let optimizer = Optimizer::new(&playback, basic_settings()).unwrap();
        // No frames simulated yet: the cursor is at frame 0, which has the
        // stacked head block.
        assert!(optimizer.current_frame_block().is_some());
    }
}
