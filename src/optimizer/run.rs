//! Per-frame telemetry and run scoring.

use std::io::{Read, Write};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{OptimizerGoal, OptimizerSettings};
use crate::script::{PlaybackInfo, TAS_STRAFE_YAW};
use crate::utils::normalize_deg;

/// Sentinel for [`FrameData::vel_theta`] meaning the player had no
/// horizontal velocity that frame.
pub const INVALID_VEL_THETA: f64 = 999.;

/// Teleport time recorded in a run that never touched a teleporter.
pub const NEVER_TELEPORTED: f64 = 1000.;

/// Widest yaw adjustment ever proposed around an existing strafe angle, in
/// degrees to either side.
const MAX_STRAFE_BOUND: f32 = 90.;

/// Efficacy weight of one kill; ties break on how early the run ended.
const KILL_WEIGHT: f64 = 1e6;

/// Every how many frames a node is sampled from the baseline path.
const NODE_INTERVAL: usize = 36;

/// How close a run must pass to a node to count as visiting it.
const NODE_RADIUS: f32 = 50.;

/// One frame of player telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    pub pos: Vec3,
    /// Horizontal velocity angle in radians, [`INVALID_VEL_THETA`] when the
    /// player is not moving.
    pub vel_theta: f64,
}

impl Default for FrameData {
    fn default() -> Self {
        Self {
            pos: Vec3::ZERO,
            vel_theta: INVALID_VEL_THETA,
        }
    }
}

impl FrameData {
    /// Narrows `[min, max]` to the smallest yaw adjustments, to either side
    /// of `strafe_yaw`, that would cross this frame's velocity direction.
    pub fn smallest_strafe_yaw_increments(&self, strafe_yaw: f32, min: &mut f32, max: &mut f32) {
        if self.vel_theta == INVALID_VEL_THETA {
            return;
        }

        let delta = normalize_deg(self.vel_theta.to_degrees() - f64::from(strafe_yaw)) as f32;
        if delta > 0. && delta < *max {
            *max = delta;
        }
        if delta < 0. && delta > *min {
            *min = delta;
        }
    }
}

/// Everything the simulator reports about one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtendedFrameData {
    pub frame_data: FrameData,
    pub health: f32,
    pub armor: f32,
    /// Simulation time in seconds.
    pub time: f64,
    pub died: bool,
    pub intermission: bool,
    pub teleported: bool,
    /// Cumulative counters as of this frame.
    pub kills: u32,
    pub secrets: u32,
    pub center_prints: u32,
}

impl Default for ExtendedFrameData {
    fn default() -> Self {
        Self {
            frame_data: FrameData::default(),
            health: 100.,
            armor: 0.,
            time: 0.,
            died: false,
            intermission: false,
            teleported: false,
            kills: 0,
            secrets: 0,
            center_prints: 0,
        }
    }
}

/// One attempted playthrough of the working script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRun {
    /// Score of this run, higher is better.
    pub efficacy: f64,
    /// The script that produced this run.
    pub playback_info: PlaybackInfo,
    pub finished_level: bool,
    pub died: bool,
    pub level_time: f64,
    pub teleport_time: f64,
    pub frames: Vec<FrameData>,
    pub kills: u32,
    pub secrets: u32,
    pub center_prints: u32,
    pub health: f32,
    pub armor: f32,
}

impl Default for OptimizerRun {
    fn default() -> Self {
        Self {
            efficacy: f64::MIN,
            playback_info: PlaybackInfo::default(),
            finished_level: false,
            died: false,
            level_time: 0.,
            teleport_time: NEVER_TELEPORTED,
            frames: Vec::new(),
            kills: 0,
            secrets: 0,
            center_prints: 0,
            health: 100.,
            armor: 0.,
        }
    }
}

impl OptimizerRun {
    /// Clears everything the previous iteration accumulated, keeping the
    /// working script.
    pub fn reset_iteration(&mut self) {
        self.efficacy = f64::MIN;
        self.finished_level = false;
        self.died = false;
        self.level_time = 0.;
        self.teleport_time = NEVER_TELEPORTED;
        self.frames.clear();
        self.kills = 0;
        self.secrets = 0;
        self.center_prints = 0;
        self.health = 100.;
        self.armor = 0.;
    }

    /// Scores the run under `goal`. A run that violates the captured
    /// conditions gets the sentinel-low efficacy.
    pub fn calculate_efficacy(&mut self, goal: OptimizerGoal, conditions: Option<&RunConditions>) {
        if let Some(conditions) = conditions {
            if !conditions.fulfills(self) {
                self.efficacy = f64::MIN;
                return;
            }
        }

        let Some(last) = self.frames.last() else {
            self.efficacy = f64::MIN;
            return;
        };

        self.efficacy = match goal {
            OptimizerGoal::PlusX => f64::from(last.pos.x),
            OptimizerGoal::NegX => f64::from(-last.pos.x),
            OptimizerGoal::PlusY => f64::from(last.pos.y),
            OptimizerGoal::NegY => f64::from(-last.pos.y),
            OptimizerGoal::PlusZ => f64::from(last.pos.z),
            OptimizerGoal::NegZ => f64::from(-last.pos.z),
            OptimizerGoal::Time => {
                if self.finished_level {
                    convert_time_to_efficacy(self.level_time)
                } else {
                    f64::MIN
                }
            }
            OptimizerGoal::Kills => f64::from(self.kills) * KILL_WEIGHT - self.frames.len() as f64,
            OptimizerGoal::Teleporter => -self.teleport_time,
            OptimizerGoal::Undetermined => f64::MIN,
        };
    }

    pub fn run_efficacy(&self) -> f64 {
        self.efficacy
    }

    pub fn is_better_than(&self, run: &OptimizerRun) -> bool {
        self.efficacy > run.efficacy
    }

    /// Picks the goal from the direction the run was moving at its end.
    pub fn auto_goal(&self) -> OptimizerGoal {
        let count = self.frames.len();
        if count < 2 {
            return OptimizerGoal::Undetermined;
        }
        auto_goal(self.frames[count - 2].pos, self.frames[count - 1].pos)
    }

    /// Yaw adjustment bounds for the strafe convar of `block_index`, derived
    /// from the velocity angles observed while that block was active.
    pub fn strafe_bounds(&self, block_index: usize) -> (f32, f32) {
        let mut min = -MAX_STRAFE_BOUND;
        let mut max = MAX_STRAFE_BOUND;

        let script = &self.playback_info.current_script;
        let Some(block) = script.blocks.get(block_index) else {
            return (min, max);
        };
        let yaw = block.convars.get(TAS_STRAFE_YAW).copied().unwrap_or(0.);

        let start = block.frame.max(0) as usize;
        let end = script
            .blocks
            .get(block_index + 1)
            .map_or(self.frames.len(), |next| next.frame.max(0) as usize);

        for frame in self.frames.iter().take(end).skip(start) {
            frame.smallest_strafe_yaw_increments(yaw, &mut min, &mut max);
        }

        (min, max)
    }

    pub fn write_to_buffer<W: Write>(&self, writer: W) -> bincode::Result<()> {
        bincode::serialize_into(writer, self)
    }

    pub fn read_from_buffer<R: Read>(reader: R) -> bincode::Result<OptimizerRun> {
        bincode::deserialize_from(reader)
    }
}

/// Thresholds captured from the first finished run, which later runs must
/// meet to stay valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConditions {
    pub initialized: bool,
    /// Positions the run must pass, in order.
    pub nodes: Vec<Vec3>,
    pub kills: u32,
    pub secrets: u32,
    pub center_prints: u32,
    pub total_hp: f32,
}

impl RunConditions {
    pub fn init(&mut self, run: &OptimizerRun, settings: &OptimizerSettings) {
        self.nodes.clear();
        if settings.use_nodes {
            if settings.input_nodes.is_empty() {
                self.nodes = run
                    .frames
                    .iter()
                    .step_by(NODE_INTERVAL)
                    .map(|frame| frame.pos)
                    .collect();
            } else {
                self.nodes = settings.input_nodes.clone();
            }
        }

        if settings.secondary_goals {
            self.kills = run.kills;
            self.secrets = run.secrets;
            self.center_prints = run.center_prints;
            self.total_hp = run.health + run.armor;
        } else {
            self.kills = 0;
            self.secrets = 0;
            self.center_prints = 0;
            self.total_hp = 0.;
        }

        self.initialized = true;
    }

    pub fn fulfills(&self, run: &OptimizerRun) -> bool {
        if !self.initialized {
            return true;
        }

        let mut next_node = 0;
        for frame in &run.frames {
            if next_node == self.nodes.len() {
                break;
            }
            if frame.pos.distance(self.nodes[next_node]) <= NODE_RADIUS {
                next_node += 1;
            }
        }
        if next_node != self.nodes.len() {
            return false;
        }

        run.kills >= self.kills
            && run.secrets >= self.secrets
            && run.center_prints >= self.center_prints
            && run.health + run.armor >= self.total_hp
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Goal implied by the movement between the last two sampled positions: the
/// axis with the largest absolute change, signed by its direction.
pub fn auto_goal(second_last: Vec3, last: Vec3) -> OptimizerGoal {
    let diff = last - second_last;
    let abs = diff.abs();

    if abs == Vec3::ZERO {
        OptimizerGoal::Undetermined
    } else if abs.x >= abs.y && abs.x >= abs.z {
        if diff.x > 0. {
            OptimizerGoal::PlusX
        } else {
            OptimizerGoal::NegX
        }
    } else if abs.y >= abs.z {
        if diff.y > 0. {
            OptimizerGoal::PlusY
        } else {
            OptimizerGoal::NegY
        }
    } else if diff.z > 0. {
        OptimizerGoal::PlusZ
    } else {
        OptimizerGoal::NegZ
    }
}

/// Level time mapped so that a faster run scores higher.
pub fn convert_time_to_efficacy(time: f64) -> f64 {
    -time
}

pub fn convert_efficacy_to_time(efficacy: f64) -> f64 {
    -efficacy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::TasScript;

    fn run_with_path(positions: &[Vec3]) -> OptimizerRun {
        let mut run = OptimizerRun::default();
        run.frames = positions
            .iter()
            .map(|&pos| FrameData {
                pos,
                vel_theta: INVALID_VEL_THETA,
            })
            .collect();
        run
    }

    #[test]
    fn auto_goal_picks_the_dominant_axis() {
        assert_eq!(
            auto_goal(Vec3::ZERO, Vec3::new(3., -5., 0.)),
            OptimizerGoal::NegY
        );
        assert_eq!(
            auto_goal(Vec3::ZERO, Vec3::new(10., 0., 0.)),
            OptimizerGoal::PlusX
        );
        assert_eq!(auto_goal(Vec3::ZERO, Vec3::ZERO), OptimizerGoal::Undetermined);
        assert_eq!(
            auto_goal(Vec3::new(0., 0., 5.), Vec3::new(1., 0., -5.)),
            OptimizerGoal::NegZ
        );
    }

    #[test]
    fn axis_goals_score_the_final_position() {
        let mut run = run_with_path(&[Vec3::ZERO, Vec3::new(4., -7., 2.)]);
        run.calculate_efficacy(OptimizerGoal::PlusY, None);
        assert_eq!(run.efficacy, -7.);
        run.calculate_efficacy(OptimizerGoal::NegY, None);
        assert_eq!(run.efficacy, 7.);
    }

    #[test]
    fn time_goal_requires_a_finished_level() {
        let mut run = run_with_path(&[Vec3::ZERO]);
        run.level_time = 12.5;
        run.calculate_efficacy(OptimizerGoal::Time, None);
        assert_eq!(run.efficacy, f64::MIN);

        run.finished_level = true;
        run.calculate_efficacy(OptimizerGoal::Time, None);
        assert_eq!(run.efficacy, convert_time_to_efficacy(12.5));
        assert_eq!(convert_efficacy_to_time(run.efficacy), 12.5);
    }

    #[test]
    fn kills_goal_breaks_ties_by_run_length() {
        let mut short = run_with_path(&[Vec3::ZERO, Vec3::ZERO]);
        short.kills = 2;
        short.calculate_efficacy(OptimizerGoal::Kills, None);

        let mut long = run_with_path(&[Vec3::ZERO, Vec3::ZERO, Vec3::ZERO]);
        long.kills = 2;
        long.calculate_efficacy(OptimizerGoal::Kills, None);

        assert!(short.is_better_than(&long));

        long.kills = 3;
        long.calculate_efficacy(OptimizerGoal::Kills, None);
        assert!(long.is_better_than(&short));
    }

    #[test]
    fn teleporter_goal_prefers_earlier_touches() {
        let mut never = run_with_path(&[Vec3::ZERO]);
        never.calculate_efficacy(OptimizerGoal::Teleporter, None);

        let mut touched = run_with_path(&[Vec3::ZERO]);
        touched.teleport_time = 3.5;
        touched.calculate_efficacy(OptimizerGoal::Teleporter, None);

        assert!(touched.is_better_than(&never));
    }

    #[test]
    fn violated_conditions_force_the_sentinel() {
        let settings = OptimizerSettings {
            secondary_goals: true,
            use_nodes: false,
            ..OptimizerSettings::default()
        };

        let mut baseline = run_with_path(&[Vec3::ZERO, Vec3::new(5., 0., 0.)]);
        baseline.kills = 3;
        let mut conditions = RunConditions::default();
        conditions.init(&baseline, &settings);

        let mut worse = run_with_path(&[Vec3::ZERO, Vec3::new(100., 0., 0.)]);
        worse.kills = 2;
        worse.calculate_efficacy(OptimizerGoal::PlusX, Some(&conditions));
        assert_eq!(worse.efficacy, f64::MIN);

        worse.kills = 3;
        worse.calculate_efficacy(OptimizerGoal::PlusX, Some(&conditions));
        assert_eq!(worse.efficacy, 100.);
    }

    #[test]
    fn node_path_must_be_walked_in_order() {
        let settings = OptimizerSettings {
            use_nodes: true,
            ..OptimizerSettings::default()
        };

        // Long enough that sampling picks up several nodes.
        let baseline_path: Vec<Vec3> = (0..120).map(|i| Vec3::new(i as f32 * 10., 0., 0.)).collect();
        let baseline = run_with_path(&baseline_path);
        let mut conditions = RunConditions::default();
        conditions.init(&baseline, &settings);
        assert!(conditions.nodes.len() > 1);

        assert!(conditions.fulfills(&baseline));

        // A run that stops halfway misses the later nodes.
        let partial = run_with_path(&baseline_path[..40]);
        assert!(!conditions.fulfills(&partial));
    }

    #[test]
    fn strafe_bounds_narrow_towards_observed_velocity() {
        let mut script = TasScript::default();
        script.add_cvar(TAS_STRAFE_YAW, 0., 0);

        let mut run = OptimizerRun::default();
        run.playback_info.current_script = script;
        run.frames = vec![
            FrameData {
                pos: Vec3::ZERO,
                vel_theta: 30f64.to_radians(),
            },
            FrameData {
                pos: Vec3::ZERO,
                vel_theta: (-10f64).to_radians(),
            },
            FrameData::default(),
        ];

        let (min, max) = run.strafe_bounds(0);
        assert!((max - 30.).abs() < 1e-4);
        assert!((min + 10.).abs() < 1e-4);
    }

    #[test]
    fn run_buffer_round_trip() {
        let mut run = run_with_path(&[Vec3::ZERO, Vec3::new(1., 2., 3.)]);
        run.kills = 4;
        run.efficacy = 12.;

        let mut buffer = Vec::new();
        run.write_to_buffer(&mut buffer).unwrap();
        let back = OptimizerRun::read_from_buffer(&buffer[..]).unwrap();
        assert_eq!(run, back);
    }
}
