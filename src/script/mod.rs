//! The frame-indexed script model.
//!
//! A script is an ordered list of [`FrameBlock`]s, each carrying the convar
//! assignments, button toggles and console commands to apply at one frame.
//! Blocks are kept in strictly ascending frame order; every operation below
//! preserves that invariant.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use crate::ordered_map::OrderedMap;
use crate::utils::INVALID_ANGLE;

mod parse;
pub use parse::ScriptError;

pub mod playback;
pub use playback::PlaybackInfo;

mod test_block;
pub use test_block::{Hook, TestBlock, TestScript};

pub const TAS_STRAFE: &str = "tas_strafe";
pub const TAS_STRAFE_YAW: &str = "tas_strafe_yaw";
pub const TAS_VIEW_PITCH: &str = "tas_view_pitch";
pub const TAS_VIEW_YAW: &str = "tas_view_yaw";

/// Scripts shorter than this are scanned linearly on frame lookups.
const MAX_LINEAR_SEARCH_SIZE: usize = 16;

/// Everything to apply to the game at one specific frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameBlock {
    pub frame: i32,
    /// Convar assignments, in the order the script author wrote them.
    pub convars: OrderedMap<f32>,
    /// Button toggles, `true` meaning pressed.
    pub toggles: OrderedMap<bool>,
    /// Raw console commands.
    pub commands: Vec<String>,
    /// Whether this block has absorbed at least one script line.
    pub parsed: bool,
}

impl FrameBlock {
    pub fn at_frame(frame: i32) -> Self {
        Self {
            frame,
            parsed: true,
            ..Self::default()
        }
    }

    /// Overlays `new_block` on top of this one, later writes winning per key.
    pub fn stack(&mut self, new_block: &FrameBlock) {
        for (name, &state) in new_block.toggles.iter() {
            self.toggles.insert(name, state);
        }
        for (name, &value) in new_block.convars.iter() {
            self.convars.insert(name, value);
        }
    }

    /// Renders the block as a single semicolon-separated console command.
    pub fn command_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.convars.iter() {
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push(';');
        }
        for (name, &state) in self.toggles.iter() {
            out.push(if state { '+' } else { '-' });
            out.push_str(name);
            out.push(';');
        }
        for cmd in &self.commands {
            out.push_str(cmd);
            out.push(';');
        }
        out
    }

    pub fn add_command(&mut self, line: &str) {
        self.commands.push(line.to_owned());
    }

    pub fn has_convar(&self, name: &str) -> bool {
        self.convars.contains_key(name)
    }

    pub fn has_cvar_value(&self, name: &str, value: f32) -> bool {
        self.convars.get(name) == Some(&value)
    }

    pub fn has_toggle(&self, name: &str) -> bool {
        self.toggles.contains_key(name)
    }

    pub fn has_toggle_value(&self, name: &str, state: bool) -> bool {
        self.toggles.get(name) == Some(&state)
    }

    pub fn is_empty(&self) -> bool {
        self.convars.is_empty() && self.toggles.is_empty() && self.commands.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// An ordered sequence of [`FrameBlock`]s.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasScript {
    pub blocks: Vec<FrameBlock>,
    pub file_name: String,
    /// Index of the last frame lookup. Purely an acceleration hint for
    /// repeated nearby lookups; a stale value must never affect results.
    #[serde(skip)]
    prev_block_number: Cell<usize>,
}

impl PartialEq for TasScript {
    fn eq(&self, other: &Self) -> bool {
        self.blocks == other.blocks && self.file_name == other.file_name
    }
}

impl TasScript {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    /// Frame of the last block, or `0` for an empty script.
    pub fn last_frame(&self) -> i32 {
        self.blocks.last().map_or(0, |block| block.frame)
    }

    /// Returns the index of the first block whose frame is `>= frame`, or
    /// `blocks.len()` if there is none.
    ///
    /// Small scripts are scanned linearly. Larger ones first check whether
    /// the previous lookup still brackets the query and otherwise fall back
    /// to binary search; the hint is updated either way.
    pub fn block_index(&self, frame: i32) -> usize {
        let count = self.blocks.len();
        if count == 0 {
            return 0;
        }

        if count < MAX_LINEAR_SEARCH_SIZE {
            return self
                .blocks
                .iter()
                .position(|block| block.frame >= frame)
                .unwrap_or(count);
        }

        let hint = self.prev_block_number.get().min(count - 1);
        if self.blocks[hint].frame >= frame
            && (hint == 0 || self.blocks[hint - 1].frame < frame)
        {
            self.prev_block_number.set(hint);
            return hint;
        }

        let index = self.blocks.partition_point(|block| block.frame < frame);
        self.prev_block_number.set(index.min(count - 1));
        index
    }

    /// Returns the block at exactly `frame`, if any.
    pub fn get_block(&self, frame: i32) -> Option<&FrameBlock> {
        let index = self.block_index(frame);
        self.blocks.get(index).filter(|block| block.frame == frame)
    }

    /// Returns the block at `frame`, inserting an empty one in order if the
    /// frame has none yet.
    pub fn block_for_frame(&mut self, frame: i32) -> &mut FrameBlock {
        let index = self.block_index(frame);
        let exists = self
            .blocks
            .get(index)
            .map_or(false, |block| block.frame == frame);
        if !exists {
            self.blocks.insert(index, FrameBlock::at_frame(frame));
        }
        &mut self.blocks[index]
    }

    pub fn add_cvar(&mut self, name: &str, value: f32, frame: i32) {
        self.block_for_frame(frame).convars.insert(name, value);
    }

    pub fn add_toggle(&mut self, name: &str, state: bool, frame: i32) {
        self.block_for_frame(frame).toggles.insert(name, state);
    }

    pub fn add_command(&mut self, command: &str, frame: i32) {
        self.block_for_frame(frame).add_command(command);
    }

    /// Points the view at `pitch`/`yaw` over a short turn window starting at
    /// `frame` and releases the override at `frame + turn_frames`.
    ///
    /// Returns whether any block's contents changed.
    pub fn add_shot(&mut self, pitch: f32, yaw: f32, frame: i32, turn_frames: i32) -> bool {
        let wanted = [
            (frame, TAS_VIEW_PITCH, pitch),
            (frame, TAS_VIEW_YAW, yaw),
            (frame + turn_frames, TAS_VIEW_PITCH, INVALID_ANGLE),
            (frame + turn_frames, TAS_VIEW_YAW, INVALID_ANGLE),
        ];

        if wanted.iter().all(|&(at, name, value)| {
            self.get_block(at)
                .map_or(false, |block| block.has_cvar_value(name, value))
        }) {
            return false;
        }

        for (at, name, value) in wanted {
            self.add_cvar(name, value, at);
        }
        true
    }

    /// Removes a shot previously placed with [`TasScript::add_shot`].
    pub fn remove_shot(&mut self, frame: i32, turn_frames: i32) {
        self.remove_cvars_from_range(TAS_VIEW_PITCH, frame, frame + turn_frames);
        self.remove_cvars_from_range(TAS_VIEW_YAW, frame, frame + turn_frames);
    }

    /// Shifts `blocks[index..]` by `delta` frames.
    ///
    /// A negative delta is clamped so the shifted block lands one past its
    /// predecessor (or at frame 0 for the first block). Returns whether
    /// anything moved.
    pub fn shift_blocks(&mut self, index: usize, mut delta: i32) -> bool {
        let Some(block) = self.blocks.get(index) else {
            return false;
        };
        let current_frame = block.frame;

        if delta < 0 {
            let min_frame = if index == 0 {
                0
            } else {
                self.blocks[index - 1].frame + 1
            };
            delta = delta.max(min_frame - current_frame);
        }

        if delta == 0 {
            return false;
        }

        for block in &mut self.blocks[index..] {
            block.frame += delta;
        }
        true
    }

    /// Moves a single block by `delta` frames, clamped between its
    /// neighbours so the ordering invariant holds. Returns whether it moved.
    pub fn shift_single_block(&mut self, index: usize, delta: i32) -> bool {
        let Some(block) = self.blocks.get(index) else {
            return false;
        };
        let frame = block.frame;

        let min_frame = if index == 0 {
            0
        } else {
            self.blocks[index - 1].frame + 1
        };
        let mut target = (frame + delta).max(min_frame);
        if let Some(next) = self.blocks.get(index + 1) {
            target = target.min(next.frame - 1);
        }

        if target == frame || target < min_frame {
            return false;
        }

        self.blocks[index].frame = target;
        true
    }

    /// Removes empty blocks with frames in `[min_frame, max_frame]`.
    pub fn prune(&mut self, min_frame: i32, max_frame: i32) {
        self.blocks.retain(|block| {
            !(block.is_empty() && block.frame >= min_frame && block.frame <= max_frame)
        });
    }

    /// Removes empty blocks with frames `>= min_frame`.
    pub fn prune_from(&mut self, min_frame: i32) {
        self.blocks
            .retain(|block| !(block.is_empty() && block.frame >= min_frame));
    }

    pub fn remove_blocks_after_frame(&mut self, frame: i32) {
        self.blocks.retain(|block| block.frame <= frame);
    }

    pub fn remove_cvars_from_range(&mut self, name: &str, min_frame: i32, max_frame: i32) {
        for block in &mut self.blocks {
            if block.frame >= min_frame && block.frame <= max_frame {
                block.convars.remove(name);
            }
        }
    }

    pub fn remove_toggles_from_range(&mut self, name: &str, min_frame: i32, max_frame: i32) {
        for block in &mut self.blocks {
            if block.frame >= min_frame && block.frame <= max_frame {
                block.toggles.remove(name);
            }
        }
    }

    /// Replaces everything from `frame` on with `script`, rebasing the
    /// spliced blocks by `frame`.
    pub fn add_script(&mut self, script: &TasScript, frame: i32) {
        self.blocks.retain(|block| block.frame < frame);
        for block in &script.blocks {
            let mut block = block.clone();
            block.frame += frame;
            self.blocks.push(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_with_frames(frames: &[i32]) -> TasScript {
        let mut script = TasScript::default();
        for &frame in frames {
            let mut block = FrameBlock::at_frame(frame);
            block.convars.insert(TAS_STRAFE_YAW, frame as f32);
            script.blocks.push(block);
        }
        script
    }

    fn assert_ordered(script: &TasScript) {
        for pair in script.blocks.windows(2) {
            assert!(pair[0].frame < pair[1].frame);
        }
    }

    #[test]
    fn block_index_finds_first_at_or_after() {
        let script = script_with_frames(&[5, 10, 20]);
        assert_eq!(script.block_index(0), 0);
        assert_eq!(script.block_index(5), 0);
        assert_eq!(script.block_index(6), 1);
        assert_eq!(script.block_index(10), 1);
        assert_eq!(script.block_index(20), 2);
        assert_eq!(script.block_index(21), 3);
    }

    #[test]
    fn block_index_with_stale_hint_still_correct() {
        let frames: Vec<i32> = (0..40).map(|i| i * 10).collect();
        let script = script_with_frames(&frames);

        // Walk backwards and forwards so the hint is wrong most of the time.
        for &frame in &[395, 5, 200, 0, 399, 150, 151] {
            let expected = frames.iter().position(|&f| f >= frame).unwrap_or(40);
            assert_eq!(script.block_index(frame), expected, "frame {frame}");
        }
    }

    #[test]
    fn shift_blocks_clamps_to_one_past_previous() {
        let mut script = script_with_frames(&[5, 10, 20]);
        assert!(script.shift_blocks(1, -10));
        let frames: Vec<i32> = script.blocks.iter().map(|b| b.frame).collect();
        assert_eq!(frames, [5, 6, 16]);
        assert_ordered(&script);
    }

    #[test]
    fn shift_blocks_clamped_to_zero_is_a_no_op() {
        let mut script = script_with_frames(&[5, 6, 20]);
        assert!(!script.shift_blocks(1, -10));
        let frames: Vec<i32> = script.blocks.iter().map(|b| b.frame).collect();
        assert_eq!(frames, [5, 6, 20]);
    }

    #[test]
    fn shift_blocks_never_goes_negative() {
        let mut script = script_with_frames(&[5, 10]);
        assert!(script.shift_blocks(0, -100));
        assert_eq!(script.blocks[0].frame, 0);
        assert_eq!(script.blocks[1].frame, 5);
    }

    #[test]
    fn shift_single_block_respects_both_neighbours() {
        let mut script = script_with_frames(&[5, 10, 20]);
        assert!(script.shift_single_block(1, 100));
        assert_eq!(script.blocks[1].frame, 19);
        assert!(script.shift_single_block(1, -100));
        assert_eq!(script.blocks[1].frame, 6);
        assert_ordered(&script);

        let mut packed = script_with_frames(&[5, 6, 7]);
        assert!(!packed.shift_single_block(1, 3));
    }

    #[test]
    fn block_for_frame_inserts_in_order() {
        let mut script = script_with_frames(&[5, 20]);
        script.add_cvar(TAS_STRAFE, 1., 10);
        let frames: Vec<i32> = script.blocks.iter().map(|b| b.frame).collect();
        assert_eq!(frames, [5, 10, 20]);
        assert_ordered(&script);
        assert!(script.get_block(10).unwrap().has_cvar_value(TAS_STRAFE, 1.));
    }

    #[test]
    fn add_shot_reports_changes() {
        let mut script = script_with_frames(&[0]);
        assert!(script.add_shot(10., 45., 3, 6));
        assert!(script.get_block(3).unwrap().has_cvar_value(TAS_VIEW_PITCH, 10.));
        assert!(script.get_block(9).unwrap().has_cvar_value(TAS_VIEW_YAW, INVALID_ANGLE));
        assert_ordered(&script);

        // Identical shot changes nothing.
        assert!(!script.add_shot(10., 45., 3, 6));

        script.remove_shot(3, 6);
        assert!(!script.get_block(3).unwrap().has_convar(TAS_VIEW_PITCH));
    }

    #[test]
    fn prune_drops_only_empty_blocks_in_range() {
        let mut script = script_with_frames(&[0, 10]);
        script.block_for_frame(5);
        script.block_for_frame(15);
        script.prune(4, 6);
        let frames: Vec<i32> = script.blocks.iter().map(|b| b.frame).collect();
        assert_eq!(frames, [0, 10, 15]);
        script.prune_from(0);
        let frames: Vec<i32> = script.blocks.iter().map(|b| b.frame).collect();
        assert_eq!(frames, [0, 10]);
    }

    #[test]
    fn add_script_splices_and_rebases() {
        let mut script = script_with_frames(&[0, 50, 100]);
        let tail = script_with_frames(&[0, 10]);
        script.add_script(&tail, 50);
        let frames: Vec<i32> = script.blocks.iter().map(|b| b.frame).collect();
        assert_eq!(frames, [0, 50, 60]);
        assert_ordered(&script);
    }
}
