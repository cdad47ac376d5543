//! Playback position tracking for a loaded script.

use serde::{Deserialize, Serialize};

use super::{FrameBlock, TasScript};
use crate::host::Host;

/// A script together with the playback cursor into it.
///
/// `stacked` is the accumulated state of every block strictly before
/// `current_frame`, later writes overwriting earlier ones per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackInfo {
    pub current_script: TasScript,
    pub stacked: FrameBlock,
    pub current_frame: i32,
    pub pause_frame: i32,
    pub script_running: bool,
    pub should_unpause: bool,
}

impl PlaybackInfo {
    pub fn with_script(current_script: TasScript) -> Self {
        Self {
            current_script,
            ..Self::default()
        }
    }

    /// The first block at or after `frame` (the current frame if `None`).
    pub fn current_block(&self, frame: Option<i32>) -> Option<&FrameBlock> {
        let index = self.block_number(frame);
        self.current_script.blocks.get(index)
    }

    pub fn stacked_block(&self) -> &FrameBlock {
        &self.stacked
    }

    pub fn block_number(&self, frame: Option<i32>) -> usize {
        self.current_script
            .block_index(frame.unwrap_or(self.current_frame))
    }

    pub fn number_of_blocks(&self) -> usize {
        self.current_script.blocks.len()
    }

    pub fn last_frame(&self) -> i32 {
        self.current_script.last_frame()
    }

    pub fn in_edit_mode(&self, host: &dyn Host) -> bool {
        !self.script_running && host.game_paused() && !self.current_script.blocks.is_empty()
    }

    /// Recomputes `stacked` by replaying every block before `current_frame`.
    pub fn calculate_stack(&mut self) {
        self.stacked.reset();
        for block in &self.current_script.blocks {
            if block.frame >= self.current_frame {
                break;
            }
            self.stacked.stack(block);
        }
    }

    /// Produces a playback whose first block is the stacked state at
    /// `start_frame` (the current frame if `None`) and whose tail is the
    /// original blocks after it, rebased to `frame - start_frame`.
    pub fn time_shifted(&self, start_frame: Option<i32>) -> PlaybackInfo {
        let start_frame = start_frame.unwrap_or(self.current_frame);

        let mut output = PlaybackInfo::default();
        output.current_script.file_name = self.current_script.file_name.clone();

        let mut stacked = FrameBlock::at_frame(0);
        let mut added_stack = false;

        for block in &self.current_script.blocks {
            if block.frame <= start_frame {
                stacked.stack(block);
                if block.frame == start_frame {
                    stacked.commands = block.commands.clone();
                }
            } else {
                if !added_stack {
                    output.current_script.blocks.push(stacked.clone());
                    added_stack = true;
                }

                let mut block = block.clone();
                block.frame -= start_frame;
                output.current_script.blocks.push(block);
            }
        }

        if !added_stack {
            output.current_script.blocks.push(stacked);
        }

        output
    }
}
