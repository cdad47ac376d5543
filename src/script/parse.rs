//! Text form of [`TasScript`]: parsing, emission, file I/O and backups.
//!
//! The format is line-oriented. A block starts with a `+<delta>:` header
//! (frame gap since the previous block, absolute for the first one) followed
//! by tab-indented lines: `<convar> <value>`, `+name`/`-name` toggles, or raw
//! console commands. `//` starts a comment.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1, one_of};
use nom::combinator::{all_consuming, opt, recognize};
use nom::sequence::{pair, preceded, tuple};
use nom::IResult;
use thiserror::Error;
use tracing::{info, warn};

use super::{FrameBlock, TasScript};
use crate::host::Host;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("error parsing line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("cannot write an empty script")]
    Empty,
    #[error("script file name has no extension: {0}")]
    NoExtension(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn parse_error(line: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Parse {
        line,
        message: message.into(),
    }
}

fn word(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(i)
}

fn number(i: &str) -> IResult<&str, &str> {
    recognize(tuple((
        opt(char('-')),
        digit1,
        opt(preceded(char('.'), digit1)),
    )))(i)
}

/// `+123:` or `123:`; returns whether the frame is relative and the digits.
fn frame_header(i: &str) -> Option<(bool, &str)> {
    let result: IResult<&str, (Option<char>, &str, char)> =
        all_consuming(tuple((opt(char('+')), digit1, char(':'))))(i);
    let (_, (plus, digits, _)) = result.ok()?;
    Some((plus.is_some(), digits))
}

/// `name value` with the value optionally quoted.
fn convar_line(i: &str) -> Option<(&str, &str)> {
    let result: IResult<&str, (&str, char, Option<char>, &str, Option<char>)> =
        all_consuming(tuple((
            word,
            char(' '),
            opt(char('"')),
            number,
            opt(char('"')),
        )))(i);
    let (_, (name, _, _, value, _)) = result.ok()?;
    Some((name, value))
}

/// `+name` or `-name`.
fn toggle_line(i: &str) -> Option<(bool, &str)> {
    let result: IResult<&str, (char, &str)> = all_consuming(pair(one_of("+-"), word))(i);
    let (_, (sign, name)) = result.ok()?;
    Some((sign == '+', name))
}

fn strip_comment(line: &str) -> &str {
    let line = line.split("//").next().unwrap_or(line);
    line.trim()
}

impl TasScript {
    /// Parses the text form of a script.
    ///
    /// Lines that look like convar assignments are only treated as such when
    /// the host recognizes the name; everything else falls through to a raw
    /// command.
    pub fn from_text(input: &str, host: &dyn Host) -> Result<TasScript, ScriptError> {
        let mut script = TasScript::default();
        let mut block = FrameBlock::default();
        let mut running_frame = 0i32;

        for (index, raw) in input.lines().enumerate() {
            let number = index + 1;
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }

            if let Some((relative, digits)) = frame_header(line) {
                if block.parsed {
                    script.push_parsed_block(std::mem::take(&mut block), number)?;
                }

                if !relative {
                    running_frame = 0;
                }
                let frame: i32 = digits
                    .parse()
                    .map_err(|_| parse_error(number, format!("frame out of range: {digits}")))?;
                block.frame = frame
                    .checked_add(running_frame)
                    .ok_or_else(|| parse_error(number, "frame out of range"))?;
                running_frame = block.frame;
                block.parsed = true;
            } else if let Some((name, value)) = convar_line(line).filter(|(name, _)| host.is_convar(name)) {
                let value: f32 = value
                    .parse()
                    .map_err(|_| parse_error(number, format!("bad convar value: {value}")))?;
                block.convars.insert(name, value);
            } else if let Some((state, name)) = toggle_line(line) {
                block.toggles.insert(name, state);
            } else {
                block.add_command(line);
            }
        }

        if block.parsed {
            let line = input.lines().count();
            script.push_parsed_block(block, line)?;
        }

        Ok(script)
    }

    fn push_parsed_block(&mut self, block: FrameBlock, line: usize) -> Result<(), ScriptError> {
        if let Some(last) = self.blocks.last() {
            if block.frame <= last.frame {
                return Err(parse_error(
                    line,
                    format!(
                        "block at frame {} does not come after frame {}",
                        block.frame, last.frame
                    ),
                ));
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Writes the text form of the script.
    pub fn write_text<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let mut current_frame = 0;
        for block in &self.blocks {
            writeln!(writer, "+{}:", block.frame - current_frame)?;
            current_frame = block.frame;

            for (name, value) in block.convars.iter() {
                writeln!(writer, "\t{name} {value}")?;
            }
            for (name, &state) in block.toggles.iter() {
                writeln!(writer, "\t{}{name}", if state { '+' } else { '-' })?;
            }
            for command in &block.commands {
                writeln!(writer, "\t{command}")?;
            }
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut out = Vec::new();
        self.write_text(&mut out)
            .expect("writing to a Vec cannot fail");
        String::from_utf8(out).expect("script text is valid UTF-8")
    }

    pub fn load_from_file(
        file_name: impl Into<String>,
        host: &dyn Host,
    ) -> Result<TasScript, ScriptError> {
        let file_name = file_name.into();
        let input = fs::read_to_string(&file_name).map_err(|err| {
            warn!("unable to open script {file_name}: {err}");
            err
        })?;

        match Self::from_text(&input, host) {
            Ok(mut script) => {
                script.file_name = file_name.clone();
                info!("script {} loaded with {} blocks", file_name, script.blocks.len());
                Ok(script)
            }
            Err(err) => {
                warn!("failed to load script {file_name}: {err}");
                Err(err)
            }
        }
    }

    /// Saves the script to its file, rotating backups first.
    ///
    /// Existing backups move one slot older (`name-0.qtas` is the newest, the
    /// oldest is deleted) and the current file becomes `name-0.qtas` before
    /// the new contents are written.
    pub fn save_to_file(&self, host: &dyn Host) -> Result<(), ScriptError> {
        if self.blocks.is_empty() {
            warn!("cannot write an empty script to file");
            return Err(ScriptError::Empty);
        }

        rotate_backups(&self.file_name, host.num_backups())?;
        fs::write(&self.file_name, self.to_text())?;
        info!("wrote script to file {}", self.file_name);
        Ok(())
    }

    pub fn write_to_memory<W: Write>(&self, writer: W) -> bincode::Result<()> {
        bincode::serialize_into(writer, self)
    }

    pub fn load_from_memory<R: io::Read>(reader: R) -> bincode::Result<TasScript> {
        bincode::deserialize_from(reader)
    }
}

fn rotate_backups(file_name: &str, backups: u32) -> Result<(), ScriptError> {
    if backups == 0 || !Path::new(file_name).exists() {
        return Ok(());
    }

    let (base, _) = file_name
        .rsplit_once('.')
        .ok_or_else(|| ScriptError::NoExtension(file_name.to_owned()))?;
    let slot = |i: u32| format!("{base}-{i}.qtas");

    let oldest = slot(backups - 1);
    if Path::new(&oldest).exists() {
        fs::remove_file(&oldest)?;
    }
    for i in (0..backups - 1).rev() {
        let from = slot(i);
        if Path::new(&from).exists() {
            fs::rename(&from, slot(i + 1))?;
        }
    }
    fs::rename(file_name, slot(0))?;
    Ok(())
}
