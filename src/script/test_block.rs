//! Hook-driven test scripts.
//!
//! A test block is one line: `<hook>\t<count>\t<filter>\t<command>`, where
//! the hook is `f` (frame), `l` (level change) or `s` (script completed), the
//! count says how many firings of the hook to wait for, and the filter is a
//! 4-bit mask written most-significant bit first.

use std::fs;
use std::io::{self, Write};

use nom::character::complete::{char, digit1, one_of};
use nom::combinator::all_consuming;
use nom::multi::count;
use nom::sequence::tuple;
use nom::IResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::parse::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Hook {
    #[default]
    Frame,
    LevelChange,
    ScriptCompleted,
}

impl Hook {
    fn as_char(self) -> char {
        match self {
            Hook::Frame => 'f',
            Hook::LevelChange => 'l',
            Hook::ScriptCompleted => 's',
        }
    }
}

/// A command to run once a hook has fired a given number of times.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestBlock {
    pub hook: Hook,
    pub hook_count: u32,
    /// Low 4 bits select which afterframes queues the command applies to.
    pub afterframes_filter: u8,
    pub command: String,
}

fn test_block_line(i: &str) -> IResult<&str, (char, &str, Vec<char>, &str)> {
    let (rest, (hook, _, digits, _, filter, _, command)) = all_consuming(tuple((
        one_of("fls"),
        char('\t'),
        digit1,
        char('\t'),
        count(one_of("01"), 4),
        char('\t'),
        nom::combinator::rest,
    )))(i)?;
    Ok((rest, (hook, digits, filter, command)))
}

impl TestBlock {
    pub fn parse(line: &str) -> Result<Self, ScriptError> {
        let (_, (hook, digits, filter, command)) =
            test_block_line(line).map_err(|_| ScriptError::Parse {
                line: 0,
                message: format!("malformed test block: {line}"),
            })?;

        let hook = match hook {
            'f' => Hook::Frame,
            'l' => Hook::LevelChange,
            _ => Hook::ScriptCompleted,
        };
        let hook_count = digits.parse().map_err(|_| ScriptError::Parse {
            line: 0,
            message: format!("hook count out of range: {digits}"),
        })?;

        let mut afterframes_filter = 0;
        for (i, bit) in filter.iter().enumerate() {
            if *bit == '1' {
                afterframes_filter |= 1 << (3 - i);
            }
        }

        Ok(Self {
            hook,
            hook_count,
            afterframes_filter,
            command: command.to_owned(),
        })
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        write!(writer, "{}\t{}\t", self.hook.as_char(), self.hook_count)?;
        for i in (0..4).rev() {
            write!(writer, "{}", (self.afterframes_filter >> i) & 1)?;
        }
        writeln!(writer, "\t{}", self.command)
    }
}

/// A sequence of [`TestBlock`]s with a one-line description header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestScript {
    pub blocks: Vec<TestBlock>,
    pub description: String,
    pub file_name: String,
}

impl TestScript {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(file_name: impl Into<String>) -> Result<TestScript, ScriptError> {
        let file_name = file_name.into();
        let input = fs::read_to_string(&file_name).map_err(|err| {
            warn!("unable to open test {file_name}: {err}");
            err
        })?;

        let mut script = TestScript::new(file_name.clone());
        for (index, line) in input.lines().enumerate() {
            if index == 0 {
                script.description = line.to_owned();
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            script.blocks.push(TestBlock::parse(line).map_err(|err| {
                warn!("failed to load test {file_name}: {err}");
                match err {
                    ScriptError::Parse { message, .. } => ScriptError::Parse {
                        line: index + 1,
                        message,
                    },
                    other => other,
                }
            })?);
        }

        info!("test {} loaded with {} blocks", file_name, script.blocks.len());
        Ok(script)
    }

    pub fn save_to_file(&self) -> Result<(), ScriptError> {
        if self.blocks.is_empty() {
            warn!("cannot write an empty test to file");
            return Err(ScriptError::Empty);
        }

        let mut out = Vec::new();
        writeln!(out, "{}", self.description)?;
        for block in &self.blocks {
            block.write_to(&mut out)?;
        }
        fs::write(&self.file_name, out)?;
        info!("wrote test to file {}", self.file_name);
        Ok(())
    }
}
