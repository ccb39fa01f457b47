//! Filter descriptions and filter nodes.
//!
//! A [`FilterSpec`] is an ordered list of named operations written in the
//! familiar `name=arg:arg, name(arg,arg)` syntax, e.g.
//! `"scale=1080:-1, crop=1080:1920, fps=29"`. The spec is only checked for
//! syntax when parsed; operation names and arguments are resolved against
//! the input format when a [`FilterGraph`] is built from it.

mod audio;
mod graph;
mod video;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use transcode_core::{PixelFormat, Rational, SampleFormat};

use crate::error::{PipelineError, Result};
use crate::media::{FrameFormat, MediaFrame};

pub use graph::FilterGraph;
pub(crate) use video::can_convert;

/// One filter node inside a graph.
pub trait FilterNode: Send {
    /// Operation name.
    fn name(&self) -> &str;

    /// Format of the frames this node emits.
    fn output_format(&self) -> FrameFormat;

    /// Transform one frame, appending zero or more outputs to `out`.
    ///
    /// An `Err` rejects just this frame; the node stays usable.
    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String>;

    /// Emit anything held back once input has ended.
    fn flush(&mut self, _out: &mut Vec<MediaFrame>) {}

    /// Frames deliberately discarded, e.g. by rate conversion.
    fn discarded(&self) -> u64 {
        0
    }
}

/// A single operation in a filter description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStep {
    /// Operation name.
    pub name: String,
    /// Positional or `key=value` arguments.
    pub args: Vec<String>,
}

impl FilterStep {
    /// Create a step from a name and arguments.
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Look up an argument by position, or by one of its key names.
    pub(crate) fn arg(&self, position: usize, keys: &[&str]) -> Option<&str> {
        for arg in &self.args {
            if let Some((key, value)) = arg.split_once('=') {
                if keys.contains(&key.trim()) {
                    return Some(value.trim());
                }
            }
        }
        let positional: Vec<&str> = self
            .args
            .iter()
            .filter(|a| !a.contains('='))
            .map(|a| a.trim())
            .collect();
        positional.get(position).copied()
    }

    /// Parse a required argument.
    pub(crate) fn required<T: FromStr>(&self, position: usize, keys: &[&str]) -> Result<T> {
        let raw = self.arg(position, keys).ok_or_else(|| {
            PipelineError::FilterGraph(format!("{}: missing argument '{}'", self.name, keys[0]))
        })?;
        self.parse_value(raw, keys[0])
    }

    /// Parse an optional argument.
    pub(crate) fn optional<T: FromStr>(&self, position: usize, keys: &[&str]) -> Result<Option<T>> {
        self.arg(position, keys)
            .map(|raw| self.parse_value(raw, keys[0]))
            .transpose()
    }

    fn parse_value<T: FromStr>(&self, raw: &str, key: &str) -> Result<T> {
        raw.parse().map_err(|_| {
            PipelineError::FilterGraph(format!("{}: invalid {} '{}'", self.name, key, raw))
        })
    }
}

impl fmt::Display for FilterStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.args.is_empty() {
            write!(f, "={}", self.args.join(":"))?;
        }
        Ok(())
    }
}

/// Ordered list of filter operations for one stream kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilterSpec {
    steps: Vec<FilterStep>,
}

impl FilterSpec {
    /// Create an empty (identity) spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a textual filter description.
    pub fn parse(text: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for item in split_top_level(text)? {
            let item = item.trim();
            if item.is_empty() {
                if text.trim().is_empty() {
                    continue;
                }
                return Err(PipelineError::FilterGraph(format!(
                    "empty filter in '{}'",
                    text
                )));
            }
            steps.push(parse_step(item)?);
        }
        Ok(Self { steps })
    }

    /// The operations in order.
    pub fn steps(&self) -> &[FilterStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Append an operation.
    pub fn push(&mut self, step: FilterStep) {
        self.steps.push(step);
    }

    /// Builder: append an operation.
    pub fn then(mut self, step: FilterStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Builder: resize. `-1` keeps the aspect ratio, `-2` also keeps the
    /// result even, `0` keeps the input dimension.
    pub fn scale(self, width: i64, height: i64) -> Self {
        self.then(FilterStep::new("scale", [width, height]))
    }

    /// Builder: centered crop.
    pub fn crop(self, width: u32, height: u32) -> Self {
        self.then(FilterStep::new("crop", [width, height]))
    }

    /// Builder: crop at an offset.
    pub fn crop_at(self, width: u32, height: u32, x: u32, y: u32) -> Self {
        self.then(FilterStep::new("crop", [width, height, x, y]))
    }

    /// Builder: frame rate conversion.
    pub fn rate(self, fps: Rational) -> Self {
        self.then(FilterStep::new("fps", [fps]))
    }

    /// Builder: pixel format conversion.
    pub fn pixel_format(self, format: PixelFormat) -> Self {
        self.then(FilterStep::new("format", [format]))
    }

    /// Builder: gain in decibels.
    pub fn volume_db(self, gain_db: f64) -> Self {
        self.then(FilterStep::new("volume", [format!("{}dB", gain_db)]))
    }

    /// Builder: sample format conversion.
    pub fn sample_format(self, format: SampleFormat) -> Self {
        self.then(FilterStep::new("aformat", [format]))
    }
}

impl FromStr for FilterSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FilterSpec {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<FilterSpec> for String {
    fn from(spec: FilterSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

/// Split on commas and semicolons outside parentheses.
fn split_top_level(text: &str) -> Result<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    PipelineError::FilterGraph(format!("unbalanced ')' in '{}'", text))
                })?;
            }
            ',' | ';' if depth == 0 => {
                items.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PipelineError::FilterGraph(format!("unbalanced '(' in '{}'", text)));
    }
    items.push(&text[start..]);
    Ok(items)
}

fn parse_step(item: &str) -> Result<FilterStep> {
    let (name, args) = if let Some(open) = item.find('(') {
        let inner = item[open + 1..].strip_suffix(')').ok_or_else(|| {
            PipelineError::FilterGraph(format!("trailing input after ')' in '{}'", item))
        })?;
        (&item[..open], split_args(inner, ','))
    } else if let Some((name, rest)) = item.split_once('=') {
        (name, split_args(rest, ':'))
    } else {
        (item, Vec::new())
    };

    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PipelineError::FilterGraph(format!(
            "invalid filter name in '{}'",
            item
        )));
    }
    Ok(FilterStep {
        name: name.to_ascii_lowercase(),
        args,
    })
}

fn split_args(text: &str, separator: char) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    text.split(separator).map(|a| a.trim().to_string()).collect()
}
