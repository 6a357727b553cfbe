//! Recorded navigation logs
//!
//! A log is a CSV export with one instruction per row and exactly 14
//! comma-separated fields. Only five of them are used:
//!
//! ```text
//! [8]  title       street name, optionally wrapped in double quotes
//! [9]  subtitle    distance text such as "350 m" or "1,2 km"
//! [10] icon        icon name, only consulted for roundabouts
//! [11] direction   DirectionCode ordinal
//! [12] timestamp   milliseconds
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::navigation::{DirectionCode, NavigationMessage};

pub const FIELD_COUNT: usize = 14;

const TITLE_FIELD: usize = 8;
const SUBTITLE_FIELD: usize = 9;
const ICON_FIELD: usize = 10;
const DIRECTION_FIELD: usize = 11;
const TIMESTAMP_FIELD: usize = 12;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    IoError(String),
}

/// One replayable instruction and the pause before the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedInstruction {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub direction: DirectionCode,
    pub delay_to_next: Duration,
}

impl TimedInstruction {
    pub fn distance_m(&self) -> u32 {
        self.subtitle.as_deref().map(extract_distance).unwrap_or(0)
    }

    pub fn street_name(&self) -> &str {
        self.title.as_deref().map(extract_street_name).unwrap_or("")
    }

    /// Build the outbound message for this instruction.
    pub fn to_message(&self) -> NavigationMessage {
        NavigationMessage::new(self.direction, self.distance_m(), self.street_name())
    }
}

struct Row<'a> {
    title: &'a str,
    subtitle: &'a str,
    direction: DirectionCode,
    timestamp_ms: u64,
}

impl<'a> Row<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != FIELD_COUNT {
            log::warn!(
                "Ignoring row with {} fields (expected {}): {}",
                fields.len(),
                FIELD_COUNT,
                line
            );
            return None;
        }

        let Ok(raw_direction) = fields[DIRECTION_FIELD].trim().parse::<u8>() else {
            log::warn!("Ignoring row with bad direction {:?}", fields[DIRECTION_FIELD]);
            return None;
        };
        let Ok(timestamp_ms) = fields[TIMESTAMP_FIELD].trim().parse::<u64>() else {
            log::warn!("Ignoring row with bad timestamp {:?}", fields[TIMESTAMP_FIELD]);
            return None;
        };

        let mut direction = DirectionCode::from_byte_lossy(raw_direction);
        if direction == DirectionCode::Roundabout {
            direction = DirectionCode::from_roundabout_icon(fields[ICON_FIELD].trim());
        }

        Some(Self {
            title: fields[TITLE_FIELD],
            subtitle: fields[SUBTITLE_FIELD],
            direction,
            timestamp_ms,
        })
    }
}

fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// An ordered, parsed navigation log.
#[derive(Debug, Clone, Default)]
pub struct InstructionLog {
    instructions: Vec<TimedInstruction>,
}

impl InstructionLog {
    /// Parse a log. Malformed rows are logged and skipped; each delay is the
    /// timestamp difference to the next well-formed row.
    pub fn parse(source: &str) -> Self {
        let rows: Vec<Row<'_>> = source
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(Row::parse)
            .collect();

        let instructions = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let delay_ms = rows
                    .get(i + 1)
                    .map(|next| next.timestamp_ms.saturating_sub(row.timestamp_ms))
                    .unwrap_or(0);
                TimedInstruction {
                    title: non_empty(row.title),
                    subtitle: non_empty(row.subtitle),
                    direction: row.direction,
                    delay_to_next: Duration::from_millis(delay_ms),
                }
            })
            .collect();

        Self { instructions }
    }

    pub fn from_file(path: &Path) -> Result<Self, LogError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| LogError::IoError(format!("{}: {}", path.display(), e)))?;
        let log = Self::parse(&source);
        log::info!("Parsed {} instructions from {}", log.len(), path.display());
        Ok(log)
    }

    pub fn instructions(&self) -> &[TimedInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Total playback time at normal speed.
    pub fn duration(&self) -> Duration {
        self.instructions.iter().map(|i| i.delay_to_next).sum()
    }
}

impl From<Vec<TimedInstruction>> for InstructionLog {
    fn from(instructions: Vec<TimedInstruction>) -> Self {
        Self { instructions }
    }
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || c == ',' || c == '.'
}

/// Distance in metres from text like "350 m", "1.2km" or "1,2 km".
///
/// The first run of digits and separators is used. A lone comma is a decimal
/// separator unless exactly three digits follow it; any other commas group
/// thousands. A trailing "km" scales to metres. No number gives 0.
pub fn extract_distance(text: &str) -> u32 {
    let run = text
        .split(|c: char| !is_number_char(c))
        .find(|run| run.chars().any(|c| c.is_ascii_digit()));
    let Some(run) = run else {
        return 0;
    };

    let normalized = match (run.matches(',').count(), run.contains('.')) {
        (1, false) => {
            let decimals = run.rsplit(',').next().map(str::len).unwrap_or(0);
            if decimals == 3 {
                run.replace(',', "")
            } else {
                run.replace(',', ".")
            }
        }
        _ => run.replace(',', ""),
    };

    let Ok(mut value) = normalized.trim_matches('.').parse::<f64>() else {
        return 0;
    };
    if text.trim_end().ends_with("km") {
        value *= 1000.0;
    }
    value.round() as u32
}

/// Strip one pair of surrounding double quotes, if present.
pub fn extract_street_name(title: &str) -> &str {
    if title.len() >= 2 && title.starts_with('"') && title.ends_with('"') {
        &title[1..title.len() - 1]
    } else {
        title
    }
}
