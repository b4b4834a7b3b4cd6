// G-code codec for the supported motion controller firmwares
//
// Moves are plain `G1 E<d> F<f>` in every dialect. Writing steps/mm is
// where the firmwares differ, and so is reading temperatures and steps
// back from the controller.

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelSource, Telemetry, ToolConfig};
use crate::error::ChannelError;
use crate::protocol::format_number;

/// Switch the extruder to relative positioning
pub const RELATIVE_EXTRUSION: &str = "M83";

/// Persist settings to EEPROM (Marlin)
pub const SAVE_SETTINGS: &str = "M500";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareDialect {
    Marlin,
    Klipper,
    RepRapFirmware,
}

/// `G1 E<distance> F<feedrate>`
pub fn extrude(distance_mm: f64, feedrate_mm_per_min: f64) -> String {
    format!(
        "G1 E{} F{}",
        format_number(distance_mm, 4),
        format_number(feedrate_mm_per_min, 2)
    )
}

/// Home all axes
pub const HOME_ALL: &str = "G28";

/// Ask Marlin to report temperatures every 2 seconds
pub const AUTO_TEMPERATURE_REPORT: &str = "M155 S2";

/// Height the nozzle is parked at before extruding into free air
const PARK_HEIGHT_MM: f64 = 50.0;
const PARK_Z_FEEDRATE: f64 = 1200.0;
const TRAVEL_FEEDRATE: f64 = 6000.0;

impl FirmwareDialect {
    /// Lines that write steps/mm for `tool`.
    ///
    /// `tools` is the tool table after the update; RepRapFirmware writes all
    /// extruders in one command and needs the other values too.
    ///
    /// # Errors
    /// `CommandRejected` when `tool` is not in the table or the value is not
    /// a positive number.
    pub fn set_steps_per_mm(
        &self,
        tool: usize,
        tools: &[ToolConfig],
    ) -> Result<Vec<String>, ChannelError> {
        let config = tools.get(tool).ok_or_else(|| ChannelError::CommandRejected {
            source: ChannelSource::Motion,
            reason: format!("unknown tool {}", tool),
        })?;
        let value = config.steps_per_mm;
        if !(value.is_finite() && value > 0.0) {
            return Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("steps/mm {} for tool {}", value, tool),
            });
        }

        let lines = match self {
            FirmwareDialect::Marlin => vec![
                format!("M92 T{} E{}", tool, format_number(value, 3)),
                SAVE_SETTINGS.to_string(),
            ],
            FirmwareDialect::Klipper => vec![format!(
                "SET_EXTRUDER_STEP_DISTANCE EXTRUDER={} DISTANCE={}",
                config.name,
                format_number(config.step_distance(), 8)
            )],
            FirmwareDialect::RepRapFirmware => {
                let values: Vec<String> = tools
                    .iter()
                    .map(|t| format_number(t.steps_per_mm, 3))
                    .collect();
                vec![format!("M92 E{}", values.join(":"))]
            }
        };
        Ok(lines)
    }

    /// Set a hotend target temperature.
    ///
    /// RepRapFirmware uses `M109`, which also selects the tool.
    ///
    /// # Errors
    /// `CommandRejected` for an unknown tool, a negative or non-finite
    /// target, or a target above the tool's `max_temp`.
    pub fn set_tool_temperature(
        &self,
        tool: usize,
        celsius: f64,
        tools: &[ToolConfig],
    ) -> Result<String, ChannelError> {
        let config = tools.get(tool).ok_or_else(|| ChannelError::CommandRejected {
            source: ChannelSource::Motion,
            reason: format!("unknown tool {}", tool),
        })?;
        let too_hot = config.max_temp.is_some_and(|max| celsius > max);
        if !(celsius.is_finite() && celsius >= 0.0) || too_hot {
            return Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("temperature {} for tool {} ({})", celsius, tool, config.name),
            });
        }

        let code = match self {
            FirmwareDialect::Marlin | FirmwareDialect::Klipper => "M104",
            FirmwareDialect::RepRapFirmware => "M109",
        };
        Ok(format!("{} S{} T{}", code, format_number(celsius, 1), tool))
    }

    /// Select `tool` and lift it clear of the bed.
    ///
    /// Marlin homes first. Klipper and RepRapFirmware move over `bed_center`
    /// when it is known.
    pub fn park(&self, tool: usize, bed_center: Option<(f64, f64)>) -> Vec<String> {
        let mut lines = vec![format!("T{}", tool)];
        match self {
            FirmwareDialect::Marlin => lines.push(HOME_ALL.to_string()),
            FirmwareDialect::Klipper | FirmwareDialect::RepRapFirmware => {
                if let Some((x, y)) = bed_center {
                    lines.push(format!(
                        "G1 X{} Y{} F{}",
                        format_number(x, 3),
                        format_number(y, 3),
                        format_number(TRAVEL_FEEDRATE, 0)
                    ));
                }
            }
        }
        lines.push(format!(
            "G1 Z{} F{}",
            format_number(PARK_HEIGHT_MM, 0),
            format_number(PARK_Z_FEEDRATE, 0)
        ));
        lines
    }

    /// Query that makes the controller echo a tool's steps/mm.
    ///
    /// Only Marlin answers over the G-code stream; the other firmwares
    /// expose it through their object model.
    pub fn steps_query(&self, tool: usize) -> Option<String> {
        match self {
            FirmwareDialect::Marlin => Some(format!("M92 T{}", tool)),
            FirmwareDialect::Klipper | FirmwareDialect::RepRapFirmware => None,
        }
    }

    /// Lines sent once the link is up
    pub fn connect_sequence(&self, tool_count: usize) -> Vec<String> {
        let mut lines: Vec<String> = (0..tool_count)
            .filter_map(|tool| self.steps_query(tool))
            .collect();
        lines.push(RELATIVE_EXTRUSION.to_string());
        if *self == FirmwareDialect::Marlin {
            lines.push(AUTO_TEMPERATURE_REPORT.to_string());
        }
        lines
    }
}

/// Parse a Marlin temperature report (` T:200.00 /200.00 B:...` or
/// `ok T0:200.00 /210.00 T1:...`) into one telemetry event per tool.
pub fn parse_temperature_report(line: &str) -> Vec<Telemetry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut per_tool = Vec::new();
    let mut single = None;

    for (index, token) in tokens.iter().enumerate() {
        let Some(rest) = token.strip_prefix('T') else {
            continue;
        };
        let Some((label, current)) = rest.split_once(':') else {
            continue;
        };
        let Ok(current) = current.parse::<f64>() else {
            continue;
        };
        let target = tokens
            .get(index + 1)
            .and_then(|t| t.strip_prefix('/'))
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(0.0);

        if label.is_empty() {
            single = Some(Telemetry::Temperature {
                tool: 0,
                current,
                target,
            });
        } else if let Ok(tool) = label.parse::<usize>() {
            per_tool.push(Telemetry::Temperature {
                tool,
                current,
                target,
            });
        }
    }

    if per_tool.is_empty() {
        single.into_iter().collect()
    } else {
        per_tool
    }
}

/// Parse an `M92` echo (`echo: M92 T0 E93.00`) into `(tool, steps_per_mm)`
pub fn parse_steps_report(line: &str) -> Option<(usize, f64)> {
    let body = line.trim().strip_prefix("echo:")?.trim();
    let mut words = body.split_whitespace();
    if words.next()? != "M92" {
        return None;
    }

    let mut tool = 0;
    let mut steps = None;
    for word in words {
        if let Some(t) = word.strip_prefix('T') {
            tool = t.parse().ok()?;
        } else if let Some(e) = word.strip_prefix('E') {
            steps = e.parse().ok();
        }
    }
    steps.map(|s| (tool, s))
}
