// GcodeLink - MotionChannel over a G-code stream
//
// Writes are queued to an I/O task so the engine never blocks on the
// transport. The same task reads the controller's output for temperature
// reports and M92 echoes; the tool table is kept in sync with both the
// values we write and the values the controller reports. On Marlin the
// table is refreshed from the controller right after connecting.

use std::sync::{Arc, RwLock};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, ChannelSource, MotionChannel, ToolConfig};
use crate::error::{log_channel_error, ChannelError};
use crate::protocol::gcode::{self, FirmwareDialect};

/// Handle to the motion controller I/O task
pub struct GcodeLink {
    lines: mpsc::UnboundedSender<String>,
    dialect: FirmwareDialect,
    tools: Arc<RwLock<Vec<ToolConfig>>>,
}

impl GcodeLink {
    /// Spawn the I/O task and send the dialect's connect sequence: steps/mm
    /// queries where supported, relative extrusion, temperature reporting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        dialect: FirmwareDialect,
        tools: Vec<ToolConfig>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (lines, line_rx) = mpsc::unbounded_channel();
        let tool_count = tools.len();
        let tools = Arc::new(RwLock::new(tools));
        tokio::spawn(run_link(reader, writer, line_rx, Arc::clone(&tools), events));

        let link = Self {
            lines,
            dialect,
            tools,
        };
        for line in dialect.connect_sequence(tool_count) {
            let _ = link.send(line);
        }
        link
    }

    pub fn dialect(&self) -> FirmwareDialect {
        self.dialect
    }

    pub fn home_axes(&self) -> Result<(), ChannelError> {
        self.send(gcode::HOME_ALL.to_string())
    }

    /// Select `tool` and park it above the bed so filament can be pushed
    /// into free air.
    pub fn park(&self, tool: usize, bed_center: Option<(f64, f64)>) -> Result<(), ChannelError> {
        self.tool_known(tool)?;
        for line in self.dialect.park(tool, bed_center) {
            self.send(line)?;
        }
        Ok(())
    }

    pub fn set_tool_temperature(&self, tool: usize, celsius: f64) -> Result<(), ChannelError> {
        let line = {
            let tools = self.tools.read().map_err(|_| Self::poisoned())?;
            self.dialect.set_tool_temperature(tool, celsius, &tools)?
        };
        log::info!("[GcodeLink] Heating tool {} to {}°C", tool, celsius);
        self.send(line)
    }

    /// Ask the controller to echo steps/mm for every tool.
    ///
    /// Replies update the tool table as they arrive. Returns the number of
    /// queries sent, 0 for firmwares that do not answer over G-code.
    pub fn query_steps_per_mm(&self) -> Result<usize, ChannelError> {
        let count = self.tools.read().map_err(|_| Self::poisoned())?.len();
        let mut sent = 0;
        for line in (0..count).filter_map(|tool| self.dialect.steps_query(tool)) {
            self.send(line)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn tool_known(&self, tool: usize) -> Result<(), ChannelError> {
        let tools = self.tools.read().map_err(|_| Self::poisoned())?;
        if tool < tools.len() {
            Ok(())
        } else {
            Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("unknown tool {}", tool),
            })
        }
    }

    fn send(&self, line: String) -> Result<(), ChannelError> {
        self.lines.send(line).map_err(|_| ChannelError::Disconnected {
            source: ChannelSource::Motion,
            reason: "motion link task has stopped".to_string(),
        })
    }

    fn poisoned() -> ChannelError {
        ChannelError::CommandRejected {
            source: ChannelSource::Motion,
            reason: "tool table lock poisoned".to_string(),
        }
    }
}

impl MotionChannel for GcodeLink {
    fn command_extrude(&self, distance_mm: f64, feedrate_mm_per_min: f64) -> Result<(), ChannelError> {
        self.send(gcode::extrude(distance_mm, feedrate_mm_per_min))
    }

    fn set_steps_per_mm(&self, tool: usize, value: f64) -> Result<(), ChannelError> {
        let mut tools = self.tools.write().map_err(|_| Self::poisoned())?;
        let current = tools.get(tool).ok_or_else(|| ChannelError::CommandRejected {
            source: ChannelSource::Motion,
            reason: format!("unknown tool {}", tool),
        })?;

        let mut updated = tools.clone();
        updated[tool] = current.with_steps_per_mm(value);
        for line in self.dialect.set_steps_per_mm(tool, &updated)? {
            self.send(line)?;
        }
        *tools = updated;
        log::info!("[GcodeLink] Tool {} set to {:.3} steps/mm", tool, value);
        Ok(())
    }

    fn tool_config(&self, tool: usize) -> Option<ToolConfig> {
        self.tools.read().ok()?.get(tool).cloned()
    }
}

async fn run_link<R, W>(
    reader: R,
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    tools: Arc<RwLock<Vec<ToolConfig>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    let failure = loop {
        tokio::select! {
            line = outgoing.recv() => {
                let Some(line) = line else {
                    return;
                };
                log::trace!("[GcodeLink] -> {}", line);
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(err) = written {
                    break ChannelError::Disconnected {
                        source: ChannelSource::Motion,
                        reason: err.to_string(),
                    };
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break ChannelError::Disconnected {
                        source: ChannelSource::Motion,
                        reason: "controller closed the connection".to_string(),
                    },
                    Err(err) => break ChannelError::Disconnected {
                        source: ChannelSource::Motion,
                        reason: err.to_string(),
                    },
                };
                if !handle_line(&line, &tools, &events) {
                    return;
                }
            }
        }
    };

    log_channel_error(&failure, "GcodeLink");
    let _ = events.send(ChannelEvent::Failure(failure));
}

/// Returns false once nobody listens for events any more
fn handle_line(
    line: &str,
    tools: &RwLock<Vec<ToolConfig>>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> bool {
    if let Some((tool, steps)) = gcode::parse_steps_report(line) {
        if let Ok(mut tools) = tools.write() {
            if let Some(config) = tools.get_mut(tool) {
                *config = config.with_steps_per_mm(steps);
            }
        }
        return true;
    }

    if line.contains("T:") {
        for temperature in gcode::parse_temperature_report(line) {
            if events.send(ChannelEvent::Telemetry(temperature)).is_err() {
                return false;
            }
        }
    } else if line.trim_start().starts_with("Error:") {
        log::warn!("[GcodeLink] Controller reported: {}", line.trim());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Telemetry;
    use tokio::io::{duplex, split, AsyncReadExt, BufReader, DuplexStream};

    async fn expect(device: &mut DuplexStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    fn connect(
        dialect: FirmwareDialect,
        tools: Vec<ToolConfig>,
    ) -> (GcodeLink, DuplexStream, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (host, device) = duplex(4096);
        let (read_half, write_half) = split(host);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = GcodeLink::spawn(
            BufReader::new(read_half),
            write_half,
            dialect,
            tools,
            events_tx,
        );
        (link, device, events_rx)
    }

    #[tokio::test]
    async fn test_relative_mode_then_moves() {
        let (link, mut device, _events) =
            connect(FirmwareDialect::Marlin, vec![ToolConfig::new("extruder", 93.0)]);

        link.command_extrude(20.0, 240.0).unwrap();
        expect(&mut device, "M92 T0\nM83\nM155 S2\nG1 E20 F240\n").await;
    }

    #[tokio::test]
    async fn test_marlin_steps_write_updates_table() {
        let (link, mut device, _events) =
            connect(FirmwareDialect::Marlin, vec![ToolConfig::new("extruder", 93.0)]);

        link.set_steps_per_mm(0, 94.25).unwrap();
        expect(&mut device, "M92 T0\nM83\nM155 S2\nM92 T0 E94.25\nM500\n").await;
        assert_eq!(link.tool_config(0).unwrap().steps_per_mm, 94.25);
    }

    #[tokio::test]
    async fn test_klipper_steps_write_tracks_rotation_distance() {
        let tool = ToolConfig::from_rotation_distance("extruder", 16, 8.0);
        let (link, mut device, _events) = connect(FirmwareDialect::Klipper, vec![tool]);

        link.set_steps_per_mm(0, 500.0).unwrap();
        expect(
            &mut device,
            "M83\nSET_EXTRUDER_STEP_DISTANCE EXTRUDER=extruder DISTANCE=0.002\n",
        )
        .await;
        let updated = link.tool_config(0).unwrap();
        assert_eq!(updated.rotation_distance, Some(6.4));
    }

    #[tokio::test]
    async fn test_unknown_tool_writes_nothing() {
        let (link, _device, _events) =
            connect(FirmwareDialect::RepRapFirmware, vec![ToolConfig::new("extruder", 93.0)]);

        assert!(matches!(
            link.set_steps_per_mm(1, 100.0),
            Err(ChannelError::CommandRejected { .. })
        ));
        assert!(link.tool_config(1).is_none());
    }

    #[tokio::test]
    async fn test_temperature_reports_become_telemetry() {
        let (_link, mut device, mut events) =
            connect(FirmwareDialect::Marlin, vec![ToolConfig::new("extruder", 93.0)]);

        device
            .write_all(b"ok\n T:205.3 /210.0 B:60.0 /60.0 @:127 B@:0\n")
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Telemetry(Telemetry::Temperature {
                tool: 0,
                current: 205.3,
                target: 210.0
            }))
        );
    }

    #[tokio::test]
    async fn test_steps_echo_refreshes_table() {
        let (link, mut device, mut events) =
            connect(FirmwareDialect::Marlin, vec![ToolConfig::new("extruder", 93.0)]);

        device
            .write_all(b"echo: M92 T0 E415.00\n T:20.0 /0.0\n")
            .await
            .unwrap();
        // Telemetry arrives after the echo line has been applied
        events.recv().await.unwrap();
        assert_eq!(link.tool_config(0).unwrap().steps_per_mm, 415.0);
    }

    #[tokio::test]
    async fn test_klipper_write_targets_configured_extruder() {
        let tools = vec![
            ToolConfig::new("extruder", 400.0),
            ToolConfig::new("extruder_stepper_t1", 400.0),
        ];
        let (link, mut device, _events) = connect(FirmwareDialect::Klipper, tools);

        link.set_steps_per_mm(1, 500.0).unwrap();
        expect(
            &mut device,
            "M83\nSET_EXTRUDER_STEP_DISTANCE EXTRUDER=extruder_stepper_t1 DISTANCE=0.002\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_marlin_connect_refreshes_tool_table() {
        let tools = vec![
            ToolConfig::new("T0", 93.0),
            ToolConfig::new("T1", 93.0),
        ];
        let (link, mut device, mut events) = connect(FirmwareDialect::Marlin, tools);

        expect(&mut device, "M92 T0\nM92 T1\nM83\nM155 S2\n").await;
        device
            .write_all(b"echo: M92 T0 E96.50\necho: M92 T1 E415.00\n T:20.0 /0.0\n")
            .await
            .unwrap();
        events.recv().await.unwrap();

        assert_eq!(link.tool_config(0).unwrap().steps_per_mm, 96.5);
        assert_eq!(link.tool_config(1).unwrap().steps_per_mm, 415.0);
        assert_eq!(link.query_steps_per_mm().unwrap(), 2);
        expect(&mut device, "M92 T0\nM92 T1\n").await;
    }

    #[tokio::test]
    async fn test_klipper_has_no_steps_query() {
        let (link, _device, _events) =
            connect(FirmwareDialect::Klipper, vec![ToolConfig::new("extruder", 93.0)]);
        assert_eq!(link.query_steps_per_mm().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_home_park_and_heat() {
        let tool = ToolConfig::new("extruder", 93.0).with_max_temp(260.0);
        let (link, mut device, _events) = connect(FirmwareDialect::Marlin, vec![tool]);
        expect(&mut device, "M92 T0\nM83\nM155 S2\n").await;

        link.home_axes().unwrap();
        link.park(0, None).unwrap();
        link.set_tool_temperature(0, 215.0).unwrap();
        expect(&mut device, "G28\nT0\nG28\nG1 Z50 F1200\nM104 S215 T0\n").await;
    }

    #[tokio::test]
    async fn test_rejected_heat_and_park_write_nothing() {
        let tool = ToolConfig::new("extruder", 93.0).with_max_temp(260.0);
        let (link, mut device, _events) = connect(FirmwareDialect::RepRapFirmware, vec![tool]);

        assert!(matches!(
            link.set_tool_temperature(0, 300.0),
            Err(ChannelError::CommandRejected { .. })
        ));
        assert!(link.park(2, None).is_err());

        link.park(0, Some((150.0, 150.0))).unwrap();
        expect(&mut device, "M83\nT0\nG1 X150 Y150 F6000\nG1 Z50 F1200\n").await;
    }

    #[tokio::test]
    async fn test_controller_hangup_reports_disconnect() {
        let (_link, device, mut events) =
            connect(FirmwareDialect::Marlin, vec![ToolConfig::new("extruder", 93.0)]);
        drop(device);

        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Failure(ChannelError::Disconnected {
                source: ChannelSource::Motion,
                ..
            }))
        ));
    }
}
