// EncoderLink - MeasurementChannel over the encoder line protocol
//
// The device does not echo request ids, so outstanding MEASURE requests are
// queued and matched to readings in FIFO order. A reading with nothing
// outstanding is reported as a protocol violation and dropped by the
// engine.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::channel::{
    ChannelEvent, ChannelSource, EncoderMode, MeasurementChannel, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::error::{log_channel_error, ChannelError};
use crate::protocol::{EncoderCommand, EncoderInfo, EncoderLine};

enum LinkRequest {
    Send(EncoderCommand),
    Measure(u64),
}

/// Handle to the encoder I/O task
pub struct EncoderLink {
    requests: mpsc::UnboundedSender<LinkRequest>,
    info: watch::Receiver<Option<EncoderInfo>>,
    response_timeout: Duration,
}

impl EncoderLink {
    /// Spawn the I/O task and ask the device for its handshake.
    ///
    /// Replies and failures are delivered on `events`. Must be called from
    /// within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, events: mpsc::UnboundedSender<ChannelEvent>) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (info_tx, info) = watch::channel(None);
        tokio::spawn(run_link(reader, writer, request_rx, events, info_tx));

        let link = Self {
            requests,
            info,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        };
        // Task was just spawned, the receiver is alive
        let _ = link.send(EncoderCommand::Info);
        link
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Handshake data, once the device has answered INFO
    pub fn info(&self) -> Option<EncoderInfo> {
        self.info.borrow().clone()
    }

    /// Set the continuous reporting interval
    pub fn set_interval(&self, interval_ms: u32) -> Result<(), ChannelError> {
        self.send(EncoderCommand::Interval(interval_ms))
    }

    fn send(&self, command: EncoderCommand) -> Result<(), ChannelError> {
        self.submit(LinkRequest::Send(command))
    }

    fn submit(&self, request: LinkRequest) -> Result<(), ChannelError> {
        self.requests
            .send(request)
            .map_err(|_| ChannelError::Disconnected {
                source: ChannelSource::Measurement,
                reason: "encoder link task has stopped".to_string(),
            })
    }
}

impl MeasurementChannel for EncoderLink {
    fn set_mode(&self, mode: EncoderMode) -> Result<(), ChannelError> {
        self.send(mode.into())
    }

    fn reset_accumulator(&self) -> Result<(), ChannelError> {
        self.send(EncoderCommand::Reset)
    }

    fn request_measurement(&self, request_id: u64) -> Result<(), ChannelError> {
        self.submit(LinkRequest::Measure(request_id))
    }

    fn response_timeout(&self) -> Duration {
        self.response_timeout
    }
}

async fn run_link<R, W>(
    reader: R,
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    info: watch::Sender<Option<EncoderInfo>>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut pending: VecDeque<u64> = VecDeque::new();

    let failure = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    log::debug!("[EncoderLink] All handles dropped, stopping");
                    return;
                };
                let command = match request {
                    LinkRequest::Send(command) => command,
                    LinkRequest::Measure(request_id) => {
                        pending.push_back(request_id);
                        EncoderCommand::Measure
                    }
                };
                if let Err(err) = write_command(&mut writer, command).await {
                    break err;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break ChannelError::Disconnected {
                        source: ChannelSource::Measurement,
                        reason: "encoder closed the connection".to_string(),
                    },
                    Err(err) => break ChannelError::Disconnected {
                        source: ChannelSource::Measurement,
                        reason: err.to_string(),
                    },
                };

                match EncoderLine::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(EncoderLine::Handshake(handshake))) => {
                        log::info!(
                            "[EncoderLink] Encoder firmware {} ({}), interval {} ms",
                            handshake.firmware_version,
                            handshake.firmware_date,
                            handshake.interval_ms
                        );
                        info.send_replace(Some(handshake));
                    }
                    Ok(Some(EncoderLine::Reading(value))) => {
                        let event = match pending.pop_front() {
                            Some(request_id) => ChannelEvent::Measurement { request_id, value },
                            None => ChannelEvent::Failure(ChannelError::ProtocolViolation {
                                detail: format!("unrequested encoder reading {}", value),
                            }),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        // Nothing else will answer the oldest request
                        pending.pop_front();
                        log_channel_error(&err, "EncoderLink");
                        if events.send(ChannelEvent::Failure(err)).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    };

    log_channel_error(&failure, "EncoderLink");
    let _ = events.send(ChannelEvent::Failure(failure));
}

async fn write_command<W>(writer: &mut W, command: EncoderCommand) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    log::trace!("[EncoderLink] -> {}", command);
    let result = async {
        writer.write_all(command.to_line().as_bytes()).await?;
        writer.flush().await
    }
    .await;
    result.map_err(|err| ChannelError::Disconnected {
        source: ChannelSource::Measurement,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncReadExt, BufReader, DuplexStream};

    struct FakeDevice {
        stream: DuplexStream,
    }

    impl FakeDevice {
        async fn expect(&mut self, expected: &str) {
            let mut buf = vec![0u8; expected.len()];
            self.stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(String::from_utf8(buf).unwrap(), expected);
        }

        async fn reply(&mut self, line: &str) {
            self.stream.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn connect() -> (EncoderLink, FakeDevice, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (host, device) = duplex(1024);
        let (read_half, write_half) = split(host);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = EncoderLink::spawn(BufReader::new(read_half), write_half, events_tx);
        (link, FakeDevice { stream: device }, events_rx)
    }

    #[tokio::test]
    async fn test_handshake_is_requested_and_stored() {
        let (link, mut device, _events) = connect();
        device.expect("INFO\n").await;
        device.reply("NXE|1.0.3|2021-05-30|250|0.0229\n").await;

        let mut info = link.info.clone();
        info.wait_for(|info| info.is_some()).await.unwrap();
        assert_eq!(link.info().unwrap().interval_ms, 250);
    }

    #[tokio::test]
    async fn test_readings_are_matched_in_order() {
        let (link, mut device, mut events) = connect();
        device.expect("INFO\n").await;

        link.set_mode(EncoderMode::Relative).unwrap();
        link.reset_accumulator().unwrap();
        link.request_measurement(7).unwrap();
        link.request_measurement(8).unwrap();
        device.expect("REL\nRESET\nMEASURE\nMEASURE\n").await;

        device.reply("19.81\r\n20.02\r\n").await;
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Measurement {
                request_id: 7,
                value: 19.81
            })
        );
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Measurement {
                request_id: 8,
                value: 20.02
            })
        );
    }

    #[tokio::test]
    async fn test_unrequested_reading_is_a_violation() {
        let (_link, mut device, mut events) = connect();
        device.expect("INFO\n").await;
        device.reply("3.5\n").await;

        match events.recv().await {
            Some(ChannelEvent::Failure(err)) => assert!(err.is_recoverable()),
            other => panic!("Expected protocol violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_reply_fails_the_request() {
        let (link, mut device, mut events) = connect();
        device.expect("INFO\n").await;
        link.request_measurement(1).unwrap();
        device.expect("MEASURE\n").await;
        device.reply("ERR overflow\n").await;

        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Failure(ChannelError::Malformed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_device_hangup_reports_disconnect() {
        let (link, device, mut events) = connect();
        drop(device);

        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Failure(ChannelError::Disconnected { .. }))
        ));
        // Task is gone, further commands fail immediately
        tokio::task::yield_now().await;
        let mut attempts = 0;
        while link.reset_accumulator().is_ok() && attempts < 100 {
            attempts += 1;
            tokio::task::yield_now().await;
        }
        assert!(link.reset_accumulator().is_err());
    }
}
