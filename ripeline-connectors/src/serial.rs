//! Serial link to the sensor/actuator board
//!
//! One USB serial port carries both directions as line-delimited JSON:
//!
//! ```text
//! board → edge   {"ir_detected": true, "timestamp": "12345"}
//! edge  → board  {"servo": 1, "angle": 90}
//! ```
//!
//! The port is opened once and split with `try_clone` so the trigger reader
//! and the actuator writer each own a handle. Reads use the port timeout, so
//! a trigger poll returns `None` when the board is quiet.

use std::io::{self, BufRead, BufReader, Read, Write};

use ripeline_core::config::SerialConfig;
use ripeline_core::ActuatorCommand;
use serde::Deserialize;
use serialport::SerialPort;
use thiserror::Error;

/// Upper bound on lines consumed by one trigger poll
const MAX_LINES_PER_POLL: usize = 64;

/// Longest partial line kept while waiting for its newline
const MAX_PENDING: usize = 4096;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("serial I/O: {0}")]
    Io(#[from] io::Error),

    #[error("command encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One "object present" report from the IR sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Board-side timestamp, opaque to the edge
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SensorFrame {
    ir_detected: bool,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

/// Source of IR triggers
pub trait TriggerSource {
    /// Non-blocking beyond the read timeout; `Ok(None)` when idle
    fn poll_trigger(&mut self) -> Result<Option<Trigger>, SerialError>;
}

/// Sink for actuator commands
pub trait Actuator {
    fn actuate(&mut self, command: ActuatorCommand) -> Result<(), SerialError>;
}

/// Line-delimited JSON trigger reader
pub struct LineTrigger<R: BufRead> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: BufRead> LineTrigger<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Next complete line, keeping partial input across timeouts
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, SerialError> {
        let room = (MAX_PENDING + 1).saturating_sub(self.pending.len()) as u64;
        match self.reader.by_ref().take(room).read_until(b'\n', &mut self.pending) {
            Ok(0) => Ok(None),
            Ok(_) if self.pending.ends_with(b"\n") => Ok(Some(std::mem::take(&mut self.pending))),
            Ok(_) if self.pending.len() > MAX_PENDING => {
                log::warn!("discarding {} bytes of sensor input without a newline", self.pending.len());
                self.pending.clear();
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_line(line: &[u8]) -> Option<Trigger> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<SensorFrame>(text) {
        Ok(frame) if frame.ir_detected => Some(Trigger {
            timestamp: frame.timestamp.map(|t| match t {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
        }),
        Ok(_) => None,
        Err(e) => {
            log::warn!("ignoring malformed sensor line {text:?}: {e}");
            None
        }
    }
}

impl<R: BufRead> TriggerSource for LineTrigger<R> {
    fn poll_trigger(&mut self) -> Result<Option<Trigger>, SerialError> {
        for _ in 0..MAX_LINES_PER_POLL {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            if let Some(trigger) = parse_line(&line) {
                log::debug!("IR trigger at {:?}", trigger.timestamp);
                return Ok(Some(trigger));
            }
        }
        Ok(None)
    }
}

/// Line-delimited JSON actuator writer
pub struct LineActuator<W: Write> {
    writer: W,
}

impl<W: Write> LineActuator<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Actuator for LineActuator<W> {
    fn actuate(&mut self, command: ActuatorCommand) -> Result<(), SerialError> {
        let mut line = serde_json::to_vec(&command)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        log::info!("sent servo command: servo={} angle={}", command.actuator_id, command.target_angle);
        Ok(())
    }
}

pub type SerialTrigger = LineTrigger<BufReader<Box<dyn SerialPort>>>;
pub type SerialActuator = LineActuator<Box<dyn SerialPort>>;

/// Open the board's port and split it into trigger reader and actuator writer
pub fn open(config: &SerialConfig) -> Result<(SerialTrigger, SerialActuator), SerialError> {
    let open_err = |e: serialport::Error| SerialError::Open {
        port: config.port.clone(),
        reason: e.to_string(),
    };

    let port = serialport::new(&config.port, config.baud)
        .timeout(config.read_timeout)
        .open()
        .map_err(open_err)?;
    if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
        log::warn!("could not flush stale serial input: {e}");
    }
    let writer = port.try_clone().map_err(open_err)?;

    log::info!("connected to serial port {} at {} baud", config.port, config.baud);
    Ok((LineTrigger::new(BufReader::new(port)), LineActuator::new(writer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Cursor, Read};

    /// Yields scripted chunks; `None` and exhaustion time out like an idle port
    struct Chunks(VecDeque<Option<&'static [u8]>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                _ => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
            }
        }
    }

    fn scripted(steps: &[Option<&'static [u8]>]) -> LineTrigger<BufReader<Chunks>> {
        LineTrigger::new(BufReader::new(Chunks(steps.iter().copied().collect())))
    }

    fn trigger(chunks: &[&'static [u8]]) -> LineTrigger<BufReader<Chunks>> {
        LineTrigger::new(BufReader::new(Chunks(chunks.iter().copied().map(Some).collect())))
    }

    #[test]
    fn detects_trigger() {
        let mut source = trigger(&[&b"{\"ir_detected\": true, \"timestamp\": \"1042\"}\n"[..]]);
        assert_eq!(
            source.poll_trigger().unwrap(),
            Some(Trigger {
                timestamp: Some("1042".into())
            })
        );
        assert_eq!(source.poll_trigger().unwrap(), None);
    }

    #[test]
    fn idle_and_negative_frames_are_not_triggers() {
        let mut source = trigger(&[&b"{\"ir_detected\": false, \"timestamp\": \"1\"}\n"[..]]);
        assert_eq!(source.poll_trigger().unwrap(), None);
        assert_eq!(source.poll_trigger().unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut source = trigger(&[
            &b"garbage\n"[..],
            &b"{\"ir_detected\": \"yes\"}\n"[..],
            &b"\xff\xfe\n"[..],
            &b"{\"ir_detected\": true, \"timestamp\": 77}\n"[..],
        ]);
        assert_eq!(
            source.poll_trigger().unwrap(),
            Some(Trigger {
                timestamp: Some("77".into())
            })
        );
    }

    #[test]
    fn partial_line_survives_timeout() {
        let mut source = scripted(&[Some(&b"{\"ir_detec"[..]), None, Some(&b"ted\": true}\n"[..])]);
        assert_eq!(source.poll_trigger().unwrap(), None);
        assert_eq!(source.poll_trigger().unwrap(), Some(Trigger { timestamp: None }));
    }

    #[test]
    fn runaway_line_is_discarded() {
        let mut input = vec![b'x'; 3 * MAX_PENDING];
        input.extend_from_slice(b"\n{\"ir_detected\": true, \"timestamp\": \"9\"}\n");
        let mut source = LineTrigger::new(Cursor::new(input));

        let mut triggers = Vec::new();
        for _ in 0..8 {
            if let Some(trigger) = source.poll_trigger().unwrap() {
                triggers.push(trigger);
            }
            assert!(source.pending.len() <= MAX_PENDING);
        }
        assert_eq!(
            triggers,
            [Trigger {
                timestamp: Some("9".into())
            }]
        );
    }

    #[test]
    fn eof_is_idle() {
        let mut source = LineTrigger::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(source.poll_trigger().unwrap(), None);
    }

    #[test]
    fn actuator_writes_one_json_line() {
        let mut actuator = LineActuator::new(Vec::new());
        actuator.actuate(ActuatorCommand::new(1, 90)).unwrap();
        actuator.actuate(ActuatorCommand::new(1, 180)).unwrap();

        let written = String::from_utf8(actuator.into_inner()).unwrap();
        assert_eq!(written, "{\"servo\":1,\"angle\":90}\n{\"servo\":1,\"angle\":180}\n");
    }

    #[test]
    fn missing_port_fails_to_open() {
        let config = SerialConfig {
            port: "/dev/ripeline-no-such-port".into(),
            ..SerialConfig::default()
        };
        assert!(matches!(open(&config), Err(SerialError::Open { .. })));
    }
}
