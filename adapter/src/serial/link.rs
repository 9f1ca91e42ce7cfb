//! The serial port seam.
//!
//! A single pump task owns the port device: it splits inbound bytes into
//! lines for the [`super::matcher::LineMatcher`] and drains an ordered
//! command channel for outbound writes and DTR control. Components never
//! touch the device directly; the serial queue holds the only write sender
//! and the reset shim a DTR-only clone.

use std::io;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

/// How long a blocking open of the device may take.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Hold time between the two DTR edges of a reset blip.
const DTR_BLIP_HOLD: Duration = Duration::from_millis(100);

/// One request for the pump task.
pub enum PortCommand {
    /// Transmit raw bytes, in channel order.
    Write(Vec<u8>),
    /// Toggle DTR low, hold, then high again.
    BlipDtr(oneshot::Sender<io::Result<()>>),
}

/// Opens the printer device the way the firmware expects it: 8-N-1 at the
/// configured baud rate, DTR asserted.
pub fn open_serial(port: &str, baud: u32) -> anyhow::Result<SerialStream> {
    let mut stream = tokio_serial::new(port, baud)
        .timeout(OPEN_TIMEOUT)
        .open_native_async()
        .with_context(|| format!("opening serial port {port}"))?;
    stream
        .write_data_terminal_ready(true)
        .context("asserting DTR")?;
    info!(port, baud, "serial port open");
    Ok(stream)
}

/// DTR setter for a real serial device.
pub fn serial_dtr() -> impl FnMut(&mut SerialStream, bool) -> io::Result<()> + Send {
    |stream, level| {
        stream
            .write_data_terminal_ready(level)
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

/// Runs the port pump until shutdown, EOF or an I/O error.
///
/// `on_line` fires synchronously on the pump task for every inbound line,
/// stripped of its terminator; it must not block. `set_dtr` adapts the DTR
/// control to the concrete stream (a no-op for in-memory test streams).
pub async fn serial_pump<S, D>(
    mut stream: S,
    mut commands: mpsc::Receiver<PortCommand>,
    on_line: impl Fn(&str) + Send,
    mut set_dtr: D,
    mut running: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: FnMut(&mut S, bool) -> io::Result<()> + Send,
{
    enum Action {
        Command(Option<PortCommand>),
        Read(io::Result<usize>),
        RunningChanged,
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let action = tokio::select! {
            command = commands.recv() => Action::Command(command),
            read = stream.read(&mut chunk) => Action::Read(read),
            _ = running.changed() => Action::RunningChanged,
        };

        match action {
            Action::RunningChanged => {
                if !*running.borrow() {
                    debug!("serial pump shutting down");
                    return Ok(());
                }
            }
            Action::Command(None) => {
                debug!("all port command senders dropped, pump exiting");
                return Ok(());
            }
            Action::Command(Some(PortCommand::Write(bytes))) => {
                trace!(line = %String::from_utf8_lossy(&bytes).trim_end(), "serial write");
                stream.write_all(&bytes).await?;
                stream.flush().await?;
            }
            Action::Command(Some(PortCommand::BlipDtr(reply))) => {
                let result = blip(&mut stream, &mut set_dtr).await;
                let _ = reply.send(result);
            }
            Action::Read(Ok(0)) => {
                info!("serial link closed by peer");
                return Ok(());
            }
            Action::Read(Ok(read)) => {
                pending.extend_from_slice(&chunk[..read]);
                while let Some(position) = pending.iter().position(|byte| *byte == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=position).collect();
                    let line = String::from_utf8_lossy(&raw[..position]);
                    let line = line.trim_end_matches('\r');
                    if !line.is_empty() {
                        trace!(line, "serial read");
                        on_line(line);
                    }
                }
            }
            Action::Read(Err(err)) => return Err(err),
        }
    }
}

async fn blip<S, D>(stream: &mut S, set_dtr: &mut D) -> io::Result<()>
where
    D: FnMut(&mut S, bool) -> io::Result<()>,
{
    set_dtr(stream, false)?;
    tokio::time::sleep(DTR_BLIP_HOLD).await;
    set_dtr(stream, true)
}

/// Contract of the physical reset collaborator.
///
/// A GPIO-capable deployment pulses the configured reset pin; the in-tree
/// fallback only knows how to blip DTR through the pump.
#[async_trait]
pub trait ResetShim: Send + Sync {
    /// Attempts a hardware (GPIO) reset. `Ok(false)` means the capability
    /// is not available and the caller should fall back to DTR.
    async fn hardware_reset(&self) -> anyhow::Result<bool>;

    /// Toggles the serial DTR line, resetting boards wired for it.
    async fn blip_dtr(&self) -> anyhow::Result<()>;
}

/// Reset shim with no GPIO capability; DTR through the port pump only.
pub struct DtrResetShim {
    port: mpsc::Sender<PortCommand>,
}

impl DtrResetShim {
    pub fn new(port: mpsc::Sender<PortCommand>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl ResetShim for DtrResetShim {
    async fn hardware_reset(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn blip_dtr(&self) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.port
            .send(PortCommand::BlipDtr(reply_tx))
            .await
            .context("port pump gone while blipping DTR")?;
        reply_rx.await.context("port pump dropped the DTR reply")??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_pump_splits_lines_and_writes_in_order() {
        let (near, mut far) = tokio::io::duplex(4096);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (running_tx, running_rx) = watch::channel(true);

        let lines = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&lines);
        let pump = tokio::spawn(serial_pump(
            near,
            command_rx,
            move |line| seen.lock().unwrap().push(line.to_string()),
            |_, _| Ok(()),
            running_rx,
        ));

        command_tx
            .send(PortCommand::Write(b"N1 M115*57\n".to_vec()))
            .await
            .unwrap();
        command_tx
            .send(PortCommand::Write(b"N2 M105*53\n".to_vec()))
            .await
            .unwrap();

        far.write_all(b"start\r\nok\n").await.unwrap();

        let mut outbound = vec![0u8; 64];
        let mut collected = Vec::new();
        while collected.len() < 22 {
            let read = far.read(&mut outbound).await.unwrap();
            collected.extend_from_slice(&outbound[..read]);
        }
        assert_eq!(&collected, b"N1 M115*57\nN2 M105*53\n");

        // Wait for the inbound lines to pass through the pump.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if lines.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["start".to_string(), "ok".to_string()]);

        running_tx.send(false).unwrap();
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dtr_blip_round_trip() {
        let (near, _far) = tokio::io::duplex(64);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (_running_tx, running_rx) = watch::channel(true);

        let edges = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&edges);
        let _pump = tokio::spawn(serial_pump(
            near,
            command_rx,
            |_| {},
            move |_, level| {
                recorded.lock().unwrap().push(level);
                Ok(())
            },
            running_rx,
        ));

        let shim = DtrResetShim::new(command_tx);
        shim.blip_dtr().await.unwrap();
        assert_eq!(*edges.lock().unwrap(), vec![false, true]);
    }
}
