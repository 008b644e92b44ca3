//! Thurlby Thandar TG2512A Arbitrary Waveform Generator Driver
//!
//! Protocol Overview:
//! - Format: ASCII commands terminated by LF over RS-232/USB-serial
//! - Baud: 115200, 8N1, no flow control
//! - Only queries (`*IDN?`) answer; setting commands are silent
//! - Example: "CHN 1", "FREQ 10000", "WAVE SINE", "*TRG"
//!
//! Triggered bursts use manual trigger source, so every `*TRG` emits exactly one
//! burst of `BSTCOUNT` cycles and pulses the sync output.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::config::SignalGeneratorConfig;
use crate::hardware::capabilities::{ExcitationSource, PulseShape, WaveKind};
use crate::hardware::serial::{drain_serial_buffer, open_serial_async, wrap_shared, DynSerial, SharedPort};

/// Pause after each silent command; the generator drops input while busy.
const COMMAND_GAP: Duration = Duration::from_millis(10);

/// Driver for the TG2512A.
pub struct Tg2512a {
    port: SharedPort,
    timeout: Duration,
}

impl Tg2512a {
    /// Open the configured port and check the instrument identity.
    ///
    /// # Errors
    /// Returns error if the port cannot be opened or `*IDN?` gets no answer.
    pub async fn connect(config: &SignalGeneratorConfig) -> Result<Self> {
        let port = open_serial_async(&config.port, config.baud_rate, "TG2512A").await?;
        let driver = Self::with_port(Box::new(port), config.response_timeout);

        {
            let mut port = driver.port.lock().await;
            let writer = port.get_mut();
            writer.write_all(b"\r\n\r\n").await.context("TG2512A wake write failed")?;
            writer.flush().await.context("TG2512A flush failed")?;
            drain_serial_buffer(port.get_mut(), 50).await;
        }

        let identity = driver
            .identify()
            .await
            .map_err(|e| anyhow!("TG2512A validation failed: no response to *IDN?. Error: {e:#}"))?;
        tracing::info!(%identity, "Signal generator connected");
        Ok(driver)
    }

    /// Wrap an open transport without any handshake.
    pub fn with_port(port: DynSerial, timeout: Duration) -> Self {
        Self {
            port: wrap_shared(port),
            timeout,
        }
    }

    /// Query the identity string.
    #[instrument(skip(self), err)]
    pub async fn identify(&self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// Beep and hand the front panel back to the user.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self) -> Result<()> {
        self.send_command("BEEP").await?;
        self.send_command("LOCAL").await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;

        let cmd = format!("{command}\n");
        let writer = port.get_mut();
        writer
            .write_all(cmd.as_bytes())
            .await
            .context("TG2512A write failed")?;
        writer.flush().await.context("TG2512A flush failed")?;

        let mut response = String::new();
        let read = tokio::time::timeout(self.timeout, port.read_line(&mut response))
            .await
            .context("TG2512A read timeout")?
            .context("TG2512A read error")?;
        if read == 0 {
            return Err(anyhow!("TG2512A closed the connection"));
        }

        Ok(response.trim().to_string())
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        let mut port = self.port.lock().await;

        let cmd = format!("{command}\n");
        let writer = port.get_mut();
        writer
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("TG2512A write of '{command}' failed"))?;
        writer.flush().await.context("TG2512A flush failed")?;

        tokio::time::sleep(COMMAND_GAP).await;
        Ok(())
    }
}

#[async_trait]
impl ExcitationSource for Tg2512a {
    #[instrument(skip(self), err)]
    async fn set_channel(&self, channel: u8) -> Result<()> {
        self.send_command(&format!("CHN {channel}")).await
    }

    #[instrument(skip(self), err)]
    async fn set_output(&self, enabled: bool) -> Result<()> {
        self.send_command(if enabled { "OUTPUT ON" } else { "OUTPUT OFF" })
            .await
    }

    #[instrument(skip(self), err)]
    async fn set_frequency(&self, hz: f64) -> Result<()> {
        self.send_command(&format!("FREQ {hz}")).await
    }

    #[instrument(skip(self), err)]
    async fn set_wave(&self, kind: WaveKind, register: Option<u8>) -> Result<()> {
        self.send_command(&format!("WAVE {kind}")).await?;
        if let (WaveKind::Arb, Some(n)) = (kind, register) {
            self.send_command(&format!("ARBLOAD ARB{n}")).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_pulse(&self, shape: PulseShape) -> Result<()> {
        for command in [
            format!("WAVE {}", WaveKind::Pulse),
            format!("PULSFREQ {}", shape.frequency),
            format!("AMPL {}", shape.amplitude),
            format!("DCOFFS {}", shape.offset),
            format!("PULSWID {}", shape.width),
            format!("PULSDLY {}", shape.delay),
        ] {
            self.send_command(&command).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_burst_mode(&self, count: u32) -> Result<()> {
        for command in [
            format!("BSTCOUNT {count}"),
            "BSTPHASE 0".to_string(),
            "BST NCYC".to_string(),
            "TRGSRC MAN".to_string(),
            "TRGOUT BURST".to_string(),
            "SYNCOUT ON".to_string(),
            "SYNCTYPE BURST".to_string(),
        ] {
            self.send_command(&command).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn burst(&self) -> Result<()> {
        self.send_command("*TRG").await
    }
}
