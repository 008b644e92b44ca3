//! LeCroy WaveSurfer Oscilloscope Driver (VICP)
//!
//! Reference: LeCroy Oscilloscopes Remote Control and Automation Manual
//!
//! Protocol Overview:
//! - Transport: VICP over TCP, port 1861
//! - Every message is prefixed by an 8-byte header:
//!
//! ```text
//! byte 0    operation flags (DATA 0x80, REMOTE 0x40, CLEAR 0x10, EOI 0x01)
//! byte 1    header version (1)
//! byte 2    sequence number (1..=255, wraps)
//! byte 3    spare
//! byte 4-7  payload length, big-endian
//! ```
//!
//! - A response may span several messages; the last one carries EOI
//! - Waveform data (`Cn:WAVEFORM? DAT1`) is little-endian `i16`, optionally wrapped
//!   in an IEEE-488.2 definite-length block (`#9000001000...`)

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::config::OscilloscopeConfig;
use crate::hardware::capabilities::{Acquisition, GridSettings, TriggerSettings, Waveform};
use crate::hardware::serial::DynSerial;

/// Default VICP TCP port.
pub const VICP_PORT: u16 = 1861;

/// VICP header length in bytes.
pub const HEADER_LEN: usize = 8;

/// VICP header version understood by the instrument.
pub const HEADER_VERSION: u8 = 1;

/// Operation flag bits.
pub mod flags {
    /// Payload carries data
    pub const DATA: u8 = 0x80;
    /// Remote mode
    pub const REMOTE: u8 = 0x40;
    /// Device clear
    pub const CLEAR: u8 = 0x10;
    /// End of message
    pub const EOI: u8 = 0x01;
}

/// Sync point issued after every setting command.
const WAIT_UNTIL_IDLE: &str = "vbs? 'return=app.WaitUntilIdle(5)'";

/// Decoded VICP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation flags
    pub flags: u8,
    /// Header version
    pub version: u8,
    /// Sequence number
    pub sequence: u8,
    /// Payload length
    pub length: u32,
}

impl FrameHeader {
    /// Parse the 8 header bytes.
    pub fn decode(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            bail!("VICP header too short: {} bytes", raw.len());
        }
        let flags = raw.get_u8();
        let version = raw.get_u8();
        let sequence = raw.get_u8();
        let _spare = raw.get_u8();
        let length = raw.get_u32();
        Ok(Self {
            flags,
            version,
            sequence,
            length,
        })
    }

    /// Whether this message ends the response.
    pub fn is_end(&self) -> bool {
        self.flags & flags::EOI != 0
    }
}

/// Frame `payload` as one EOI-terminated data message.
pub fn encode_message(payload: &[u8], sequence: u8) -> Result<Bytes> {
    let length = u32::try_from(payload.len()).context("VICP payload too large")?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags::DATA | flags::REMOTE | flags::EOI);
    buf.put_u8(HEADER_VERSION);
    buf.put_u8(sequence);
    buf.put_u8(0);
    buf.put_u32(length);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Strip an IEEE-488.2 definite-length block header if present.
///
/// Data without a `#` prefix is returned unchanged, minus a trailing newline.
pub fn block_payload(data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&b'#') {
        return Ok(data.strip_suffix(b"\n").unwrap_or(data));
    }
    let digits = data
        .get(1)
        .and_then(|d| (*d as char).to_digit(10))
        .ok_or_else(|| anyhow!("malformed block header"))? as usize;
    if digits == 0 {
        bail!("indefinite-length blocks are not supported");
    }
    let len_field = data
        .get(2..2 + digits)
        .ok_or_else(|| anyhow!("truncated block header"))?;
    let length: usize = std::str::from_utf8(len_field)?
        .parse()
        .context("block length is not a number")?;
    let start = 2 + digits;
    data.get(start..start + length).ok_or_else(|| {
        anyhow!(
            "block declares {length} bytes but only {} arrived",
            data.len().saturating_sub(start)
        )
    })
}

/// Decode little-endian `i16` samples; a trailing odd byte is ignored.
pub fn decode_samples(block: &[u8]) -> Vec<i16> {
    block
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

struct VicpLink {
    io: DynSerial,
    sequence: u8,
}

impl VicpLink {
    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence % 255 + 1;
        self.sequence
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let sequence = self.next_sequence();
        let frame = encode_message(command.as_bytes(), sequence)?;
        self.io
            .write_all(&frame)
            .await
            .with_context(|| format!("VICP write of '{command}' failed"))?;
        self.io.flush().await.context("VICP flush failed")?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes> {
        let mut response = BytesMut::new();
        loop {
            let mut raw = [0u8; HEADER_LEN];
            self.io
                .read_exact(&mut raw)
                .await
                .context("VICP header read failed")?;
            let header = FrameHeader::decode(&raw)?;
            if header.version != HEADER_VERSION {
                bail!("unsupported VICP header version {}", header.version);
            }

            let start = response.len();
            response.resize(start + header.length as usize, 0);
            self.io
                .read_exact(&mut response[start..])
                .await
                .context("VICP payload read failed")?;

            if header.is_end() {
                return Ok(response.freeze());
            }
        }
    }
}

/// Driver for LeCroy oscilloscopes reachable over VICP.
pub struct LecroyScope {
    link: Mutex<VicpLink>,
    timeout: Duration,
}

impl LecroyScope {
    /// Connect over TCP and put the scope in binary word mode without headers.
    ///
    /// # Errors
    /// Returns error if the connection fails or the setup commands are not accepted.
    pub async fn connect(config: &OscilloscopeConfig) -> Result<Self> {
        let stream = tokio::time::timeout(
            config.timeout,
            TcpStream::connect((config.address.as_str(), config.port)),
        )
        .await
        .with_context(|| format!("VICP connect to {}:{} timed out", config.address, config.port))?
        .with_context(|| format!("VICP connect to {}:{} failed", config.address, config.port))?;
        stream.set_nodelay(true)?;

        let scope = Self::with_port(Box::new(stream), config.timeout);
        scope.setup().await?;
        let identity = scope.query("*IDN?").await?;
        info!(identity = %String::from_utf8_lossy(&identity).trim(), "Oscilloscope connected");
        Ok(scope)
    }

    /// Wrap an open byte stream without any handshake.
    pub fn with_port(io: DynSerial, timeout: Duration) -> Self {
        Self {
            link: Mutex::new(VicpLink { io, sequence: 0 }),
            timeout,
        }
    }

    /// Disable response headers and select binary word transfers.
    #[instrument(skip(self), err)]
    pub async fn setup(&self) -> Result<()> {
        self.write("COMM_HEADER OFF").await?;
        self.write("COMM_FORMAT OFF,WORD,BIN").await
    }

    async fn send(&self, command: &str) -> Result<()> {
        let mut link = self.link.lock().await;
        tokio::time::timeout(self.timeout, link.send(command))
            .await
            .context("VICP write timeout")?
    }

    async fn query(&self, command: &str) -> Result<Bytes> {
        let mut link = self.link.lock().await;
        tokio::time::timeout(self.timeout, async {
            link.send(command).await?;
            link.receive().await
        })
        .await
        .with_context(|| format!("VICP query '{command}' timed out"))?
    }

    /// Send a setting command, then block until the scope reports idle.
    async fn write(&self, command: &str) -> Result<()> {
        self.send(command).await?;
        let idle = self.query(WAIT_UNTIL_IDLE).await?;
        debug!(%command, idle = %String::from_utf8_lossy(&idle).trim(), "Scope idle");
        Ok(())
    }

    async fn query_block(&self, command: &str) -> Result<Bytes> {
        let raw = self.query(command).await?;
        let payload = block_payload(&raw)?;
        Ok(raw.slice_ref(payload))
    }
}

#[async_trait]
impl Acquisition for LecroyScope {
    #[instrument(skip(self), err)]
    async fn set_grid(&self, grid: GridSettings) -> Result<()> {
        self.write(&format!(
            "C{}:VOLT_DIV {}{}",
            grid.channel,
            grid.volt_division,
            grid.volt_unit.as_str()
        ))
        .await?;
        self.write(&format!(
            "TIME_DIV {}{}",
            grid.time_division,
            grid.time_unit.as_str()
        ))
        .await
    }

    #[instrument(skip(self), err)]
    async fn set_trigger(&self, trigger: TriggerSettings) -> Result<()> {
        self.write(&format!(
            "C{}:TRIG_LEVEL {}{}",
            trigger.channel,
            trigger.level,
            trigger.level_unit.as_str()
        ))
        .await?;
        self.write(&format!(
            "TRIG_DELAY {}{}",
            trigger.delay,
            trigger.delay_unit.as_str()
        ))
        .await?;
        self.write(&format!("TRIG_MODE {}", trigger.mode.as_str()))
            .await
    }

    #[instrument(skip(self), err)]
    async fn acquire(&self, read_only: bool, channel: u8) -> Result<Waveform> {
        if !read_only {
            self.send("ARM_ACQUISITION").await?;
            self.send("WAIT").await?;
        }

        let description = self.query_block(&format!("C{channel}:WAVEFORM? DESC")).await?;
        let text = self.query_block(&format!("C{channel}:WAVEFORM? TEXT")).await?;
        let time = self.query_block(&format!("C{channel}:WAVEFORM? TIME")).await?;
        let data = self.query_block(&format!("C{channel}:WAVEFORM? DAT1")).await?;

        let samples = decode_samples(&data);
        debug!(channel, samples = samples.len(), "Waveform read");
        Ok(Waveform {
            description: String::from_utf8_lossy(&description).into_owned(),
            text: String::from_utf8_lossy(&text).into_owned(),
            time: String::from_utf8_lossy(&time).into_owned(),
            samples,
        })
    }
}
