//! Serial port settings for XBee modules.
//!
//! XBee modules attach over a UART, usually through a USB adapter that
//! presents a virtual COM port. Factory firmware runs at 9600 baud, 8N1, with
//! no flow control; boards wired for RTS/CTS can enable hardware flow control
//! so that large transmit bursts are not dropped by the module.
//!
//! # Example
//!
//! ```no_run
//! use meshlink_xbee::{open_serial_stream, SerialConfig};
//!
//! # async fn example() -> meshlink_core::Result<()> {
//! let config = SerialConfig::with_baud(115200).hardware_flow_control();
//! let stream = open_serial_stream("/dev/ttyUSB0", &config)?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

use meshlink_core::error::{Error, Result};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial port configuration.
///
/// Defaults match XBee factory settings:
/// - 9600 baud
/// - 8 data bits
/// - 1 stop bit
/// - No parity
/// - No flow control
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate (module `BD` setting: 9600, 19200, 38400, 57600, 115200)
    pub baud_rate: u32,
    /// Number of data bits (always 8 on XBee)
    pub data_bits: DataBits,
    /// Number of stop bits (module `SB` setting)
    pub stop_bits: StopBits,
    /// Parity checking (module `NB` setting)
    pub parity: Parity,
    /// Flow control (module `D6`/`D7` settings)
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Default settings at the given baud rate.
    pub fn with_baud(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Enable RTS/CTS flow control.
    pub fn hardware_flow_control(mut self) -> Self {
        self.flow_control = FlowControl::Hardware;
        self
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Open a serial port for an XBee module.
///
/// The returned stream is ready to hand to
/// [`XBeeLink::open`](crate::XBeeLink::open).
pub fn open_serial_stream(port: &str, config: &SerialConfig) -> Result<SerialStream> {
    tracing::debug!(
        port = %port,
        baud_rate = config.baud_rate,
        data_bits = ?config.data_bits,
        stop_bits = ?config.stop_bits,
        parity = ?config.parity,
        flow_control = ?config.flow_control,
        "Opening serial port"
    );

    let mut stream = tokio_serial::new(port, config.baud_rate)
        .data_bits(config.data_bits.into())
        .stop_bits(config.stop_bits.into())
        .parity(config.parity.into())
        .flow_control(config.flow_control.into())
        .open_native_async()
        .map_err(|e| {
            tracing::error!(port = %port, error = %e, "Failed to open serial port");
            Error::Transport(format!("failed to open serial port {}: {}", port, e))
        })?;

    // DTR doubles as the sleep-request line on XBee modules with pin sleep
    // enabled; hold it asserted so the module stays awake.
    if let Err(e) = stream.write_data_terminal_ready(true) {
        tracing::warn!(port = %port, error = %e, "Failed to assert DTR");
    }

    tracing::info!(port = %port, baud_rate = config.baud_rate, "Serial port opened");
    Ok(stream)
}
