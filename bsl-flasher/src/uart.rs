//! Serial port transport backed by `serialport`.

use std::io::Read;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::trace;

use crate::Error;
use crate::transport::{Device, RESPONSE_TIMEOUT, ScanOptions, Transport};

fn transport_err(
    action: &'static str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> Error {
    Error::Transport {
        action,
        source: Box::new(source),
    }
}

/// One opened serial port, polled with a fixed overall response deadline.
pub struct UartTransport {
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl UartTransport {
    /// Open `name` at the given baud rate. Fails with
    /// [`Error::NoSuchDevice`] when the port does not exist.
    pub fn open(name: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(name, baud)
            // short poll interval; the overall deadline lives in transfer
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => Error::NoSuchDevice {
                    name: name.to_string(),
                },
                _ => transport_err("opening serial port", e),
            })?;

        Ok(Self {
            port: Some(port),
            timeout: RESPONSE_TIMEOUT,
        })
    }

    /// Enumerate serial ports. The UART scan has no vendor filter.
    pub fn scan(_options: ScanOptions) -> Result<Vec<Device>, Error> {
        let ports =
            serialport::available_ports().map_err(|e| transport_err("enumerating ports", e))?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let description = match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        usb.product.unwrap_or_else(|| "USB serial".to_string())
                    }
                    serialport::SerialPortType::PciPort => "PCI serial".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
                    serialport::SerialPortType::Unknown => String::new(),
                };
                Device {
                    name: p.port_name,
                    description,
                }
            })
            .collect())
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, Error> {
        self.port.as_mut().ok_or(Error::Transport {
            action: "using a closed port",
            source: "port already closed".into(),
        })
    }
}

impl Transport for UartTransport {
    fn set_baud(&mut self, rate: u32) -> Result<(), Error> {
        self.port()?
            .set_baud_rate(rate)
            .map_err(|e| transport_err("setting baud rate", e))
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.port()?
            .write_data_terminal_ready(level)
            .map_err(|e| transport_err("setting DTR", e))
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.port()?
            .write_request_to_send(level)
            .map_err(|e| transport_err("setting RTS", e))
    }

    fn clear_buffers(&mut self) -> Result<(), Error> {
        self.port()?
            .clear(ClearBuffer::All)
            .map_err(|e| transport_err("clearing buffers", e))
    }

    fn transfer(&mut self, tx: &[u8], expected_rx_len: usize) -> Result<Vec<u8>, Error> {
        let timeout = self.timeout;
        let port = self.port()?;

        if !tx.is_empty() {
            trace!(len = tx.len(), "uart write");
            port.write_all(tx)
                .map_err(|e| transport_err("writing frame", e))?;
        }
        if expected_rx_len == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; expected_rx_len];
        let mut filled = 0usize;
        let deadline = Instant::now() + timeout;
        while filled < expected_rx_len {
            match port.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(transport_err("reading response", e)),
            }
            if filled < expected_rx_len && Instant::now() >= deadline {
                return Err(if filled == 0 {
                    Error::Timeout
                } else {
                    Error::ShortRead {
                        expected: expected_rx_len,
                        received: filled,
                    }
                });
            }
        }

        trace!(len = filled, "uart read");
        Ok(buf)
    }

    fn close(&mut self) {
        self.port = None;
    }
}
