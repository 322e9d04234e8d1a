//! USB-HID transport backed by `hidapi`. The TI BSL enumerates as
//! VID 0x2047 / PID 0x0200; devices are addressed by their platform HID
//! path.

use std::ffi::CString;
use std::time::Instant;

use tracing::trace;

use crate::Error;
use crate::transport::{Device, RESPONSE_TIMEOUT, ScanOptions, Transport};

const TI_BSL_VID: u16 = 0x2047;
const TI_BSL_PID: u16 = 0x0200;

const HID_REPORT_LEN: usize = 64;

fn transport_err(action: &'static str, source: hidapi::HidError) -> Error {
    Error::Transport {
        action,
        source: Box::new(source),
    }
}

/// One opened HID device. Baud/DTR/RTS are no-ops on this transport.
pub struct UsbTransport {
    device: Option<hidapi::HidDevice>,
    pending: Vec<u8>,
}

impl UsbTransport {
    /// Open the HID device at `path` (as produced by [`UsbTransport::scan`]).
    pub fn open(path: &str) -> Result<Self, Error> {
        let c_path = CString::new(path).map_err(|_| Error::NoSuchDevice {
            name: path.to_string(),
        })?;

        let api = hidapi::HidApi::new().map_err(|e| transport_err("initializing hidapi", e))?;
        let device = api.open_path(&c_path).map_err(|_| Error::NoSuchDevice {
            name: path.to_string(),
        })?;

        Ok(Self {
            device: Some(device),
            pending: Vec::new(),
        })
    }

    /// Enumerate BSL HID devices; `ignore_vendor_filter` lists every HID
    /// device instead.
    pub fn scan(options: ScanOptions) -> Result<Vec<Device>, Error> {
        let api = hidapi::HidApi::new().map_err(|e| transport_err("initializing hidapi", e))?;

        Ok(api
            .device_list()
            .filter(|info| {
                options.ignore_vendor_filter
                    || (info.vendor_id() == TI_BSL_VID && info.product_id() == TI_BSL_PID)
            })
            .map(|info| Device {
                name: info.path().to_string_lossy().into_owned(),
                description: format!(
                    "{} {:04x}:{:04x}",
                    info.product_string().unwrap_or("HID"),
                    info.vendor_id(),
                    info.product_id()
                ),
            })
            .collect())
    }

    fn device(&self) -> Result<&hidapi::HidDevice, Error> {
        self.device.as_ref().ok_or(Error::Transport {
            action: "using a closed device",
            source: "device already closed".into(),
        })
    }
}

impl Transport for UsbTransport {
    fn set_baud(&mut self, _rate: u32) -> Result<(), Error> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), Error> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<(), Error> {
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), Error> {
        self.pending.clear();
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8], expected_rx_len: usize) -> Result<Vec<u8>, Error> {
        let device = self.device.as_ref().ok_or(Error::Transport {
            action: "using a closed device",
            source: "device already closed".into(),
        })?;

        if !tx.is_empty() {
            trace!(len = tx.len(), "hid write");
            device
                .write(tx)
                .map_err(|e| transport_err("writing report", e))?;
        }
        if expected_rx_len == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        while self.pending.len() < expected_rx_len {
            let mut report = [0u8; HID_REPORT_LEN];
            let received = device
                .read_timeout(&mut report, 50)
                .map_err(|e| transport_err("reading report", e))?;
            self.pending.extend_from_slice(&report[..received]);

            if self.pending.len() < expected_rx_len && Instant::now() >= deadline {
                return Err(if self.pending.is_empty() {
                    Error::Timeout
                } else {
                    Error::ShortRead {
                        expected: expected_rx_len,
                        received: self.pending.len(),
                    }
                });
            }
        }

        trace!(len = expected_rx_len, "hid read");
        Ok(self.pending.drain(..expected_rx_len).collect())
    }

    fn close(&mut self) {
        self.device = None;
        self.pending.clear();
    }
}
