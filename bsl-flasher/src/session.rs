//! The linear BSL session driver.
//!
//! A session owns one opened transport for its lifetime and walks a fixed
//! sequence of steps: init, firmware prep, line setup, BSL invoke, baud
//! negotiation, authentication, version query, data transfer, CRC verify,
//! load PC, reset, finish. Each step is a `Result`-returning function; the
//! driver records one [`Report`] per step and performs the same cleanup on
//! every exit path. Cancellation is cooperative via a token checked before
//! every wire exchange and GPIO wait.

use std::thread;
use std::time::Duration;

use futures::channel::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bsl_firmware::{Crc16, Firmware, Format, RxBlock, crc16_ccitt, fill_gaps};

use crate::Error;
use crate::frame::{self, CoreCommand, Reply};
use crate::mcu::{InvokeMechanism, Mcu, Protocol};
use crate::status::{BslVersion, Report, ReportResult, Status, StatusEx};
use crate::transport::Transport;

/// Spacing between consecutive protocol exchanges.
const INTER_COMMAND_DELAY: Duration = Duration::from_millis(10);
/// Flash settle time after a mass erase, before the password frame.
const MASS_ERASE_SETTLE: Duration = Duration::from_secs(1);
/// Wait after the invoke waveform before the first protocol byte.
const INVOKE_SETTLE: Duration = Duration::from_millis(350);
/// Width of one GPIO pulse in the invoke and reset waveforms.
const PULSE_WIDTH: Duration = Duration::from_millis(10);
/// How long RST is held low during the reset waveform.
const RESET_HOLD: Duration = Duration::from_millis(250);

/// Address of the MSP430 reset vector word in the interrupt vector table.
const RESET_VECTOR_ADDR: u32 = 0xFFFE;

/// What the session should do once the target is authenticated.
#[derive(Debug, Clone)]
pub enum Command {
    /// Mass-erase the entire main memory.
    Erase,
    /// Write a parsed firmware image into the target.
    Upload { firmware: Firmware },
    /// Read `size` bytes starting at `addr` out of the target.
    Download { addr: u32, size: u32 },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Erase => "erase",
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
        }
    }
}

/// Per-session settings resolved from the target MCU.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mcu: Mcu,
    pub protocol: Protocol,
    pub invoke: InvokeMechanism,
    /// UART baud rate to negotiate after invoke; ignored over USB.
    pub baud: u32,
    /// BSL password; `None` selects the erase-then-blank-password path for
    /// upload and erase, and the all-0xFF default elsewhere.
    pub password: Option<Vec<u8>>,
}

impl SessionConfig {
    /// Resolve the protocol for `mcu` over the chosen transport kind and
    /// fill in the defaults. Fails when the part has no USB BSL.
    pub fn new(mcu: Mcu, usb: bool) -> Result<Self, Error> {
        let protocol = mcu.protocol(usb)?;
        let invoke = if usb {
            // USB enumeration is the invoke; there are no GPIO lines
            InvokeMechanism::Manual
        } else {
            mcu.default_invoke()
        };
        Ok(Self {
            mcu,
            protocol,
            invoke,
            baud: Protocol::DEFAULT_BAUD,
            password: None,
        })
    }
}

/// One progress update, emitted per step and per transferred block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub step: String,
    /// Monotonically non-decreasing, 0..=100.
    pub percent: u8,
}

/// Everything a finished session hands back to the caller.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: StatusEx,
    /// Image read from the target, for download sessions that reached the
    /// end of the transfer loop.
    pub downloaded: Option<Firmware>,
}

/// Address range and host-side CRC the verify step checks the device
/// against.
#[derive(Debug, Clone, Copy)]
struct VerifyPlan {
    addr: u32,
    len: u64,
    crc: u16,
}

/// Run one complete session over an already-opened transport. The
/// transport is closed on every exit path; errors are folded into the
/// returned [`StatusEx`] instead of being thrown at the caller.
pub fn run(
    transport: &mut dyn Transport,
    config: SessionConfig,
    command: Command,
    progress: Option<mpsc::Sender<Progress>>,
    cancel: Option<CancellationToken>,
) -> SessionOutcome {
    let mut session = Session {
        transport,
        config,
        command,
        progress,
        cancel,
        reports: Vec::new(),
        step: String::new(),
        bytes_processed: 0,
        bsl_version: None,
        downloaded: None,
        custom_password_used: false,
        blocks: Vec::new(),
        download_plan: None,
        verify: None,
        reset_vector: None,
    };

    let result = session.execute();
    session.transport.close();

    let status = match result {
        Ok(()) => Status::success(),
        Err(err) => {
            session.fail_pending();
            warn!(error = %err, "session failed");
            Status::from_error(&err)
        }
    };

    SessionOutcome {
        status: StatusEx {
            status,
            reports: session.reports,
            bytes_processed: session.bytes_processed,
            bsl_version: session.bsl_version,
        },
        downloaded: session.downloaded,
    }
}

struct Session<'a> {
    transport: &'a mut dyn Transport,
    config: SessionConfig,
    command: Command,
    progress: Option<mpsc::Sender<Progress>>,
    cancel: Option<CancellationToken>,
    reports: Vec<Report>,
    step: String,
    bytes_processed: u64,
    bsl_version: Option<BslVersion>,
    downloaded: Option<Firmware>,
    custom_password_used: bool,
    blocks: Vec<RxBlock>,
    download_plan: Option<(u32, u32)>,
    verify: Option<VerifyPlan>,
    reset_vector: Option<u16>,
}

impl Session<'_> {
    fn execute(&mut self) -> Result<(), Error> {
        let protocol = self.config.protocol;

        // 1: record start, reject command/protocol combinations the USB
        // BSL cannot serve before any device interaction
        self.begin("INIT", 5);
        info!(
            mcu = %self.config.mcu,
            protocol = %protocol,
            command = self.command.name(),
            "session start"
        );
        if protocol.is_usb() {
            match self.command {
                Command::Erase => {
                    return Err(Error::UnsupportedCommand {
                        command: "mass erase",
                        protocol,
                    });
                }
                Command::Download { .. } => {
                    return Err(Error::UnsupportedCommand {
                        command: "TX data block",
                        protocol,
                    });
                }
                Command::Upload { .. } => {}
            }
        }
        self.finish(ReportResult::Success);

        // 2: firmware prep, no device interaction yet
        self.begin("PREPARE FIRMWARE", 10);
        if matches!(self.command, Command::Erase) {
            self.finish(ReportResult::Skipped);
        } else {
            self.prepare()?;
            self.finish(ReportResult::Success);
        }

        // 3: line configuration on the already-opened transport
        self.begin("OPEN TRANSPORT", 15);
        self.transport.set_baud(Protocol::DEFAULT_BAUD)?;
        self.transport.clear_buffers()?;
        self.finish(ReportResult::Success);

        // 4: GPIO entry waveform
        self.begin("INVOKE BSL", 20);
        if protocol.is_usb() || self.config.invoke == InvokeMechanism::Manual {
            self.finish(ReportResult::Skipped);
        } else {
            self.invoke_bsl()?;
            self.finish(ReportResult::Success);
        }

        // 5: baud negotiation; tolerated on failure except timeout
        self.begin("CHANGE BAUD RATE", 25);
        self.negotiate_baud()?;

        // 6: authentication, possibly via mass erase
        self.begin("AUTHENTICATE", 30);
        self.authenticate()?;
        self.finish(ReportResult::Success);

        // 7: informational version query, best-effort
        self.begin("BSL VERSION", 40);
        if protocol.is_usb() {
            self.finish(ReportResult::Skipped);
        } else {
            self.query_version()?;
        }

        // 8: the transfer loop
        self.begin("TRANSFER DATA", 40);
        if matches!(self.command, Command::Erase) {
            self.finish(ReportResult::Skipped);
        } else {
            self.transfer()?;
            self.finish(ReportResult::Success);
        }

        // 9: device-side CRC over the full address range
        self.begin("CRC CHECK", 95);
        self.verify_crc()?;

        // 10: jump to the uploaded image, best-effort
        self.begin("LOAD PC", 98);
        self.load_pc()?;

        // 11: hardware reset waveform
        self.begin("RESET MCU", 99);
        if protocol.is_usb() || self.config.invoke == InvokeMechanism::Manual {
            self.finish(ReportResult::Skipped);
        } else {
            self.reset_mcu()?;
            self.finish(ReportResult::Success);
        }

        // 12: the driver closes the transport on every path
        self.begin("FINISH", 100);
        self.finish(ReportResult::Success);
        info!(bytes = self.bytes_processed, "session complete");
        Ok(())
    }

    // ---- step bodies ----

    fn prepare(&mut self) -> Result<(), Error> {
        let buffer = self.config.mcu.buffer_size(self.config.protocol);

        match &self.command {
            Command::Erase => unreachable!("erase skips firmware prep"),
            Command::Upload { firmware } => {
                let info = firmware.info();
                debug!(
                    addr_first = format_args!("{:#06X}", info.addr_first),
                    addr_last = format_args!("{:#06X}", info.addr_last),
                    size_code = info.size_code,
                    "upload image"
                );

                self.blocks = firmware.blocks(buffer);

                // the device CRC covers the whole span; erased gaps read
                // back 0xFF, so the host CRC runs over gap-filled data
                let (filled, _) = fill_gaps(firmware.nodes());
                let data: Vec<u8> = filled.iter().map(|n| n.data).collect();
                self.verify = Some(VerifyPlan {
                    addr: info.addr_first,
                    len: info.size_full,
                    crc: crc16_ccitt(&data),
                });

                let lo = firmware.byte_at(RESET_VECTOR_ADDR);
                let hi = firmware.byte_at(RESET_VECTOR_ADDR + 1);
                self.reset_vector = lo.zip(hi).map(|(lo, hi)| u16::from_le_bytes([lo, hi]));
            }
            Command::Download { addr, size } => {
                let planned = Firmware::planned(*addr, *size, buffer);
                debug!(
                    addr_first = format_args!("{:#06X}", planned.info().addr_first),
                    addr_last = format_args!("{:#06X}", planned.info().addr_last),
                    "download range"
                );
                self.download_plan = Some((*addr, *size));
                self.verify = Some(VerifyPlan {
                    addr: *addr,
                    len: u64::from(*size),
                    crc: 0,
                });
            }
        }
        Ok(())
    }

    fn negotiate_baud(&mut self) -> Result<(), Error> {
        if self.config.protocol.is_usb() || self.config.baud == Protocol::DEFAULT_BAUD {
            self.finish(ReportResult::Skipped);
            return Ok(());
        }

        let baud = self.config.baud;
        match self.exchange(&CoreCommand::ChangeBaud { baud }) {
            Ok(_) => {
                self.transport.set_baud(baud)?;
                info!(baud, "baud rate changed");
                self.finish(ReportResult::Success);
            }
            Err(err) if err.is_timeout() || err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(error = %err, "baud negotiation failed, continuing at default rate");
                self.finish(ReportResult::Failed);
            }
        }
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), Error> {
        let expected = self.config.mcu.password_len();
        // over USB and for downloads the password goes out directly; there
        // is no erase fallback on those paths
        let direct_only = self.config.protocol.is_usb()
            || matches!(self.command, Command::Download { .. });

        if matches!(self.command, Command::Erase) {
            // the mass erase is the operation itself; a supplied password
            // would only skip it
            return self.erase_then_default_password(expected);
        }

        match self.config.password.take() {
            Some(password) if password.len() == expected => {
                self.exchange(&CoreCommand::RxPassword(&password))?;
                self.custom_password_used = true;
                info!("authenticated with supplied password");
                Ok(())
            }
            Some(password) if direct_only => Err(Error::PasswordLength {
                expected,
                found: password.len(),
            }),
            Some(password) => {
                warn!(
                    expected,
                    found = password.len(),
                    "password has the wrong length, falling back to mass erase"
                );
                self.erase_then_default_password(expected)
            }
            None if direct_only => {
                let password = vec![0xFF; expected];
                self.exchange(&CoreCommand::RxPassword(&password))?;
                Ok(())
            }
            None => self.erase_then_default_password(expected),
        }
    }

    /// The security fallback when no usable password is known: erase the
    /// whole memory, then unlock with the now-blank all-0xFF password.
    fn erase_then_default_password(&mut self, password_len: usize) -> Result<(), Error> {
        info!("mass erase");
        self.exchange(&CoreCommand::MassErase)?;
        thread::sleep(MASS_ERASE_SETTLE);
        self.send_progress(35);

        let password = vec![0xFF; password_len];
        self.exchange(&CoreCommand::RxPassword(&password))?;
        info!("authenticated with blank password");
        Ok(())
    }

    fn query_version(&mut self) -> Result<(), Error> {
        match self.exchange(&CoreCommand::BslVersion) {
            Ok(Reply::Version(raw)) => {
                let version = BslVersion(raw);
                info!(%version, "BSL version");
                self.bsl_version = Some(version);
                self.finish_named(ReportResult::Success, format!("BSL VERSION ({version})"));
            }
            Ok(_) => self.finish(ReportResult::Failed),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(error = %err, "BSL version query failed");
                self.finish(ReportResult::Failed);
            }
        }
        Ok(())
    }

    fn transfer(&mut self) -> Result<(), Error> {
        if let Some((addr, size)) = self.download_plan {
            self.download_chunks(addr, size)
        } else {
            self.upload_blocks()
        }
    }

    fn upload_blocks(&mut self) -> Result<(), Error> {
        let blocks = std::mem::take(&mut self.blocks);
        let total: u64 = blocks.iter().map(|b| b.data.len() as u64).sum();
        info!(blocks = blocks.len(), bytes = total, "uploading");

        let mut sent = 0u64;
        for (index, block) in blocks.iter().enumerate() {
            let cmd = CoreCommand::RxDataBlock {
                addr: block.addr,
                data: &block.data,
            };
            self.exchange(&cmd).map_err(|err| match err {
                // a cancellation is not a block failure
                Error::Cancelled => Error::Cancelled,
                err => Error::BlockTransfer {
                    block: index + 1,
                    source: Box::new(err),
                },
            })?;

            sent += block.data.len() as u64;
            self.bytes_processed = sent;
            self.send_progress(transfer_percent(sent, total));
        }
        Ok(())
    }

    fn download_chunks(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        let buffer = self.config.mcu.buffer_size(self.config.protocol) as u32;
        info!(
            addr = format_args!("{addr:#06X}"),
            size, "downloading"
        );

        let mut bytes = Vec::with_capacity(size as usize);
        let mut crc = Crc16::new();
        let mut offset = 0u32;
        while offset < size {
            let chunk = (size - offset).min(buffer) as u16;
            let cmd = CoreCommand::TxDataBlock {
                addr: addr + offset,
                len: chunk,
            };
            let index = (offset / buffer) as usize + 1;
            let reply = self.exchange(&cmd).map_err(|err| match err {
                Error::Cancelled => Error::Cancelled,
                err => Error::BlockTransfer {
                    block: index,
                    source: Box::new(err),
                },
            })?;
            let Reply::Data(data) = reply else {
                return Err(Error::MalformedResponse {
                    reason: "data block reply carries no data".to_string(),
                });
            };

            crc.feed(&data);
            bytes.extend_from_slice(&data);
            offset += chunk as u32;
            self.bytes_processed = u64::from(offset);
            self.send_progress(transfer_percent(u64::from(offset), u64::from(size)));
        }

        if let Some(plan) = self.verify.as_mut() {
            plan.crc = crc.finish();
        }
        self.downloaded = Some(Firmware::from_bytes(addr, &bytes, Format::Auto));
        Ok(())
    }

    fn verify_crc(&mut self) -> Result<(), Error> {
        if self.config.protocol.is_legacy() || self.config.protocol.is_usb() {
            self.finish(ReportResult::Skipped);
            return Ok(());
        }
        if self.custom_password_used && matches!(self.command, Command::Upload { .. }) {
            // without the erase fallback the memory outside the image is
            // unknown, so the whole-range CRC cannot be predicted
            self.finish(ReportResult::Skipped);
            return Ok(());
        }
        let Some(plan) = self.verify else {
            self.finish(ReportResult::Skipped);
            return Ok(());
        };
        let Ok(len) = u16::try_from(plan.len) else {
            warn!(len = plan.len, "address span exceeds the CRC command range");
            self.finish(ReportResult::Skipped);
            return Ok(());
        };

        let reply = self.exchange(&CoreCommand::CrcCheck {
            addr: plan.addr,
            len,
        })?;
        let Reply::Crc(device) = reply else {
            return Err(Error::MalformedResponse {
                reason: "CRC reply carries no checksum".to_string(),
            });
        };

        if device != plan.crc {
            return Err(Error::CrcMismatch {
                device,
                host: plan.crc,
            });
        }
        info!(crc = format_args!("{device:#06X}"), "flash CRC verified");
        self.finish_named(ReportResult::Success, format!("CRC CHECK ({device:04X})"));
        Ok(())
    }

    fn load_pc(&mut self) -> Result<(), Error> {
        let Some(vector) = self.reset_vector else {
            debug!("no reset vector, not starting the image");
            self.finish(ReportResult::Skipped);
            return Ok(());
        };

        match self.exchange(&CoreCommand::LoadPc {
            addr: u32::from(vector),
        }) {
            Ok(_) => {
                info!(
                    addr = format_args!("{vector:#06X}"),
                    "program counter loaded"
                );
                self.finish(ReportResult::Success);
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(error = %err, "load PC failed");
                self.finish(ReportResult::Failed);
            }
        }
        Ok(())
    }

    // ---- GPIO waveforms ----

    /// Drive the BSL entry waveform. RST rides on DTR, TEST/TCK on RTS;
    /// levels below are the logical pin levels at the target.
    fn invoke_bsl(&mut self) -> Result<(), Error> {
        self.check_cancel()?;

        let waveform: &[(bool, bool)] = match self.config.invoke {
            // RST low while TEST pulses twice, release RST on the second
            // TEST high, then drop TEST
            InvokeMechanism::SharedJtag => &[
                (false, false),
                (false, true),
                (false, false),
                (false, true),
                (true, true),
                (true, false),
            ],
            // same pattern on parts with a dedicated TCK, which idles high
            InvokeMechanism::DedicatedJtag => &[
                (false, true),
                (false, false),
                (false, true),
                (false, false),
                (true, false),
                (true, true),
            ],
            InvokeMechanism::Manual => unreachable!("manual invoke is skipped"),
        };

        debug!(mechanism = ?self.config.invoke, "driving BSL entry waveform");
        for &(rst, test) in waveform {
            self.transport.set_dtr(rst)?;
            self.transport.set_rts(test)?;
            thread::sleep(PULSE_WIDTH);
        }

        thread::sleep(INVOKE_SETTLE);
        self.transport.clear_buffers()?;
        Ok(())
    }

    /// Pulse RST a few times with TEST/TCK at its idle level, ending with
    /// a long low hold, to restart the target into its application.
    fn reset_mcu(&mut self) -> Result<(), Error> {
        self.check_cancel()?;

        let test_idle = self.config.invoke == InvokeMechanism::DedicatedJtag;
        self.transport.set_rts(test_idle)?;

        debug!("driving reset waveform");
        for _ in 0..3 {
            self.transport.set_dtr(false)?;
            thread::sleep(PULSE_WIDTH);
            self.transport.set_dtr(true)?;
            thread::sleep(PULSE_WIDTH);
        }
        self.transport.set_dtr(false)?;
        thread::sleep(RESET_HOLD);
        self.transport.set_dtr(true)?;
        Ok(())
    }

    // ---- plumbing ----

    /// One request/response round trip. Builds and validates the frame
    /// before any device I/O; on the legacy family every frame is preceded
    /// by the sync handshake.
    fn exchange(&mut self, cmd: &CoreCommand<'_>) -> Result<Reply, Error> {
        self.check_cancel()?;

        let tx = frame::build_request(self.config.protocol, cmd)?;
        let rx_len = frame::reply_len(self.config.protocol, cmd);

        if self.config.protocol.is_legacy() {
            self.sync()?;
        }

        debug!(command = cmd.name(), tx = tx.len(), rx = rx_len, "exchange");
        let rx = self.transport.transfer(&tx, rx_len)?;
        thread::sleep(INTER_COMMAND_DELAY);
        frame::parse_reply(self.config.protocol, cmd, &rx)
    }

    /// Legacy-family sync byte; the target answers ACK when it is ready
    /// for the next frame.
    fn sync(&mut self) -> Result<(), Error> {
        let ack = self.transport.transfer(&[frame::LEGACY_SYNC], 1)?;
        match ack.as_slice() {
            [frame::LEGACY_ACK] => Ok(()),
            [frame::LEGACY_NAK] => Err(Error::Nak),
            [other] => Err(Error::MalformedResponse {
                reason: format!("unexpected sync reply {other:#04X}"),
            }),
            _ => Err(Error::MalformedResponse {
                reason: "unexpected sync reply".to_string(),
            }),
        }
    }

    fn check_cancel(&self) -> Result<(), Error> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Start a step: push its `Pending` report and emit the step's target
    /// progress value.
    fn begin(&mut self, name: &str, percent: u8) {
        info!(step = name, "step");
        self.step = name.to_string();
        self.reports.push(Report::new(name, ReportResult::Pending));
        self.send_progress(percent);
    }

    /// Replace the trailing `Pending` report with the step's terminal
    /// result.
    fn finish(&mut self, result: ReportResult) {
        let name = self.step.clone();
        self.finish_named(result, name);
    }

    fn finish_named(&mut self, result: ReportResult, name: String) {
        if let Some(last) = self.reports.last_mut() {
            if last.result == ReportResult::Pending {
                *last = Report::new(name, result);
            }
        }
    }

    fn fail_pending(&mut self) {
        if let Some(last) = self.reports.last_mut() {
            if last.result == ReportResult::Pending {
                *last = Report::new(last.name.clone(), ReportResult::Failed);
            }
        }
    }

    fn send_progress(&mut self, percent: u8) {
        if let Some(chan) = self.progress.as_mut() {
            // fire and forget; a slow consumer must not stall the wire
            let _ = chan.try_send(Progress {
                step: self.step.clone(),
                percent,
            });
        }
    }
}

/// Interpolate the 40..=90 transfer window.
fn transfer_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 90;
    }
    40 + ((done * 50) / total) as u8
}
