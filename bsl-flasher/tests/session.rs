//! Full session runs against a simulated BSL target. The mock keeps a
//! byte-addressed memory, applies writes and mass erases, and answers CRC
//! queries from its own state, so upload verification is checked
//! end-to-end instead of against canned byte strings.

use std::collections::BTreeMap;

use futures::channel::mpsc;
use tokio_util::sync::CancellationToken;

use bsl_firmware::{Format, crc16_ccitt, parse_bytes};
use bsl_flasher::{
    BslCoreStatus, Command, Error, InvokeMechanism, Mcu, Progress, Protocol, ReportResult,
    SessionConfig, SessionOutcome, Transport, run,
};

const FIRMWARE_TXT: &str = "@8000
31 40 00 24 B2 40 80 5A 20 01 D2 43 22 02
@FFFE
00 80
q
";
const FIRMWARE_BYTES: u64 = 16;

#[derive(Default)]
struct Behavior {
    corrupt_crc: bool,
    reject_baud: bool,
    timeout_on_baud: bool,
    fail_write_at: Option<usize>,
    cancel_after_writes: Option<(usize, CancellationToken)>,
}

/// Simulated BSL target behind the transport contract.
struct MockBsl {
    protocol: Protocol,
    memory: BTreeMap<u32, u8>,
    behavior: Behavior,
    writes: usize,
    closed: bool,
}

impl MockBsl {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            memory: BTreeMap::new(),
            behavior: Behavior::default(),
            writes: 0,
            closed: false,
        }
    }

    fn read(&self, addr: u32) -> u8 {
        *self.memory.get(&addr).unwrap_or(&0xFF)
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.memory.insert(addr + i as u32, byte);
        }
    }

    fn handle(&mut self, tx: &[u8]) -> Result<Vec<u8>, Error> {
        match self.protocol {
            Protocol::LegacyUart => self.handle_legacy(tx),
            Protocol::ModernUart => self.handle_modern(tx),
            Protocol::ModernUsb => Ok(self.handle_usb(tx)),
        }
    }

    fn handle_legacy(&mut self, tx: &[u8]) -> Result<Vec<u8>, Error> {
        assert_eq!(tx[0], 0x80);
        if tx.len() == 1 {
            // sync byte
            return Ok(vec![0x90]);
        }

        let (body, checksum) = tx.split_at(tx.len() - 2);
        assert_eq!(
            legacy_checksum(body),
            [checksum[0], checksum[1]],
            "request checksum"
        );

        let addr = u32::from(u16::from_le_bytes([tx[4], tx[5]]));
        let length = u16::from_le_bytes([tx[6], tx[7]]);
        match tx[1] {
            // mass erase
            0x18 => {
                self.memory.clear();
                Ok(vec![0x90])
            }
            // password, data write, load PC
            0x10 | 0x1A => Ok(vec![0x90]),
            0x12 => {
                self.writes += 1;
                self.write_block(addr, &body[8..]);
                Ok(vec![0x90])
            }
            // data read
            0x14 => {
                let data: Vec<u8> = (addr..addr + u32::from(length)).map(|a| self.read(a)).collect();
                Ok(legacy_data_frame(&data))
            }
            // version query
            0x1E => {
                let mut data = vec![0x00, 0x06, 0x05, 0x34];
                data.resize(16, 0x00);
                Ok(legacy_data_frame(&data))
            }
            _ => Ok(vec![0xA0]),
        }
    }

    fn handle_modern(&mut self, tx: &[u8]) -> Result<Vec<u8>, Error> {
        assert_eq!(tx[0], 0x80);
        let len = usize::from(u16::from_le_bytes([tx[1], tx[2]]));
        let core = tx[3..3 + len].to_vec();
        assert_eq!(
            u16::from_le_bytes([tx[3 + len], tx[4 + len]]),
            crc16_ccitt(&core),
            "request CRC"
        );

        if core[0] == 0x52 {
            if self.behavior.timeout_on_baud {
                return Err(Error::Timeout);
            }
            if self.behavior.reject_baud {
                // UART-layer unknown-baud-rate error, padded to the
                // expected reply length
                return Ok(vec![0x56, 0, 0, 0, 0, 0, 0, 0]);
            }
        }

        let reply_core = self.core_reply(&core);
        Ok(wrap_modern(&reply_core))
    }

    fn handle_usb(&mut self, tx: &[u8]) -> Vec<u8> {
        assert_eq!(tx[0], 0x3F);
        let len = usize::from(tx[1]);
        let core = tx[2..2 + len].to_vec();

        let reply_core = self.core_reply(&core);
        let mut reply = vec![0x3F, reply_core.len() as u8];
        reply.extend_from_slice(&reply_core);
        reply
    }

    fn core_reply(&mut self, core: &[u8]) -> Vec<u8> {
        let addr = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], 0]);

        match core[0] {
            // mass erase
            0x15 => {
                self.memory.clear();
                vec![0x3B, 0x00]
            }
            // password, load PC
            0x11 | 0x17 => vec![0x3B, 0x00],
            // data write
            0x10 => {
                self.writes += 1;
                if let Some((after, token)) = &self.behavior.cancel_after_writes {
                    if self.writes == *after {
                        token.cancel();
                    }
                }
                if Some(self.writes) == self.behavior.fail_write_at {
                    return vec![0x3B, 0x01];
                }
                self.write_block(addr(&core[1..4]), &core[4..]);
                vec![0x3B, 0x00]
            }
            // data read
            0x18 => {
                let start = addr(&core[1..4]);
                let len = u32::from(u16::from_le_bytes([core[4], core[5]]));
                let mut reply = vec![0x3A];
                reply.extend((start..start + len).map(|a| self.read(a)));
                reply
            }
            // CRC over an address range, from the simulated memory
            0x16 => {
                let start = addr(&core[1..4]);
                let len = u32::from(u16::from_le_bytes([core[4], core[5]]));
                let data: Vec<u8> = (start..start + len).map(|a| self.read(a)).collect();
                let mut crc = crc16_ccitt(&data);
                if self.behavior.corrupt_crc {
                    crc ^= 0x5A5A;
                }
                let mut reply = vec![0x3A];
                reply.extend_from_slice(&crc.to_le_bytes());
                reply
            }
            // version query
            0x19 => vec![0x3A, 0x00, 0x06, 0x05, 0x34],
            0x52 => vec![0x3B, 0x00],
            _ => vec![0x3B, 0x07],
        }
    }
}

impl Transport for MockBsl {
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
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8], expected_rx_len: usize) -> Result<Vec<u8>, Error> {
        assert!(!tx.is_empty(), "the session never issues a pure read");
        let reply = self.handle(tx)?;
        assert_eq!(reply.len(), expected_rx_len, "reply length contract");
        Ok(reply)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn legacy_checksum(body: &[u8]) -> [u8; 2] {
    let mut ckl = 0u8;
    let mut ckh = 0u8;
    for (i, byte) in body.iter().enumerate() {
        if i % 2 == 0 {
            ckl ^= byte;
        } else {
            ckh ^= byte;
        }
    }
    [!ckl, !ckh]
}

fn legacy_data_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x80, data.len() as u8, data.len() as u8];
    frame.extend_from_slice(data);
    let checksum = legacy_checksum(&frame);
    frame.extend_from_slice(&checksum);
    frame
}

fn wrap_modern(core: &[u8]) -> Vec<u8> {
    let mut reply = vec![0x00, 0x80];
    reply.extend_from_slice(&(core.len() as u16).to_le_bytes());
    reply.extend_from_slice(core);
    reply.extend_from_slice(&crc16_ccitt(core).to_le_bytes());
    reply
}

fn upload_command() -> Command {
    let firmware = parse_bytes(FIRMWARE_TXT.as_bytes(), Format::TiTxt, false).unwrap();
    Command::Upload { firmware }
}

fn manual_config(mcu: Mcu, usb: bool) -> SessionConfig {
    let mut config = SessionConfig::new(mcu, usb).unwrap();
    config.invoke = InvokeMechanism::Manual;
    config
}

fn result_of(outcome: &SessionOutcome, step: &str) -> ReportResult {
    outcome
        .status
        .reports
        .iter()
        .find(|r| r.name.starts_with(step))
        .unwrap_or_else(|| panic!("no report for step {step}"))
        .result
}

#[test]
fn upload_session_succeeds_end_to_end() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    let (tx, mut rx) = mpsc::channel::<Progress>(64);

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430Fr5xx, false),
        upload_command(),
        Some(tx),
        None,
    );

    assert!(outcome.status.ok(), "{}", outcome.status);
    assert_eq!(outcome.status.bytes_processed, FIRMWARE_BYTES);
    assert_eq!(outcome.status.reports.len(), 12);
    for report in &outcome.status.reports {
        assert_ne!(report.result, ReportResult::Failed, "step {}", report.name);
        assert_ne!(report.result, ReportResult::Pending, "step {}", report.name);
    }
    assert_eq!(result_of(&outcome, "CRC CHECK"), ReportResult::Success);
    assert_eq!(result_of(&outcome, "LOAD PC"), ReportResult::Success);
    assert!(outcome.status.bsl_version.is_some());
    assert!(outcome.downloaded.is_none());
    assert!(target.closed);

    // target memory holds exactly the uploaded image
    assert_eq!(target.read(0x8000), 0x31);
    assert_eq!(target.read(0xFFFF), 0x80);

    let mut last = 0u8;
    let mut final_percent = 0u8;
    while let Ok(Some(progress)) = rx.try_next() {
        assert!(progress.percent >= last, "progress went backwards");
        last = progress.percent;
        final_percent = progress.percent;
    }
    assert_eq!(final_percent, 100);
}

#[test]
fn crc_mismatch_is_a_distinct_failure() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    target.behavior.corrupt_crc = true;

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430Fr5xx, false),
        upload_command(),
        None,
        None,
    );

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 400);
    assert!(outcome.status.status.msg.contains("CRC mismatch"));
    assert_eq!(result_of(&outcome, "CRC CHECK"), ReportResult::Failed);
    // the transfer itself went through before the verify failed
    assert_eq!(result_of(&outcome, "TRANSFER DATA"), ReportResult::Success);
    assert!(target.closed);
}

#[test]
fn download_returns_the_read_image() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    let pattern: Vec<u8> = (0..=255).collect();
    target.write_block(0x4400, &pattern);

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430Fr5xx, false),
        Command::Download {
            addr: 0x4400,
            size: 256,
        },
        None,
        None,
    );

    assert!(outcome.status.ok(), "{}", outcome.status);
    assert_eq!(outcome.status.bytes_processed, 256);
    assert_eq!(result_of(&outcome, "CRC CHECK"), ReportResult::Success);

    let downloaded = outcome.downloaded.expect("download produces an image");
    assert_eq!(downloaded.data_bytes(), pattern);
    assert_eq!(downloaded.info().addr_first, 0x4400);

    // a download must not erase anything
    assert_eq!(target.read(0x4400), 0x00);
}

#[test]
fn erase_session_on_the_legacy_family() {
    let mut target = MockBsl::new(Protocol::LegacyUart);
    target.write_block(0xC000, &[0xDE, 0xAD]);

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430F2xx, false),
        Command::Erase,
        None,
        None,
    );

    assert!(outcome.status.ok(), "{}", outcome.status);
    assert_eq!(outcome.status.bytes_processed, 0);
    assert_eq!(result_of(&outcome, "PREPARE FIRMWARE"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "TRANSFER DATA"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "CRC CHECK"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "LOAD PC"), ReportResult::Skipped);
    assert!(outcome.status.bsl_version.is_some());

    // the erase reached the simulated memory
    assert_eq!(target.read(0xC000), 0xFF);
}

#[test]
fn usb_upload_skips_uart_only_steps() {
    let mut target = MockBsl::new(Protocol::ModernUsb);

    let outcome = run(
        &mut target,
        SessionConfig::new(Mcu::Msp430F5xx, true).unwrap(),
        upload_command(),
        None,
        None,
    );

    assert!(outcome.status.ok(), "{}", outcome.status);
    assert_eq!(outcome.status.bytes_processed, FIRMWARE_BYTES);
    assert_eq!(result_of(&outcome, "INVOKE BSL"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "CHANGE BAUD RATE"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "BSL VERSION"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "CRC CHECK"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "RESET MCU"), ReportResult::Skipped);
    assert_eq!(result_of(&outcome, "LOAD PC"), ReportResult::Success);
    assert!(outcome.status.bsl_version.is_none());
}

#[test]
fn erase_is_rejected_over_usb_before_any_io() {
    let mut target = MockBsl::new(Protocol::ModernUsb);

    let outcome = run(
        &mut target,
        SessionConfig::new(Mcu::Msp430F5xx, true).unwrap(),
        Command::Erase,
        None,
        None,
    );

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 120);
    assert_eq!(target.writes, 0);
    assert!(target.closed);
}

#[test]
fn rejected_baud_negotiation_is_tolerated() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    target.behavior.reject_baud = true;

    let mut config = manual_config(Mcu::Msp430Fr5xx, false);
    config.baud = 115_200;

    let outcome = run(&mut target, config, upload_command(), None, None);

    assert!(outcome.status.ok(), "{}", outcome.status);
    assert_eq!(result_of(&outcome, "CHANGE BAUD RATE"), ReportResult::Failed);
    assert_eq!(outcome.status.bytes_processed, FIRMWARE_BYTES);
}

#[test]
fn baud_negotiation_timeout_aborts() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    target.behavior.timeout_on_baud = true;

    let mut config = manual_config(Mcu::Msp430Fr5xx, false);
    config.baud = 115_200;

    let outcome = run(&mut target, config, upload_command(), None, None);

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 300);
    assert_eq!(result_of(&outcome, "CHANGE BAUD RATE"), ReportResult::Failed);
    // nothing was written before the abort
    assert_eq!(target.writes, 0);
}

#[test]
fn block_failure_carries_the_block_index() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    target.behavior.fail_write_at = Some(2);

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430Fr5xx, false),
        upload_command(),
        None,
        None,
    );

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 410);
    assert!(outcome.status.status.msg.contains("block 2"));
    assert_eq!(
        outcome.status.status.core_status,
        Some(BslCoreStatus::FlashWriteCheckFailed)
    );
    assert_eq!(result_of(&outcome, "TRANSFER DATA"), ReportResult::Failed);
}

#[test]
fn cancellation_stops_before_the_first_exchange() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    let token = CancellationToken::new();
    token.cancel();

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430Fr5xx, false),
        upload_command(),
        None,
        Some(token),
    );

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 500);
    assert_eq!(result_of(&outcome, "AUTHENTICATE"), ReportResult::Failed);
    assert_eq!(target.writes, 0);
    assert!(target.closed);
}

#[test]
fn cancellation_mid_transfer_stops_the_block_loop() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    let token = CancellationToken::new();
    target.behavior.cancel_after_writes = Some((1, token.clone()));

    let outcome = run(
        &mut target,
        manual_config(Mcu::Msp430Fr5xx, false),
        upload_command(),
        None,
        Some(token),
    );

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 500);
    assert_eq!(result_of(&outcome, "TRANSFER DATA"), ReportResult::Failed);
    // the first block landed before the cancellation took effect
    assert_eq!(outcome.status.bytes_processed, 14);
    assert_eq!(target.writes, 1);
}

#[test]
fn custom_password_upload_skips_erase_and_crc() {
    let mut target = MockBsl::new(Protocol::ModernUart);
    target.write_block(0x1000, &[0x42]);

    let mut config = manual_config(Mcu::Msp430Fr5xx, false);
    config.password = Some(vec![0xAB; 32]);

    let outcome = run(&mut target, config, upload_command(), None, None);

    assert!(outcome.status.ok(), "{}", outcome.status);
    assert_eq!(result_of(&outcome, "CRC CHECK"), ReportResult::Skipped);
    // no mass erase happened, unrelated memory survived
    assert_eq!(target.read(0x1000), 0x42);
}

#[test]
fn wrong_length_password_fails_a_download() {
    let mut target = MockBsl::new(Protocol::ModernUart);

    let mut config = manual_config(Mcu::Msp430Fr5xx, false);
    config.password = Some(vec![0xAB; 7]);

    let outcome = run(
        &mut target,
        config,
        Command::Download {
            addr: 0x4400,
            size: 16,
        },
        None,
        None,
    );

    assert!(!outcome.status.ok());
    assert_eq!(outcome.status.status.code, 110);
    assert_eq!(target.writes, 0);
}
