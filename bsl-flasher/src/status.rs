//! Session result model: the chainable [`Status`], the full [`StatusEx`]
//! payload every top-level operation returns, and the per-step [`Report`]
//! audit trail.

use std::fmt;
use std::time::SystemTime;

use crate::error::{BslCoreStatus, BslUartStatus};
use crate::Error;

/// One frame of the owned cause chain, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub msg: String,
}

/// Outcome of one session operation. `inner` holds the error cause chain
/// walked from [`std::error::Error::source`]; the root cause is last.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: i32,
    pub ok: bool,
    pub msg: String,
    pub extra: String,
    pub core_status: Option<BslCoreStatus>,
    pub uart_status: Option<BslUartStatus>,
    pub inner: Vec<StatusFrame>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: 0,
            ok: true,
            msg: "success".to_string(),
            extra: String::new(),
            core_status: None,
            uart_status: None,
            inner: Vec::new(),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        let mut inner = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            inner.push(StatusFrame {
                msg: cause.to_string(),
            });
            source = cause.source();
        }

        Self {
            code: error.code(),
            ok: false,
            msg: error.to_string(),
            extra: String::new(),
            core_status: error.core_status(),
            uart_status: error.uart_status(),
            inner,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            return write!(f, "[0] {}", self.msg);
        }

        write!(f, "Error 1 [{}]: {}", self.code, self.msg)?;
        let mut depth = 2;
        let mut previous = self.msg.as_str();
        for frame in &self.inner {
            // adjacent duplicates carry no information
            if frame.msg == previous {
                continue;
            }
            write!(f, "\nError {depth}: {}", frame.msg)?;
            previous = &frame.msg;
            depth += 1;
        }
        if !self.extra.is_empty() {
            write!(f, "\n{}", self.extra)?;
        }
        Ok(())
    }
}

/// Result of one session step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResult {
    Success,
    Skipped,
    Failed,
    /// Step has started; the terminal report for the same name follows.
    Pending,
}

impl fmt::Display for ReportResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Pending => "PENDING",
        };
        f.write_str(name)
    }
}

/// One step of the session audit trail.
#[derive(Debug, Clone)]
pub struct Report {
    pub name: String,
    pub result: ReportResult,
    pub timestamp: SystemTime,
}

impl Report {
    pub fn new(name: impl Into<String>, result: ReportResult) -> Self {
        Self {
            name: name.into(),
            result,
            timestamp: SystemTime::now(),
        }
    }
}

/// Raw 4-byte BSL version with the vendor/interpreter/API/peripheral
/// interpretation the 5xx/6xx BSL documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BslVersion(pub [u8; 4]);

impl fmt::Display for BslVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [vendor, interpreter, api, peripheral] = self.0;
        let vendor_name = match vendor {
            0x00 => "TI",
            _ => "third-party",
        };
        write!(
            f,
            "{vendor_name} {interpreter:02X}.{api:02X}.{peripheral:02X}"
        )
    }
}

/// Complete session outcome: final [`Status`], the ordered step reports,
/// bytes moved over the wire and the BSL version when one was read.
#[derive(Debug, Clone)]
pub struct StatusEx {
    pub status: Status,
    pub reports: Vec<Report>,
    pub bytes_processed: u64,
    pub bsl_version: Option<BslVersion>,
}

impl StatusEx {
    pub fn ok(&self) -> bool {
        self.status.ok
    }
}

impl fmt::Display for StatusEx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if self.bytes_processed > 0 {
            write!(f, "\nbytes processed: {}", self.bytes_processed)?;
        }
        if let Some(version) = self.bsl_version {
            write!(f, "\nBSL version: {version}")?;
        }
        Ok(())
    }
}
