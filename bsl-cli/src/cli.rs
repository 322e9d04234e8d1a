use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    #[command(subcommand)]
    /// Specifies the subcommand to execute.
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Command to list attached serial ports or BSL USB devices.
    Scan {
        #[arg(long)]
        /// Enumerate USB-HID devices instead of serial ports.
        usb: bool,

        #[arg(long, requires = "usb")]
        /// List every HID device, not only the TI BSL vendor/product id.
        all: bool,
    },

    /// Command to mass-erase the target's main memory.
    Erase {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Command to flash a firmware image into the target.
    Upload {
        /// Path of the firmware image to flash (TI-TXT, Intel-HEX, SREC or ELF).
        image: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
        /// Input format; `auto` detects the format from the file content.
        format: FormatArg,

        #[arg(long)]
        /// Fill address gaps with 0xFF before flashing.
        fill: bool,

        #[arg(long)]
        /// Suppress standard output messages for a quieter experience.
        quiet: bool,
    },

    /// Command to read target memory out into a firmware image file.
    Download {
        /// Output file for the downloaded image.
        output: PathBuf,

        #[arg(long, value_parser = parse_u32)]
        /// Start address, decimal or 0x-prefixed hex.
        addr: u32,

        #[arg(long, value_parser = parse_u32)]
        /// Number of bytes to read, decimal or 0x-prefixed hex.
        size: u32,

        #[arg(long, value_enum, default_value_t = FormatArg::TiTxt)]
        /// Output format written to the file.
        format: FormatArg,

        #[command(flatten)]
        device: DeviceArgs,

        #[arg(long)]
        /// Suppress standard output messages for a quieter experience.
        quiet: bool,
    },

    /// Command to parse a firmware image and print its summary.
    Validate {
        /// Path of the firmware image to validate.
        image: PathBuf,
    },

    /// Command to convert a firmware image between formats.
    Convert {
        /// Input image (format is detected from the content).
        input: PathBuf,

        /// Output file.
        output: PathBuf,

        #[arg(long, value_enum)]
        /// Output format.
        format: FormatArg,

        #[arg(long, default_value_t = 0)]
        /// Data bytes per output line; 0 keeps the format default.
        line_length: usize,

        #[arg(long)]
        /// Fill address gaps with 0xFF in the output.
        fill: bool,
    },

    /// Command to compare two firmware images byte by byte.
    Compare {
        /// First image.
        a: PathBuf,

        /// Second image.
        b: PathBuf,
    },

    /// Command to merge two address-disjoint images into one output file.
    Combine {
        /// First image.
        a: PathBuf,

        /// Second image.
        b: PathBuf,

        /// Output file.
        output: PathBuf,

        #[arg(long, value_enum)]
        /// Output format.
        format: FormatArg,

        #[arg(long)]
        /// Fill address gaps with 0xFF in the output.
        fill: bool,
    },

    /// Command to print the BSL password stored in an image's vector table.
    Password {
        /// Path of the firmware image to read the password from.
        image: PathBuf,
    },

    /// Command to generate shell completion
    GenerateCompletion {
        /// Specifies the target shell type for completion
        shell: clap_complete::Shell,
    },
}

/// Device selection shared by every command that opens a target.
#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Serial port name (e.g. `/dev/ttyUSB0`, `COM3`) or USB-HID device path.
    pub device: String,

    #[arg(long, value_enum)]
    /// Target MCU family; decides the protocol, password length and buffer size.
    pub mcu: McuArg,

    #[arg(long)]
    /// Talk to the USB BSL instead of a serial port.
    pub usb: bool,

    #[arg(long, default_value_t = 9600)]
    /// UART baud rate to negotiate after invoking the BSL.
    baud: u32,

    #[arg(long)]
    /// BSL password as hex digits; omitted selects mass-erase entry.
    password: Option<String>,

    #[arg(long, value_enum)]
    /// Override the GPIO entry sequence used to invoke the BSL.
    invoke: Option<InvokeArg>,
}

impl DeviceArgs {
    /// Resolve the session configuration for these arguments.
    pub fn config(&self) -> Result<bsl_flasher::SessionConfig, String> {
        let mut config = bsl_flasher::SessionConfig::new(self.mcu.into(), self.usb)
            .map_err(|e| e.to_string())?;
        config.baud = self.baud;
        if let Some(invoke) = self.invoke {
            config.invoke = invoke.into();
        }
        if let Some(password) = &self.password {
            let bytes =
                const_hex::decode(password).map_err(|e| format!("invalid password hex: {e}"))?;
            config.password = Some(bytes);
        }
        Ok(config)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum McuArg {
    /// MSP430F1xx (legacy BSL)
    F1xx,
    /// MSP430F2xx (legacy BSL)
    F2xx,
    /// MSP430F4xx (legacy BSL)
    F4xx,
    /// MSP430F543x non-A (16-byte password)
    F543xNonA,
    /// MSP430F5xx
    F5xx,
    /// MSP430F6xx
    F6xx,
    /// MSP430FR5xx
    Fr5xx,
    /// MSP430FR6xx
    Fr6xx,
    /// MSP432P401R
    Msp432,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum InvokeArg {
    /// TEST/RST waveform for parts with shared JTAG pins.
    SharedJtag,
    /// TCK/RST waveform for parts with dedicated JTAG pins.
    DedicatedJtag,
    /// No waveform; the target is already in BSL mode.
    Manual,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum FormatArg {
    /// Detect the format from the file content.
    Auto,
    /// TI-TXT
    TiTxt,
    /// Intel-HEX
    IntelHex,
    /// Motorola SREC
    Srec,
    /// ELF32 (input only)
    Elf,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}
