mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use bsl_firmware::Format;
use bsl_flasher::uart::UartTransport;
use bsl_flasher::usb::UsbTransport;
use bsl_flasher::{Command, Progress, Protocol, Report, ScanOptions, SessionOutcome, Transport};
use cli::{Commands, DeviceArgs, FormatArg, InvokeArg, McuArg, Opt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();

    match opt.command {
        Commands::Scan { usb, all } => scan(usb, all),
        Commands::Erase { device } => erase(device).await,
        Commands::Upload {
            image,
            device,
            format,
            fill,
            quiet,
        } => upload(image, device, format, fill, quiet).await,
        Commands::Download {
            output,
            addr,
            size,
            format,
            device,
            quiet,
        } => download(output, addr, size, format, device, quiet).await,
        Commands::Validate { image } => validate(image),
        Commands::Convert {
            input,
            output,
            format,
            line_length,
            fill,
        } => convert(input, output, format, line_length, fill),
        Commands::Compare { a, b } => compare(a, b),
        Commands::Combine {
            a,
            b,
            output,
            format,
            fill,
        } => combine(a, b, output, format, fill),
        Commands::Password { image } => password(image),
        Commands::GenerateCompletion { shell } => {
            generate_completion(shell);
            ExitCode::SUCCESS
        }
    }
}

fn scan(usb: bool, all: bool) -> ExitCode {
    let term = console::Term::stdout();
    let options = ScanOptions {
        ignore_vendor_filter: all,
    };

    let devices = if usb {
        UsbTransport::scan(options)
    } else {
        UartTransport::scan(options)
    };

    match devices {
        Ok(devices) => {
            if devices.is_empty() {
                term.write_line("no devices found").unwrap();
            }
            for device in devices {
                term.write_line(&device.to_string()).unwrap();
            }
            ExitCode::SUCCESS
        }
        Err(err) => fail_error(&err),
    }
}

async fn erase(device: DeviceArgs) -> ExitCode {
    match run_session(device, Command::Erase, false).await {
        Ok(outcome) => report_outcome(&outcome, false),
        Err(msg) => fail(&msg),
    }
}

async fn upload(
    image: PathBuf,
    device: DeviceArgs,
    format: FormatArg,
    fill: bool,
    quiet: bool,
) -> ExitCode {
    let firmware = match bsl_firmware::parse_file(&image, format.into(), fill) {
        Ok(firmware) => firmware,
        Err(err) => return fail_error(&err),
    };

    match run_session(device, Command::Upload { firmware }, quiet).await {
        Ok(outcome) => report_outcome(&outcome, quiet),
        Err(msg) => fail(&msg),
    }
}

async fn download(
    output: PathBuf,
    addr: u32,
    size: u32,
    format: FormatArg,
    device: DeviceArgs,
    quiet: bool,
) -> ExitCode {
    let outcome = match run_session(device, Command::Download { addr, size }, quiet).await {
        Ok(outcome) => outcome,
        Err(msg) => return fail(&msg),
    };

    let code = report_outcome(&outcome, quiet);
    if !outcome.status.ok() {
        return code;
    }

    let Some(firmware) = outcome.downloaded else {
        return fail("session finished without data");
    };
    match bsl_firmware::create(&firmware, format.into(), 0) {
        Ok(text) => write_output(&output, &text),
        Err(err) => fail_error(&err),
    }
}

fn validate(image: PathBuf) -> ExitCode {
    let info = match bsl_firmware::validate(&image) {
        Ok(info) => info,
        Err(err) => return fail_error(&err),
    };

    let term = console::Term::stdout();
    term.write_line(&format!("format:        {}", info.format))
        .unwrap();
    term.write_line(&format!(
        "address range: {:#06X}..={:#06X}",
        info.addr_first, info.addr_last
    ))
    .unwrap();
    term.write_line(&format!("code bytes:    {}", info.size_code))
        .unwrap();
    term.write_line(&format!("full span:     {}", info.size_full))
        .unwrap();
    term.write_line(&format!("CRC-16/CCITT:  {:#06X}", info.crc16))
        .unwrap();
    match info.reset_vector {
        Some(vector) => term
            .write_line(&format!("reset vector:  {vector:#06X}"))
            .unwrap(),
        None => term.write_line("reset vector:  none").unwrap(),
    }
    ExitCode::SUCCESS
}

fn convert(
    input: PathBuf,
    output: PathBuf,
    format: FormatArg,
    line_length: usize,
    fill: bool,
) -> ExitCode {
    let text = bsl_firmware::parse_file(&input, Format::Auto, fill)
        .and_then(|firmware| bsl_firmware::create(&firmware, format.into(), line_length));
    match text {
        Ok(text) => write_output(&output, &text),
        Err(err) => fail_error(&err),
    }
}

fn compare(a: PathBuf, b: PathBuf) -> ExitCode {
    let comparison = match bsl_firmware::compare_files(&a, &b) {
        Ok(comparison) => comparison,
        Err(err) => return fail_error(&err),
    };

    let term = console::Term::stdout();
    term.write_line(&format!("equal:       {}", comparison.equal))
        .unwrap();
    term.write_line(&format!(
        "match ratio: {:.2} %",
        comparison.match_ratio * 100.0
    ))
    .unwrap();
    term.write_line(&format!("bytes diff:  {}", comparison.bytes_diff))
        .unwrap();

    if comparison.equal {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn combine(a: PathBuf, b: PathBuf, output: PathBuf, format: FormatArg, fill: bool) -> ExitCode {
    match bsl_firmware::combine_files(&a, &b, format.into(), fill) {
        Ok(text) => write_output(&output, &text),
        Err(err) => fail_error(&err),
    }
}

fn password(image: PathBuf) -> ExitCode {
    match bsl_firmware::get_password(&image) {
        Ok(Some(password)) => {
            console::Term::stdout()
                .write_line(&const_hex::encode_upper(password))
                .unwrap();
            ExitCode::SUCCESS
        }
        Ok(None) => fail("image does not cover the full password region"),
        Err(err) => fail_error(&err),
    }
}

/// Open the transport and drive one full session on a blocking worker.
/// Ctrl-C cancels the session cooperatively through the shared token.
async fn run_session(
    args: DeviceArgs,
    command: Command,
    quiet: bool,
) -> Result<SessionOutcome, String> {
    let config = args.config()?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let (progress, printer) = if quiet {
        (None, None)
    } else {
        let (tx, rx) = futures::channel::mpsc::channel(20);
        (Some(tx), Some(tokio::task::spawn(print_progress(rx))))
    };

    let usb = args.usb;
    let name = args.device;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut transport: Box<dyn Transport> = if usb {
            Box::new(UsbTransport::open(&name)?)
        } else {
            Box::new(UartTransport::open(&name, Protocol::DEFAULT_BAUD)?)
        };
        Ok::<_, bsl_flasher::Error>(bsl_flasher::run(
            &mut *transport,
            config,
            command,
            progress,
            Some(cancel),
        ))
    })
    .await
    .expect("session task panicked");

    if let Some(printer) = printer {
        printer.await.expect("progress task panicked");
    }

    outcome.map_err(|e| e.to_string())
}

async fn print_progress(mut rx: futures::channel::mpsc::Receiver<Progress>) {
    let bar_style = indicatif::ProgressStyle::with_template("{msg:18}  [{wide_bar}] [{percent:3} %]")
        .expect("Failed to create progress bar");
    let bars = indicatif::MultiProgress::new();

    let mut last_bar: Option<indicatif::ProgressBar> = None;
    let mut last_step = String::new();

    while let Some(progress) = rx.next().await {
        if progress.step != last_step {
            if let Some(bar) = last_bar.take() {
                bar.finish();
            }

            let bar = bars.add(indicatif::ProgressBar::new(100));
            bar.set_style(bar_style.clone());
            bar.set_message(progress.step.clone());
            last_step = progress.step;
            last_bar = Some(bar);
        }

        if let Some(bar) = &last_bar {
            bar.set_position(progress.percent.into());
        }
    }

    if let Some(bar) = last_bar.take() {
        bar.finish();
    }
}

fn report_outcome(outcome: &SessionOutcome, quiet: bool) -> ExitCode {
    let term = console::Term::stdout();

    if !quiet {
        print_reports(&term, &outcome.status.reports);
    }
    term.write_line(&outcome.status.to_string()).unwrap();

    if outcome.status.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_reports(term: &console::Term, reports: &[Report]) {
    const STEP_HEADER: &str = "Step";
    const RESULT_HEADER: &str = "Result";

    let rows: Vec<_> = reports
        .iter()
        .map(|r| (r.name.clone(), r.result.to_string()))
        .collect();

    let max_step = rows
        .iter()
        .map(|r| r.0.len())
        .chain([STEP_HEADER.len()])
        .max()
        .unwrap();
    let max_result = rows
        .iter()
        .map(|r| r.1.len())
        .chain([RESULT_HEADER.len()])
        .max()
        .unwrap();

    let table_border = format!(
        "+-{}-+-{}-+",
        std::iter::repeat_n('-', max_step).collect::<String>(),
        std::iter::repeat_n('-', max_result).collect::<String>(),
    );

    term.write_line(&table_border).unwrap();
    term.write_line(&format!(
        "| {} | {} |",
        console::pad_str(STEP_HEADER, max_step, console::Alignment::Left, None),
        console::pad_str(RESULT_HEADER, max_result, console::Alignment::Left, None),
    ))
    .unwrap();
    term.write_line(&table_border).unwrap();

    for (name, result) in rows {
        term.write_line(&format!(
            "| {} | {} |",
            console::pad_str(&name, max_step, console::Alignment::Left, None),
            console::pad_str(&result, max_result, console::Alignment::Left, None),
        ))
        .unwrap();
    }

    term.write_line(&table_border).unwrap();
}

fn write_output(path: &Path, text: &str) -> ExitCode {
    match std::fs::write(path, text) {
        Ok(()) => {
            console::Term::stdout()
                .write_line(&format!("wrote {}", path.display()))
                .unwrap();
            ExitCode::SUCCESS
        }
        Err(err) => fail(&format!("cannot write {}: {err}", path.display())),
    }
}

fn fail(msg: &str) -> ExitCode {
    console::Term::stderr().write_line(msg).unwrap();
    ExitCode::FAILURE
}

fn fail_error(err: &dyn std::error::Error) -> ExitCode {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    fail(&msg)
}

fn generate_completion(target: clap_complete::Shell) {
    let mut cmd = Opt::command();
    const BIN_NAME: &str = env!("CARGO_PKG_NAME");

    clap_complete::generate(target, &mut cmd, BIN_NAME, &mut std::io::stdout())
}

impl From<McuArg> for bsl_flasher::Mcu {
    fn from(value: McuArg) -> Self {
        match value {
            McuArg::F1xx => Self::Msp430F1xx,
            McuArg::F2xx => Self::Msp430F2xx,
            McuArg::F4xx => Self::Msp430F4xx,
            McuArg::F543xNonA => Self::Msp430F543xNonA,
            McuArg::F5xx => Self::Msp430F5xx,
            McuArg::F6xx => Self::Msp430F6xx,
            McuArg::Fr5xx => Self::Msp430Fr5xx,
            McuArg::Fr6xx => Self::Msp430Fr6xx,
            McuArg::Msp432 => Self::Msp432P401R,
        }
    }
}

impl From<InvokeArg> for bsl_flasher::InvokeMechanism {
    fn from(value: InvokeArg) -> Self {
        match value {
            InvokeArg::SharedJtag => Self::SharedJtag,
            InvokeArg::DedicatedJtag => Self::DedicatedJtag,
            InvokeArg::Manual => Self::Manual,
        }
    }
}

impl From<FormatArg> for Format {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Auto => Self::Auto,
            FormatArg::TiTxt => Self::TiTxt,
            FormatArg::IntelHex => Self::IntelHex,
            FormatArg::Srec => Self::Srec,
            FormatArg::Elf => Self::Elf,
        }
    }
}
