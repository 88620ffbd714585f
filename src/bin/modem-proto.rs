//! Command-line front end for sending and receiving files with the
//! XMODEM/YMODEM family over a serial port.

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use modem_proto::profile::ProgramProfile;
use modem_proto::task::Task;
use modem_proto::xmodem::{self, XmodemConfig};
use modem_proto::ymodem::{self, FileSource, YmodemConfig};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "modem-proto")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port to use, e.g. /dev/ttyUSB0 or COM3.
    #[arg(short, long, env = "MODEM_PROTO_PORT")]
    port: String,

    /// Baud rate for data transfer.
    #[arg(long, default_value_t = 115_200)]
    baudrate: u32,

    /// Parity checking mode.
    #[arg(long, value_enum, default_value_t = CliParity::None)]
    parity: CliParity,

    /// Data bits per character.
    #[arg(long, default_value_t = 8)]
    bytesize: u8,

    /// Stop bits per character.
    #[arg(long, value_enum, default_value_t = CliStopBits::One)]
    stopbits: CliStopBits,

    /// Per-byte read timeout, in seconds.
    #[arg(long, default_value_t = 2)]
    timeout: u64,

    /// Block payload size in bytes: 1024 requests XMODEM-1K/YMODEM-1K
    /// blocks, 128 requests plain XMODEM/YMODEM blocks.
    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    /// Use plain XMODEM instead of YMODEM (single file, no filename
    /// packet or batch termination).
    #[arg(long)]
    xmodem: bool,

    /// Negotiate YMODEM-G streaming mode (no effect on plain XMODEM).
    #[arg(long)]
    ymodem_g: bool,

    /// Retries permitted per step before aborting.
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliParity {
    None,
    Odd,
    Even,
}

impl From<CliParity> for serialport::Parity {
    fn from(p: CliParity) -> Self {
        match p {
            CliParity::None => serialport::Parity::None,
            CliParity::Odd => serialport::Parity::Odd,
            CliParity::Even => serialport::Parity::Even,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliStopBits {
    One,
    Two,
}

impl From<CliStopBits> for serialport::StopBits {
    fn from(s: CliStopBits) -> Self {
        match s {
            CliStopBits::One => serialport::StopBits::One,
            CliStopBits::Two => serialport::StopBits::Two,
        }
    }
}

fn data_bits(bytesize: u8) -> modem_proto::Result<serialport::DataBits> {
    match bytesize {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(modem_proto::Error::Protocol(format!(
            "unsupported bytesize {other}, expected 5-8"
        ))),
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send one or more files.
    Send {
        /// Files to transmit. XMODEM accepts exactly one.
        paths: Vec<PathBuf>,
    },
    /// Receive into a directory.
    Recv {
        /// Directory to write received files into.
        dir: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let code = match run(cli) {
        Ok(true) => 0,
        Ok(false) => {
            error!("transfer did not complete successfully");
            1
        }
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> modem_proto::Result<bool> {
    let mut port = serialport::new(&cli.port, cli.baudrate)
        .timeout(Duration::from_secs(cli.timeout))
        .data_bits(data_bits(cli.bytesize)?)
        .parity(cli.parity.into())
        .stop_bits(cli.stopbits.into())
        .open()?;
    let use_1k = cli.chunk_size >= 1024;

    match (&cli.command, cli.xmodem) {
        (Commands::Send { paths }, true) => {
            let Some(path) = paths.first() else {
                error!("xmodem send requires exactly one file");
                return Ok(false);
            };
            let file = File::open(path)?;
            let mut reader = BufReader::new(file);
            let cfg = XmodemConfig {
                max_retries: cli.max_retries,
                use_1k,
                ..Default::default()
            };
            let bar = progress_bar(path.metadata()?.len());
            let mut cb = |_idx: u32, _name: &str, _total: u64, done: u64| bar.set_position(done);
            xmodem::send(&mut port, &mut reader, &cfg, Some(&mut cb))
        }
        (Commands::Recv { dir }, true) => {
            std::fs::create_dir_all(dir)?;
            let out_path = dir.join("received.bin");
            let file = File::create(&out_path)?;
            let mut writer = BufWriter::new(file);
            let cfg = XmodemConfig {
                max_retries: cli.max_retries,
                use_1k,
                ..Default::default()
            };
            let bar = progress_bar(0);
            let mut cb = |_idx: u32, _name: &str, _total: u64, done: u64| bar.set_position(done);
            xmodem::recv(&mut port, &mut writer, &cfg, true, Some(&mut cb))
        }
        (Commands::Send { paths }, false) => {
            if paths.is_empty() {
                error!("ymodem send requires at least one file");
                return Ok(false);
            }
            let mut opened: Vec<(Task, File)> = Vec::new();
            for path in paths {
                let meta = path.metadata()?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("file")
                    .to_string();
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or_else(Task::now_epoch_secs);
                let task = Task::for_send(name, meta.len(), mtime, modem_proto::task::MODE_REGULAR_FILE);
                opened.push((task, File::open(path)?));
            }
            let mut sources: Vec<FileSource<'_>> = opened
                .iter_mut()
                .map(|(task, file)| FileSource {
                    task: task.clone(),
                    reader: file,
                })
                .collect();

            let cfg = YmodemConfig {
                max_retries: cli.max_retries,
                profile: ProgramProfile::RzSz,
                request_1k: use_1k,
                streaming: cli.ymodem_g,
                ..Default::default()
            };
            let total: u64 = sources.iter().map(|f| f.task.total).sum();
            let bar = progress_bar(total);
            let mut cb = |_idx: u32, name: &str, _total: u64, done: u64| {
                bar.set_message(name.to_string());
                bar.set_position(done);
            };
            ymodem::send(&mut port, &mut sources, &cfg, Some(&mut cb))
        }
        (Commands::Recv { dir }, false) => {
            std::fs::create_dir_all(dir)?;
            let cfg = YmodemConfig {
                max_retries: cli.max_retries,
                profile: ProgramProfile::RzSz,
                request_1k: use_1k,
                streaming: cli.ymodem_g,
                ..Default::default()
            };
            let bar = progress_bar(0);
            let dir = dir.clone();
            let open = move |task: &Task| -> modem_proto::Result<Box<dyn std::io::Write>> {
                info!("receiving {}", task.name);
                let dest = File::create(dir.join(&task.name))?;
                Ok(Box::new(BufWriter::new(dest)))
            };
            let mut cb = |_idx: u32, name: &str, total: u64, done: u64| {
                bar.set_length(total.max(1));
                bar.set_message(name.to_string());
                bar.set_position(done);
            };
            ymodem::recv(&mut port, &cfg, open, Some(&mut cb))
        }
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len.max(1));
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}
