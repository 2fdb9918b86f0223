//! Command-line front end.
//!
//! Run with:
//! ```bash
//! sudo pcie-lat -p 00:05.0 -b 0 -o 0x40 -l 100000
//! ```
//!
//! Or without hardware, against a RAM-backed BAR:
//! ```bash
//! pcie-lat --simulate 4096 -l 10000 --json
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use pcie_lat::attrs::{self, Attribute};
use pcie_lat::measurement::{CycleCounter, DefaultQuiesce, Quiesce, SoftwareCounter};
use pcie_lat::output;
use pcie_lat::pci::{self, PciAddress, PciDevice};
use pcie_lat::preflight;
use pcie_lat::report::{analyze, RunInfo};
use pcie_lat::{
    decode_samples, parse_number, Config, Error, Region, RegionTable, Session, SessionOptions,
};

const USAGE: &str = "\
Usage: pcie-lat [options]

  -p, --pci B:D.F        PCIe device, e.g. 00:05.0
  -b, --bar N            BAR number to read from (default 0)
  -o, --offset N         offset within the BAR, decimal or 0x hex (default 0)
  -l, --loops N          measurement loops (default 100000)
      --csv PATH         where to write 3-sigma latencies
                         (default lat_<loops>_loops_3sigma.csv)
      --json [PATH]      write the report as JSON to PATH, or to stdout
      --hist             print a histogram of the 3-sigma latencies
      --list [IDS]       list PCI devices, optionally only those matching
                         vendor:device[:...] patterns, and exit
      --cpu N            pin the measuring thread to CPU N
      --realtime         run under SCHED_FIFO
      --simulate LEN     measure a RAM-backed BAR of LEN bytes instead
  -h, --help             show this help

Environment: PCIE_LAT_LOOPS, PCIE_LAT_BAR, PCIE_LAT_OFFSET, RUST_LOG";

#[derive(Debug, Default)]
struct CliArgs {
    pci: Option<PciAddress>,
    bar: Option<u32>,
    offset: Option<u32>,
    loops: Option<u32>,
    csv_path: Option<PathBuf>,
    json: bool,
    json_path: Option<PathBuf>,
    hist: bool,
    list: Option<String>,
    cpu: Option<usize>,
    realtime: bool,
    simulate: Option<usize>,
    help: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();

    let value = |i: usize| -> Result<&str, String> {
        args.get(i + 1)
            .map(String::as_str)
            .ok_or_else(|| format!("missing value for {}", args[i]))
    };
    let number = |i: usize| -> Result<u32, String> {
        let text = value(i)?;
        parse_number(text).ok_or_else(|| format!("invalid number for {}: {}", args[i], text))
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--pci" => {
                let text = value(i)?;
                cli.pci = Some(text.parse().map_err(|e: Error| e.to_string())?);
                i += 2;
            }
            "-b" | "--bar" | "--BAR" => {
                cli.bar = Some(number(i)?);
                i += 2;
            }
            "-o" | "--offset" => {
                cli.offset = Some(number(i)?);
                i += 2;
            }
            "-l" | "--loops" => {
                cli.loops = Some(number(i)?);
                i += 2;
            }
            "--csv" => {
                cli.csv_path = Some(PathBuf::from(value(i)?));
                i += 2;
            }
            "--json" => {
                cli.json = true;
                if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    cli.json_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--hist" => {
                cli.hist = true;
                i += 1;
            }
            "--list" => {
                if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    cli.list = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    cli.list = Some(String::new());
                    i += 1;
                }
            }
            "--cpu" => {
                cli.cpu = Some(number(i)? as usize);
                i += 2;
            }
            "--realtime" => {
                cli.realtime = true;
                i += 1;
            }
            "--simulate" => {
                cli.simulate = Some(number(i)? as usize);
                i += 2;
            }
            "-h" | "--help" => {
                cli.help = true;
                i += 1;
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    Ok(cli)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("{}\n\n{}", msg, USAGE);
            return ExitCode::from(2);
        }
    };
    if cli.help {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    if let Some(ids) = &cli.list {
        return match list_devices(ids) {
            Ok(listing) => {
                print!("{}", listing);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let preflight = preflight::run_all_checks();
    eprint!("{}", output::format_preflight(&preflight));

    let result = match cli.simulate {
        Some(len) => simulate(&cli, len),
        None if !preflight.is_valid() => return ExitCode::FAILURE,
        None => hardware(&cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn hardware(cli: &CliArgs) -> pcie_lat::Result<()> {
    let address = cli
        .pci
        .ok_or_else(|| Error::InvalidAddress("no PCIe device specified, use -p 00:05.0".into()))?;

    let device = match PciDevice::open(address) {
        Ok(device) => device,
        Err(e) => {
            if let Ok(listing) = list_devices("") {
                eprint!("existing PCI devices:\n{}", listing);
            }
            return Err(e);
        }
    };
    if let Err(e) = device.enable() {
        warn!(error = %e, "could not enable device, assuming it already is");
    }
    let regions = device.map_regions()?;
    let session = Session::bind(address.to_string(), regions)?;
    run(cli, &session)
}

/// PCI devices under sysfs matching the comma-separated `ids`, or all of
/// them for an empty list.
fn list_devices(ids: &str) -> pcie_lat::Result<String> {
    let devices = pci::scan(Path::new(pci::SYSFS_PCI_DEVICES), &pci::parse_id_list(ids))?;
    Ok(output::format_devices(&devices))
}

fn simulate(cli: &CliArgs, len: usize) -> pcie_lat::Result<()> {
    let regions = RegionTable::unmapped().with(0, Region::anonymous(len)?);
    let session = Session::with_parts(
        "simulated",
        regions,
        SoftwareCounter::new(),
        DefaultQuiesce::default(),
        SessionOptions::default(),
    )?;
    run(cli, &session)
}

/// Apply configuration through the attributes, measure, then report.
fn run<C: CycleCounter, Q: Quiesce>(cli: &CliArgs, session: &Session<C, Q>) -> pcie_lat::Result<()> {
    let env = Config::default().from_env();
    let settings = [
        (Attribute::TargetBar, cli.bar.unwrap_or(env.target_bar() as u32), 16),
        (Attribute::BarOffset, cli.offset.unwrap_or(env.bar_offset()), 10),
        (Attribute::Loops, cli.loops.unwrap_or(env.loops()), 10),
    ];
    for (attr, value, radix) in settings {
        let text = if radix == 16 {
            format!("{:x}", value)
        } else {
            value.to_string()
        };
        attrs::store(session, attr, &text)?;
    }

    let config = session.config();
    if cli.offset.is_some_and(|o| o != config.bar_offset()) {
        warn!(offset = config.bar_offset(), "offset must be 32-bit aligned, keeping previous value");
    }
    if cli.bar.is_some_and(|b| b != config.target_bar() as u32) {
        warn!(bar = config.target_bar(), "BAR must be 0..=5, keeping previous value");
    }

    {
        #[cfg(target_os = "linux")]
        let _scope = if cli.cpu.is_some() || cli.realtime {
            Some(pcie_lat::measurement::RealtimeScope::enter(cli.cpu, cli.realtime)?)
        } else {
            None
        };
        session.measure()?;
    }

    let mut bytes = Vec::new();
    session
        .with_results(|buffer| buffer.reader().read_to_end(&mut bytes))
        .map_err(|e| io_error("reading results", e))?;
    let samples = decode_samples(&bytes);

    let info = RunInfo {
        device: session.name().to_string(),
        counter: session.counter().name().to_string(),
        tsc_freq: session.tsc_freq(),
        tsc_overhead: session.tsc_overhead(),
        target_bar: config.target_bar(),
        bar_offset: config.bar_offset(),
        loops: config.loops(),
    };
    let analysis = analyze(info, &samples);

    if cli.json && cli.json_path.is_none() {
        println!("{}", json(&analysis.report)?);
    } else {
        print!("{}", output::format_report(&analysis.report));
        if cli.hist {
            println!();
            print!("{}", output::format_histogram(&analysis.report.histogram));
        }
    }
    if let Some(path) = &cli.json_path {
        std::fs::write(path, json(&analysis.report)?)
            .map_err(|e| io_error(path.display().to_string(), e))?;
    }

    let csv_path = cli
        .csv_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(output::default_csv_name(config.loops())));
    eprintln!("writing 3\u{03c3} values (in ns) to {}...", csv_path.display());
    output::save_csv(&csv_path, &analysis.filtered, session.tsc_freq())
}

fn json(report: &pcie_lat::report::Report) -> pcie_lat::Result<String> {
    output::to_json_pretty(report)
        .map_err(|e| io_error("serializing report", std::io::Error::other(e)))
}

fn io_error(context: impl Into<String>, source: std::io::Error) -> Error {
    Error::Io {
        context: context.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("pcie-lat")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_full_command_line() {
        let cli = parse_args(&args(&[
            "-p", "00:05.0", "-b", "2", "-o", "0x40", "-l", "5000", "--json", "--cpu", "3",
        ]))
        .unwrap();
        assert_eq!(cli.pci.unwrap().short(), "00:05.0");
        assert_eq!(cli.bar, Some(2));
        assert_eq!(cli.offset, Some(0x40));
        assert_eq!(cli.loops, Some(5000));
        assert!(cli.json);
        assert!(cli.json_path.is_none());
        assert_eq!(cli.cpu, Some(3));
    }

    #[test]
    fn test_parse_json_path_and_simulate() {
        let cli = parse_args(&args(&["--simulate", "4096", "--json", "out.json", "--realtime"])).unwrap();
        assert_eq!(cli.simulate, Some(4096));
        assert_eq!(cli.json_path, Some(PathBuf::from("out.json")));
        assert!(cli.realtime);
    }

    #[test]
    fn test_parse_hist_and_list() {
        let cli = parse_args(&args(&["--list", "8086:10d3,10ec:8168", "--hist"])).unwrap();
        assert_eq!(cli.list.as_deref(), Some("8086:10d3,10ec:8168"));
        assert!(cli.hist);

        let cli = parse_args(&args(&["--list", "-l", "10"])).unwrap();
        assert_eq!(cli.list.as_deref(), Some(""));
        assert_eq!(cli.loops, Some(10));
        assert!(!cli.hist);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["--loops"])).is_err());
        assert!(parse_args(&args(&["-l", "many"])).is_err());
        assert!(parse_args(&args(&["-p", "nonsense"])).is_err());
        assert!(parse_args(&args(&["--frobnicate"])).is_err());
    }
}
