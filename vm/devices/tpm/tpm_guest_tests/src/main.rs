// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-line utility that exercises a TPM 2.0 device from inside a guest.
//! Runs the built-in command, key hierarchy and NV storage tests, or replays
//! captured command dumps.

mod tpm;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;
use std::time::Duration;
use tpm_lib::TestContext;
use tpm_lib::profile::AlgorithmProfile;
use tpm_lib::replay::ReplayOutcome;
use tpm_lib::replay::replay_hex;
use tpm_lib::suite::RunSummary;
use tpm_lib::suite::TestOutcome;
use tpm_lib::suite::TestRegistry;
use tpm_protocol::hex::split_hex_blocks;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use tpm::Tpm;

const HEXDUMP_LIMIT: usize = 256;

#[derive(Parser)]
#[clap(name = "tpm_guest_tests", about = "TPM 2.0 guest smoke tests")]
struct Options {
    /// TPM character device
    #[clap(
        long,
        global = true,
        env = "TPM_DEVICE",
        default_value = "/dev/tpmrm0"
    )]
    device: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the built-in tests
    Run {
        /// Algorithm profile: sha256-rsa, sha256-ecc or sm3-sm2
        #[clap(long, default_value_t = AlgorithmProfile::default())]
        profile: AlgorithmProfile,
        /// Run only the named tests (repeatable)
        #[clap(long = "only", value_name = "TEST")]
        only: Vec<String>,
        /// Delay between tests, in milliseconds
        #[clap(long, default_value_t = 0)]
        pace_ms: u64,
        /// Print the results as JSON
        #[clap(long)]
        json: bool,
    },
    /// Send captured hex command dumps and print the responses
    Replay {
        /// One command as hex text (repeatable)
        #[clap(long = "hex", value_name = "TEXT", required_unless_present = "file")]
        hex: Vec<String>,
        /// File of hex dumps, one command per blank-line-separated block
        #[clap(long, conflicts_with = "hex")]
        file: Option<PathBuf>,
    },
    /// List the built-in tests
    List,
}

fn main() {
    let opts = Options::parse();

    let filter = if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::default().add_directive(LevelFilter::INFO.into())
    };
    tracing_subscriber::fmt()
        .log_internal_errors(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(err) = run(opts) {
        eprintln!("error: {err}");
        for inner in err.chain().skip(1) {
            eprintln!("caused by: {inner}");
        }
        std::process::exit(1);
    }
}

fn run(opts: Options) -> anyhow::Result<()> {
    match opts.command {
        Command::List => {
            for name in TestRegistry::standard(AlgorithmProfile::default()).names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Run {
            profile,
            only,
            pace_ms,
            json,
        } => {
            let mut registry =
                TestRegistry::standard(profile).with_pace(Duration::from_millis(pace_ms));
            if !only.is_empty() {
                registry.retain_named(&only)?;
            }

            let mut ctx = open_device(&opts.device)?;
            let summary = registry.run(&mut ctx);
            if json {
                println!("{:#}", summary_json(&profile, &summary));
            } else {
                print_summary(&profile, &summary);
            }

            if summary.any_failed() {
                anyhow::bail!(
                    "{} of {} tests failed",
                    summary.count(TestOutcome::Failed),
                    summary.reports.len()
                );
            }
            Ok(())
        }
        Command::Replay { hex, file } => {
            let dumps = match file {
                Some(path) => {
                    let text = fs_err::read_to_string(path)?;
                    split_hex_blocks(&text).collect()
                }
                None => hex,
            };

            let mut ctx = open_device(&opts.device)?;
            for (i, dump) in dumps.iter().enumerate() {
                let outcome = replay_hex(&mut ctx, dump)
                    .with_context(|| format!("failed to replay command {i}"))?;
                print_replay(i, &outcome);
            }
            Ok(())
        }
    }
}

fn open_device(path: &std::path::Path) -> anyhow::Result<TestContext<Tpm>> {
    tracing::info!(device = %path.display(), "opening TPM device");
    let tpm = Tpm::open(path).context("failed to open TPM device")?;
    Ok(TestContext::new(tpm))
}

fn print_summary(profile: &AlgorithmProfile, summary: &RunSummary) {
    println!("profile: {profile}");
    for report in &summary.reports {
        print!("{:<16} {:<4} {}", report.name, report.outcome, report.detail);
        if let Some(rc) = report.response_code {
            print!(" [rc {rc:#x}]");
        }
        println!();
    }
    println!(
        "pass: {}, warn: {}, fail: {}, skip: {}",
        summary.count(TestOutcome::Passed),
        summary.count(TestOutcome::Warning),
        summary.count(TestOutcome::Failed),
        summary.count(TestOutcome::Skipped),
    );
}

fn summary_json(profile: &AlgorithmProfile, summary: &RunSummary) -> serde_json::Value {
    let tests = summary
        .reports
        .iter()
        .map(|report| {
            serde_json::json!({
                "name": report.name,
                "outcome": report.outcome.as_str(),
                "detail": report.detail,
                "response_code": report.response_code,
            })
        })
        .collect::<Vec<_>>();

    serde_json::json!({
        "profile": profile.name,
        "tests": tests,
        "summary": {
            "pass": summary.count(TestOutcome::Passed),
            "warn": summary.count(TestOutcome::Warning),
            "fail": summary.count(TestOutcome::Failed),
            "skip": summary.count(TestOutcome::Skipped),
        },
    })
}

fn print_replay(index: usize, outcome: &ReplayOutcome) {
    match outcome.command_code {
        Some(cc) => println!("command {index} ({cc:?}, {} bytes):", outcome.command.len()),
        None => println!("command {index} ({} bytes):", outcome.command.len()),
    }
    if let Some(declared) = outcome.size_mismatch {
        println!("  size field says {declared} bytes");
    }
    print_hexdump(&outcome.command, HEXDUMP_LIMIT);

    println!(
        "response: {} ({:#x}), {} bytes",
        outcome.reply.response_code,
        outcome.reply.response_code.raw,
        outcome.reply.bytes.len()
    );
    print_hexdump(&outcome.reply.bytes, HEXDUMP_LIMIT);
}

fn print_hexdump(data: &[u8], limit: usize) {
    for line in hexdump(data, limit) {
        println!("{line}");
    }
    if data.len() > limit {
        println!(
            "… {} additional bytes not shown (total {} bytes)",
            data.len() - limit,
            data.len()
        );
    }
}

/// 16 bytes per row: offset, hex bytes, then the printable ASCII.
fn hexdump(data: &[u8], limit: usize) -> Vec<String> {
    let max = data.len().min(limit);
    data[..max]
        .chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let mut line = format!("{:04x}: ", row * 16);
            let mut ascii = String::new();
            for byte in chunk {
                line.push_str(&format!("{:02x} ", byte));
                let ch = if (0x20..=0x7e).contains(byte) {
                    *byte as char
                } else {
                    '.'
                };
                ascii.push(ch);
            }
            for _ in chunk.len()..16 {
                line.push_str("   ");
            }
            line.push_str(&format!(" |{}|", ascii));
            line
        })
        .collect()
}
