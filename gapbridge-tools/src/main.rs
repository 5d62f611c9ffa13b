use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gapbridge_core::crypto::crc32;
use gapbridge_core::inspect::SignatureScanner;
use gapbridge_core::{CryptoEngine, Inspector, Verdict};
use zeroize::Zeroize;

/// GapBridge Tools - key management and offline policy checks
#[derive(Parser)]
#[command(name = "gapbridge-tools")]
#[command(about = "GapBridge key management and inspection utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a random master key and store it encrypted
    Keygen {
        /// Output key file
        #[arg(long)]
        output: PathBuf,

        /// Password protecting the key file
        #[arg(long)]
        password: String,
    },

    /// Print the master key from a key file as hex
    ExportKey {
        /// Key file
        #[arg(long)]
        input: PathBuf,

        /// Key file password
        #[arg(long)]
        password: String,
    },

    /// CRC32 of a file
    Checksum {
        file: PathBuf,
    },

    /// Run a SQL statement through the query policy
    CheckSql {
        sql: String,
    },

    /// Run an FTP command line through the command policy
    CheckFtp {
        line: String,
    },

    /// Scan a file with the content signatures
    Scan {
        file: PathBuf,

        /// Extra signature rules (`name = pattern` per line)
        #[arg(long)]
        signatures: Option<PathBuf>,
    },
}

fn report(verdict: &Verdict) -> ExitCode {
    match verdict {
        Verdict::Accepted => {
            println!("accepted");
            ExitCode::SUCCESS
        }
        Verdict::Rejected(reason) => {
            println!("rejected: {}", reason);
            ExitCode::FAILURE
        }
        Verdict::Malformed(reason) => {
            println!("malformed: {}", reason);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Keygen { output, password } => {
            let engine = CryptoEngine::generate()?;
            engine
                .save_to_file(&output, &password)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Key written to {}", output.display());
        }

        Commands::ExportKey { input, password } => {
            let engine = CryptoEngine::load_from_file(&input, &password)
                .with_context(|| format!("reading {}", input.display()))?;
            let mut key = engine.export_key();
            println!("{}", hex::encode(key));
            key.zeroize();
        }

        Commands::Checksum { file } => {
            let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            println!("{:08x}  {}", crc32(&data), file.display());
        }

        Commands::CheckSql { sql } => {
            let inspector = Inspector::with_defaults()?;
            return Ok(report(&inspector.check_sql(&sql)));
        }

        Commands::CheckFtp { line } => {
            let inspector = Inspector::with_defaults()?;
            return Ok(report(&inspector.check_ftp_command(&line)));
        }

        Commands::Scan { file, signatures } => {
            let scanner = match signatures {
                Some(path) => SignatureScanner::from_file(&path)?,
                None => SignatureScanner::with_defaults()?,
            };
            let inspector = Inspector::new(Arc::new(scanner))?;
            let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            return Ok(report(&inspector.check_content(&data, &file.display().to_string())));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
