//! nupkg-promote CLI
//!
//! Entry point for the `nupkg-promote` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nupkg_promote::{HelperPatcher, Pipeline, PipelineConfig, Verifier};

#[derive(Parser)]
#[command(name = "nupkg-promote")]
#[command(about = "Promote CI packages to release versions", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a directory of packages to a release version
    Set {
        /// Release version to write (e.g. 1.3.0)
        #[arg(long, short = 'v')]
        version: String,

        /// Directory containing the packages to promote
        #[arg(long, short = 'd')]
        directory: PathBuf,

        /// Split debug symbols into a companion .symbols package
        #[arg(long)]
        symbols: bool,
    },

    /// Report the versions embedded in a package without modifying it
    Verify {
        /// Package file to inspect
        #[arg(long, short = 'f')]
        filename: PathBuf,

        /// Expected version to check each binary against
        #[arg(long, short = 'v')]
        version: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Set { version, directory, symbols } => {
            run_set(version, directory, symbols);
        }
        Commands::Verify { filename, version } => {
            run_verify(&filename, version.as_deref());
        }
    }
}

fn run_set(version: String, directory: PathBuf, symbols: bool) {
    let mut config = PipelineConfig::new(version, directory);
    config.split_symbols = symbols;

    let pipeline = Pipeline::new(config, Arc::new(HelperPatcher::new()));
    match pipeline.promote() {
        Ok(outputs) => {
            for output in outputs {
                println!("Processed {}", output.display());
            }
        }
        Err(e) => {
            eprintln!("Error promoting packages: {}", e);
            process::exit(1);
        }
    }
}

fn run_verify(filename: &PathBuf, expected_version: Option<&str>) {
    let verifier = Verifier::new();
    match verifier.verify(filename, expected_version) {
        Ok(reports) => {
            let mut all_match = true;
            for report in reports {
                match report.matches {
                    Some(true) => {
                        println!("{} -> {} [matches]", report.path.display(), report.version);
                    }
                    Some(false) => {
                        println!(
                            "{} -> {} [DOES NOT match]",
                            report.path.display(),
                            report.version
                        );
                        all_match = false;
                    }
                    None => {
                        println!("{} -> {}", report.path.display(), report.version);
                    }
                }
            }
            if !all_match {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error verifying package: {}", e);
            process::exit(1);
        }
    }
}
