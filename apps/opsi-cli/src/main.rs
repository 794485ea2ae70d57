use std::process::ExitCode;

use clap::Parser;
use opsi_cli::app;
use opsi_cli::cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match app::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if !err.is_reported() {
                eprintln!("Error: {err}");
            }
            ExitCode::from(err.exit_code().clamp(1, 255) as u8)
        }
    }
}
