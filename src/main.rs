//! loadkeeper daemon entry point.

use clap::Parser;

use loadkeeper::cli_app;

fn main() {
    let args = cli_app::Cli::parse();
    if let Err(e) = cli_app::run(&args) {
        eprintln!("loadkeeper: {e}");
        std::process::exit(e.exit_code());
    }
}
