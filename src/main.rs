use clap::Parser;
use tfcascade::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
