use std::process::ExitCode;

fn main() -> ExitCode {
    swift_rs::run_cli()
}
