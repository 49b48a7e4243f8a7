//! Standalone entry point for `k8s-sandbox-cleanup`.
//!
//! This binary only has to exist and hand off to the library function, so it
//! parses its two positional arguments by hand rather than pulling in a
//! dedicated CLI crate.

use std::env;
use std::process::ExitCode;

use k8s_sandbox_engine::sandbox;

const USAGE: &str = "usage: k8s-sandbox-cleanup <namespace> [release-id]";

#[tokio::main]
async fn main() -> ExitCode {
    match tracing_subscriber::fmt().try_init() {
        Ok(_) => {}
        Err(error) => eprintln!("failed to initialize tracing subscriber: {error}"),
    }

    let mut args = env::args().skip(1);
    let namespace = match args.next() {
        Some(namespace) => namespace,
        None => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    let id = args.next();

    match sandbox::cli_cleanup(id, &namespace).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "cleanup failed");
            ExitCode::FAILURE
        }
    }
}
