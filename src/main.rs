//! `aq` - Aqueduct task runner.
//!
//! The bare binary ships with an empty task registry; applications embed
//! the CLI with their own registry via [`aqueduct::cli::main`].

use std::process::ExitCode;

use aqueduct::registry::TaskRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env (ignore if not present): AQ_LOCAL_STORE / AQ_SCRATCH_STORE.
    let _ = dotenvy::dotenv();

    aqueduct::cli::main(TaskRegistry::new()).await
}
