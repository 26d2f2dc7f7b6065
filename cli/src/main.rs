//! The main entrypoint for tcbuilder, which is mostly just a wrapper around
//! the library crate.

use anyhow::Result;

async fn run() -> Result<()> {
    tcbuilder_utils::initialize_tracing();
    tracing::trace!("starting");
    tcbuilder_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
