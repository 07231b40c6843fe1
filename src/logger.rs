use crate::error::Result;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map the integer verbosity onto a tracing filter: negative is quiet
/// (errors only), 0 normal, 1 adds debug noise, 2 and up enables trace.
pub fn init(verbose: i32) -> Result<()> {
    let filter = if verbose < 0 {
        EnvFilter::new("error")
    } else if verbose == 0 {
        EnvFilter::new("info")
    } else if verbose == 1 {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("trace")
    };

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
