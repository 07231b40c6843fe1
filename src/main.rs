use ptcopy::cli::Cli;
use ptcopy::logger;
use tracing::{debug, error};

fn main() {
    let args = Cli::parse_args();

    // Initialize logging system
    if logger::init(args.verbose).is_err() {
        eprintln!("failed to initialize logging");
    }

    debug!("ptcopy starting");

    match ptcopy::run(args) {
        Ok(_) => {
            debug!("copy completed");
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
