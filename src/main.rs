mod app;
mod cli;

use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "vidproc=debug" } else { "vidproc=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // stderr keeps logs apart from the progress lines on stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = cli::parse();
    init_tracing(cli.verbose);
    app::run(cli);
}
