mod config;
mod dns;
mod nameresolve;
mod oracle;
mod proxy;
mod region;
mod resolvconf;
mod supervisor;
mod trace;

use clap::Parser;
use supervisor::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    trace::init(cli.verbosity);

    match supervisor::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{e:?}");
            std::process::exit(1);
        }
    }
}
