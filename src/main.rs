use clap::Parser;

mod adapters;
mod cigar;
mod cli;
mod compact;
mod coverage_cmd;
mod error;
mod grid;
mod mutation;
mod mutation_cmd;
mod pipeline;
mod source;

use cli::Command;

fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::Cli::parse();
    match args.command {
        Command::Coverage(args) => coverage_cmd::run(args),
        Command::Mutation(args) => mutation_cmd::run(args),
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
