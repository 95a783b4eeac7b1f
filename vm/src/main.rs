use std::process;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use bundle::BundleReader;
use vm::{loader, Machine, MachineSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Execute a compiled bundle", long_about = None)]
struct Cli {
    /// Entry point to invoke; defaults to the bundle's only entry point
    #[arg(short = 'e', long = "entry-point", value_name = "NAME")]
    entry_point: Option<String>,

    /// The bundle file to execute
    #[arg(value_name = "BUNDLE")]
    bundle: String,

    /// Arguments passed through to the program
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> vm::Result<()> {
    let reader = BundleReader::open(&cli.bundle)?;
    let entry = loader::select_entry_point(&reader, cli.entry_point.as_deref())?;
    debug!(bundle = %cli.bundle, entry = %entry, args = ?cli.args, "starting");

    let mut machine = Machine::new(MachineSettings::default())?;
    loader::run_entry(&mut machine, &reader, &entry)
}
