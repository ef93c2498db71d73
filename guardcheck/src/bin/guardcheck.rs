use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{ensure, Context};
use clap::Parser;
use guardcheck::*;

/// Makes classic heap mistakes on purpose and checks that
/// each one is caught.
#[derive(Parser, Debug)]
struct Arg {
    /// Scenarios to run (all of them if none is given)
    #[arg(value_enum)]
    scenarios:  Vec<Scenario>,

    /// What to do when the heap runs out of memory
    #[arg(short, long, value_enum, default_value_t = Policy::Retnull)]
    policy:     Policy,

    /// Append diagnostics to this file instead of stdout
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    report:     Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Arg::parse();
    let scenarios = if cli.scenarios.is_empty() {
        Scenario::all().to_vec()
    } else {
        cli.scenarios
    };

    let mut failed = 0;
    for scenario in scenarios {
        let out: Box<dyn Write + Send> = match &cli.report {
            Some(path)  => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("cannot open {}", path.display()))?,
            ),
            None        => Box::new(io::stdout()),
        };
        println!("== {scenario:?}");
        let outcome = run(scenario, cli.policy, out)?;
        for (origin, (count, bytes)) in outcome.report.by_origin() {
            println!("   {count} unfreed block(s), {bytes} bytes, from {origin}");
        }
        match verify(scenario, cli.policy, &outcome) {
            Ok(())  => println!("{scenario:?}: ok"),
            Err(e)  => {
                eprintln!("{scenario:?}: {e:#}");
                failed += 1;
            }
        }
    }
    ensure!(failed == 0, "{failed} scenario(s) failed");

    Ok(())
}
