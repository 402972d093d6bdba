//! `carat <module.json> [config.json]`
//!
//! Instruments a JSON-serialized module and writes the result to stdout.

#[macro_use]
extern crate log;

use carat::il;
use carat::instrument::{self, Configuration, GuardRule};
use carat::Error;
use log::{Level, LevelFilter, Metadata, Record};
use std::fs;
use std::io::Write;
use std::process;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn usage() -> Error {
    Error::Custom("usage: carat <module.json> [config.json]".to_string())
}

fn run() -> Result<(), Error> {
    let mut args = std::env::args().skip(1);
    let module = args.next().ok_or_else(usage)?;
    let configuration = match args.next() {
        Some(path) => Configuration::from_json(&fs::read_to_string(path)?)?,
        None => Configuration::new(),
    };
    if args.next().is_some() {
        return Err(usage());
    }

    if configuration.debug() {
        log::set_max_level(LevelFilter::Debug);
    }

    let mut program: il::Program = serde_json::from_str(&fs::read_to_string(&module)?)?;
    let report = instrument::instrument(&mut program, &configuration)?;

    for rule in [
        GuardRule::InvariantHoist,
        GuardRule::InductionHoist,
        GuardRule::Fallback,
    ] {
        info!("{}: {} accesses", rule, report.guards.count(rule));
    }
    info!("redundant: {} accesses", report.guards.redundant());
    info!("stack guards: {}", report.guards.stack_guards.len());
    if log_enabled!(Level::Debug) {
        for decision in &report.guards.decisions {
            debug!(
                "{} {}: {} of {}: {}",
                decision.function(),
                decision.location(),
                decision.access(),
                decision.pointer(),
                decision.rule()
            );
        }
    }

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    serde_json::to_writer_pretty(&mut stdout, &program)?;
    writeln!(stdout)?;
    Ok(())
}

fn main() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }

    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}
