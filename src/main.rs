use std::io::{self, Write};
use std::process;

use depcache::{
    cache::{CacheConfig, Invocation, fingerprint},
    config::{self, Command, FingerprintArgs, LogFormat, Settings},
    infra::{error::InfraError, telemetry},
};
use serde_json::json;
use tracing::{Dispatch, Level, debug, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "depcache failed");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "depcache failed");
    });
}

fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Fingerprint(args) => print_fingerprint(&args),
        Command::Settings => print_settings(&settings),
    }
}

fn print_fingerprint(args: &FingerprintArgs) -> Result<(), InfraError> {
    let invocation = build_invocation(args);
    let components = invocation.components(&args.path, args.tenant.as_deref())?;
    let key = fingerprint(&components);
    debug!(components = components.len(), key = %key, "fingerprint built");

    let mut out = io::stdout().lock();
    if args.verbose {
        for component in &components {
            writeln!(out, "{component}")?;
        }
    }
    writeln!(out, "{key}")?;
    Ok(())
}

fn build_invocation(args: &FingerprintArgs) -> Invocation {
    let mut invocation = Invocation::new(args.owner.as_str(), args.function.as_str());
    for value in &args.args {
        invocation = invocation.arg(value.as_str());
    }
    for (name, value) in &args.kwargs {
        invocation = invocation.kwarg(name.as_str(), value.as_str());
    }
    for value in &args.extras {
        invocation = invocation.extra(value.as_str());
    }
    if let Some(sentinel) = args.sentinel {
        invocation = invocation.sentinel(sentinel.into());
    }
    invocation
}

fn print_settings(settings: &Settings) -> Result<(), InfraError> {
    let format = match settings.logging.format {
        LogFormat::Json => "json",
        LogFormat::Compact => "compact",
    };
    let resolved = json!({
        "cache": CacheConfig::from(&settings.cache),
        "logging": {
            "level": settings.logging.level.to_string(),
            "format": format,
        },
    });

    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(&resolved)?)?;
    Ok(())
}
