use std::process;

use marketsync::{
    config::{self, ScenarioName},
    infra::{error::AppError, telemetry},
    marketplace::{MarketplaceApi, MarketplaceBackend, ScenarioReport, scenario},
    sync::{SyncClient, SyncConfig},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Demo(config::DemoArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Demo(args) => run_demo(settings, args).await,
        config::Command::Scenario(args) => run_scenario(settings, args).await,
        config::Command::Endpoints(_) => run_endpoints(settings),
    }
}

async fn run_demo(settings: config::Settings, args: config::DemoArgs) -> Result<(), AppError> {
    info!(
        target = "marketsync::demo",
        latency_ms = settings.backend.latency.as_millis() as u64,
        "Running every scenario"
    );

    for name in ScenarioName::all() {
        let report = scenario::run(
            name,
            SyncConfig::from(&settings.sync),
            settings.backend.latency,
        )
        .await?;
        print_report(&report, args.events);
    }
    Ok(())
}

async fn run_scenario(
    settings: config::Settings,
    args: config::ScenarioArgs,
) -> Result<(), AppError> {
    let report = scenario::run(
        args.name,
        SyncConfig::from(&settings.sync),
        settings.backend.latency,
    )
    .await?;
    print_report(&report, args.events);
    Ok(())
}

fn run_endpoints(settings: config::Settings) -> Result<(), AppError> {
    let client = SyncClient::new(SyncConfig::from(&settings.sync));
    let backend = MarketplaceBackend::seeded(settings.backend.latency);
    MarketplaceApi::register(&client, &backend)?;

    println!("queries:");
    for name in client.endpoints().query_names() {
        println!("  {name}");
    }
    println!("mutations:");
    for name in client.endpoints().mutation_names() {
        let optimistic = client
            .endpoints()
            .mutation(&name)
            .is_some_and(|info| info.optimistic);
        let mode = if optimistic { "optimistic" } else { "pessimistic" };
        println!("  {name} ({mode})");
    }
    Ok(())
}

fn print_report(report: &ScenarioReport, with_events: bool) {
    println!("== {} ==", report.scenario.as_str());
    for step in &report.steps {
        println!("  - {step}");
    }
    if with_events {
        println!("  events:");
        for event in &report.events {
            println!("    [{:>4}] {}", event.epoch, event.kind);
        }
    }
}
