use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use cds_client::{
    dispatcher::DispatchReport,
    handlers::{PATIENT_VIEW, RX_SIGN_ORDER_SIGN},
    CdsClient,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use shared::{
    domain::{ActionTag, DateRangeKind, DoseFrequency, HookId},
    protocol::ExchangeBody,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file, `sandbox.toml` in the working directory by default.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    fhir_server: Option<String>,
    #[arg(long, value_delimiter = ',')]
    discovery_url: Vec<String>,
    #[arg(long)]
    patient_id: Option<String>,
    #[arg(long)]
    jwt_secret: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the configured services.
    Services,
    /// Fire a hook and print the exchanges.
    Fire {
        #[arg(long, default_value = PATIENT_VIEW)]
        hook: String,
        #[arg(long, default_value = ActionTag::PATIENT_SELECTED)]
        action: String,
    },
    /// Build a draft prescription on an order view, optionally sign it.
    Order {
        #[arg(long, default_value = RX_SIGN_ORDER_SIGN)]
        hook: String,
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 1)]
        dose: u32,
        #[arg(long, default_value = "daily")]
        frequency: String,
        #[arg(long, default_value_t = 1)]
        supply_days: u32,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long)]
        sign: bool,
        /// Take a suggestion from the returned cards by its uuid.
        #[arg(long)]
        take_suggestion: Option<String>,
    },
    /// Post a raw request body to one service. `@path` reads it from a file.
    Resend {
        service_url: String,
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => config::load_settings_from(path, |key| std::env::var(key).ok()),
        None => config::load_settings(),
    };
    if let Some(fhir_server) = cli.fhir_server {
        settings.fhir_server = fhir_server;
    }
    if !cli.discovery_url.is_empty() {
        settings.discovery_urls = cli.discovery_url;
    }
    if cli.patient_id.is_some() {
        settings.patient_id = cli.patient_id;
    }
    if cli.jwt_secret.is_some() {
        settings.jwt_secret = cli.jwt_secret;
    }

    let client = CdsClient::new(settings.client_options()).context("failed to build client")?;
    let version = client
        .connect_fhir_server(&settings.fhir_server)
        .await
        .with_context(|| format!("failed to connect FHIR server {}", settings.fhir_server))?;
    info!(fhir_server = %settings.fhir_server, ?version, "sandbox: FHIR server ready");

    for discovery_url in &settings.discovery_urls {
        match client.discover_services(discovery_url).await {
            Ok(count) => info!(%discovery_url, count, "sandbox: services discovered"),
            Err(err) => error!(%discovery_url, "sandbox: discovery failed: {err}"),
        }
    }

    match cli.command {
        Command::Services => {
            for service in client.configured_services().await {
                println!(
                    "{}\t{}\t{}",
                    service.descriptor.hook,
                    service.url,
                    service.descriptor.title.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Fire { hook, action } => {
            client.set_current_hook(HookId::new(hook)).await;
            load_patient(&client, settings.patient_id.as_deref()).await?;
            let report = client.fire(ActionTag::new(action)).await;
            print_results(&client, &report).await?;
        }
        Command::Order {
            hook,
            code,
            name,
            dose,
            frequency,
            supply_days,
            start,
            end,
            sign,
            take_suggestion,
        } => {
            let frequency = DoseFrequency::parse(&frequency)
                .with_context(|| format!("unknown dose frequency {frequency}"))?;
            client.set_current_hook(HookId::new(hook)).await;
            load_patient(&client, settings.patient_id.as_deref()).await?;

            client.choose_medication(&code, &name).await;
            client.update_dosage_instructions(dose, frequency).await;
            let mut report = client.update_dispense_request(supply_days).await;
            if start.is_some() {
                report = client.update_date(DateRangeKind::Start, start).await;
            }
            if end.is_some() {
                report = client.update_date(DateRangeKind::End, end).await;
            }
            if sign {
                report = client.sign_order().await;
            }
            if let Some(uuid) = take_suggestion {
                report = client.take_suggestion_by_uuid(&uuid).await?;
            }
            print_results(&client, &report).await?;
            if let Some(draft) = client.draft_order().await {
                println!("draft order:\n{}", serde_json::to_string_pretty(&draft)?);
            }
        }
        Command::Resend { service_url, body } => {
            let raw = match body.strip_prefix('@') {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("failed to read request body from {path}"))?,
                None => body,
            };
            let result = client
                .resend(&service_url, ExchangeBody::from_text(&raw))
                .await;
            if let Some(exchange) = result.exchange {
                println!("{}", serde_json::to_string_pretty(&exchange)?);
            }
        }
    }

    Ok(())
}

async fn load_patient(client: &Arc<CdsClient>, patient_id: Option<&str>) -> Result<()> {
    if let Some(patient_id) = patient_id {
        client
            .load_patient(patient_id)
            .await
            .with_context(|| format!("failed to load patient {patient_id}"))?;
    }
    Ok(())
}

async fn print_results(client: &Arc<CdsClient>, report: &DispatchReport) -> Result<()> {
    if report.is_skipped() {
        println!("hook {} did not fire", report.hook_id());
    }
    for exchange in client.exchanges().await {
        println!("{}", serde_json::to_string_pretty(&exchange)?);
    }
    for card in client.cards().await {
        println!("[{:?}] {} ({})", card.indicator, card.summary, card.source.label);
        for suggestion in &card.suggestions {
            println!(
                "    suggestion {}: {}",
                suggestion.uuid.as_deref().unwrap_or("-"),
                suggestion.label
            );
        }
    }
    for message in client.messages().await {
        println!("message from {}: {}", message.service_url, message.message);
    }
    Ok(())
}
