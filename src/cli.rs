//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing, wires the configured
//! collaborators together and routes commands to the appropriate handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::audit::TracingAuditSink;
use crate::auth::{ClientSecretToken, ManagedIdentityToken, TokenProvider};
use crate::backends::{AwsSecretsStore, KeyVaultClient, SecretStore, StoreKind};
use crate::config::{AuthorizationRuleSpec, Config};
use crate::credentials::{CredentialBackend, ServiceBusClient};
use crate::health::HealthReporter;
use crate::lock::InMemoryRotationLock;
use crate::rotation::{Orchestrator, RotationSettings, TriggerSource};
use crate::scheduler::{self, BatchOutcome, DailySchedule, Trigger};
use crate::server::{self, AppState, ServiceInfo};

#[derive(Parser)]
#[command(name = "sbkr")]
#[command(about = "Scheduled Service Bus authorization key rotation with Key Vault propagation", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (environment variables are used when omitted)
    #[arg(short, long, env = "ROTATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Secret store to use (key_vault or aws, overrides config)
    #[arg(long)]
    pub secret_store: Option<StoreKind>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "rotator-config.toml")]
        output: PathBuf,
    },

    /// Run the daily scheduler and the HTTP trigger surface
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Rotate now, for one rule or every enabled rule
    Rotate {
        /// Authorization rule to rotate
        #[arg(short, long)]
        rule: Option<String>,
    },

    /// Probe the Service Bus namespace and the secret store
    Health,

    /// Show the effective configuration (names only, no secret values)
    Info,
}

/// Everything a rotation needs, wired from configuration.
struct Services {
    trigger: Arc<Trigger>,
    health: Arc<HealthReporter>,
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    // Handle init command separately as it doesn't need configuration
    if let Commands::Init { output } = &cli.command {
        Config::create_sample(output)
            .with_context(|| format!("Failed to create sample config at {:?}", output))?;
        info!("Sample configuration created at {:?}", output);
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(kind) = cli.secret_store {
        config.secret_store.kind = kind;
    }
    let rules = config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above

        Commands::Info => {
            let info = ServiceInfo::new(&config, &rules);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Health => {
            let services = build_services(&config, rules).await?;
            let snapshot = services.health.check().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if !snapshot.is_healthy() {
                anyhow::bail!("One or more dependencies are degraded");
            }
        }

        Commands::Rotate { rule } => {
            let services = build_services(&config, rules).await?;
            let report = services
                .trigger
                .run(TriggerSource::Manual, rule.as_deref())
                .await
                .context("Rotation could not start")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if matches!(report.outcome, BatchOutcome::Partial | BatchOutcome::AllFailed) {
                anyhow::bail!(
                    "{} of {} rotation(s) failed; see the audit log for details",
                    report.failed,
                    report.runs.len()
                );
            }
        }

        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let schedule: DailySchedule = config
                .rotation
                .schedule
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid rotation schedule")?;
            let info = ServiceInfo::new(&config, &rules);
            let services = build_services(&config, rules).await?;

            if !config.rotation.enabled {
                info!("Secret rotation is disabled; only health and info will do anything");
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let scheduler = tokio::spawn(scheduler::run_daily(
                services.trigger.clone(),
                schedule,
                config.rotation.run_on_startup,
                shutdown_rx,
            ));

            let state = AppState {
                trigger: services.trigger,
                health: services.health,
                info: Arc::new(info),
            };
            let served = server::serve(&listen, state, shutdown_signal()).await;

            // Stop the timer; a batch already running is allowed to finish.
            shutdown_tx.send(true).ok();
            scheduler.await.context("Scheduler task failed")?;
            served?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(config_path) => Config::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path)),
        None => Config::from_env().context("Failed to load config from environment"),
    }
}

async fn build_services(config: &Config, rules: Vec<AuthorizationRuleSpec>) -> Result<Services> {
    let token = build_token_provider(config);
    let backend = create_credential_backend(config, token.clone())?;
    let store = create_secret_store(config, token).await?;
    info!(
        backend = backend.backend_type(),
        store = store.store_type(),
        namespace = %config.namespace.name,
        rules = rules.iter().filter(|r| r.enabled).count(),
        "Collaborators ready"
    );

    let settings = RotationSettings::from_config(&config.rotation);
    let health = HealthReporter::new(backend.clone(), store.clone(), settings.call_timeout);
    let orchestrator = Orchestrator::new(
        backend,
        store,
        Arc::new(InMemoryRotationLock::new()),
        Arc::new(TracingAuditSink),
        settings,
    );

    Ok(Services {
        trigger: Arc::new(Trigger::new(Arc::new(orchestrator), rules, config.rotation.enabled)),
        health: Arc::new(health),
    })
}

/// Service principal when fully configured, managed identity otherwise.
fn build_token_provider(config: &Config) -> Arc<dyn TokenProvider> {
    let auth = &config.auth;
    match (&auth.tenant_id, &auth.client_id, &auth.client_secret) {
        (Some(tenant_id), Some(client_id), Some(client_secret)) => {
            info!("Authenticating as service principal {}", client_id);
            Arc::new(ClientSecretToken::new(
                tenant_id.clone(),
                client_id.clone(),
                client_secret.clone(),
            ))
        }
        _ => {
            info!("Authenticating with managed identity");
            Arc::new(ManagedIdentityToken::from_env(auth.client_id.clone()))
        }
    }
}

/// Create the Service Bus client based on configuration
fn create_credential_backend(
    config: &Config,
    token: Arc<dyn TokenProvider>,
) -> Result<Arc<dyn CredentialBackend>> {
    let namespace = &config.namespace;
    if namespace.subscription_id.trim().is_empty() {
        anyhow::bail!(
            "Subscription not configured. Set AZURE_SUBSCRIPTION_ID or configure [namespace] subscription_id"
        );
    }

    let client = ServiceBusClient::new(
        token,
        &namespace.management_endpoint,
        &namespace.subscription_id,
        &namespace.resource_group,
        &namespace.name,
        Duration::from_secs(config.rotation.call_timeout_seconds),
    )
    .context("Failed to create Service Bus client")?;
    Ok(Arc::new(client))
}

/// Create a secret store instance based on configuration
async fn create_secret_store(
    config: &Config,
    token: Arc<dyn TokenProvider>,
) -> Result<Arc<dyn SecretStore>> {
    match config.secret_store.kind {
        StoreKind::KeyVault => {
            let vault_uri = config
                .secret_store
                .key_vault_uri
                .as_deref()
                .filter(|uri| !uri.trim().is_empty())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Key Vault not configured. Set KEY_VAULT_URI or configure [secret_store] key_vault_uri"
                    )
                })?;
            let client = KeyVaultClient::new(
                token,
                vault_uri,
                &config.namespace.name,
                Duration::from_secs(config.rotation.call_timeout_seconds),
            )
            .context("Failed to create Key Vault client")?;
            Ok(Arc::new(client))
        }
        StoreKind::Aws => {
            let store =
                AwsSecretsStore::new(config.secret_store.aws_region.clone(), &config.namespace.name).await;
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining");
}
