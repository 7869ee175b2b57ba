//! edge-trust - trust service for client devices at the edge
//!
//! Authenticates devices by certificate, authorizes their operations against
//! group policies and keeps TLS certificates issued by a local CA.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use edge_trust::{
    certificate::FileKeyProvider,
    cli::{Cli, Command},
    config::{Config, RegistryConfig},
    config_reload::ConfigWatcher,
    iot::{CaRegistrar, InMemoryIotRegistry, IotAuthClient},
    service::{ClientDevicesAuthService, Collaborators},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Validate) => run_validate(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Load and validate the configuration, then print what it contains
fn run_validate(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    println!("✅ configuration valid");
    println!("   Work dir: {}", config.work_dir.display());
    println!(
        "   CA: {}",
        if config.certificate_authority.is_using_custom_ca() {
            "custom".to_string()
        } else {
            config.certificate_authority.ca_type.to_string()
        }
    );
    println!(
        "   Groups: {} ({} policies)",
        config.device_groups.definitions.len(),
        config.device_groups.policies.len()
    );
    println!("   Session capacity: {}", config.session.capacity);
    println!(
        "   Registered certificates: {}",
        config.registry.certificates.len()
    );
    for output in &config.certificate_outputs {
        println!(
            "   Output: {} ({}) -> {}",
            output.service_name,
            output.certificate_type,
            output.directory.display()
        );
    }
    Ok(())
}

/// Build the offline identity registry from configured records
fn build_registry(records: &RegistryConfig) -> anyhow::Result<InMemoryIotRegistry> {
    let registry = InMemoryIotRegistry::new();
    for record in &records.certificates {
        let pem = std::fs::read_to_string(&record.certificate_file).with_context(|| {
            format!(
                "Failed to read certificate {} from {}",
                record.certificate_id,
                record.certificate_file.display()
            )
        })?;
        registry.register_certificate(&pem, record.certificate_id.clone());
        for thing in &record.things {
            registry.attach_thing(thing, &record.certificate_id);
        }
    }
    Ok(registry)
}

/// Run the service until Ctrl-C
async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        work_dir = %config.work_dir.display(),
        groups = config.device_groups.definitions.len(),
        outputs = config.certificate_outputs.len(),
        "Starting edge-trust"
    );

    let registry = Arc::new(build_registry(&config.registry)?);
    let collaborators = Collaborators {
        iot_client: Arc::clone(&registry) as Arc<dyn IotAuthClient>,
        ca_registrar: Some(registry as Arc<dyn CaRegistrar>),
        key_provider: Arc::new(FileKeyProvider),
    };

    let service = Arc::new(
        ClientDevicesAuthService::new(config, collaborators).context("Failed to create service")?,
    );
    service.start().await.context("Failed to start service")?;

    let _watcher = match (&cli.config, cli.no_watch) {
        (Some(path), false) => match ConfigWatcher::start(
            path.clone(),
            Arc::clone(&service),
            service.shutdown_receiver(),
        ) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "Config hot-reload disabled");
                None
            }
        },
        _ => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    service.shutdown().await;
    info!("edge-trust shutdown complete");
    Ok(())
}
