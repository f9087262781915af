//! cloud-provisioner-sim: runs a cloud client against the in-memory provider.
//!
//! Usage:
//!   cloud-provisioner-sim run [--config <path>] [--images <n>] [--instances <n>] [--passes <n>]
//!   cloud-provisioner-sim config [--config <path>]
//!
//! Log output is controlled through `RUST_LOG` (default `info`).

use anyhow::{bail, Context};
use cloud_provisioner::cache::{CredentialIdentity, ThrottlerCache};
use cloud_provisioner::client::CloudClientBuilder;
use cloud_provisioner::config::{CredentialsConfig, ProvisionerConfig};
use cloud_provisioner::connector::InMemoryProvider;
use cloud_provisioner::types::{CloudInstance, ImageDetails, InstanceStatus, InstanceUserData};
use cloud_provisioner::UpdatableErrorProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") => cmd_run(&args[2..]).await,
        Some("config") => cmd_config(&args[2..]).await,
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("version") | Some("--version") | Some("-V") => {
            println!("cloud-provisioner-sim {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
        None => {
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"cloud-provisioner-sim: throttled provisioning simulator

USAGE:
    cloud-provisioner-sim <COMMAND> [OPTIONS]

COMMANDS:
    run       Populate images, start instances and reconcile against an in-memory provider
    config    Print the effective configuration as JSON
    version   Show version information
    help      Show this help message

OPTIONS:
    --config <path>      YAML profile (default: built-in MSI profile)
    --images <n>         Number of images (default 3)
    --instances <n>      Instances to start per image (default 2)
    --passes <n>         Reconciliation passes to run (default 3)
    --latency-ms <n>     Simulated provider latency (default 20)

ENVIRONMENT:
    CLOUD_*              Throttler overrides, see ProvisionerConfig::apply_env_overrides
    RUST_LOG             Log filter"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn numeric_flag(args: &[String], name: &str, default: u64) -> anyhow::Result<u64> {
    match flag(args, name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} expects a number, got `{raw}`")),
        None => Ok(default),
    }
}

async fn load_config(args: &[String]) -> anyhow::Result<ProvisionerConfig> {
    let config = match flag(args, "--config") {
        Some(path) => ProvisionerConfig::from_path(path)
            .await
            .with_context(|| format!("loading {path}"))?,
        None => {
            let mut config = ProvisionerConfig::new(CredentialsConfig::Msi {
                environment: "AZURE".to_string(),
                subscription_id: "00000000-0000-0000-0000-000000000000".to_string(),
            });
            config.profile = "simulator".to_string();
            config.reconcile_interval_ms = 500;
            config
        }
    };
    Ok(config.apply_env_overrides()?)
}

async fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let mut config = load_config(args).await?;
    if let CredentialsConfig::Credentials { secret, .. } = &mut config.credentials {
        *secret = "<redacted>".to_string();
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args).await?;
    let images = numeric_flag(args, "--images", 3)?;
    let per_image = numeric_flag(args, "--instances", 2)?;
    let passes = numeric_flag(args, "--passes", 3)?;
    let latency = Duration::from_millis(numeric_flag(args, "--latency-ms", 20)?);
    if images == 0 {
        bail!("--images must be at least 1");
    }

    let provider = Arc::new(InMemoryProvider::new().with_latency(latency));
    // One pre-existing instance per image, as if left over from an earlier session.
    for i in 0..images {
        let image_id = format!("image-{i}");
        provider.add_instance(CloudInstance::new(
            format!("{image_id}-existing"),
            image_id,
            InstanceStatus::Running,
        ));
    }

    let cache = ThrottlerCache::with_provider(config.throttler.clone(), provider.clone());
    let client = Arc::new(CloudClientBuilder::from_config(&config, &cache)?.build()?);

    let details = (0..images)
        .map(|i| {
            ImageDetails::new(format!("image-{i}"))
                .with_name(format!("Image {i}"))
                .with_max_instances(per_image as usize + 1)
        })
        .collect();
    let initial = client.populate_images_async(details)?.await?;
    println!("initial pass: {}", serde_json::to_string(&initial)?);

    let mut starts = Vec::new();
    for image in client.images() {
        for n in 0..per_image {
            let client = Arc::clone(&client);
            let image_id = image.id().to_string();
            starts.push(tokio::spawn(async move {
                let user_data = InstanceUserData::new().with_agent_name(format!("{image_id}-agent-{n}"));
                client.start_new_instance(&image_id, &user_data).await
            }));
        }
    }
    for start in starts {
        match start.await? {
            Ok(instance) => println!("started {} ({})", instance.id, instance.image_id),
            Err(err) => println!("start failed: {err}"),
        }
    }

    for _ in 0..passes {
        let report = client.reconcile_now().await?;
        println!("pass {}: {}", report.pass, serde_json::to_string(&report)?);
    }

    let subscriptions = client.list_subscriptions().await?;
    println!("subscriptions: {}", serde_json::to_string(&subscriptions)?);

    if let Some(throttler) = cache.get(&CredentialIdentity::from(&config.credentials)) {
        println!("{}", serde_json::to_string_pretty(&throttler.signals().await)?);
    }
    if let Some(info) = client.error_info() {
        println!("errors: {}", serde_json::to_string(&info)?);
    }
    println!(
        "provider peak concurrency: {}, executor: {}, cache: {}",
        provider.peak_in_flight(),
        serde_json::to_string(&client.executor_stats())?,
        serde_json::to_string(&cache.stats())?
    );

    client.dispose();
    cache.shutdown_all();
    Ok(())
}
