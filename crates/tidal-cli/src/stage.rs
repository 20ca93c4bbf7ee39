use std::time::Duration;

use anyhow::Context;
use tidal_core::{CoreStore, StorageMode};
use tidal_drive::Drive;
use tidal_mirror::{decide, hydrate_drive, mirror, read_version, sync_settings, MirrorOptions, ReleaseDecision};
use tidal_swarm::{IdleMonitor, JoinOptions, Swarm};
use tidal_types::CoreKey;
use tracing::{error, info};

use crate::cli::Cli;
use crate::config::StageConfig;
use crate::output;

const RELEASE_NAMESPACE: &str = "release";
const PROD_NAMESPACE: &str = "prod";

/// How a run that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    DryRun,
    NotRelease,
    Idle,
}

#[derive(Clone, Debug)]
pub struct StageArgs {
    pub stage_key: CoreKey,
    pub stage_checkout: u64,
    pub prod_key: CoreKey,
    pub dry_run: bool,
}

impl StageArgs {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        Ok(Self {
            stage_key: CoreKey::from_hex(&cli.stage_key).context("invalid stage key")?,
            stage_checkout: cli.stage_checkout,
            prod_key: CoreKey::from_hex(&cli.prod_key).context("invalid prod key")?,
            dry_run: cli.dry_run,
        })
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<Outcome> {
    let config = StageConfig::load(cli.config.as_deref())?.with_cli(&cli);
    let args = StageArgs::from_cli(&cli)?;
    let store = CoreStore::open(StorageMode::Directory(cli.storage.clone()), config.store.clone())
        .with_context(|| format!("opening core store at {}", cli.storage.display()))?;
    run_with_store(store, &args, &config).await
}

/// Stage into `store`, then shut the swarm and the store down whatever the
/// result.
pub async fn run_with_store(store: CoreStore, args: &StageArgs, config: &StageConfig) -> anyhow::Result<Outcome> {
    let swarm = Swarm::new(store.clone(), config.swarm.clone());
    let result = stage(&store, &swarm, args, config).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "staging failed, shutting down");
    }
    let closed = teardown(&swarm, &store).await;
    let outcome = result?;
    closed?;
    info!(?outcome, "stager finished");
    Ok(outcome)
}

/// Swarm first, so no peer writes race the closing cores.
async fn teardown(swarm: &Swarm, store: &CoreStore) -> anyhow::Result<()> {
    swarm.destroy().await;
    store.close().await.context("closing core store")
}

async fn stage(store: &CoreStore, swarm: &Swarm, args: &StageArgs, config: &StageConfig) -> anyhow::Result<Outcome> {
    let timeout = config.open_timeout();
    let release_store = store.namespace(RELEASE_NAMESPACE);
    let (metadata, blobs) = Drive::writable_cores(&release_store)?;
    swarm
        .join(metadata.discovery_key(), JoinOptions::default())
        .await?;

    if metadata.length() == 0 {
        swarm
            .join(args.prod_key.discovery_key(), JoinOptions::client_only())
            .await?;
        let prod = Drive::open_remote(&store.namespace(PROD_NAMESPACE), args.prod_key, timeout)
            .await
            .context("opening production drive")?;
        let (metadata_blocks, blob_blocks) = hydrate_drive(&prod, &metadata, &blobs)
            .await
            .context("seeding release from production")?;
        output::notice(&format!(
            "seeded release from production: {metadata_blocks} metadata blocks, {blob_blocks} blob blocks"
        ));
    }
    let release = Drive::open_writable(&release_store).await?;
    output::print_drive("release", &release);

    swarm
        .join(args.stage_key.discovery_key(), JoinOptions::client_only())
        .await?;
    let staged = Drive::open_remote(store, args.stage_key, timeout)
        .await
        .context("opening staging drive")?;
    staged
        .metadata()
        .wait_for_length(args.stage_checkout, timeout)
        .await
        .with_context(|| format!("waiting for staging drive to reach {}", args.stage_checkout))?;
    staged.refresh().await?;
    let checkout = staged.checkout(args.stage_checkout).await?;

    let preview = mirror(&checkout, &release, MirrorOptions::dry_run(), output::print_record).await?;
    let version = read_version(&checkout).await?;
    output::print_summary(&preview, &version);
    output::print_drive("release", &release);

    match decide(&version, args.dry_run) {
        ReleaseDecision::SkipDryRun { .. } => {
            output::notice("exiting due to dry run...");
            return Ok(Outcome::DryRun);
        }
        ReleaseDecision::SkipNotRelease { version } => {
            output::notice(&format!(
                "version {version} does not look like a release version, not staging..."
            ));
            return Ok(Outcome::NotRelease);
        }
        ReleaseDecision::Proceed { .. } => {}
    }

    wait_grace(config.swarm.grace_period()).await;
    output::notice("OK THEN! Staging...");
    println!();
    let report = mirror(&checkout, &release, MirrorOptions::default(), output::print_record).await?;
    let settings = sync_settings(&checkout, &release, &config.settings_allow_list()).await?;
    println!();
    output::notice("DONE!");
    info!(
        records = report.len(),
        settings = settings.len(),
        length = report.length,
        "release staged"
    );
    output::print_drive("release", &release);
    println!();

    output::notice("Swarming until idle...");
    let mut idle = IdleMonitor::new(config.swarm.idle_window());
    idle.watch(release.metadata());
    idle.watch(release.blobs().core());
    idle.run().await;
    output::notice("Shutting down due to inactivity...");
    Ok(Outcome::Idle)
}

/// Last chance to cancel before a real apply.
async fn wait_grace(period: Duration) {
    if period.is_zero() {
        return;
    }
    output::warning(&format!(
        "NOT A DRY RUN! Waiting {}s in case you wanna bail...",
        period.as_secs()
    ));
    tokio::time::sleep(period).await;
}
