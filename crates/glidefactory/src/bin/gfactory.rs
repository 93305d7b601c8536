//! The factory daemon: one controller per configured entry, driven in
//! cycles against the collector and the local schedd.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use glidefactory::advertise::Advertiser;
use glidefactory::collector::security::SecEnvRequest;
use glidefactory::collector::{AdvertiseCmd, BusClient, CondorBusClient};
use glidefactory::config::{FrontendDescript, GlideinDescript, JobDescript, SignatureFile};
use glidefactory::creds::crypto::FactoryKey;
use glidefactory::entry::downtime::DowntimeCalendar;
use glidefactory::entry::{self, Entry};
use glidefactory::schedd::CondorScheddClient;
use glidefactory::Map;

#[derive(Parser)]
#[command(name = "gfactory", about = "Glidein factory core daemon")]
struct Opts {
    /// Directory holding glidein.descript and the per-entry configuration
    config_dir: PathBuf,

    /// Seconds to sleep between cycles
    #[arg(long, default_value_t = 60)]
    cycle_sleep: u64,

    /// Run a single cycle and exit
    #[arg(long)]
    one_cycle: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    let glidein = Arc::new(
        GlideinDescript::load(&opts.config_dir).context("cannot load glidein.descript")?,
    );
    let frontends = Arc::new(
        FrontendDescript::load(&opts.config_dir).context("cannot load frontend.descript")?,
    );
    let signatures =
        Arc::new(SignatureFile::load(&opts.config_dir).context("cannot load signatures")?);

    let key = match FactoryKey::load(&glidein.rsa_key_file) {
        Ok(key) => Some(key),
        Err(e) => {
            log::warn!("No usable factory key ({e}); encrypted requests will be skipped");
            None
        }
    };

    let downtimes_path = opts.config_dir.join("downtimes");
    let downtimes = if downtimes_path.is_file() {
        DowntimeCalendar::load(&downtimes_path).context("cannot load downtimes")?
    } else {
        DowntimeCalendar::default()
    };

    let mut entries = Vec::new();
    for entry_name in &glidein.entries {
        let job = JobDescript::load(&opts.config_dir, entry_name)
            .with_context(|| format!("cannot load entry {entry_name}"))?;
        entries.push(Entry::new(
            glidein.clone(),
            frontends.clone(),
            signatures.clone(),
            job,
            downtimes.clone(),
        )?);
    }
    if entries.is_empty() {
        anyhow::bail!("no entries configured");
    }
    log::info!(
        "Starting factory {}@{} with {} entries",
        glidein.glidein_name,
        glidein.factory_name,
        entries.len()
    );

    let mut security = SecEnvRequest::new();
    security.require_integrity(Some(true));
    if let Some(proxy) = &glidein.factory_proxy {
        security.set_x509_proxy(Some(proxy.display().to_string()));
    }
    let bus = CondorBusClient::new(
        glidein.factory_collector.clone(),
        glidein.lock_dir.clone(),
        glidein.advertise_use_tcp,
    )
    .with_security(security);
    let schedd = CondorScheddClient::new(glidein.submit_dir.clone());
    let advertiser = Advertiser::new(glidein.lock_dir.clone(), glidein.advertise_use_multi);

    loop {
        run_one_cycle(&glidein, &frontends, &entries, &bus, &schedd, &advertiser, key.as_ref())
            .await;

        if opts.one_cycle {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(opts.cycle_sleep)) => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down, invalidating advertisements");
                deadvertise_all(&advertiser, &bus, &glidein, &entries).await;
                break;
            }
        }
    }

    Ok(())
}

async fn run_one_cycle(
    glidein: &Arc<GlideinDescript>,
    frontends: &Arc<FrontendDescript>,
    entries: &[Entry],
    bus: &CondorBusClient,
    schedd: &CondorScheddClient,
    advertiser: &Advertiser,
    key: Option<&FactoryKey>,
) {
    // The global ad carries the public key the frontends seal against.
    if let Some(key) = key {
        let global_ad = advertiser.global_classad(glidein, key);
        if let Err(e) = advertiser
            .advertise_ads(bus, &[global_ad], AdvertiseCmd::UpdateAdGeneric)
            .await
        {
            log::warn!("Advertising glidefactoryglobal classad failed: {e}");
        }

        let updated = entry::process_global_credentials(bus, glidein, frontends, key).await;
        if updated > 0 {
            log::info!("Updated {updated} credential file(s)");
        }
    }

    let entry_names: Vec<String> = entries.iter().map(|e| e.name().to_string()).collect();
    let work = match entry::work::find_group_work(bus, glidein, &entry_names, key).await {
        Ok(work) => work,
        Err(e) => {
            log::warn!("Could not fetch work requests: {e}");
            Map::new()
        }
    };

    let empty = Map::new();
    for entry in entries {
        let entry_work = work.get(entry.name()).unwrap_or(&empty);
        match entry::run_cycle(entry, bus, schedd, advertiser, key, entry_work).await {
            Ok(stats) => {
                log::info!(
                    "Entry {}: {}",
                    entry.name(),
                    serde_json::to_string(&stats).unwrap_or_default()
                );
            }
            Err(e) => {
                log::error!("Entry {} cycle failed: {e}", entry.name());
            }
        }
    }
}

async fn deadvertise_all(
    advertiser: &Advertiser,
    bus: &dyn BusClient,
    glidein: &GlideinDescript,
    entries: &[Entry],
) {
    let mut names = Vec::new();
    let mut futs: Vec<Pin<Box<dyn Future<Output = glidefactory::Result<()>> + '_>>> = Vec::new();
    for entry in entries {
        names.push(entry.name());
        futs.push(Box::pin(advertiser.deadvertise_entry(bus, glidein, entry.name())));
        names.push(entry.name());
        futs.push(Box::pin(advertiser.deadvertise_client_monitoring(
            bus,
            glidein,
            entry.name(),
        )));
    }
    for (name, result) in names.into_iter().zip(futures::future::join_all(futs).await) {
        if let Err(e) = result {
            log::warn!("Could not deadvertise entry {name}: {e}");
        }
    }
    if let Err(e) = advertiser.deadvertise_global(bus, glidein).await {
        log::warn!("Could not deadvertise the factory global classad: {e}");
    }
}
