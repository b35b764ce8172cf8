//! Rangzen engine host binary.
//!
//! Environment, CLI surface and exit codes are not prescribed by the
//! engine itself (spec §6 "Environment, CLI, exit codes ... driven by
//! the embedding application"); this binary is a minimal host that
//! wires the engine up and runs its scheduling loop against whatever
//! peers the registry already knows about. A real deployment supplies
//! its own [`rangzen_core::transport::TransportDriver`] and feeds
//! [`rangzen_core::transport::TransportAdapter`] from its radio stack —
//! this binary has none, so it idles, ready for one to be attached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use rangzen_core::config::Config;
use rangzen_core::database::Db;
use rangzen_core::friend::FriendStore;
use rangzen_core::identity::{identity_init, FileIdentityStore};
use rangzen_core::message::MessageStore;
use rangzen_core::peer::PeerRegistry;
use rangzen_core::scheduler::{ExchangeContext, Scheduler, SchedulerLimits};
use rangzen_core::session::legacy::LegacyPolicy;
use rangzen_core::transport::{TransportAdapter, TransportDriver};
use rangzen_core::Result;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Missing keys fall back to
    /// spec defaults; `RANGZEN_*` environment variables override both.
    #[arg(short, long, default_value = "rangzen.toml")]
    config: PathBuf,

    /// Override the configured log level.
    #[arg(short, long)]
    verbosity: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    use tracing_subscriber::{fmt, EnvFilter};
    let log_level = args.verbosity.as_deref().unwrap_or(&config.app.log_level);
    fmt().with_env_filter(EnvFilter::new(log_level)).init();

    tracing::info!(data_dir = %config.app.data_dir.display(), "starting rangzen engine");

    let identity_store = FileIdentityStore::new(config.security.identity_key_path.clone());
    let identity = identity_init(&identity_store)?;
    tracing::info!(public_id = %identity.public_id(), "device identity ready");

    let message_db = Db::open(&config.database.message_store_path)?;
    let message_store = MessageStore::open(message_db, config.security.min_trust_gate).await?;

    let friend_db = Db::open(&config.database.friend_store_path)?;
    let friend_store = FriendStore::open(friend_db).await?;
    let own_friends = friend_store.all().await?;
    tracing::info!(count = own_friends.len(), "loaded friend list");

    let registry = Arc::new(PeerRegistry::new(config.network.stale_ms));
    let (adapter, _frames, _accepted) = TransportAdapter::new(registry.clone());

    let scheduler = Scheduler::new(SchedulerLimits {
        backoff_base_ms: config.exchange.backoff_base_ms,
        backoff_max_ms: config.exchange.backoff_max_ms,
        max_concurrent_exchanges: config.exchange.max_concurrent_exchanges,
    });

    let legacy_policy = LegacyPolicy {
        use_trust: config.exchange.use_trust,
        min_shared_contacts: config.exchange.min_shared_contacts_for_exchange,
        max_messages_per_exchange: config.exchange.max_messages_per_exchange,
        session_timeout: Duration::from_millis(config.exchange.exchange_session_timeout_ms),
    };
    let ctx = ExchangeContext {
        own_friends: &own_friends,
        message_store: &message_store,
        legacy_policy: &legacy_policy,
        local_public_id_prefix: identity.public_id_prefix(),
    };

    // A real deployment attaches its own driver here (spec §1, §6 — transport
    // drivers are external collaborators, not part of this engine). This
    // minimal host has none, so `scheduler.run_once` never has anything to
    // drive and the loop only reports readiness.
    let driver: Option<Arc<dyn TransportDriver>> = None;
    if driver.is_none() {
        tracing::info!("no transport driver attached; idling on the peer registry");
    }

    loop {
        let now = rangzen_core::peer::now_ms();
        match &driver {
            Some(driver) => {
                let outcomes = scheduler
                    .run_once(&registry, driver, &adapter, identity.public_id(), &ctx)
                    .await;
                for (public_id, outcome) in outcomes {
                    match outcome {
                        Ok(result) => tracing::info!(
                            peer = %public_id,
                            sent = result.messages_sent,
                            received = result.messages_received,
                            "exchange completed"
                        ),
                        Err(err) => tracing::warn!(peer = %public_id, error = %err, "exchange failed"),
                    }
                }
            }
            None => {
                registry.prune(now).await;
                let candidates = scheduler.ready_candidates(&registry, now).await;
                if !candidates.is_empty() {
                    tracing::debug!(count = candidates.len(), "peers ready for exchange");
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
