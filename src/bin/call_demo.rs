use anyhow::{Context, anyhow};
use callsync::calls::{CallContext, CallManager, StartCall};
use callsync::config::CallConfig;
use callsync::media::{FakeMediaFactory, LoopbackHub};
use callsync::store::InMemorySignalingStore;
use callsync::types::call::{CallType, EndReason, UserRef};
use chrono::Local;
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Two participants in one process, sharing an in-memory store and a loopback
// media hub.
//
// Usage:
//   cargo run --bin call-demo                           # ring, accept, talk, hang up
//   cargo run --bin call-demo -- --scenario decline
//   cargo run --bin call-demo -- --scenario cap --max-duration 5

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    Accept,
    Decline,
    Cap,
}

#[derive(Debug, Parser)]
#[command(name = "call-demo", about = "Run a call between two in-process users")]
struct Args {
    #[arg(short, long, value_enum, default_value = "accept")]
    scenario: Scenario,

    /// JSON file with a CallConfig
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the duration cap, in seconds
    #[arg(long)]
    max_duration: Option<u64>,

    /// Seconds to stay connected before hanging up
    #[arg(long, default_value_t = 3)]
    talk: u64,

    #[arg(long)]
    voice: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => CallConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CallConfig::default(),
    };
    if let Some(secs) = args.max_duration {
        config.max_duration_secs = secs;
    } else if matches!(args.scenario, Scenario::Cap) {
        config.max_duration_secs = 5;
    }
    config.validate()?;

    let store = Arc::new(InMemorySignalingStore::new());
    let hub = LoopbackHub::new();
    let alice_user = UserRef::new("alice", "Alice");
    let bob_user = UserRef::new("bob", "Bob");

    let alice = CallManager::new(CallContext::new(
        alice_user.clone(),
        config.clone(),
        store.clone(),
        Arc::new(FakeMediaFactory::new("alice", hub.clone())),
    ));
    let bob = CallManager::new(CallContext::new(
        bob_user.clone(),
        config,
        store.clone(),
        Arc::new(FakeMediaFactory::new("bob", hub)),
    ));

    let mut bob_incoming = bob.events().incoming_calls.subscribe();
    let mut alice_terminated = alice.events().terminated.subscribe();
    bob.listen().await?;

    let call_type = if args.voice {
        CallType::Voice
    } else {
        CallType::Video
    };
    let caller = alice
        .start_call(StartCall {
            room_id: "demo-room".into(),
            call_type,
            invitees: vec![bob_user],
        })
        .await?;
    let call_id = caller
        .call_id()
        .ok_or_else(|| anyhow!("call started without an id"))?;

    let incoming = tokio::time::timeout(Duration::from_secs(5), bob_incoming.recv())
        .await
        .context("bob never saw the call")??;
    info!("Bob's phone is ringing: {} from {}", incoming.record.id, incoming.record.caller_name);

    match args.scenario {
        Scenario::Decline => {
            bob.notifier().decline(&call_id)?;
        }
        Scenario::Accept | Scenario::Cap => {
            let callee = bob.join_call(&call_id).await?;
            let mut state = caller.subscribe_state();
            tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected()))
                .await
                .context("call never connected")??;
            info!("Connected, {} and {} are talking", alice_user.name, callee.state().name());

            if matches!(args.scenario, Scenario::Accept) {
                tokio::time::sleep(Duration::from_secs(args.talk)).await;
                if let Some(tick) = caller.duration() {
                    info!("Elapsed {}s, {}s left before the cap", tick.elapsed_secs, tick.remaining_secs);
                }
                caller.end(EndReason::Hangup).await;
            }
        }
    }

    let terminated = tokio::time::timeout(Duration::from_secs(60), alice_terminated.recv())
        .await
        .context("call never ended")??;
    info!(
        "Call {} ended: {} (connected for {}s)",
        terminated.call_id,
        terminated.reason,
        terminated.duration_secs.unwrap_or(0)
    );

    // let the deferred delete run
    tokio::time::sleep(Duration::from_secs(6)).await;
    alice.shutdown().await;
    bob.shutdown().await;
    info!("{} record(s) left in the store", store.record_count());
    Ok(())
}
