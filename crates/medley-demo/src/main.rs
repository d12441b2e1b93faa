//! Runs a three-member conference on the loopback transport and cycles it
//! through every architecture.
//!
//! Usage: `medley-demo [data-dir]`. When a data directory is given, the
//! conference settings are read from its `conference.json`.

use std::sync::Arc;
use std::time::Duration;

use medley_core::loopback::{LoopbackBus, LoopbackFactory};
use medley_core::servers::{MediaServer, spawn_switch_server};
use medley_core::{
    Conference, ConferenceConfig, ConferenceEvent, ConfigStore, MediaArgument, MediaStream,
    MediaTrack, MedleyError, Topology, TrackKind,
};

const MEMBERS: [&str; 3] = ["alice", "bob", "carol"];

async fn join(
    bus: &LoopbackBus,
    factory: &Arc<LoopbackFactory>,
    base: &ConferenceConfig,
    name: &str,
) -> Result<Arc<Conference>, MedleyError> {
    let config = ConferenceConfig {
        name: name.to_string(),
        ..base.clone()
    };
    let inbound = bus.join(name);
    let conference = Arc::new(Conference::new(config, bus.channel(), factory.clone())?);
    let who = name.to_string();
    conference.add_listener(Arc::new(move |event: ConferenceEvent| match event {
        ConferenceEvent::DisplayChanged => tracing::debug!("{who}: display changed"),
        other => tracing::info!("{who}: {other:?}"),
    }));
    conference.start().await?;
    tokio::spawn(conference.clone().run(inbound));

    let camera = MediaStream::new(vec![
        MediaTrack::with_id(format!("{name}-mic"), TrackKind::Audio),
        MediaTrack::with_id(format!("{name}-cam"), TrackKind::Video),
    ]);
    conference.add_media(MediaArgument::Stream(camera)).await?;
    Ok(conference)
}

fn report(conferences: &[Arc<Conference>]) {
    for conference in conferences {
        let shown: Vec<String> = conference
            .displayed()
            .into_iter()
            .map(|d| format!("{}:{}", d.owner, d.track.id))
            .collect();
        tracing::info!(
            "{} [{}] shows {}",
            conference.name(),
            conference.architecture(),
            shown.join(", ")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), MedleyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medley_core=debug,medley_demo=info".into()),
        )
        .init();

    let base = match std::env::args().nth(1) {
        Some(dir) => ConfigStore::new(dir).get(),
        None => ConferenceConfig::default(),
    };
    let settle = Duration::from_millis(300);

    let bus = LoopbackBus::new();
    let factory = Arc::new(LoopbackFactory::new());
    MediaServer::spawn(&bus, factory.clone(), &base.sfu_peer, Topology::Sfu, base.policy);
    MediaServer::spawn(&bus, factory.clone(), &base.mcu_peer, Topology::Mcu, base.policy);
    spawn_switch_server(&bus, &base.switch_server);

    let mut conferences = Vec::new();
    for name in MEMBERS {
        conferences.push(join(&bus, &factory, &base, name).await?);
    }
    tokio::time::sleep(settle).await;
    report(&conferences);

    let driver = conferences[0].clone();
    for _ in 0..driver.architectures().len() {
        tracing::info!("switching to {}", driver.next_architecture_value());
        driver.next_architecture()?;
        tokio::time::sleep(settle).await;
        report(&conferences);
    }

    bus.leave("carol");
    tokio::time::sleep(settle).await;
    report(&conferences[..2]);

    for conference in &conferences {
        conference.close().await;
    }
    tracing::info!("{} transports created", factory.created());
    Ok(())
}
