//! Two tabs of a music player and an embedded widget, kept in sync.
//!
//! Run with: cargo run -p two-tabs-example
//!
//! Set `TABSYNC_CONFIG` to a JSON object to override config fields, e.g.
//! `{"throttleMs": 250}`. `RUST_LOG=debug` shows every message.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tabsync_core::SyncConfig;
use tabsync_engine::{SyncContext, SyncedStore};
use tabsync_store::MemoryStorage;
use tabsync_transport::{BroadcastHub, FrameNode, HostEnvironment};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ORIGIN: &str = "https://player.example";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Theme {
    is_dark: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Player {
    track: Option<String>,
    volume: f64,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            track: None,
            volume: 0.8,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::var("TABSYNC_CONFIG") {
        Ok(text) => SyncConfig::from_json_str(&text).context("TABSYNC_CONFIG")?,
        Err(_) => SyncConfig::default(),
    };
    let settle = config.throttle_window() + Duration::from_millis(50);

    // One origin: a shared bus and shared storage.
    let hub = BroadcastHub::new();
    let storage = MemoryStorage::new();

    // Tab A embeds a widget frame that has no bus of its own.
    let tab_a_frame = FrameNode::new(ORIGIN);
    let widget_frame = FrameNode::new(ORIGIN);
    tab_a_frame.attach_child(&widget_frame);

    let tab_a = SyncContext::builder(
        HostEnvironment::new()
            .with_bus(hub.clone())
            .with_storage(Arc::new(storage.handle()))
            .with_frame(tab_a_frame),
    )
    .config(config.clone())
    .build()?;
    let tab_b = SyncContext::builder(
        HostEnvironment::new()
            .with_bus(hub)
            .with_storage(Arc::new(storage.handle())),
    )
    .config(config.clone())
    .build()?;
    let widget = SyncContext::builder(HostEnvironment::new().with_frame(widget_frame))
        .config(config)
        .build()?;

    let theme_a = SyncedStore::attach(&tab_a, "theme", Some("music-player-theme"), Theme::default());
    let theme_b = SyncedStore::attach(&tab_b, "theme", Some("music-player-theme"), Theme::default());
    let theme_widget = SyncedStore::attach(&widget, "theme", None, Theme::default());
    let player_a = SyncedStore::attach(&tab_a, "player", None, Player::default());
    let player_b = SyncedStore::attach(&tab_b, "player", None, Player::default());

    theme_b.store().subscribe(|theme: &Theme| {
        tracing::info!("Tab B theme is now {}", if theme.is_dark { "dark" } else { "light" });
    });

    tracing::info!("Tab A toggles dark mode");
    theme_a.update(|t| t.is_dark = !t.is_dark);
    tokio::time::sleep(settle).await;

    tracing::info!("Tab B drags the volume slider");
    for step in 1..=10 {
        player_b.update(|p| p.volume = f64::from(step) / 10.0);
    }
    player_b.update(|p| p.track = Some("Blue in Green".to_string()));
    tokio::time::sleep(settle).await;

    println!("tab A:  theme={:?} player={:?}", theme_a.get(), player_a.get());
    println!("tab B:  theme={:?} player={:?}", theme_b.get(), player_b.get());
    println!("widget: theme={:?}", theme_widget.get());

    tab_a.shutdown();
    tab_b.shutdown();
    widget.shutdown();
    Ok(())
}
