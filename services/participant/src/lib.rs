//! Headless room participant.
//!
//! Joins a room, logs everything that happens in it, and sends stdin lines as
//! chat messages.  Shutdown (Ctrl-C) logs out cleanly; the session's close
//! reason is reported either way.

pub mod config;

pub use config::{ConfigError, ParticipantConfig, load_config, load_config_from_path};

use lockstep_client::coordinator::{MediumEvent, PeerLifecycleEvent, RoomCoordinator};
use lockstep_client::medium::Medium;
use lockstep_client::{CloseReason, ConnectError, RegisterError};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Connect, register, and run until the session ends or `shutdown` flips.
///
/// Returns the close reason the session ended with.
pub async fn run(
    config: ParticipantConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<CloseReason, RunError> {
    let connection = lockstep_client::connect_with_timeout(
        &config.server_url,
        &config.token,
        config.request_timeout,
    )
    .await?;

    let (closed_tx, mut closed_rx) = oneshot::channel();
    let coordinator = RoomCoordinator::register(
        Arc::clone(&connection),
        config.display_name.clone(),
        move |reason| {
            let _ = closed_tx.send(reason);
        },
    )
    .await?;

    let peers = coordinator.peers();
    info!(
        name = %coordinator.as_peer().name,
        peers = peers.len(),
        "joined the room"
    );
    for peer in peers {
        info!(id = peer.id, name = %peer.name, "peer present");
    }

    let _peer_sub = coordinator.subscribe_to_peer_changes(|event| match event {
        PeerLifecycleEvent::Joined(peer) => info!(name = %peer.name, "peer joined"),
        PeerLifecycleEvent::Left { peer, reason } => {
            info!(name = %peer.name, ?reason, "peer left");
        }
        PeerLifecycleEvent::Refreshed { peers } => info!(peers = peers.len(), "membership refreshed"),
    });
    let _chat_sub = coordinator.subscribe_to_chat_messages(|message| {
        info!(from = %message.sender.name, counter = message.counter, "{}", message.message);
    });
    let _medium_sub = coordinator.subscribe_to_medium_changes(|event| match event {
        MediumEvent::ChangedByOurself { medium } => {
            info!(version = medium.version, "medium changed by us");
        }
        MediumEvent::ChangedByPeer { changer, medium } => match &medium.medium {
            Medium::Empty => info!(by = %changer.name, version = medium.version, "medium ejected"),
            Medium::FixedLength(fixed) => {
                info!(by = %changer.name, version = medium.version, name = %fixed.name, "medium changed");
            }
        },
        MediumEvent::TimeAdjusted { delta_ms, .. } => {
            info!(delta_ms, "playback start adjusted for clock drift");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            biased;
            reason = &mut closed_rx => {
                let reason = reason.unwrap_or(CloseReason::Error);
                info!(?reason, "session ended");
                return Ok(reason);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutting down, leaving the room");
                    coordinator.logout().await;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = coordinator.send_chat_message(line).await {
                        warn!(error = %e, "chat message failed");
                    }
                }
                Ok(Some(_)) => {}
                // Stdin closed; keep the session running on broadcasts alone.
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            }
        }
    }
}
