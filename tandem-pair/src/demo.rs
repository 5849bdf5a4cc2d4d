//! Two pairing sessions wired through an in-process hub.
//!
//! The host opens the page without a room, the joiner opens the link the
//! host would share. Both are driven from this task.

use log::{info, warn};
use std::time::Duration;
use tandem_collab::{
    CollabError, LocalRendezvous, LocalSignaling, LoopbackDevices, PeerSession, SessionConfig,
    SessionMode, SessionStatus,
};
use tandem_core::{Board, Element, Point, ShapeElement, StrokeElement, TextElement};
use tokio::sync::mpsc::UnboundedReceiver;

type DemoSession = PeerSession<LocalSignaling, Board, LoopbackDevices>;

fn session(
    hub: &LocalRendezvous,
    config: SessionConfig,
    board: Board,
    page: &str,
) -> Result<DemoSession, CollabError> {
    let hub = hub.clone();
    PeerSession::new(config, move || hub.client(), board, LoopbackDevices::new(), page)
}

/// Handle queued events on both sides until neither has any left.
fn settle(host: &mut DemoSession, joiner: &mut DemoSession) {
    while host.drain_pending() + joiner.drain_pending() > 0 {}
}

/// Wait out the echo suppression window.
async fn pause(config: &SessionConfig) {
    tokio::time::sleep(config.echo_suppression + Duration::from_millis(10)).await;
}

fn print_statuses(who: &str, rx: &mut UnboundedReceiver<SessionStatus>) {
    while let Ok(status) = rx.try_recv() {
        info!("[{who}] {status}");
    }
}

pub async fn run(mode: SessionMode) -> Result<(), CollabError> {
    let hub = LocalRendezvous::new();
    let (config, page) = match mode {
        SessionMode::Whiteboard => (SessionConfig::whiteboard(), "https://prep.example/whiteboard"),
        SessionMode::Call => (SessionConfig::call(), "https://prep.example/call"),
    };

    let mut board = Board::new();
    for element in [
        Element::Text(TextElement::new("Two Sum: hash map, O(n)", 16.0, 16.0)),
        Element::Rect(ShapeElement::new(16.0, 48.0, 240.0, 120.0)),
    ] {
        if let Err(e) = board.add(element) {
            warn!("Skipping seed element: {e}");
        }
    }

    let mut host = session(&hub, config.clone(), board, page)?;
    let mut host_status = host.take_status_rx().ok_or(CollabError::NotConnected)?;
    host.init().await?;
    let link = host
        .room_address()
        .map(|address| address.to_string())
        .ok_or(CollabError::NotConnected)?;
    info!("Share this link: {link}");

    let mut joiner = session(&hub, config.clone(), Board::new(), &link)?;
    let mut joiner_status = joiner.take_status_rx().ok_or(CollabError::NotConnected)?;
    joiner.init().await?;
    settle(&mut host, &mut joiner);

    match mode {
        SessionMode::Whiteboard => {
            info!(
                "Joiner received {} elements from the host",
                joiner.document().len()
            );

            pause(&config).await;
            let drawn = joiner.document_mut().add(Element::Stroke(StrokeElement::new(
                vec![Point::new(20.0, 200.0), Point::new(80.0, 230.0), Point::new(140.0, 210.0)],
                2.0,
            )));
            settle(&mut host, &mut joiner);

            match drawn {
                Ok(stroke) => {
                    pause(&config).await;
                    match host.document_mut().translate(&stroke, 10.0, -5.0) {
                        Ok(()) => settle(&mut host, &mut joiner),
                        Err(e) => warn!("Host could not move the stroke: {e}"),
                    }
                }
                Err(e) => warn!("Joiner could not draw: {e}"),
            }
            info!(
                "Boards: host {} elements (v{}), joiner {} elements (v{})",
                host.document().len(),
                host.document().version(),
                joiner.document().len(),
                joiner.document().version()
            );
            let stats = host.stats();
            info!(
                "Host sync: {} sent, {} applied, {} echoes suppressed",
                stats.snapshots_sent, stats.snapshots_applied, stats.echoes_suppressed
            );
        }
        SessionMode::Call => {
            let muted = !joiner.toggle_audio();
            let camera = joiner.toggle_video();
            info!("Joiner muted: {muted}, camera on: {camera}");
            if let Some(remote) = host.media().remote() {
                info!(
                    "Host sees {} remote tracks ({} enabled)",
                    remote.tracks().len(),
                    remote.tracks().iter().filter(|t| t.enabled()).count()
                );
            }
        }
    }

    joiner.teardown();
    settle(&mut host, &mut joiner);
    host.teardown();

    print_statuses("host", &mut host_status);
    print_statuses("joiner", &mut joiner_status);
    Ok(())
}
