//! Timer-driven session loop.
//!
//! Everything that touches the [`Session`] runs on the one task executing
//! [`run`]: poll ticks, fetch completions, playback advances and commands are
//! handled one at a time, so an ingest always finishes before the next
//! advance reads the slice. Only the blocking fetch itself leaves the task,
//! on tokio's blocking pool, and its result comes back through the loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::playback::PendingAdvance;
use crate::session::{Frame, Session, Snapshot};
use crate::source::{FetchPage, ObservationSource};
use crate::stream::PollTicket;
use crate::window::PlaybackWindow;
use crate::StreamError;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Play,
    Pause,
    SetSpeed(f64),
    SetProgress(f64),
    StepBackward,
    StepForward,
    RefreshNow,
    SetWindow(PlaybackWindow),
    SetMissionFilter(Option<String>),
    SetLookback(f64),
    Shutdown,
}

/// Presentation side of the channels.
pub struct Controller {
    pub commands: mpsc::UnboundedSender<Command>,
    pub snapshots: watch::Receiver<Snapshot>,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

/// Driver side of the channels, consumed by [`run`].
pub struct DriverChannels {
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<Snapshot>,
    frames: mpsc::UnboundedSender<Frame>,
}

pub fn channel(initial: Snapshot) -> (Controller, DriverChannels) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    (
        Controller {
            commands: command_tx,
            snapshots: snapshot_rx,
            frames: frame_rx,
        },
        DriverChannels {
            commands: command_rx,
            snapshots: snapshot_tx,
            frames: frame_tx,
        },
    )
}

type InFlight = (PollTicket, JoinHandle<Result<FetchPage, StreamError>>);

/// Drive `session` until [`Command::Shutdown`] arrives or every command
/// sender is dropped. Returns the session with all timers released.
pub async fn run<S>(
    mut session: Session,
    source: Arc<S>,
    config: EngineConfig,
    mut channels: DriverChannels,
) -> Session
where
    S: ObservationSource + ?Sized + 'static,
{
    info!("session driver started");
    let mut next_poll = Instant::now();
    let mut fetch: Option<InFlight> = None;
    let mut advance: Option<(PendingAdvance, Instant)> = None;
    let mut refresh_queued = false;
    let mut last_frame: Option<(usize, String)> = None;

    loop {
        let advance_at = advance.map(|(_, at)| at);
        tokio::select! {
            _ = sleep_until(next_poll) => {
                start_poll(&mut session, &source, &mut fetch);
                next_poll = Instant::now() + config.poll_interval(session.playback().is_playing());
            }
            joined = wait_fetch(&mut fetch) => {
                if let Some((ticket, _)) = fetch.take() {
                    let result = joined.unwrap_or_else(|err| {
                        Err(StreamError::SourceUnavailable(format!("fetch task failed: {err}")))
                    });
                    let outcome = session.complete_poll(ticket, result);
                    debug!(?outcome, "poll completed");
                    if refresh_queued {
                        refresh_queued = false;
                        next_poll = Instant::now();
                    }
                }
            }
            _ = sleep_until_opt(advance_at) => {
                if let Some((pending, _)) = advance.take() {
                    if !session.advance(pending) {
                        debug!("stale advance ignored");
                    }
                }
            }
            command = channels.commands.recv() => {
                match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        debug!(?command, "command received");
                        let wants_refresh = apply(&mut session, command);
                        if wants_refresh {
                            if fetch.is_some() {
                                refresh_queued = true;
                            } else {
                                next_poll = Instant::now();
                            }
                        }
                        let interval = config.poll_interval(session.playback().is_playing());
                        next_poll = next_poll.min(Instant::now() + interval);
                    }
                }
            }
        }

        let live = session.playback().pending();
        if live.is_none() || advance.map(|(pending, _)| pending) != live {
            advance = session
                .schedule_advance()
                .map(|pending| (pending, Instant::now() + pending.delay));
        }

        if let Some(frame) = session.frame() {
            let key = (frame.index, frame.observation.id().to_string());
            if last_frame.as_ref() != Some(&key) {
                last_frame = Some(key);
                if channels.frames.send(frame).is_err() {
                    debug!("frame receiver dropped");
                }
            }
        }
        channels.snapshots.send_replace(session.snapshot());
    }

    session.teardown();
    if let Some((_, handle)) = fetch.take() {
        warn!("abandoning in-flight fetch at shutdown");
        handle.abort();
    }
    channels.snapshots.send_replace(session.snapshot());
    info!("session driver stopped");
    session
}

fn start_poll<S>(session: &mut Session, source: &Arc<S>, fetch: &mut Option<InFlight>)
where
    S: ObservationSource + ?Sized + 'static,
{
    if fetch.is_some() {
        debug!("poll tick skipped: fetch in flight");
        return;
    }
    if let Some(ticket) = session.begin_poll() {
        let source = Arc::clone(source);
        let query = ticket.query.clone();
        let handle = tokio::task::spawn_blocking(move || source.fetch(&query));
        *fetch = Some((ticket, handle));
    }
}

/// Returns true when the command asks for an immediate poll.
fn apply(session: &mut Session, command: Command) -> bool {
    match command {
        Command::Play => session.play(),
        Command::Pause => session.pause(),
        Command::SetSpeed(speed) => session.set_speed(speed),
        Command::SetProgress(progress) => session.set_progress(progress),
        Command::StepBackward => session.step_backward(),
        Command::StepForward => session.step_forward(),
        Command::SetWindow(window) => session.set_window(window),
        Command::RefreshNow => return true,
        Command::SetMissionFilter(mission) => return session.set_mission_filter(mission),
        Command::SetLookback(hours) => return session.set_lookback_hours(hours),
        Command::Shutdown => {}
    }
    false
}

async fn wait_fetch(fetch: &mut Option<InFlight>) -> Result<Result<FetchPage, StreamError>, JoinError> {
    match fetch {
        Some((_, handle)) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
