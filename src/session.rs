use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::router::{Audience, Router};
use crate::types::*;

const CMD_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

const MAX_NAME_LEN: usize = 32;

/// Commands the WebSocket layer sends to a session task.
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        participant_id: String,
        name: String,
        /// Admission outcome; a rejection carries the reason for the client.
        reply: oneshot::Sender<Result<(), String>>,
    },
    Start {
        participant_id: String,
    },
    Submit {
        participant_id: String,
        content: String,
    },
    Stroke {
        participant_id: String,
        stroke: Stroke,
    },
    Leave {
        participant_id: String,
    },
}

// ─── Connection registry ──────────────────────────────────────────

/// Maps live connections to participant identities and, once joined, to the
/// owning session. No game semantics.
pub struct Connections {
    live: dashmap::DashMap<String, Option<String>>,
}

impl Connections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: dashmap::DashMap::new(),
        })
    }

    /// Issues a fresh participant identity for a new connection.
    pub fn register(&self) -> String {
        let participant_id = Uuid::new_v4().to_string();
        self.live.insert(participant_id.clone(), None);
        participant_id
    }

    /// Records which session the participant joined.
    pub fn bind(&self, participant_id: &str, game_id: &str) {
        if let Some(mut entry) = self.live.get_mut(participant_id) {
            *entry = Some(game_id.to_string());
        }
    }

    /// The session this participant has joined, if any.
    pub fn game_of(&self, participant_id: &str) -> Option<String> {
        self.live.get(participant_id).and_then(|g| g.clone())
    }

    pub fn is_live(&self, participant_id: &str) -> bool {
        self.live.contains_key(participant_id)
    }

    /// Removes the connection and returns its bound session. Returns `Some`
    /// at most once per registration, so a disconnect detected from several
    /// code paths still triggers exactly one leave.
    pub fn unregister(&self, participant_id: &str) -> Option<String> {
        self.live.remove(participant_id).and_then(|(_, game)| game)
    }
}

// ─── Session directory ────────────────────────────────────────────

#[derive(Clone)]
pub struct SessionHandle {
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub router: Router,
}

/// Process-wide table of game identifier -> session. Sessions are created
/// lazily on first join and reap themselves once empty.
pub struct Directory {
    sessions: dashmap::DashMap<String, SessionHandle>,
    pub connections: Arc<Connections>,
    prompts: Vec<String>,
}

impl Directory {
    pub fn new(connections: Arc<Connections>, prompts: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            sessions: dashmap::DashMap::new(),
            connections,
            prompts,
        })
    }

    pub fn get(&self, game_id: &str) -> Option<SessionHandle> {
        self.sessions.get(game_id).map(|h| h.clone())
    }

    /// Idempotent lookup-or-create. The entry shard lock makes creation
    /// exactly-once under concurrent joins to a never-seen identifier, and
    /// is the same lock `remove_session` takes, so teardown cannot race a
    /// join into a deleted entry. A handle whose mailbox has closed belongs
    /// to a session that already reaped itself and is replaced.
    pub fn get_or_create(self: &Arc<Self>, game_id: &str) -> SessionHandle {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(game_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().cmd_tx.is_closed() {
                    let handle = spawn_session(self.clone(), game_id.to_string());
                    occupied.insert(handle.clone());
                    handle
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let handle = spawn_session(self.clone(), game_id.to_string());
                vacant.insert(handle.clone());
                handle
            }
        }
    }

    /// Removes the entry only if it still maps to the given session, so a
    /// reaping session can never delete a successor created under the same
    /// identifier.
    fn remove_session(&self, game_id: &str, cmd_tx: &mpsc::Sender<SessionCommand>) {
        self.sessions
            .remove_if(game_id, |_, handle| handle.cmd_tx.same_channel(cmd_tx));
    }
}

fn spawn_session(directory: Arc<Directory>, game_id: String) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_BUFFER);
    let router = Router::new(EVENT_BUFFER);

    let handle = SessionHandle {
        cmd_tx: cmd_tx.clone(),
        router: router.clone(),
    };

    let state = SessionState::new(game_id.clone());
    tokio::spawn(session_task(state, cmd_rx, cmd_tx, router, directory));

    tracing::info!("session created: {}", game_id);

    handle
}

/// The per-session actor loop. All session mutation happens here, so racing
/// submits and leaves are serialized by the mailbox.
async fn session_task(
    mut state: SessionState,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    router: Router,
    directory: Arc<Directory>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SessionCommand::Join { participant_id, name, reply } => {
                let admitted =
                    handle_join(&mut state, &router, &directory.connections, participant_id, name);
                let _ = reply.send(admitted);
            }
            SessionCommand::Start { participant_id } => {
                handle_start(&mut state, &router, &directory.prompts, &participant_id);
            }
            SessionCommand::Submit { participant_id, content } => {
                handle_submit(&mut state, &router, &participant_id, content);
            }
            SessionCommand::Stroke { participant_id, stroke } => {
                handle_stroke(&state, &router, &participant_id, stroke);
            }
            SessionCommand::Leave { participant_id } => {
                handle_leave(&mut state, &router, &participant_id);

                if state.players.is_empty() {
                    directory.remove_session(&state.game_id, &cmd_tx);
                    cmd_rx.close();
                    // Joins that raced into the mailbox before removal get a
                    // visible rejection; a retry will create a fresh session.
                    while let Some(cmd) = cmd_rx.recv().await {
                        if let SessionCommand::Join { reply, .. } = cmd {
                            let _ = reply.send(Err("game no longer exists, rejoin".to_string()));
                        }
                    }
                    break;
                }
            }
        }
    }

    tracing::info!("session reaped: {}", state.game_id);
}

// ─── State machine ────────────────────────────────────────────────

/// The authoritative state of one game session.
pub struct SessionState {
    pub game_id: String,
    /// Turn order. Index 0 is the first joiner.
    pub players: Vec<Participant>,
    pub phase: Phase,
    /// Index of the active participant. Valid whenever `phase` is active.
    pub active: usize,
    /// The current round's post, overwritten on every accepted submit.
    pub post: Option<String>,
}

impl SessionState {
    pub fn new(game_id: String) -> Self {
        Self {
            game_id,
            players: Vec::new(),
            phase: Phase::Waiting,
            active: 0,
            post: None,
        }
    }

    /// The current active participant's id, if the session is in an active
    /// phase.
    pub fn active_id(&self) -> Option<&str> {
        if !self.phase.is_active() {
            return None;
        }
        self.players.get(self.active).map(|p| p.id.as_str())
    }

    fn player_map(&self) -> HashMap<String, String> {
        self.players
            .iter()
            .map(|p| (p.id.clone(), p.name.clone()))
            .collect()
    }
}

/// Announces the current turn: active participant to everyone, the phase to
/// the rest, the phase plus round content to the active participant alone.
fn broadcast_turn(state: &SessionState, router: &Router) {
    let Some(active) = state.active_id() else { return };
    let active = active.to_string();

    router.send(
        Audience::All,
        Some(&active),
        ServerMsg::NextPlayer {
            participant_id: active.clone(),
        },
    );
    router.send(
        Audience::NonActiveOnly,
        Some(&active),
        ServerMsg::NextStep {
            state: state.phase,
            content: None,
        },
    );
    router.send(
        Audience::ActiveOnly,
        Some(&active),
        ServerMsg::NextStep {
            state: state.phase,
            content: state.post.clone(),
        },
    );
}

/// Admits a participant, or explains why not. Rejections go back over the
/// command's reply channel rather than the router: a rejected joiner has no
/// forwarder attached yet, so router sends would go nowhere.
pub fn handle_join(
    state: &mut SessionState,
    router: &Router,
    connections: &Connections,
    participant_id: String,
    name: String,
) -> Result<(), String> {
    let name = name.trim().to_string();

    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err("display name must be 1-32 characters".to_string());
    }

    if state.players.iter().any(|p| p.id == participant_id) {
        return Err("already joined this game".to_string());
    }

    // First joiner of a session becomes admin, exactly once.
    let admin = state.players.is_empty();

    state.players.push(Participant {
        id: participant_id.clone(),
        name,
        admin,
    });
    connections.bind(&participant_id, &state.game_id);

    router.send_to(
        &participant_id,
        ServerMsg::Welcome {
            participant_id: participant_id.clone(),
            game_id: state.game_id.clone(),
        },
    );
    if admin {
        router.send_to(&participant_id, ServerMsg::Admin);
    }
    router.send(
        Audience::All,
        state.active_id(),
        ServerMsg::PlayersUpdate {
            players: state.player_map(),
        },
    );

    // A mid-game joiner is queued at the end of the turn order; catch its
    // client up on the running game.
    if let Some(active) = state.active_id().map(str::to_string) {
        router.send_to(&participant_id, ServerMsg::GameStart);
        router.send_to(
            &participant_id,
            ServerMsg::NextPlayer {
                participant_id: active,
            },
        );
        router.send_to(
            &participant_id,
            ServerMsg::NextStep {
                state: state.phase,
                content: None,
            },
        );
    }

    tracing::info!(
        "participant {} joined game {} ({} players)",
        participant_id,
        state.game_id,
        state.players.len()
    );

    Ok(())
}

pub fn handle_start(
    state: &mut SessionState,
    router: &Router,
    prompts: &[String],
    participant_id: &str,
) {
    let is_admin = state
        .players
        .iter()
        .any(|p| p.id == participant_id && p.admin);

    if !is_admin {
        router.send_to(
            participant_id,
            ServerMsg::Error {
                message: "only the admin can start the game".to_string(),
            },
        );
        return;
    }
    if state.phase != Phase::Waiting {
        router.send_to(
            participant_id,
            ServerMsg::Error {
                message: "game already running".to_string(),
            },
        );
        return;
    }
    if state.players.len() < 2 {
        router.send_to(
            participant_id,
            ServerMsg::Error {
                message: "need at least two players".to_string(),
            },
        );
        return;
    }

    let prompt = if prompts.is_empty() {
        String::new()
    } else {
        let mut rng = rand::rng();
        prompts[rng.random_range(0..prompts.len())].clone()
    };

    state.phase = Phase::Draw;
    state.active = 0;
    state.post = Some(prompt);

    router.send(Audience::All, state.active_id(), ServerMsg::GameStart);
    broadcast_turn(state, router);

    tracing::info!(
        "game {} started with {} players",
        state.game_id,
        state.players.len()
    );
}

pub fn handle_submit(
    state: &mut SessionState,
    router: &Router,
    participant_id: &str,
    content: String,
) {
    // Only the active participant may submit; anything else is rejected
    // without touching session state.
    if state.active_id() != Some(participant_id) {
        router.send_to(
            participant_id,
            ServerMsg::Error {
                message: "not your turn".to_string(),
            },
        );
        return;
    }

    // Empty content is accepted; validation belongs to the UI layer.
    state.post = Some(content);
    state.active = (state.active + 1) % state.players.len();
    state.phase = state.phase.toggled();

    broadcast_turn(state, router);
}

/// Strokes never mutate session state; a stroke from anyone but the active
/// participant while drawing is dropped without comment (stale clients are
/// expected, and strokes are high-volume).
pub fn handle_stroke(state: &SessionState, router: &Router, participant_id: &str, stroke: Stroke) {
    if state.phase != Phase::Draw {
        return;
    }
    if state.active_id() != Some(participant_id) {
        return;
    }

    router.send(
        Audience::NonActiveOnly,
        state.active_id(),
        ServerMsg::Draw { points: stroke },
    );
}

pub fn handle_leave(state: &mut SessionState, router: &Router, participant_id: &str) {
    let Some(idx) = state.players.iter().position(|p| p.id == participant_id) else {
        // Already removed; leave is idempotent.
        return;
    };

    let was_active = state.phase.is_active() && idx == state.active;
    let departing = state.players.remove(idx);

    tracing::info!(
        "participant {} left game {} ({} remain)",
        participant_id,
        state.game_id,
        state.players.len()
    );

    if state.players.is_empty() {
        state.phase = Phase::Waiting;
        state.active = 0;
        state.post = None;
        return;
    }

    // Indices are recomputed against the surviving sequence: a departure
    // before the active slot shifts it down; a departing active participant
    // hands the turn to its successor in original order, wrapping.
    if idx < state.active {
        state.active -= 1;
    } else if state.active >= state.players.len() {
        state.active = 0;
    }

    if departing.admin {
        state.players[0].admin = true;
        router.send_to(&state.players[0].id, ServerMsg::Admin);
    }

    router.send(
        Audience::All,
        state.active_id(),
        ServerMsg::PlayersUpdate {
            players: state.player_map(),
        },
    );

    if state.phase.is_active() && state.players.len() < 2 {
        // Nobody left to guess; fall back to the lobby.
        state.phase = Phase::Waiting;
        state.active = 0;
        state.post = None;
        router.send(Audience::All, None, ServerMsg::GameEnd);
        return;
    }

    if was_active {
        // Forced turn advance: same phase, same post, new artist.
        broadcast_turn(state, router);
    }
}
