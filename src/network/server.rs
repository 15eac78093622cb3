//! TCP Game Server
//!
//! The top-level orchestrator: accepts connections, runs one reader and
//! one writer task per session, routes inbound messages, and drives the
//! background services (matchmaking tick, idle-session cleanup).
//!
//! Sessions and rooms live in registries behind reader-writer locks.
//! A session knows its room only by id; a room knows its members only by
//! id and outbound queue. Per-session writes are serialized through a
//! bounded queue — a queue that fills up marks the session unresponsive
//! and closes it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::data::catalog::{CatalogError, SpecCatalog};
use crate::data::store::{PlayerStore, ProfileSnapshot, StoreError};
use crate::game::engine::{GameEngine, MatchSeat};
use crate::game::events::{EndReason, GameEvent};
use crate::game::types::{GameId, GameState, Mode, PlayerId, Winner};
use crate::network::codec::{write_frame, CodecError, FrameReader};
use crate::network::matchmaker::Matchmaker;
use crate::network::protocol::{
    AuthResponse, ErrorCode, GameEndBody, GameEventBody, GameStart, ManaUpdateBody, MatchFound,
    Message, MessageType, OpponentInfo, Payload, PlayerDisconnectBody, ProtocolError,
    TurnChangeBody,
};
use crate::network::room::{Room, RoomMember};

/// Bound of a session's outbound message queue. A session that falls
/// this far behind is closed with `BACKPRESSURE`.
pub const OUTBOUND_QUEUE_BOUND: usize = 256;

/// How long a closing session's writer may keep draining its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. `localhost:8080`.
    pub bind_addr: String,
    /// Directory holding the spec catalog and the player store.
    pub data_dir: PathBuf,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Sessions silent for longer than this are evicted.
    pub idle_timeout: Duration,
    /// How often the cleanup task scans for idle sessions.
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "localhost:8080".into(),
            data_dir: PathBuf::from("data"),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden from the environment: `SERVER_ADDR` for the
    /// listen address, `TCR_DATA_DIR` for the data directory.
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();
        if let Ok(addr) = std::env::var("SERVER_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("TCR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }
}

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The configured address.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The spec catalog could not be loaded.
    #[error("spec catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// The player store could not be initialized.
    #[error("player store: {0}")]
    Store(#[from] StoreError),

    /// Transport-level failure.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a session was closed from the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The outbound queue overflowed.
    Backpressure,
    /// No activity within the idle timeout.
    Idle,
    /// The server is shutting down.
    Shutdown,
}

/// Registry entry for one live connection.
struct SessionEntry {
    /// Account name once authenticated.
    username: Option<String>,
    /// Profile snapshot taken at login.
    snapshot: Option<ProfileSnapshot>,
    /// The room this session is playing in, if any.
    room_id: Option<GameId>,
    /// Last inbound activity.
    last_ping: Instant,
    /// Outbound message queue.
    outbound: mpsc::Sender<Message>,
    /// Signal that tells the connection task to close.
    close: watch::Sender<Option<CloseReason>>,
}

type SessionMap = Arc<RwLock<BTreeMap<PlayerId, SessionEntry>>>;
type RoomMap = Arc<RwLock<BTreeMap<GameId, Arc<Room>>>>;

/// Everything a connection's routing handlers need.
struct SessionCtx {
    player_id: PlayerId,
    out: mpsc::Sender<Message>,
    server: Arc<GameServer>,
}

/// The TCP game server.
pub struct GameServer {
    config: ServerConfig,
    store: Arc<PlayerStore>,
    catalog: Arc<SpecCatalog>,
    sessions: SessionMap,
    rooms: RoomMap,
    matchmaker: Arc<Matchmaker>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl GameServer {
    /// Load the catalog and store and assemble a server. Fails when the
    /// data directory is unusable (the process should exit non-zero).
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let catalog = Arc::new(SpecCatalog::load(&config.data_dir)?);
        let store = Arc::new(PlayerStore::open(&config.data_dir).await?);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(GameServer {
            config,
            store,
            catalog,
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            rooms: Arc::new(RwLock::new(BTreeMap::new())),
            matchmaker: Arc::new(Matchmaker::new()),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener =
            TcpListener::bind(&self.config.bind_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: self.config.bind_addr.clone(),
                    source,
                })?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!("server listening on {}", listener.local_addr()?);

        tokio::spawn(run_matchmaking_loop(Arc::clone(&self)));
        tokio::spawn(run_cleanup_loop(Arc::clone(&self)));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        if self.sessions.read().await.len() >= self.config.max_connections {
                            warn!("connection limit reached, rejecting {addr}");
                            continue;
                        }
                        self.spawn_connection(stream, addr);
                    }
                    Err(e) => error!("accept error: {e}"),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        // Stop order: sessions first, then finalize every room with a
        // server-stop draw so results are still recorded.
        {
            let sessions = self.sessions.read().await;
            for entry in sessions.values() {
                let _ = entry.close.send(Some(CloseReason::Shutdown));
            }
        }
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.engine().lock().await.abort(None, EndReason::ServerStop);
        }
        // Room pumps record results and empty the registry as they finish.
        for _ in 0..20 {
            if self.rooms.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("server stopped");
        Ok(())
    }

    /// Ask the server to stop.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Live session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Active room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let player_id = PlayerId::generate();
            info!(%player_id, %addr, "client connected");

            let (read_half, write_half) = stream.into_split();
            let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_BOUND);
            let (close_tx, mut close_rx) = watch::channel(None::<CloseReason>);

            server.sessions.write().await.insert(
                player_id.clone(),
                SessionEntry {
                    username: None,
                    snapshot: None,
                    room_id: None,
                    last_ping: Instant::now(),
                    outbound: out_tx.clone(),
                    close: close_tx,
                },
            );

            let mut writer_task = tokio::spawn(async move {
                let mut writer = BufWriter::new(write_half);
                while let Some(msg) = out_rx.recv().await {
                    if write_frame(&mut writer, &msg).await.is_err() {
                        break;
                    }
                }
            });

            let ctx = SessionCtx {
                player_id: player_id.clone(),
                out: out_tx,
                server: Arc::clone(&server),
            };
            let mut frames = FrameReader::new(BufReader::new(read_half));
            let mut shutdown_rx = server.shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    frame = frames.next_frame() => match frame {
                        Ok(Some(line)) => route(&ctx, &line).await,
                        Ok(None) => {
                            debug!(%player_id, "client closed connection");
                            break;
                        }
                        Err(CodecError::FrameTooLarge) => {
                            let _ = ctx.out.try_send(Message::error(
                                ErrorCode::FrameTooLarge,
                                "frame exceeds the 64 KiB limit",
                            ));
                            warn!(%player_id, "oversized frame, closing session");
                            break;
                        }
                        Err(e) => {
                            debug!(%player_id, "transport error: {e}");
                            break;
                        }
                    },
                    _ = close_rx.changed() => {
                        let reason = *close_rx.borrow();
                        debug!(%player_id, ?reason, "session closed by server");
                        break;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            // Disconnect epilogue: queue ticket, room, username, registry.
            server.matchmaker.remove(&player_id).await;
            let entry = server.sessions.write().await.remove(&player_id);
            if let Some(entry) = entry {
                // During shutdown the rooms are finalized centrally with
                // `server_stop`; individual departures no longer count as
                // disconnect forfeits.
                if let Some(room_id) = entry.room_id.clone() {
                    if !server.shutting_down.load(Ordering::SeqCst) {
                        let username = entry.username.clone().unwrap_or_default();
                        handle_room_disconnect(&server, &player_id, &username, room_id).await;
                    }
                }
                if let Some(username) = entry.username.clone() {
                    server.store.release(&username).await;
                }
            }

            // Let the writer flush what is already queued, then give up.
            drop(ctx);
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
                .await
                .is_err()
            {
                writer_task.abort();
            }
            info!(%player_id, "client cleaned up");
        });
    }
}

// =============================================================================
// ROUTING
// =============================================================================

async fn reply(ctx: &SessionCtx, msg: Message) {
    let _ = ctx.out.send(msg).await;
}

async fn route(ctx: &SessionCtx, line: &str) {
    let msg = match Message::decode(line) {
        Ok(msg) => msg,
        Err(ProtocolError::UnknownType(t)) => {
            reply(
                ctx,
                Message::error(
                    ErrorCode::UnknownMessageType,
                    format!("unknown message type: {t}"),
                ),
            )
            .await;
            return;
        }
        Err(e) => {
            reply(ctx, Message::error(ErrorCode::InvalidRequest, e.to_string())).await;
            return;
        }
    };

    // Any well-formed inbound frame counts as activity.
    {
        let mut sessions = ctx.server.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&ctx.player_id) {
            entry.last_ping = Instant::now();
        }
    }

    match msg.msg_type {
        MessageType::Login => handle_auth(ctx, msg, true).await,
        MessageType::Register => handle_auth(ctx, msg, false).await,
        MessageType::FindMatch => handle_find_match(ctx, msg).await,
        MessageType::SummonTroop => handle_summon(ctx, msg).await,
        MessageType::Attack => handle_attack(ctx, msg).await,
        MessageType::EndTurn => handle_end_turn(ctx).await,
        MessageType::Surrender => handle_surrender(ctx).await,
        MessageType::Ping => {
            reply(
                ctx,
                Message::new(MessageType::Pong).with_player(ctx.player_id.clone()),
            )
            .await;
        }
        _ => {
            reply(
                ctx,
                Message::error(
                    ErrorCode::InvalidRequest,
                    "server-to-client message type sent by client",
                ),
            )
            .await;
        }
    }
}

async fn handle_auth(ctx: &SessionCtx, msg: Message, is_login: bool) {
    let Some(Payload::AuthRequest(req)) = msg.data else {
        reply(
            ctx,
            Message::error(ErrorCode::InvalidRequest, "expected an auth_request payload"),
        )
        .await;
        return;
    };

    let already_authed = {
        let sessions = ctx.server.sessions.read().await;
        sessions
            .get(&ctx.player_id)
            .is_some_and(|e| e.username.is_some())
    };
    if already_authed {
        reply(
            ctx,
            Message::error(
                ErrorCode::AlreadyLoggedIn,
                "session is already authenticated",
            ),
        )
        .await;
        return;
    }

    let result = if is_login {
        ctx.server.store.authenticate(&req.username, &req.password).await
    } else {
        ctx.server.store.register(&req.username, &req.password).await
    };

    match result {
        Ok(snapshot) => {
            {
                let mut sessions = ctx.server.sessions.write().await;
                if let Some(entry) = sessions.get_mut(&ctx.player_id) {
                    entry.username = Some(snapshot.username.clone());
                    entry.snapshot = Some(snapshot.clone());
                }
            }
            info!(player = %ctx.player_id, username = %snapshot.username, "authenticated");
            let message = if is_login {
                "Login successful"
            } else {
                "Registration successful"
            };
            reply(
                ctx,
                Message::new(MessageType::AuthOk)
                    .with_player(ctx.player_id.clone())
                    .with_data(Payload::AuthResponse(AuthResponse {
                        success: true,
                        code: None,
                        player_id: Some(ctx.player_id.clone()),
                        message: message.into(),
                        player_data: Some(snapshot),
                    })),
            )
            .await;
        }
        Err(err) => {
            info!(player = %ctx.player_id, username = %req.username, "auth failed: {err}");
            reply(
                ctx,
                Message::new(MessageType::AuthFail).with_data(Payload::AuthResponse(
                    AuthResponse {
                        success: false,
                        code: Some(ErrorCode::from(&err)),
                        player_id: None,
                        message: err.to_string(),
                        player_data: None,
                    },
                )),
            )
            .await;
        }
    }
}

async fn handle_find_match(ctx: &SessionCtx, msg: Message) {
    let (authed, in_room) = {
        let sessions = ctx.server.sessions.read().await;
        match sessions.get(&ctx.player_id) {
            Some(e) => (e.username.is_some(), e.room_id.is_some()),
            None => return,
        }
    };
    if !authed {
        reply(
            ctx,
            Message::error(ErrorCode::NotAuthenticated, "must login first"),
        )
        .await;
        return;
    }
    if in_room {
        reply(
            ctx,
            Message::error(ErrorCode::AlreadyInRoom, "already in an active game"),
        )
        .await;
        return;
    }

    let Some(Payload::MatchRequest(req)) = msg.data else {
        reply(
            ctx,
            Message::error(ErrorCode::InvalidRequest, "expected a match_request payload"),
        )
        .await;
        return;
    };
    let Some(mode) = Mode::parse(&req.game_mode) else {
        reply(
            ctx,
            Message::error(
                ErrorCode::InvalidGameMode,
                "game mode must be 'simple' or 'enhanced'",
            ),
        )
        .await;
        return;
    };

    if ctx
        .server
        .matchmaker
        .enqueue(mode, ctx.player_id.clone())
        .await
    {
        info!(player = %ctx.player_id, %mode, "queued for matchmaking");
    }
}

/// Resolve the caller's room, answering the appropriate error when the
/// caller is not authenticated or not playing.
async fn current_room(ctx: &SessionCtx) -> Option<Arc<Room>> {
    let (authed, room_id) = {
        let sessions = ctx.server.sessions.read().await;
        let entry = sessions.get(&ctx.player_id)?;
        (entry.username.is_some(), entry.room_id.clone())
    };
    if !authed {
        reply(
            ctx,
            Message::error(ErrorCode::NotAuthenticated, "must login first"),
        )
        .await;
        return None;
    }
    let Some(room_id) = room_id else {
        reply(
            ctx,
            Message::error(ErrorCode::GameNotActive, "no active game"),
        )
        .await;
        return None;
    };
    let room = ctx.server.rooms.read().await.get(&room_id).cloned();
    if room.is_none() {
        reply(
            ctx,
            Message::error(ErrorCode::GameNotActive, "no active game"),
        )
        .await;
    }
    room
}

async fn handle_summon(ctx: &SessionCtx, msg: Message) {
    let Some(Payload::SummonRequest(req)) = msg.data else {
        reply(
            ctx,
            Message::error(ErrorCode::InvalidRequest, "expected a summon_request payload"),
        )
        .await;
        return;
    };
    let Some(room) = current_room(ctx).await else {
        return;
    };
    if let Err(err) = room.summon(&ctx.player_id, req.troop_name).await {
        reply(ctx, Message::error(ErrorCode::from(&err), err.to_string())).await;
    }
}

async fn handle_attack(ctx: &SessionCtx, msg: Message) {
    let Some(Payload::AttackRequest(req)) = msg.data else {
        reply(
            ctx,
            Message::error(ErrorCode::InvalidRequest, "expected an attack_request payload"),
        )
        .await;
        return;
    };
    if req.target_type != "tower" {
        reply(
            ctx,
            Message::error(ErrorCode::TargetInvalid, "only towers can be targeted"),
        )
        .await;
        return;
    }
    let Some(room) = current_room(ctx).await else {
        return;
    };
    if let Err(err) = room
        .attack(&ctx.player_id, req.attacker_name, req.target_name)
        .await
    {
        reply(ctx, Message::error(ErrorCode::from(&err), err.to_string())).await;
    }
}

async fn handle_end_turn(ctx: &SessionCtx) {
    let Some(room) = current_room(ctx).await else {
        return;
    };
    if let Err(err) = room.end_turn(&ctx.player_id).await {
        reply(ctx, Message::error(ErrorCode::from(&err), err.to_string())).await;
    }
}

async fn handle_surrender(ctx: &SessionCtx) {
    let Some(room) = current_room(ctx).await else {
        return;
    };
    if let Err(err) = room.surrender(&ctx.player_id).await {
        reply(ctx, Message::error(ErrorCode::from(&err), err.to_string())).await;
    }
}

// =============================================================================
// MATCHMAKING / ROOMS
// =============================================================================

/// A queued player resolved to a live, authenticated session.
struct Paired {
    player_id: PlayerId,
    username: String,
    snapshot: ProfileSnapshot,
    sender: mpsc::Sender<Message>,
}

async fn resolve_ticket(server: &Arc<GameServer>, player_id: &PlayerId) -> Option<Paired> {
    let sessions = server.sessions.read().await;
    let entry = sessions.get(player_id)?;
    if entry.room_id.is_some() {
        return None;
    }
    Some(Paired {
        player_id: player_id.clone(),
        username: entry.username.clone()?,
        snapshot: entry.snapshot.clone()?,
        sender: entry.outbound.clone(),
    })
}

async fn run_matchmaking_loop(server: Arc<GameServer>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut shutdown_rx = server.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => break,
        }
        for mode in [Mode::Simple, Mode::Enhanced] {
            while let Some((first, second)) = server.matchmaker.pop_pair(mode).await {
                let a = resolve_ticket(&server, &first).await;
                let b = resolve_ticket(&server, &second).await;
                match (a, b) {
                    (Some(a), Some(b)) => create_room(&server, mode, a, b).await,
                    // A ticket whose session vanished is dropped; its
                    // partner keeps its place at the head of the queue.
                    (Some(_), None) => server.matchmaker.requeue_front(mode, first).await,
                    (None, Some(_)) => server.matchmaker.requeue_front(mode, second).await,
                    (None, None) => {}
                }
            }
        }
    }
}

async fn create_room(server: &Arc<GameServer>, mode: Mode, a: Paired, b: Paired) {
    let game_id = GameId::generate();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mut engine = GameEngine::new(
        game_id.clone(),
        mode,
        MatchSeat::from_snapshot(a.player_id.clone(), &a.snapshot),
        MatchSeat::from_snapshot(b.player_id.clone(), &b.snapshot),
        Arc::clone(&server.catalog),
        events_tx,
        StdRng::from_entropy(),
    );
    engine.start();
    let state = engine.state().clone();

    let members = [
        RoomMember {
            player_id: a.player_id.clone(),
            username: a.username.clone(),
            sender: a.sender.clone(),
        },
        RoomMember {
            player_id: b.player_id.clone(),
            username: b.username.clone(),
            sender: b.sender.clone(),
        },
    ];
    let room = Arc::new(Room::new(game_id.clone(), mode, engine, members));

    server.rooms.write().await.insert(game_id.clone(), Arc::clone(&room));
    {
        let mut sessions = server.sessions.write().await;
        for id in [&a.player_id, &b.player_id] {
            if let Some(entry) = sessions.get_mut(id) {
                entry.room_id = Some(game_id.clone());
            }
        }
    }

    for (me, other) in [(&a, &b), (&b, &a)] {
        let match_found = Message::new(MessageType::MatchFound)
            .with_player(me.player_id.clone())
            .with_game(game_id.clone())
            .with_data(Payload::MatchFound(MatchFound {
                game_id: game_id.clone(),
                game_mode: mode,
                opponent: OpponentInfo {
                    player_id: other.player_id.clone(),
                    username: other.username.clone(),
                    level: other.snapshot.level,
                },
                your_turn: mode == Mode::Simple && state.current_turn == me.player_id,
            }));
        room.send_to(&me.player_id, match_found);

        let slot = if state.is_player1(&me.player_id) {
            &state.player1
        } else {
            &state.player2
        };
        let game_start = Message::new(MessageType::GameStart)
            .with_player(me.player_id.clone())
            .with_game(game_id.clone())
            .with_data(Payload::GameStart(Box::new(GameStart {
                game_state: state.clone(),
                your_troops: slot.troops.clone(),
                your_towers: slot.towers.clone(),
            })));
        room.send_to(&me.player_id, game_start);
    }

    tokio::spawn(run_room_pump(
        Arc::clone(server),
        Arc::clone(&room),
        events_rx,
    ));
    if mode == Mode::Enhanced {
        room.start_clock().await;
    }

    info!(
        room = %game_id, %mode,
        "match created: {} vs {}", a.username, b.username
    );
}

/// Forward engine events to both members until the terminal `GAME_END`,
/// then finalize the room.
async fn run_room_pump(
    server: Arc<GameServer>,
    room: Arc<Room>,
    mut events_rx: mpsc::UnboundedReceiver<crate::game::events::EngineUpdate>,
) {
    while let Some(update) = events_rx.recv().await {
        if let GameEvent::GameEnd {
            winner,
            reason,
            player1_exp,
            player2_exp,
        } = &update.event
        {
            finalize_room(
                &server,
                &room,
                &update.state,
                winner.clone(),
                *reason,
                *player1_exp,
                *player2_exp,
            )
            .await;
            break;
        }

        let mut msg = match &update.event {
            GameEvent::TurnEnd { next_turn, .. } => Message::new(MessageType::TurnChange)
                .with_data(Payload::TurnChange(Box::new(TurnChangeBody {
                    current_turn: next_turn.clone(),
                    game_state: update.state.clone(),
                }))),
            GameEvent::ManaTick {
                player1_mana,
                player2_mana,
                time_left,
            } => Message::new(MessageType::ManaUpdate).with_data(Payload::ManaUpdate(Box::new(
                ManaUpdateBody {
                    player1_mana: *player1_mana,
                    player2_mana: *player2_mana,
                    time_left: *time_left,
                    game_state: update.state.clone(),
                },
            ))),
            event => Message::new(MessageType::GameEvent).with_data(Payload::GameEvent(Box::new(
                GameEventBody {
                    event: event.clone(),
                    game_state: update.state.clone(),
                },
            ))),
        };
        msg.game_id = Some(room.id.clone());
        msg.timestamp = update.timestamp;

        for player_id in room.broadcast(&msg) {
            close_session(&server, &player_id, CloseReason::Backpressure).await;
        }
    }
}

async fn finalize_room(
    server: &Arc<GameServer>,
    room: &Arc<Room>,
    state: &GameState,
    winner: Winner,
    reason: EndReason,
    player1_exp: u32,
    player2_exp: u32,
) {
    room.abort_timers().await;

    // Write both results exactly once; a level-up becomes one last
    // LEVEL_UP game event ahead of the GAME_END message.
    for member in room.members() {
        let exp = if state.is_player1(&member.player_id) {
            player1_exp
        } else {
            player2_exp
        };
        let won = matches!(&winner, Winner::Player(id) if *id == member.player_id);
        match server
            .store
            .record_game_result(&member.username, exp, won)
            .await
        {
            Ok(record) if record.levels_gained > 0 => {
                let msg = Message::new(MessageType::GameEvent)
                    .with_game(room.id.clone())
                    .with_data(Payload::GameEvent(Box::new(GameEventBody {
                        event: GameEvent::LevelUp {
                            player_id: member.player_id.clone(),
                            level: record.level,
                        },
                        game_state: state.clone(),
                    })));
                for player_id in room.broadcast(&msg) {
                    close_session(server, &player_id, CloseReason::Backpressure).await;
                }
            }
            Ok(_) => {}
            Err(e) => error!(username = %member.username, "failed to record result: {e}"),
        }
    }

    for member in room.members() {
        let (own, opponent) = if state.is_player1(&member.player_id) {
            (player1_exp, player2_exp)
        } else {
            (player2_exp, player1_exp)
        };
        let msg = Message::new(MessageType::GameEnd)
            .with_player(member.player_id.clone())
            .with_game(room.id.clone())
            .with_data(Payload::GameEnd(GameEndBody {
                winner: winner.clone(),
                reason,
                exp_gained: own.to_string(),
                opponent_exp_gained: opponent.to_string(),
            }));
        if room.send_to(&member.player_id, msg) {
            close_session(server, &member.player_id, CloseReason::Backpressure).await;
        }
    }

    {
        let mut sessions = server.sessions.write().await;
        for member in room.members() {
            if let Some(entry) = sessions.get_mut(&member.player_id) {
                entry.room_id = None;
            }
        }
    }
    server.rooms.write().await.remove(&room.id);
    info!(room = %room.id, ?winner, ?reason, "match finished");
}

/// Disconnect path: the survivor wins, hears `PLAYER_DISCONNECT` and
/// then `GAME_END`. With both sides gone the match finishes as a draw
/// into an empty room, which the pump then discards.
async fn handle_room_disconnect(
    server: &Arc<GameServer>,
    player_id: &PlayerId,
    username: &str,
    room_id: GameId,
) {
    let room = server.rooms.read().await.get(&room_id).cloned();
    let Some(room) = room else {
        return;
    };

    let both_gone = room.mark_gone(player_id).await;
    if !room.engine().lock().await.is_active() {
        return;
    }

    if both_gone {
        room.engine()
            .lock()
            .await
            .abort(None, EndReason::OpponentDisconnect);
        return;
    }

    let Some(survivor) = room.other_member(player_id) else {
        return;
    };
    let survivor_id = survivor.player_id.clone();
    warn!(%player_id, room = %room_id, "player disconnected mid-match");

    let notice = Message::new(MessageType::PlayerDisconnect)
        .with_game(room_id)
        .with_data(Payload::PlayerDisconnect(PlayerDisconnectBody {
            player_id: player_id.clone(),
            username: username.to_owned(),
        }));
    if room.send_to(&survivor_id, notice) {
        close_session(server, &survivor_id, CloseReason::Backpressure).await;
    }

    room.engine()
        .lock()
        .await
        .abort(Some(survivor_id), EndReason::OpponentDisconnect);
}

async fn close_session(server: &Arc<GameServer>, player_id: &PlayerId, reason: CloseReason) {
    let sessions = server.sessions.read().await;
    if let Some(entry) = sessions.get(player_id) {
        warn!(%player_id, ?reason, "closing session");
        let _ = entry.close.send(Some(reason));
    }
}

// =============================================================================
// BACKGROUND CLEANUP
// =============================================================================

async fn run_cleanup_loop(server: Arc<GameServer>) {
    let mut ticker = tokio::time::interval(server.config.cleanup_interval);
    let mut shutdown_rx = server.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => break,
        }
        let now = Instant::now();
        let stale: Vec<PlayerId> = {
            let sessions = server.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_ping) > server.config.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for player_id in stale {
            info!(%player_id, "evicting idle session");
            close_session(&server, &player_id, CloseReason::Idle).await;
        }
    }
}
