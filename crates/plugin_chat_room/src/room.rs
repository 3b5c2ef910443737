//! Chat room state machine.
//!
//! All room state lives behind a single mutex.  Message handlers, the
//! housekeeper's reap-and-quiz passes, and session admission each take the
//! lock once, mutate, and queue outbound frames; actual socket I/O is done
//! by per-session writer tasks, so nothing blocks under the lock and the
//! order frames enter a session's queue is the order lock holders ran.
//!
//! The housekeeper is one background thread.  It wakes at least every
//! 50 ms, or immediately when a session closes, to reap closed sessions
//! and to post the next quiz question when its time arrives.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use server_core::diagnostics::levels;
use server_core::{
    Connection, DiagnosticDelegate, DiagnosticSink, DiagnosticSubscription, Request, Response,
    TimeSource, WebSocket,
};

use crate::messages::{ClientMessage, ServerMessage, UserEntry};

/// Body returned to clients that reach the chat resource without upgrading.
pub const UPGRADE_REQUIRED_BODY: &str = "Try again, but next time use a WebSocket.  Kthxbye!";

/// The synthetic sender the quiz scheduler posts questions as.
pub const QUIZ_MASTER: &str = "MathBot2000";

/// Upper bound on how long the housekeeper sleeps between passes.
const WORKER_POLLING_PERIOD: Duration = Duration::from_millis(50);

/// Transport seam for one session's socket.
///
/// The production implementation is [`server_core::WebSocket`]; tests
/// substitute a recording fake.
pub trait SessionSocket: Send + Sync {
    /// Queue a text frame for the peer.  Never blocks.
    fn send_text(&self, text: String);

    /// Queue a close frame.
    fn close(&self, code: u16, reason: &str);

    fn subscribe_diagnostics(
        &self,
        sink: DiagnosticSink,
        min_level: usize,
    ) -> DiagnosticSubscription;
}

impl SessionSocket for WebSocket {
    fn send_text(&self, text: String) {
        WebSocket::send_text(self, text);
    }

    fn close(&self, code: u16, reason: &str) {
        WebSocket::close(self, code, reason);
    }

    fn subscribe_diagnostics(
        &self,
        sink: DiagnosticSink,
        min_level: usize,
    ) -> DiagnosticSubscription {
        WebSocket::subscribe_diagnostics(self, sink, min_level)
    }
}

/// Chat room configuration, bound from the plugin's configuration subtree.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub nicknames: Vec<String>,
    pub initial_points: HashMap<String, i64>,
    /// Seconds a user must wait between accepted tells.
    pub tell_timeout: f64,
    pub min_cooldown: f64,
    pub max_cooldown: f64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            nicknames: Vec::new(),
            initial_points: HashMap::new(),
            tell_timeout: 1.0,
            min_cooldown: 10.0,
            max_cooldown: 30.0,
        }
    }
}

struct Session {
    nickname: String,
    socket: Arc<dyn SessionSocket>,
    open: bool,
    last_tell: f64,
    points: i64,
    diagnostics_sender_name: String,
    diagnostics_subscription: Option<DiagnosticSubscription>,
}

struct RoomState {
    sessions: BTreeMap<u64, Session>,
    available_nicknames: BTreeSet<String>,
    next_session_id: u64,
    users_closed: bool,
    answered_correctly: bool,
    next_question_at: f64,
    question_components: Vec<i64>,
    question: String,
    answer: String,
}

enum RoomWake {
    UsersClosed,
    Stop,
}

pub struct Room {
    // Handle back to the owning Arc; callbacks and the housekeeper hold
    // weak copies so a dangling socket cannot keep a dead room alive.
    weak: Weak<Room>,
    config: RoomConfig,
    time: Arc<dyn TimeSource>,
    diagnostics: Mutex<Option<DiagnosticDelegate>>,
    state: Mutex<RoomState>,
    answer_changed: Condvar,
    wake: Mutex<Option<Sender<RoomWake>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn new(
        config: RoomConfig,
        time: Arc<dyn TimeSource>,
        diagnostics: DiagnosticDelegate,
    ) -> Arc<Self> {
        let available_nicknames = config.nicknames.iter().cloned().collect();
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            time,
            diagnostics: Mutex::new(Some(diagnostics)),
            state: Mutex::new(RoomState {
                sessions: BTreeMap::new(),
                available_nicknames,
                next_session_id: 1,
                users_closed: false,
                answered_correctly: true,
                next_question_at: f64::INFINITY,
                question_components: Vec::new(),
                question: String::new(),
                answer: String::new(),
            }),
            answer_changed: Condvar::new(),
            wake: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the housekeeper and schedule the first quiz question.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker slot poisoned");
        if worker.is_some() {
            return;
        }
        let (tx, rx) = channel();
        *self.wake.lock().expect("wake slot poisoned") = Some(tx);
        {
            let mut state = self.lock_state();
            let mut rng = rand::thread_rng();
            state.next_question_at = self.time.now() + self.draw_cooldown(&mut rng);
        }
        let weak = self.weak.clone();
        *worker = Some(std::thread::spawn(move || Self::run_worker(weak, rx)));
    }

    /// Stop and join the housekeeper.
    pub fn stop(&self) {
        let tx = self.wake.lock().expect("wake slot poisoned").take();
        if let Some(tx) = tx {
            let _ = tx.send(RoomWake::Stop);
        }
        let worker = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    /// Return the room to its just-configured state.  Called after `stop`
    /// as part of plugin unload.
    pub fn reset(&self) {
        let removed: Vec<Session> = {
            let mut state = self.lock_state();
            let removed = std::mem::take(&mut state.sessions).into_values().collect();
            state.available_nicknames = self.config.nicknames.iter().cloned().collect();
            state.next_session_id = 1;
            state.users_closed = false;
            state.answered_correctly = true;
            state.next_question_at = f64::INFINITY;
            state.question_components.clear();
            state.question.clear();
            state.answer.clear();
            removed
        };
        *self.diagnostics.lock().expect("diagnostics slot poisoned") = None;
        drop(removed);
    }

    /// Handle an incoming request to the chat resource: upgrade it to a
    /// WebSocket, or explain how to visit properly.
    pub async fn add_user(
        &self,
        request: Request,
        connection: Arc<Connection>,
        trailer: Vec<u8>,
    ) -> Response {
        let socket = Arc::new(WebSocket::new());
        // The session row must exist before the upgrade completes: frames
        // carried in the trailer are delivered as soon as it does.
        let session_id = self.add_session(socket.clone());
        {
            let weak = self.weak.clone();
            socket.set_text_handler(move |text| {
                if let Some(room) = weak.upgrade() {
                    room.receive_message(session_id, &text);
                }
            });
        }
        {
            let weak = self.weak.clone();
            socket.set_close_handler(move |code, reason| {
                if let Some(room) = weak.upgrade() {
                    room.remove_user(session_id, code, &reason);
                }
            });
        }
        match socket.open_as_server(&connection, &request, trailer).await {
            Ok(()) => Response::upgraded(),
            Err(_) => {
                self.discard_session(session_id);
                Response::text(200, UPGRADE_REQUIRED_BODY)
            }
        }
    }

    /// Insert a new session for `socket` and return its id.
    pub fn add_session(&self, socket: Arc<dyn SessionSocket>) -> u64 {
        let weak = self.weak.clone();
        let mut state = self.lock_state();
        let session_id = state.next_session_id;
        state.next_session_id += 1;
        let diagnostics_sender_name = format!("Session #{session_id}");
        let sink_name = diagnostics_sender_name.clone();
        let subscription = socket.subscribe_diagnostics(
            Arc::new(move |_sender: &str, level: usize, message: &str| {
                if let Some(room) = weak.upgrade() {
                    room.publish_diagnostic(&sink_name, level, message);
                }
            }),
            0,
        );
        state.sessions.insert(
            session_id,
            Session {
                nickname: String::new(),
                socket,
                open: true,
                last_tell: f64::NEG_INFINITY,
                points: 0,
                diagnostics_sender_name,
                diagnostics_subscription: Some(subscription),
            },
        );
        session_id
    }

    /// Drop a session that never finished opening.
    fn discard_session(&self, session_id: u64) {
        let removed = self.lock_state().sessions.remove(&session_id);
        drop(removed);
    }

    /// Inbound text frame dispatcher.  Malformed frames and unrecognized
    /// message types are dropped without a diagnostic.
    pub fn receive_message(&self, session_id: u64, text: &str) {
        let Ok(message) = serde_json::from_str::<ClientMessage>(text) else {
            return;
        };
        let mut state = self.lock_state();
        if !state.sessions.contains_key(&session_id) {
            return;
        }
        match message {
            ClientMessage::SetNickName { nickname } => {
                self.set_nickname(&mut state, session_id, nickname)
            }
            ClientMessage::GetNickNames => self.get_nicknames(&state, session_id),
            ClientMessage::GetAvailableNickNames => self.get_available_nicknames(&state),
            ClientMessage::GetUsers => self.get_users(&state, session_id),
            ClientMessage::Tell { tell } => self.tell(&mut state, session_id, tell),
            ClientMessage::Unknown => {}
        }
    }

    /// Socket-close callback.  The session is only marked; the housekeeper
    /// reaps it on its next pass.
    pub fn remove_user(&self, session_id: u64, code: u16, reason: &str) {
        {
            let mut state = self.lock_state();
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return;
            };
            session.socket.close(code, reason);
            session.open = false;
            state.users_closed = true;
        }
        if let Some(tx) = &*self.wake.lock().expect("wake slot poisoned") {
            let _ = tx.send(RoomWake::UsersClosed);
        }
    }

    fn set_nickname(&self, state: &mut RoomState, session_id: u64, new_nickname: String) {
        let (old_nickname, sender_name) = {
            let Some(session) = state.sessions.get(&session_id) else {
                return;
            };
            (
                session.nickname.clone(),
                session.diagnostics_sender_name.clone(),
            )
        };

        let success;
        if new_nickname.is_empty() {
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.nickname.clear();
            }
            success = true;
            if !old_nickname.is_empty() {
                self.publish_diagnostic(
                    &sender_name,
                    levels::IMPORTANT,
                    &format!("Nickname changed from '{old_nickname}' to '{new_nickname}'"),
                );
                state.available_nicknames.insert(old_nickname.clone());
                self.broadcast(
                    state,
                    &ServerMessage::Leave {
                        nickname: old_nickname,
                    },
                );
            }
        } else if old_nickname == new_nickname {
            success = true;
        } else if !state.available_nicknames.contains(&new_nickname) {
            success = false;
        } else {
            state.available_nicknames.remove(&new_nickname);
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.nickname = new_nickname.clone();
                session.points = self
                    .config
                    .initial_points
                    .get(&new_nickname)
                    .copied()
                    .unwrap_or(0);
            }
            if !old_nickname.is_empty() {
                state.available_nicknames.insert(old_nickname.clone());
                self.broadcast(
                    state,
                    &ServerMessage::Leave {
                        nickname: old_nickname.clone(),
                    },
                );
            }
            self.broadcast(
                state,
                &ServerMessage::Join {
                    nickname: new_nickname.clone(),
                },
            );
            success = true;
            self.publish_diagnostic(
                &sender_name,
                levels::IMPORTANT,
                &format!("Nickname changed from '{old_nickname}' to '{new_nickname}'"),
            );
        }
        self.send_to(state, session_id, &ServerMessage::SetNickNameResult { success });
    }

    fn get_nicknames(&self, state: &RoomState, session_id: u64) {
        let nicknames: BTreeSet<String> = state
            .sessions
            .values()
            .filter(|session| !session.nickname.is_empty())
            .map(|session| session.nickname.clone())
            .collect();
        self.send_to(
            state,
            session_id,
            &ServerMessage::NickNames {
                nicknames: nicknames.into_iter().collect(),
            },
        );
    }

    fn get_available_nicknames(&self, state: &RoomState) {
        self.broadcast(
            state,
            &ServerMessage::AvailableNickNames {
                available: state.available_nicknames.iter().cloned().collect(),
            },
        );
    }

    fn get_users(&self, state: &RoomState, session_id: u64) {
        let users: Vec<UserEntry> = state
            .sessions
            .values()
            .filter(|session| !session.nickname.is_empty())
            .map(|session| UserEntry {
                nickname: session.nickname.clone(),
                points: session.points,
            })
            .collect();
        self.send_to(state, session_id, &ServerMessage::Users { users });
    }

    fn tell(&self, state: &mut RoomState, session_id: u64, tell: String) {
        let (nickname, last_tell) = {
            let Some(session) = state.sessions.get(&session_id) else {
                return;
            };
            (session.nickname.clone(), session.last_tell)
        };
        if nickname.is_empty() {
            return;
        }
        let now = self.time.now();
        if now - last_tell < self.config.tell_timeout {
            return;
        }
        if tell.is_empty() || tell.parse::<i64>().is_err() {
            return;
        }
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.last_tell = now;
        }
        self.broadcast(
            state,
            &ServerMessage::Tell {
                sender: nickname.clone(),
                tell: tell.clone(),
            },
        );
        if state.answered_correctly {
            return;
        }
        if tell == state.answer {
            state.answered_correctly = true;
            let points = match state.sessions.get_mut(&session_id) {
                Some(session) => {
                    session.points += 1;
                    session.points
                }
                None => return,
            };
            self.broadcast(
                state,
                &ServerMessage::Award {
                    subject: nickname,
                    award: 1,
                    points,
                },
            );
        } else {
            let points = match state.sessions.get_mut(&session_id) {
                Some(session) => {
                    session.points -= 1;
                    session.points
                }
                None => return,
            };
            self.broadcast(
                state,
                &ServerMessage::Penalty {
                    subject: nickname,
                    penalty: 1,
                    points,
                },
            );
        }
    }

    fn run_worker(weak: Weak<Room>, rx: Receiver<RoomWake>) {
        loop {
            match rx.recv_timeout(WORKER_POLLING_PERIOD) {
                Ok(RoomWake::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(RoomWake::UsersClosed) | Err(RecvTimeoutError::Timeout) => {}
            }
            let Some(room) = weak.upgrade() else {
                break;
            };
            room.housekeeping_pass();
        }
    }

    fn housekeeping_pass(&self) {
        let mut removed: Vec<Session> = Vec::new();
        {
            let mut state = self.lock_state();
            if state.users_closed {
                let closed_ids: Vec<u64> = state
                    .sessions
                    .iter()
                    .filter(|(_, session)| !session.open)
                    .map(|(id, _)| *id)
                    .collect();
                for session_id in closed_ids {
                    let Some(mut session) = state.sessions.remove(&session_id) else {
                        continue;
                    };
                    if let Some(subscription) = session.diagnostics_subscription.take() {
                        subscription.unsubscribe();
                    }
                    let nickname = std::mem::take(&mut session.nickname);
                    if !nickname.is_empty() {
                        state.available_nicknames.insert(nickname.clone());
                        self.broadcast(&state, &ServerMessage::Leave { nickname });
                    }
                    removed.push(session);
                }
                state.users_closed = false;
            }
            if self.time.now() >= state.next_question_at {
                self.post_question(&mut state);
            }
        }
        // Socket teardown happens outside the room lock.
        drop(removed);
    }

    fn post_question(&self, state: &mut RoomState) {
        let mut rng = rand::thread_rng();
        let previous_answer = state.answer.clone();
        loop {
            let a: i64 = rng.gen_range(2..=10);
            let b: i64 = rng.gen_range(2..=10);
            let c: i64 = rng.gen_range(2..=97);
            let answer = (a * b + c).to_string();
            if answer == previous_answer {
                continue;
            }
            state.question = format!("What is {a} * {b} + {c}?");
            state.question_components = vec![a, b, c];
            state.answer = answer;
            break;
        }
        state.answered_correctly = false;
        state.next_question_at += self.draw_cooldown(&mut rng);
        self.broadcast(
            state,
            &ServerMessage::Tell {
                sender: QUIZ_MASTER.to_string(),
                tell: state.question.clone(),
            },
        );
        self.answer_changed.notify_all();
    }

    fn draw_cooldown(&self, rng: &mut impl Rng) -> f64 {
        rng.gen_range(self.config.min_cooldown..=self.config.max_cooldown)
    }

    fn broadcast(&self, state: &RoomState, message: &ServerMessage) {
        let Some(text) = self.render(message) else {
            return;
        };
        for session in state.sessions.values() {
            session.socket.send_text(text.clone());
        }
    }

    fn send_to(&self, state: &RoomState, session_id: u64, message: &ServerMessage) {
        let Some(session) = state.sessions.get(&session_id) else {
            return;
        };
        let Some(text) = self.render(message) else {
            return;
        };
        session.socket.send_text(text);
    }

    /// Serialize an outbound message, stamping the `Time` field.
    fn render(&self, message: &ServerMessage) -> Option<String> {
        let mut value = serde_json::to_value(message).ok()?;
        if let Value::Object(object) = &mut value {
            object.insert("Time".to_string(), self.time.now().into());
        }
        Some(value.to_string())
    }

    fn publish_diagnostic(&self, sender_name: &str, level: usize, message: &str) {
        let delegate = self
            .diagnostics
            .lock()
            .expect("diagnostics slot poisoned")
            .clone();
        if let Some(delegate) = delegate {
            delegate(sender_name, level, message);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RoomState> {
        self.state.lock().expect("room state poisoned")
    }

    // Test hooks, mirroring what an operator console would want anyway:
    // peek at and steer the current quiz question.

    pub fn next_question(&self) -> String {
        self.lock_state().question.clone()
    }

    pub fn next_answer(&self) -> String {
        self.lock_state().answer.clone()
    }

    pub fn next_question_components(&self) -> Vec<i64> {
        self.lock_state().question_components.clone()
    }

    /// Force the current answer and re-open scoring.
    pub fn set_next_answer(&self, answer: &str) {
        let mut state = self.lock_state();
        state.answer = answer.to_string();
        state.answered_correctly = false;
        self.answer_changed.notify_all();
    }

    /// Mark the current question as already answered.
    pub fn set_answered_correctly(&self) {
        self.lock_state().answered_correctly = true;
    }

    /// Block until a question is open for scoring, up to one second.
    pub fn await_next_question(&self) {
        let state = self.lock_state();
        let _ = self
            .answer_changed
            .wait_timeout_while(state, Duration::from_secs(1), |state| {
                state.answered_correctly
            });
    }

    /// Currently unallocated nicknames, in lexicographic order.
    pub fn available_nicknames(&self) -> Vec<String> {
        self.lock_state()
            .available_nicknames
            .iter()
            .cloned()
            .collect()
    }
}
