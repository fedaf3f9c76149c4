use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::flow::intent::Mode;

/// Prompt and source image of the last delivered generation, kept for the
/// regenerate / edit shortcuts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastGeneration {
    pub prompt: String,
    pub source_image: Option<Arc<Vec<u8>>>,
}

/// Where the user is in the flow. Each variant carries only what is valid there.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    ChoosingModel,
    ChoosingMode,
    ChoosingFormat {
        mode: Mode,
    },
    AwaitingImage,
    AwaitingPrompt {
        source_image: Option<Arc<Vec<u8>>>,
    },
    Generating,
    PostGeneration,
}

impl FlowState {
    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::ChoosingModel => "choosing_model",
            FlowState::ChoosingMode => "choosing_mode",
            FlowState::ChoosingFormat { .. } => "choosing_format",
            FlowState::AwaitingImage => "awaiting_image",
            FlowState::AwaitingPrompt { .. } => "awaiting_prompt",
            FlowState::Generating => "generating",
            FlowState::PostGeneration => "post_generation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub state: FlowState,
    pub last: Option<LastGeneration>,
}

impl Session {
    pub fn with_state(state: FlowState, last: Option<LastGeneration>) -> Self {
        Self { state, last }
    }
}

/// Ephemeral per-user conversation state. Every call is one atomic operation.
pub trait SessionStore: Send + Sync {
    /// Returns the user's session, or a fresh idle one.
    fn get(&self, user_id: i64) -> Session;
    fn set(&self, user_id: i64, session: Session);
    /// Read-modify-write under the store's lock.
    fn update(&self, user_id: i64, apply: &mut dyn FnMut(&mut Session));
    fn clear(&self, user_id: i64);
}

/// Sessions untouched for this long are dropped, along with any source image they hold.
pub const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    session: Session,
    touched: Instant,
}

struct Entries {
    by_user: HashMap<i64, Entry>,
    last_sweep: Instant,
}

/// Process-local session store. Idle sessions expire after `idle_ttl`: a stale entry reads
/// as a fresh idle session, and expired entries are swept out on writes.
#[derive(Clone)]
pub struct InMemorySessionStore {
    entries: Arc<Mutex<Entries>>,
    idle_ttl: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_idle_ttl(DEFAULT_SESSION_IDLE_TTL)
    }
}

impl InMemorySessionStore {
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                by_user: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            idle_ttl,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().by_user.len()
    }

    fn is_fresh(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.touched) < self.idle_ttl
    }

    fn sweep(&self, entries: &mut Entries, now: Instant) {
        if now.duration_since(entries.last_sweep) < self.idle_ttl.min(MAX_SWEEP_INTERVAL) {
            return;
        }
        let before = entries.by_user.len();
        entries.by_user.retain(|_, entry| self.is_fresh(entry, now));
        entries.last_sweep = now;
        let evicted = before - entries.by_user.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.by_user.len(), "Evicted idle sessions");
        }
    }

    fn store(&self, entries: &mut Entries, user_id: i64, session: Session, now: Instant) {
        if session == Session::default() {
            entries.by_user.remove(&user_id);
        } else {
            entries.by_user.insert(
                user_id,
                Entry {
                    session,
                    touched: now,
                },
            );
        }
        self.sweep(entries, now);
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, user_id: i64) -> Session {
        let now = Instant::now();
        self.entries
            .lock()
            .by_user
            .get(&user_id)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.session.clone())
            .unwrap_or_default()
    }

    fn set(&self, user_id: i64, session: Session) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.store(&mut entries, user_id, session, now);
    }

    fn update(&self, user_id: i64, apply: &mut dyn FnMut(&mut Session)) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut session = entries
            .by_user
            .remove(&user_id)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.session)
            .unwrap_or_default();
        apply(&mut session);
        self.store(&mut entries, user_id, session, now);
    }

    fn clear(&self, user_id: i64) {
        self.entries.lock().by_user.remove(&user_id);
    }
}
