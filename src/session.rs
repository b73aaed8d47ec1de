//! Sesiones de chat: conversación + snapshot del índice, indexadas por UUID.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::models::ConversationTurn;
use crate::vector_store::IndexSnapshot;

/// Historial ordenado de una sesión. Sólo crece, salvo `clear`.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn all(&self) -> &[ConversationTurn] {
        &self.turns
    }
}

/// Estado de una sesión de usuario.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub conversation: Conversation,
    /// Snapshot en uso; se sustituye entero al reconstruir.
    pub index: Arc<IndexSnapshot>,
}

impl Session {
    pub fn new(id: Uuid, index: Arc<IndexSnapshot>) -> Self {
        Self { id, conversation: Conversation::default(), index }
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Inactividad por defecto antes de descartar una sesión.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct Entry {
    session: SharedSession,
    last_active: DateTime<Utc>,
}

/// Registro de sesiones vivas. Cada sesión va tras un mutex asíncrono:
/// un turno termina antes de que empiece el siguiente de la misma sesión.
///
/// Las sesiones sin actividad durante más de `idle_ttl` se descartan al
/// crear o buscar cualquier sesión.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Entry>>,
    idle_ttl: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TTL)
    }
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), idle_ttl }
    }

    /// Crea una sesión sembrada con `seed` y devuelve su id.
    pub fn create(&self, seed: Arc<IndexSnapshot>) -> Uuid {
        self.create_at(seed, Utc::now())
    }

    pub fn get(&self, id: &Uuid) -> Option<SharedSession> {
        self.get_at(id, Utc::now())
    }

    fn create_at(&self, seed: Arc<IndexSnapshot>, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let session = Arc::new(Mutex::new(Session::new(id, seed)));
        let mut sessions = self.write();
        self.evict_idle(&mut sessions, now);
        sessions.insert(id, Entry { session, last_active: now });
        id
    }

    /// Busca la sesión y la marca como activa.
    fn get_at(&self, id: &Uuid, now: DateTime<Utc>) -> Option<SharedSession> {
        let mut sessions = self.write();
        self.evict_idle(&mut sessions, now);
        let entry = sessions.get_mut(id)?;
        entry.last_active = now;
        Some(entry.session.clone())
    }

    fn evict_idle(&self, sessions: &mut HashMap<Uuid, Entry>, now: DateTime<Utc>) {
        let Ok(ttl) = chrono::Duration::from_std(self.idle_ttl) else {
            return;
        };
        let before = sessions.len();
        sessions.retain(|_, entry| now.signed_duration_since(entry.last_active) <= ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("Descartadas {evicted} sesiones inactivas.");
        }
    }

    /// Elimina la sesión. `false` si no existía.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Entry>> {
        self.sessions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Entry>> {
        self.sessions.write().unwrap_or_else(|p| p.into_inner())
    }
}
