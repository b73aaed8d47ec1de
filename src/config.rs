//! Carga y gestión de configuración de la aplicación (Postgres + LLM + RAG).

use std::env;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};

/// Proveedor del modelo de chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Groq,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "groq" => Ok(Self::Groq),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }

    /// Modelo de chat por defecto de cada proveedor.
    pub fn default_chat_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::Groq => "llama-3.1-8b-instant",
        }
    }
}

/// Proveedor de embeddings. `Local` es un embedder determinista por hashing
/// que no necesita red.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    OpenAI,
    Local,
}

impl EmbeddingProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "local" | "hash" => Ok(Self::Local),
            other => Err(anyhow!("Proveedor de embeddings no soportado: {other}")),
        }
    }
}

/// Parámetros del pipeline RAG.
#[derive(Clone, Debug)]
pub struct RagSettings {
    /// Filas recientes que entran en cada reconstrucción del índice.
    pub index_limit: usize,
    /// Antigüedad máxima del índice antes de reconstruirlo.
    pub refresh_interval: Duration,
    pub top_k: usize,
    /// Filas crudas del bloque "Recent structured DB logs".
    pub recent_log_limit: usize,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            index_limit: 500,
            refresh_interval: Duration::from_secs(120),
            top_k: 5,
            recent_log_limit: 10,
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub server_addr: String,
    pub static_dir: String,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,
    pub embedding_provider: EmbeddingProvider,
    pub llm_embedding_model: String,

    pub rag: RagSettings,
    /// Tiempo sin actividad tras el que se descarta una sesión.
    pub session_idle: Duration,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow!("Falta DATABASE_URL en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());
        let static_dir = env::var("STATIC_DIR").unwrap_or_else(|_| "frontend".to_string());

        let llm_provider_str = env::var("LLM_PROVIDER").unwrap_or_else(|_| "groq".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;
        let llm_chat_model = env::var("LLM_CHAT_MODEL")
            .unwrap_or_else(|_| llm_provider.default_chat_model().to_string());

        let embedding_provider_str =
            env::var("EMBEDDING_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let embedding_provider = EmbeddingProvider::from_str(&embedding_provider_str)?;
        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let defaults = RagSettings::default();
        let rag = RagSettings {
            index_limit: env_or("INDEX_LIMIT", defaults.index_limit)?,
            refresh_interval: Duration::from_secs(env_or(
                "INDEX_REFRESH_SECS",
                defaults.refresh_interval.as_secs(),
            )?),
            top_k: env_or("RETRIEVAL_TOP_K", defaults.top_k)?,
            recent_log_limit: env_or("RECENT_LOG_LIMIT", defaults.recent_log_limit)?,
        };

        let session_idle = Duration::from_secs(env_or(
            "SESSION_IDLE_SECS",
            crate::session::DEFAULT_IDLE_TTL.as_secs(),
        )?);

        Ok(Self {
            database_url,
            server_addr,
            static_dir,
            llm_provider,
            llm_chat_model,
            embedding_provider,
            llm_embedding_model,
            rag,
            session_idle,
        })
    }
}

/// Lee una variable numérica opcional; si existe pero no se puede parsear es un error.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Valor inválido para {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
