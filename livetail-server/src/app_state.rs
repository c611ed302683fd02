use std::sync::Arc;

use shared::{
    config::server::Config,
    models::{ConversationSummary, LogRecord},
};
use sqlx::PgPool;

use crate::{
    auth::principal::{PrincipalResolver, StaticTokenResolver},
    middleware::auth::AuthState,
    services::{
        backlog::{BacklogSource, PgConversationStore, PgLogStore, RecordLookup},
        change_source::{ChangeSource, PgChangeSource},
        chat_service::ChatService,
        generation::EchoGenerator,
        memory_store::MemoryStore,
        message_repository::InMemoryMessageRepository,
        multiplexer::{SessionMultiplexer, SharedMultiplexer},
        stream_supervisor::StreamSupervisor,
        tail_session::{SessionSettings, TailService},
    },
};

const MEMORY_FEED_CAPACITY: usize = 1_024;

/// In-process stores backing the `memory` storage backend.
#[derive(Debug, Clone)]
pub struct MemoryStores {
    pub logs: Arc<MemoryStore<LogRecord>>,
    pub conversations: Arc<MemoryStore<ConversationSummary>>,
}

impl MemoryStores {
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs: Arc::new(MemoryStore::new(MEMORY_FEED_CAPACITY)),
            conversations: Arc::new(MemoryStore::new(MEMORY_FEED_CAPACITY)),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state shared across all routes.
#[derive(Clone, Debug)]
pub struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) pool: Option<PgPool>,
    pub(crate) logs: TailService<LogRecord>,
    pub(crate) conversations: TailService<ConversationSummary>,
    pub(crate) multiplexer: SharedMultiplexer,
    pub(crate) chat: ChatService,
    pub(crate) auth: AuthState,
}

impl AppState {
    /// State backed by in-process stores, returned alongside for seeding.
    #[must_use]
    pub fn in_memory(config: Arc<Config>) -> (Self, MemoryStores) {
        let stores = MemoryStores::new();
        let state = Self::assemble(
            config,
            None,
            (
                Arc::clone(&stores.logs) as Arc<dyn BacklogSource<LogRecord>>,
                Arc::clone(&stores.logs) as Arc<dyn ChangeSource<LogRecord>>,
            ),
            (
                Arc::clone(&stores.conversations) as Arc<dyn BacklogSource<ConversationSummary>>,
                Arc::clone(&stores.conversations) as Arc<dyn ChangeSource<ConversationSummary>>,
            ),
        );
        (state, stores)
    }

    /// State backed by Postgres tables and `LISTEN/NOTIFY`.
    #[must_use]
    pub fn with_postgres(config: Arc<Config>, pool: PgPool) -> Self {
        let logs = Arc::new(PgLogStore::new(pool.clone()));
        let conversations = Arc::new(PgConversationStore::new(pool.clone()));
        let log_changes = PgChangeSource::new(
            pool.clone(),
            Arc::clone(&logs) as Arc<dyn RecordLookup<LogRecord>>,
        );
        let conversation_changes = PgChangeSource::new(
            pool.clone(),
            Arc::clone(&conversations) as Arc<dyn RecordLookup<ConversationSummary>>,
        );

        Self::assemble(
            config,
            Some(pool),
            (logs, Arc::new(log_changes)),
            (conversations, Arc::new(conversation_changes)),
        )
    }

    fn assemble(
        config: Arc<Config>,
        pool: Option<PgPool>,
        logs: (
            Arc<dyn BacklogSource<LogRecord>>,
            Arc<dyn ChangeSource<LogRecord>>,
        ),
        conversations: (
            Arc<dyn BacklogSource<ConversationSummary>>,
            Arc<dyn ChangeSource<ConversationSummary>>,
        ),
    ) -> Self {
        let multiplexer: SharedMultiplexer = Arc::new(SessionMultiplexer::new());
        let settings = SessionSettings::from(&config.tail);
        let supervisor = Arc::new(StreamSupervisor::new(config.chat.generation_timeout()));
        let chat = ChatService::new(
            Arc::new(EchoGenerator::new(std::time::Duration::from_millis(
                config.chat.chunk_delay_ms,
            ))),
            Arc::new(InMemoryMessageRepository::new()),
            supervisor,
            config.chat.channel_capacity,
        );

        Self {
            pool,
            logs: TailService::new(logs.0, logs.1, settings, Arc::clone(&multiplexer)),
            conversations: TailService::new(
                conversations.0,
                conversations.1,
                settings,
                Arc::clone(&multiplexer),
            ),
            multiplexer,
            chat,
            auth: AuthState::new(Arc::new(StaticTokenResolver::from_config(&config.auth))),
            config,
        }
    }

    /// Swap the credential resolver, e.g. for an external identity provider.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.auth = AuthState::new(resolver);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn multiplexer(&self) -> SharedMultiplexer {
        Arc::clone(&self.multiplexer)
    }
}
