pub mod capabilities;
pub mod chat;
pub mod config;
pub mod error;
pub mod routes;
pub mod store;

use std::sync::Arc;

use plenary_common::SnowflakeGenerator;

use capabilities::ChatCapabilities;
use chat::events::{MessagePayload, ReactionPayload};
use chat::queue::{self, Pipeline, PipelineConfig};
use chat::registry::SubscriptionRegistry;
use chat::session::SessionMap;
use config::Config;
use store::BatchWriter;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<dyn SubscriptionRegistry>,
    pub capabilities: Arc<dyn ChatCapabilities>,
    pub sessions: Arc<SessionMap>,
    pub snowflake: Arc<SnowflakeGenerator>,
    pub messages: Pipeline<MessagePayload>,
    pub reactions: Pipeline<ReactionPayload>,
}

impl AppState {
    /// Build the application state and spawn the per-kind distributor and
    /// flush tasks. The tasks run for the life of the process (or the test
    /// runtime) and are detached here.
    pub fn new(
        config: Config,
        registry: Arc<dyn SubscriptionRegistry>,
        capabilities: Arc<dyn ChatCapabilities>,
        message_writer: Arc<dyn BatchWriter<MessagePayload>>,
        reaction_writer: Arc<dyn BatchWriter<ReactionPayload>>,
    ) -> Self {
        let sessions = Arc::new(SessionMap::new());

        let (messages, _message_tasks) = queue::start::<MessagePayload>(
            PipelineConfig {
                distribution_queue_size: config.message_distribution_queue_size,
                writeback_queue_size: config.message_writeback_queue_size,
                writeback_interval_ms: config.message_writeback_interval_ms,
            },
            registry.clone(),
            sessions.clone(),
            message_writer,
        );
        let (reactions, _reaction_tasks) = queue::start::<ReactionPayload>(
            PipelineConfig {
                distribution_queue_size: config.reaction_distribution_queue_size,
                writeback_queue_size: config.reaction_writeback_queue_size,
                writeback_interval_ms: config.reaction_writeback_interval_ms,
            },
            registry.clone(),
            sessions.clone(),
            reaction_writer,
        );

        Self {
            config: Arc::new(config),
            registry,
            capabilities,
            sessions,
            snowflake: Arc::new(SnowflakeGenerator::new(0)),
            messages,
            reactions,
        }
    }
}
