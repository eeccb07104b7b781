//! Standard lanes and their handlers.
//!
//! Wires the four stock lanes (`content`, `social`, `blockchain`,
//! `analytics`) to external collaborators. The collaborators do the actual
//! third-party calls; this module only decodes the payload and picks the
//! right operation.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::registry::Handler;
use crate::scheduler::Scheduler;

pub const CONTENT_QUEUE: &str = "content";
pub const SOCIAL_QUEUE: &str = "social";
pub const BLOCKCHAIN_QUEUE: &str = "blockchain";
pub const ANALYTICS_QUEUE: &str = "analytics";

/// Music, voice and text generation.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_music(&self, params: Value) -> anyhow::Result<Value>;
    async fn generate_speech(&self, params: Value) -> anyhow::Result<Value>;
    async fn create_completion(&self, params: Value) -> anyhow::Result<Value>;
}

#[async_trait]
pub trait SocialPoster: Send + Sync {
    async fn post(&self, post: Value) -> anyhow::Result<Value>;
}

/// On-chain submission.
#[async_trait]
pub trait ChainSubmitter: Send + Sync {
    async fn send_transaction(&self, params: Value) -> anyhow::Result<Value>;
    async fn stake_tokens(&self, params: Value) -> anyhow::Result<Value>;
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn process(&self, data: Value) -> anyhow::Result<Value>;
}

/// The collaborators behind the stock lanes.
#[derive(Clone)]
pub struct Services {
    pub content: Arc<dyn ContentGenerator>,
    pub social: Arc<dyn SocialPoster>,
    pub blockchain: Arc<dyn ChainSubmitter>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

/// Register handlers for all four stock lanes.
pub fn register_workers(scheduler: &Scheduler, services: Services) {
    scheduler.register_processor(CONTENT_QUEUE, ContentWorker(services.content));
    scheduler.register_processor(SOCIAL_QUEUE, SocialWorker(services.social));
    scheduler.register_processor(BLOCKCHAIN_QUEUE, BlockchainWorker(services.blockchain));
    scheduler.register_processor(ANALYTICS_QUEUE, AnalyticsWorker(services.analytics));
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `{"type": "music" | "voice" | "text", "params": {...}}`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentTask {
    Music {
        #[serde(default)]
        params: Value,
    },
    Voice {
        #[serde(default)]
        params: Value,
    },
    Text {
        #[serde(default)]
        params: Value,
    },
}

/// `{"type": "transfer" | "stake", "params": {...}}`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainTask {
    Transfer {
        #[serde(default)]
        params: Value,
    },
    Stake {
        #[serde(default)]
        params: Value,
    },
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct ContentWorker(Arc<dyn ContentGenerator>);

#[async_trait]
impl Handler for ContentWorker {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let task: ContentTask =
            serde_json::from_value(payload).context("unknown or malformed content task")?;
        info!(task = ?task, "processing content generation task");
        match task {
            ContentTask::Music { params } => self.0.generate_music(params).await,
            ContentTask::Voice { params } => self.0.generate_speech(params).await,
            ContentTask::Text { params } => self.0.create_completion(params).await,
        }
    }
}

struct SocialWorker(Arc<dyn SocialPoster>);

#[async_trait]
impl Handler for SocialWorker {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        info!("processing social media task");
        self.0.post(payload).await
    }
}

struct BlockchainWorker(Arc<dyn ChainSubmitter>);

#[async_trait]
impl Handler for BlockchainWorker {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let task: ChainTask =
            serde_json::from_value(payload).context("unknown or malformed transaction type")?;
        info!(task = ?task, "processing blockchain transaction");
        match task {
            ChainTask::Transfer { params } => self.0.send_transaction(params).await,
            ChainTask::Stake { params } => self.0.stake_tokens(params).await,
        }
    }
}

struct AnalyticsWorker(Arc<dyn AnalyticsSink>);

#[async_trait]
impl Handler for AnalyticsWorker {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        info!("processing analytics task");
        self.0.process(payload).await
    }
}
