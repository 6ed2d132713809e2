use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, make_cache_key};
use crate::error::CompletionError;
use crate::load_balancer::LoadBalancer;
use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_SIZE, COMPLETION_LATENCY};
use crate::models::{
    Completion, CompletionJob, CompletionRequest, NewChatRequest, QuestionRequest, QuestionResponse,
};

// Credentials sent to the completion backends
#[derive(Clone)]
pub struct UpstreamAuth {
    pub bearer_token: String,
    pub api_key: String,
}

#[derive(Clone)]
pub struct WorkerContext {
    pub client: reqwest::Client,
    pub load_balancer: Arc<LoadBalancer>,
    pub cache: Arc<DashMap<String, CacheEntry>>,
    pub ttl: Duration,
    pub auth: UpstreamAuth,
}

// Background worker -> takes jobs off the queue, at most `max_inflight` at once
pub async fn completion_worker(
    mut rx: mpsc::Receiver<CompletionJob>,
    ctx: WorkerContext,
    max_inflight: usize,
) {
    info!("Completion worker started ({} in flight max)", max_inflight);
    let permits = Arc::new(Semaphore::new(max_inflight.max(1)));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = process(&ctx, &job.request).await;
            // the asker may have gone away
            let _ = job.response_tx.send(result);
            drop(permit);
        });
    }

    info!("Completion queue closed, worker stopping");
}

async fn process(
    ctx: &WorkerContext,
    request: &CompletionRequest,
) -> Result<Completion, CompletionError> {
    let cache_key = make_cache_key(request);

    // check cache first
    if let Some(entry) = ctx.cache.get(&cache_key) {
        if entry.is_fresh(ctx.ttl) {
            CACHE_HITS.inc();
            debug!("[Worker] Cache HIT");
            return Ok(Completion {
                text: entry.response.clone(),
                cached: true,
            });
        }
    }
    CACHE_MISSES.inc();

    let backend = ctx.load_balancer.get_backend().ok_or(CompletionError::NoBackend)?;
    debug!("[Worker] Using backend: {}", backend.url);

    let started = Instant::now();
    match ask_backend(ctx, &backend.url, request).await {
        Ok(text) => {
            COMPLETION_LATENCY.observe(started.elapsed().as_secs_f64());
            ctx.cache.insert(cache_key, CacheEntry::new(text.clone()));
            CACHE_SIZE.set(ctx.cache.len() as f64);
            Ok(Completion {
                text,
                cached: false,
            })
        }
        // connection level failure -> take the backend out until the health check says otherwise
        Err(CompletionError::Request(e)) => {
            backend.set_healthy(false);
            warn!("[Worker] Backend {} failed, marked unhealthy: {}", backend.url, e);
            Err(CompletionError::Request(e))
        }
        Err(e) => Err(e),
    }
}

// Two calls: open a conversation, then ask the question in it
async fn ask_backend(
    ctx: &WorkerContext,
    base_url: &str,
    request: &CompletionRequest,
) -> Result<String, CompletionError> {
    let chat = ctx
        .client
        .post(format!("{}/chat", base_url))
        .header("Openai-Api-Key", &ctx.auth.api_key)
        .bearer_auth(&ctx.auth.bearer_token)
        .json(&NewChatRequest {
            name: conversation_name(&request.prompt),
        })
        .send()
        .await?;
    if !chat.status().is_success() {
        return Err(CompletionError::Status(chat.status().as_u16()));
    }
    let chat: serde_json::Value = chat.json().await?;
    let chat_id = match chat.get("chat_id") {
        Some(serde_json::Value::String(id)) => id.clone(),
        Some(serde_json::Value::Number(id)) => id.to_string(),
        _ => return Err(CompletionError::MissingField("chat_id")),
    };

    let answer = ctx
        .client
        .post(format!("{}/chat/{}/question", base_url, chat_id))
        .header("Openai-Api-Key", &ctx.auth.api_key)
        .bearer_auth(&ctx.auth.bearer_token)
        .json(&QuestionRequest {
            model: &request.model,
            question: &request.prompt,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        })
        .send()
        .await?;
    if !answer.status().is_success() {
        return Err(CompletionError::Status(answer.status().as_u16()));
    }

    answer
        .json::<QuestionResponse>()
        .await?
        .assistant
        .ok_or(CompletionError::MissingField("assistant"))
}

// First line of the prompt, capped, used as the upstream conversation title
fn conversation_name(prompt: &str) -> &str {
    let first_line = prompt.lines().next().unwrap_or_default();
    match first_line.char_indices().nth(64) {
        Some((idx, _)) => &first_line[..idx],
        None => first_line,
    }
}
