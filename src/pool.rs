//! Bounded-concurrency fan-out of subtasks across a role's pool
//! aliases (`4.4`).

use crate::balancer::Strategy;
use crate::message::Message;
use crate::request::{ChatRequest, TokenUsage};
use crate::router::Router;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One subtask's outcome, index-aligned with its position in the
/// slice passed to [`WorkerPool::execute_all`].
#[derive(Debug, Clone)]
pub struct SubtaskResult {
    pub subtask: String,
    pub response: String,
    pub usage: TokenUsage,
}

/// Fans a batch of subtasks out across a role's pool aliases with
/// `min(subtasks, aliases)` bounded concurrency, one same-alias retry
/// per subtask, and index-preserving result order (`4.4`).
pub struct WorkerPool {
    router: Arc<Router>,
}

impl WorkerPool {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Run every subtask as a `{system, user}` request dispatched
    /// through the plain (non-role-fallback) router call, balanced
    /// over `role`'s configured pool aliases. An empty `subtasks`
    /// returns an empty result vector without touching the balancer or
    /// any backend.
    pub async fn execute_all(&self, ctx: &CancellationToken, role: &str, system_prompt: &str, subtasks: Vec<String>) -> Vec<SubtaskResult> {
        if subtasks.is_empty() {
            return Vec::new();
        }

        let aliases = self.router.config().resolve_role_pool(role).to_vec();
        if aliases.is_empty() {
            return subtasks
                .into_iter()
                .map(|subtask| SubtaskResult {
                    subtask,
                    response: "error: role has no pool aliases configured".into(),
                    usage: TokenUsage::default(),
                })
                .collect();
        }

        let capacity = subtasks.len().min(aliases.len());
        let semaphore = Arc::new(Semaphore::new(capacity));
        let mut slots: Vec<Option<SubtaskResult>> = (0..subtasks.len()).map(|_| None).collect();

        let mut handles = Vec::with_capacity(subtasks.len());
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let router = Arc::clone(&self.router);
            let aliases = aliases.clone();
            let ctx = ctx.clone();
            let system_prompt = system_prompt.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("pool semaphore never closed");
                let result = run_subtask(&router, &ctx, &aliases, &system_prompt, subtask).await;
                (index, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_err) => log::error!("pool subtask task panicked: {join_err}"),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| SubtaskResult {
                    subtask: format!("<lost subtask {index}>"),
                    response: "error: worker task panicked".into(),
                    usage: TokenUsage::default(),
                })
            })
            .collect()
    }
}

/// Select an alias, dispatch, retry exactly once on the same alias if
/// the first attempt fails, and record a second failure as an
/// `"error: ..."` response rather than aborting the sibling subtasks.
async fn run_subtask(router: &Router, ctx: &CancellationToken, aliases: &[String], system_prompt: &str, subtask: String) -> SubtaskResult {
    let alias = router.balancer().select("pool", aliases, Strategy::RoundRobin).unwrap_or(aliases[0].as_str()).to_string();

    match router.chat_completion(ctx, build_request(&alias, system_prompt, &subtask)).await {
        Ok(response) => {
            return SubtaskResult { subtask, response: response.message.content, usage: response.usage };
        }
        Err(first_err) => {
            log::warn!("pool subtask on alias '{alias}' failed, retrying once: {first_err}");
        }
    }

    match router.chat_completion(ctx, build_request(&alias, system_prompt, &subtask)).await {
        Ok(response) => SubtaskResult { subtask, response: response.message.content, usage: response.usage },
        Err(second_err) => SubtaskResult { subtask, response: format!("error: {second_err}"), usage: TokenUsage::default() },
    }
}

fn build_request(alias: &str, system_prompt: &str, subtask: &str) -> ChatRequest {
    ChatRequest::new(alias, vec![Message::system(system_prompt), Message::user(subtask)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasConfig, AuthScheme, Config, ProviderConfig, ProviderKind, RoleConfig};
    use crate::error::ProviderError;
    use crate::provider::{ChatStream, Provider};
    use crate::request::{ChatResponse, FinishReason, ModelInfo};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// A deterministic fake backend. Fails its first `fail_times` calls
    /// per alias, then succeeds; tracks concurrently in-flight calls so
    /// tests can assert the pool's concurrency bound.
    struct FakeProvider {
        name: String,
        fail_times: usize,
        attempts: Mutex<HashMap<String, usize>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl FakeProvider {
        fn new(name: &str, fail_times: usize) -> Self {
            Self {
                name: name.to_string(),
                fail_times,
                attempts: Mutex::new(HashMap::new()),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                delay: Duration::from_millis(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn shared_counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
            (Arc::clone(&self.in_flight), Arc::clone(&self.max_in_flight))
        }
    }

    #[async_trait::async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat_completion(&self, _ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(request.model.clone()).or_insert(0);
            *count += 1;
            let this_attempt = *count;
            drop(attempts);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if this_attempt <= self.fail_times {
                return Err(ProviderError::Api {
                    status: 503,
                    code: None,
                    error_type: None,
                    message: format!("attempt {this_attempt} fails"),
                });
            }

            Ok(ChatResponse {
                id: "resp".into(),
                model: request.model,
                message: Message::assistant(format!("handled: {}", request.messages.last().unwrap().content)),
                usage: TokenUsage::new(1, 1),
                finish_reason: FinishReason::Stop,
            })
        }

        async fn stream_chat_completion(&self, _ctx: &CancellationToken, _request: ChatRequest) -> Result<ChatStream, ProviderError> {
            unimplemented!("not exercised by worker pool tests")
        }

        async fn list_models(&self, _ctx: &CancellationToken) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn config_with_pool(aliases: Vec<&str>) -> Arc<Config> {
        let mut providers = HashMap::new();
        providers.insert(
            "fake-provider".to_string(),
            ProviderConfig { kind: ProviderKind::OpenAi, base_url: "http://localhost".into(), credential: Some("x".into()), auth: AuthScheme::Bearer, organization: None },
        );

        let mut alias_map = HashMap::new();
        for alias in &aliases {
            alias_map.insert(alias.to_string(), AliasConfig { provider: "fake-provider".into(), model: alias.to_string() });
        }

        let mut roles = HashMap::new();
        roles.insert("worker".to_string(), RoleConfig { primary: aliases[0].to_string(), fallbacks: vec![], pool: aliases.iter().map(|a| a.to_string()).collect() });

        Arc::new(Config { providers, aliases: alias_map, roles, defaults: Default::default() })
    }

    fn router_with_fake(config: Arc<Config>, provider: Arc<dyn Provider>) -> Arc<Router> {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("fake-provider".to_string(), provider);
        Arc::new(Router::from_providers(config, providers))
    }

    #[tokio::test]
    async fn execute_all_preserves_subtask_order() {
        let config = config_with_pool(vec!["a", "b", "c"]);
        let provider = Arc::new(FakeProvider::new("fake-provider", 0));
        let router = router_with_fake(config, provider);
        let pool = WorkerPool::new(router);

        let ctx = CancellationToken::new();
        let subtasks: Vec<String> = vec!["one".into(), "two".into(), "three".into()];
        let results = pool.execute_all(&ctx, "worker", "be terse", subtasks.clone()).await;

        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.subtask, subtasks[i]);
            assert!(result.response.contains(&subtasks[i]));
        }
    }

    #[tokio::test]
    async fn execute_all_retries_once_then_succeeds() {
        let config = config_with_pool(vec!["a"]);
        let provider = Arc::new(FakeProvider::new("fake-provider", 1));
        let router = router_with_fake(config, provider);
        let pool = WorkerPool::new(router);

        let ctx = CancellationToken::new();
        let results = pool.execute_all(&ctx, "worker", "sys", vec!["only".into()]).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].response.contains("only"), "expected success after retry, got {}", results[0].response);
    }

    #[tokio::test]
    async fn execute_all_records_error_after_second_failure_without_aborting_siblings() {
        let config = config_with_pool(vec!["always-fails", "always-succeeds"]);
        let failing = Arc::new(FakeProvider::new("fake-provider", 99));
        let router = router_with_fake(config, failing);
        let pool = WorkerPool::new(router);

        let ctx = CancellationToken::new();
        let results = pool.execute_all(&ctx, "worker", "sys", vec!["a".into(), "b".into()]).await;

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.response.starts_with("error: "), "expected error response, got {}", result.response);
        }
    }

    #[tokio::test]
    async fn execute_all_on_empty_input_returns_empty_without_dispatch() {
        let config = config_with_pool(vec!["a"]);
        let provider = Arc::new(FakeProvider::new("fake-provider", 0));
        let router = router_with_fake(config, provider);
        let pool = WorkerPool::new(router);

        let ctx = CancellationToken::new();
        let results = pool.execute_all(&ctx, "worker", "sys", vec![]).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn execute_all_bounds_concurrency_to_pool_size() {
        let config = config_with_pool(vec!["a", "b"]);
        let provider = Arc::new(FakeProvider::new("fake-provider", 0).with_delay(Duration::from_millis(30)));
        let (in_flight, max_in_flight) = provider.shared_counters();
        let router = router_with_fake(config, provider);
        let pool = WorkerPool::new(router);

        let ctx = CancellationToken::new();
        let subtasks: Vec<String> = (0..5).map(|i| format!("task-{i}")).collect();
        let results = pool.execute_all(&ctx, "worker", "sys", subtasks).await;

        assert_eq!(results.len(), 5);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2, "observed {} in flight, pool size is 2", max_in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn execute_all_with_no_pool_aliases_configured_records_error_per_subtask() {
        let mut config = (*config_with_pool(vec!["a"])).clone();
        config.roles.insert("bare".to_string(), RoleConfig { primary: "a".into(), fallbacks: vec![], pool: vec![] });
        let provider = Arc::new(FakeProvider::new("fake-provider", 0));
        let router = router_with_fake(Arc::new(config), provider);
        let pool = WorkerPool::new(router);

        let ctx = CancellationToken::new();
        let results = pool.execute_all(&ctx, "bare", "sys", vec!["x".into()]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].response.contains("no pool aliases"));
    }
}
