//! Model/role resolution and the retry/fallback policy (`4.2`).

use crate::balancer::Balancer;
use crate::config::{Config, ProviderKind};
use crate::error::{classify, ProviderError};
use crate::provider::{AnthropicProvider, ChatStream, GeminiProvider, OllamaProvider, OpenAiProvider, Provider};
use crate::request::{ChatRequest, ChatResponse, ModelInfo, TokenUsage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Notified with usage after every completed buffered response. `None`
/// (no observer configured) is always a valid, branch-free no-op.
pub trait CostObserver: Send + Sync {
    fn record(&self, provider: &str, model: &str, role: &str, usage: TokenUsage);
}

/// Resolves aliases and roles to a concrete adapter call, applying the
/// fallback ladder on retryable errors (`4.2.1`).
pub struct Router {
    config: Arc<Config>,
    providers: HashMap<String, Arc<dyn Provider>>,
    balancer: Balancer,
    cost_observer: Option<Arc<dyn CostObserver>>,
}

impl Router {
    /// Build adapter instances for every configured provider, keyed by
    /// provider name. Credentials must already be resolved
    /// (`Config::resolve_credentials`) before calling this.
    pub fn from_config(config: Arc<Config>) -> Self {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, provider_config) in &config.providers {
            let adapter: Arc<dyn Provider> = match provider_config.kind {
                ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                    name.clone(),
                    provider_config.base_url.clone(),
                    provider_config.credential.clone().unwrap_or_default(),
                    provider_config.organization.clone(),
                )),
                ProviderKind::Anthropic => {
                    Arc::new(AnthropicProvider::new(name.clone(), provider_config.base_url.clone(), provider_config.credential.clone().unwrap_or_default()))
                }
                ProviderKind::Gemini => Arc::new(GeminiProvider::new(
                    name.clone(),
                    Some(provider_config.base_url.clone()),
                    provider_config.credential.clone().unwrap_or_default(),
                )),
                ProviderKind::Ollama => Arc::new(OllamaProvider::new(
                    name.clone(),
                    Some(provider_config.base_url.clone()),
                    provider_config.auth,
                    provider_config.credential.clone(),
                )),
            };
            providers.insert(name.clone(), adapter);
        }

        Self { config, providers, balancer: Balancer::new(), cost_observer: None }
    }

    /// Build a router directly from already-constructed adapters,
    /// bypassing `from_config`'s concrete-type dispatch. Used by the
    /// worker pool's test suite to inject deterministic fakes.
    #[cfg(test)]
    pub(crate) fn from_providers(config: Arc<Config>, providers: HashMap<String, Arc<dyn Provider>>) -> Self {
        Self { config, providers, balancer: Balancer::new(), cost_observer: None }
    }

    pub fn with_cost_observer(mut self, observer: Arc<dyn CostObserver>) -> Self {
        self.cost_observer = Some(observer);
        self
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Resolve a free-form model reference (`4.2.2`): alias, then bare
    /// provider name, then `<providerName>/<backendModel>`.
    fn resolve_model(&self, reference: &str) -> Result<(Arc<dyn Provider>, String), ProviderError> {
        if let Some(alias) = self.config.aliases.get(reference) {
            let provider = self
                .providers
                .get(&alias.provider)
                .ok_or_else(|| ProviderError::Config(format!("alias '{reference}' references unknown provider '{}'", alias.provider)))?;
            return Ok((provider.clone(), alias.model.clone()));
        }

        if let Some(provider) = self.providers.get(reference) {
            return Ok((provider.clone(), reference.to_string()));
        }

        if let Some((provider_name, model_name)) = reference.split_once('/') {
            if let Some(provider) = self.providers.get(provider_name) {
                return Ok((provider.clone(), model_name.to_string()));
            }
        }

        Err(ProviderError::Config(format!("could not resolve model reference '{reference}'")))
    }

    fn resolve_alias(&self, alias_name: &str) -> Result<(Arc<dyn Provider>, String), ProviderError> {
        self.resolve_model(alias_name)
    }

    /// Resolve `request.model` as an alias or provider literal and
    /// dispatch, with no role-level fallback.
    pub async fn chat_completion(&self, ctx: &CancellationToken, mut request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let (provider, backend_model) = self.resolve_model(&request.model)?;
        request.model = backend_model;
        let response = provider.chat_completion(ctx, request).await?;
        self.notify_observer(provider.name(), &response.model, "", response.usage);
        Ok(response)
    }

    /// Resolve `role` to its primary alias and dispatch; on a
    /// retryable error, walk the role's fallback chain in order.
    pub async fn chat_completion_for_role(&self, ctx: &CancellationToken, role: &str, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let primary = self
            .config
            .resolve_role_primary(role)
            .ok_or_else(|| ProviderError::Config(format!("role '{role}' has no primary alias and no default is configured")))?
            .to_string();

        match self.dispatch_chat_completion(ctx, &primary, request.clone()).await {
            Ok((provider_name, response)) => {
                self.notify_observer(&provider_name, &response.model, role, response.usage);
                return Ok(response);
            }
            Err(primary_err) => {
                let fallbacks = self.config.resolve_role_fallbacks(role);
                if fallbacks.is_empty() || !classify(&primary_err).is_retryable() {
                    return Err(primary_err);
                }

                for fallback in fallbacks {
                    log::warn!("role '{role}' falling back to alias '{fallback}' after {:?}", classify(&primary_err));
                    if let Ok((provider_name, response)) = self.dispatch_chat_completion(ctx, fallback, request.clone()).await {
                        self.notify_observer(&provider_name, &response.model, role, response.usage);
                        return Ok(response);
                    }
                }

                Err(ProviderError::FallbacksExhausted { source: Box::new(primary_err) })
            }
        }
    }

    /// Same resolution as [`Router::chat_completion_for_role`], but
    /// fallback only applies to the stream *open*; once opened
    /// successfully, mid-stream errors propagate to the caller
    /// unmodified.
    pub async fn stream_chat_completion_for_role(&self, ctx: &CancellationToken, role: &str, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        let primary = self
            .config
            .resolve_role_primary(role)
            .ok_or_else(|| ProviderError::Config(format!("role '{role}' has no primary alias and no default is configured")))?
            .to_string();

        match self.dispatch_stream_open(ctx, &primary, request.clone()).await {
            Ok(stream) => Ok(stream),
            Err(primary_err) => {
                let fallbacks = self.config.resolve_role_fallbacks(role);
                if fallbacks.is_empty() || !classify(&primary_err).is_retryable() {
                    return Err(primary_err);
                }

                for fallback in fallbacks {
                    log::warn!("role '{role}' stream falling back to alias '{fallback}' after {:?}", classify(&primary_err));
                    if let Ok(stream) = self.dispatch_stream_open(ctx, fallback, request.clone()).await {
                        return Ok(stream);
                    }
                }

                Err(ProviderError::StreamFallbacksExhausted { source: Box::new(primary_err) })
            }
        }
    }

    /// Aggregate `list_models` over every configured provider,
    /// best-effort: a failing adapter is omitted and logged at `warn`.
    pub async fn list_all_models(&self, ctx: &CancellationToken) -> Vec<ModelInfo> {
        let mut all = Vec::new();
        for (name, provider) in &self.providers {
            match provider.list_models(ctx).await {
                Ok(models) => all.extend(models),
                Err(e) => log::warn!("omitting provider '{name}' from model inventory: {e}"),
            }
        }
        all
    }

    async fn dispatch_chat_completion(&self, ctx: &CancellationToken, alias: &str, mut request: ChatRequest) -> Result<(String, ChatResponse), ProviderError> {
        let (provider, backend_model) = self.resolve_alias(alias)?;
        request.model = backend_model;
        let name = provider.name().to_string();
        let response = provider.chat_completion(ctx, request).await?;
        Ok((name, response))
    }

    async fn dispatch_stream_open(&self, ctx: &CancellationToken, alias: &str, mut request: ChatRequest) -> Result<ChatStream, ProviderError> {
        let (provider, backend_model) = self.resolve_alias(alias)?;
        request.model = backend_model;
        provider.stream_chat_completion(ctx, request).await
    }

    fn notify_observer(&self, provider: &str, model: &str, role: &str, usage: TokenUsage) {
        if let Some(observer) = &self.cost_observer {
            observer.record(provider, model, role, usage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasConfig, AuthScheme, ProviderConfig, RoleConfig};
    use crate::message::Message;

    fn test_config() -> Arc<Config> {
        let mut providers = HashMap::new();
        providers.insert(
            "openai-main".to_string(),
            ProviderConfig { kind: ProviderKind::OpenAi, base_url: "https://api.openai.com/v1".into(), credential: Some("sk-test".into()), auth: AuthScheme::Bearer, organization: None },
        );

        let mut aliases = HashMap::new();
        aliases.insert("fast".to_string(), AliasConfig { provider: "openai-main".into(), model: "gpt-4o-mini".into() });

        Arc::new(Config { providers, aliases, roles: HashMap::new(), defaults: Default::default() })
    }

    #[test]
    fn resolves_alias_to_provider_and_backend_model() {
        let router = Router::from_config(test_config());
        let (provider, model) = router.resolve_model("fast").unwrap();
        assert_eq!(provider.name(), "openai-main");
        assert_eq!(model, "gpt-4o-mini");
    }

    #[test]
    fn resolves_bare_provider_name_with_reference_as_model() {
        let router = Router::from_config(test_config());
        let (provider, model) = router.resolve_model("openai-main").unwrap();
        assert_eq!(provider.name(), "openai-main");
        assert_eq!(model, "openai-main");
    }

    #[test]
    fn resolves_provider_slash_model_literal() {
        let router = Router::from_config(test_config());
        let (provider, model) = router.resolve_model("openai-main/gpt-4-turbo").unwrap();
        assert_eq!(provider.name(), "openai-main");
        assert_eq!(model, "gpt-4-turbo");
    }

    #[test]
    fn unresolvable_reference_is_a_config_error() {
        let router = Router::from_config(test_config());
        assert!(router.resolve_model("no-such-thing").is_err());
    }

    #[tokio::test]
    async fn no_fallbacks_configured_returns_primary_error_verbatim() {
        let mut config = (*test_config()).clone();
        config.roles.insert("leader".to_string(), RoleConfig { primary: "fast".into(), fallbacks: vec![], pool: vec![] });
        let router = Router::from_config(Arc::new(config));

        let ctx = CancellationToken::new();
        ctx.cancel();
        let request = ChatRequest::new("fast", vec![Message::user("hi")]);
        let err = router.chat_completion_for_role(&ctx, "leader", request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[derive(Default)]
    struct RecordingObserver {
        calls: std::sync::Mutex<Vec<(String, String, String, TokenUsage)>>,
    }

    impl CostObserver for RecordingObserver {
        fn record(&self, provider: &str, model: &str, role: &str, usage: TokenUsage) {
            self.calls.lock().unwrap().push((provider.to_string(), model.to_string(), role.to_string(), usage));
        }
    }

    #[test]
    fn cost_observer_none_is_a_no_op() {
        let router = Router::from_config(test_config());
        router.notify_observer("p", "m", "r", TokenUsage::new(1, 1));
    }

    // ── Fallback ladder: SPEC_FULL §8 scenarios 3 and 4 ────────────────

    use crate::request::FinishReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A provider whose every call returns the same scripted outcome,
    /// counting how many times it was dispatched to.
    struct ScriptedProvider {
        name: String,
        outcome: Result<(), ProviderError>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn succeeding(name: &str) -> Self {
            Self { name: name.to_string(), outcome: Ok(()), calls: AtomicUsize::new(0) }
        }

        fn failing_with(name: &str, status: u16, message: &str) -> Self {
            Self {
                name: name.to_string(),
                outcome: Err(ProviderError::Api { status, code: None, error_type: None, message: message.to_string() }),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat_completion(&self, _ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Ok(()) => Ok(ChatResponse {
                    id: "resp".into(),
                    model: request.model,
                    message: Message::assistant(format!("handled by {}", self.name)),
                    usage: TokenUsage::new(1, 1),
                    finish_reason: FinishReason::Stop,
                }),
                Err(e) => Err(clone_provider_error(e)),
            }
        }

        async fn stream_chat_completion(&self, _ctx: &CancellationToken, _request: ChatRequest) -> Result<ChatStream, ProviderError> {
            unimplemented!("not exercised by fallback-ladder tests")
        }

        async fn list_models(&self, _ctx: &CancellationToken) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(Vec::new())
        }
    }

    /// `ProviderError` doesn't derive `Clone` (it wraps non-`Clone`
    /// upstream error types); scripted tests only ever need to repeat
    /// an `Api` variant, so clone that shape directly.
    fn clone_provider_error(err: &ProviderError) -> ProviderError {
        match err {
            ProviderError::Api { status, code, error_type, message } => {
                ProviderError::Api { status: *status, code: code.clone(), error_type: error_type.clone(), message: message.clone() }
            }
            other => ProviderError::Config(other.to_string()),
        }
    }

    fn fallback_ladder_config(primary_status: u16, primary_message: &str) -> (Arc<Config>, Arc<ScriptedProvider>, Arc<ScriptedProvider>) {
        let mut providers = HashMap::new();
        providers.insert(
            "provider-a".to_string(),
            ProviderConfig { kind: ProviderKind::OpenAi, base_url: "https://a.example.com".into(), credential: Some("key-a".into()), auth: AuthScheme::Bearer, organization: None },
        );
        providers.insert(
            "provider-b".to_string(),
            ProviderConfig { kind: ProviderKind::OpenAi, base_url: "https://b.example.com".into(), credential: Some("key-b".into()), auth: AuthScheme::Bearer, organization: None },
        );

        let mut aliases = HashMap::new();
        aliases.insert("primary-alias".to_string(), AliasConfig { provider: "provider-a".into(), model: "model-a".into() });
        aliases.insert("fallback-alias".to_string(), AliasConfig { provider: "provider-b".into(), model: "model-b".into() });

        let mut roles = HashMap::new();
        roles.insert("leader".to_string(), RoleConfig { primary: "primary-alias".into(), fallbacks: vec!["fallback-alias".into()], pool: vec![] });

        let config = Arc::new(Config { providers, aliases, roles, defaults: Default::default() });
        let primary = Arc::new(ScriptedProvider::failing_with("provider-a", primary_status, primary_message));
        let fallback = Arc::new(ScriptedProvider::succeeding("provider-b"));
        (config, primary, fallback)
    }

    fn router_with_scripted(config: Arc<Config>, primary: Arc<ScriptedProvider>, fallback: Arc<ScriptedProvider>) -> Router {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("provider-a".to_string(), primary);
        providers.insert("provider-b".to_string(), fallback);
        Router::from_providers(config, providers)
    }

    #[tokio::test]
    async fn retryable_primary_error_falls_back_and_returns_fallback_response() {
        let (config, primary, fallback) = fallback_ladder_config(429, "rate limited");
        let router = router_with_scripted(config, Arc::clone(&primary), Arc::clone(&fallback));

        let ctx = CancellationToken::new();
        let request = ChatRequest::new("primary-alias", vec![Message::user("hi")]);
        let response = router.chat_completion_for_role(&ctx, "leader", request).await.unwrap();

        assert_eq!(response.model, "model-b");
        assert!(response.message.content.contains("provider-b"));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_error_is_not_retryable_and_skips_the_fallback_ladder() {
        let (config, primary, fallback) = fallback_ladder_config(401, "invalid api key");
        let router = router_with_scripted(config, Arc::clone(&primary), Arc::clone(&fallback));

        let ctx = CancellationToken::new();
        let request = ChatRequest::new("primary-alias", vec![Message::user("hi")]);
        let err = router.chat_completion_for_role(&ctx, "leader", request).await.unwrap_err();

        match err {
            ProviderError::Api { status, .. } => assert_eq!(status, 401),
            other => panic!("expected the primary's 401 surfaced verbatim, got {other:?}"),
        }
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0, "fallback must not be dispatched to on a non-retryable error");
    }
}
