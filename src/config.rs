//! Validated, process-wide configuration. Construction and file/format
//! loading are an external collaborator's job (`1`); this module only
//! defines the in-memory shape and the load-time invariants a caller
//! must satisfy before the orchestration core will route anything.

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Which wire protocol a provider entry speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

/// How credentials are presented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    Basic,
    None,
}

/// One configured backend.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// A literal credential, or an environment-variable reference
    /// (`$NAME`) resolved by [`Config::resolve_credentials`].
    pub credential: Option<String>,
    pub auth: AuthScheme,
    pub organization: Option<String>,
}

/// A named alias mapping to a concrete (provider, backend-model) pair.
#[derive(Debug, Clone)]
pub struct AliasConfig {
    pub provider: String,
    pub model: String,
}

/// A role's primary alias plus its fallback and pool aliases.
#[derive(Debug, Clone, Default)]
pub struct RoleConfig {
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub pool: Vec<String>,
}

/// Process-wide defaults consulted when a role isn't configured.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    pub default_alias: Option<String>,
    pub default_fallbacks: Vec<String>,
    pub log_dir: Option<PathBuf>,
}

/// The full validated configuration: providers, aliases, roles, and
/// defaults (`3`).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub providers: HashMap<String, ProviderConfig>,
    pub aliases: HashMap<String, AliasConfig>,
    pub roles: HashMap<String, RoleConfig>,
    pub defaults: Defaults,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("alias '{alias}' references unknown provider '{provider}'")]
    UnknownProvider { alias: String, provider: String },

    #[error("role '{role}' references unknown alias '{alias}'")]
    UnknownAlias { role: String, alias: String },

    #[error("role '{role}' fallback '{fallback}' resolves to the same backend model as primary '{primary}'")]
    PointlessFallback {
        role: String,
        primary: String,
        fallback: String,
    },

    #[error("provider '{provider}' uses basic auth but its credential is missing a colon separator")]
    MalformedBasicCredential { provider: String },

    #[error("provider '{provider}' uses bearer auth but has no credential configured")]
    MissingBearerCredential { provider: String },
}

impl Config {
    /// Run every load-time invariant in one pass (`3`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (alias_name, alias) in &self.aliases {
            if !self.providers.contains_key(&alias.provider) {
                return Err(ConfigError::UnknownProvider {
                    alias: alias_name.clone(),
                    provider: alias.provider.clone(),
                });
            }
        }

        for (role_name, role) in &self.roles {
            self.check_alias_exists(role_name, &role.primary)?;
            for fb in &role.fallbacks {
                self.check_alias_exists(role_name, fb)?;
                self.check_not_pointless(role_name, &role.primary, fb)?;
            }
            for p in &role.pool {
                self.check_alias_exists(role_name, p)?;
            }
        }

        for (provider_name, provider) in &self.providers {
            match provider.auth {
                AuthScheme::Bearer => {
                    let cred = provider.credential.as_deref().unwrap_or("");
                    if cred.is_empty() {
                        return Err(ConfigError::MissingBearerCredential {
                            provider: provider_name.clone(),
                        });
                    }
                }
                AuthScheme::Basic => {
                    if let Some(cred) = provider.credential.as_deref() {
                        if !cred.starts_with('$') && !cred.contains(':') {
                            return Err(ConfigError::MalformedBasicCredential {
                                provider: provider_name.clone(),
                            });
                        }
                    }
                }
                AuthScheme::None => {}
            }
        }

        Ok(())
    }

    fn check_alias_exists(&self, role_name: &str, alias: &str) -> Result<(), ConfigError> {
        if !self.aliases.contains_key(alias) {
            return Err(ConfigError::UnknownAlias {
                role: role_name.to_string(),
                alias: alias.to_string(),
            });
        }
        Ok(())
    }

    fn check_not_pointless(&self, role_name: &str, primary: &str, fallback: &str) -> Result<(), ConfigError> {
        let (Some(p), Some(f)) = (self.aliases.get(primary), self.aliases.get(fallback)) else {
            return Ok(());
        };
        if p.provider == f.provider && p.model == f.model {
            return Err(ConfigError::PointlessFallback {
                role: role_name.to_string(),
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve `$NAME` environment-variable credential references in
    /// place. `6`: bearer-with-empty is a fatal load-time error (caught
    /// by [`Config::validate`] once the indirection is resolved);
    /// basic-with-empty simply defers the malformed-credential check to
    /// `validate`, which tolerates an unresolved `$`-prefixed reference.
    pub fn resolve_credentials(&mut self) {
        for provider in self.providers.values_mut() {
            if let Some(cred) = provider.credential.as_ref() {
                if let Some(var_name) = cred.strip_prefix('$') {
                    provider.credential = std::env::var(var_name).ok();
                }
            }
        }
    }

    /// The alias a role resolves to for its primary slot, falling back
    /// to process-wide defaults when the role itself isn't configured
    /// (`9`: "treat the role table as a mapping with an inheritance
    /// rule, not as a tree").
    pub fn resolve_role_primary(&self, role: &str) -> Option<&str> {
        if let Some(r) = self.roles.get(role) {
            return Some(r.primary.as_str());
        }
        self.defaults.default_alias.as_deref()
    }

    /// The fallback chain for a role, falling back to
    /// `defaults.default_fallbacks` when the role itself isn't
    /// configured.
    pub fn resolve_role_fallbacks(&self, role: &str) -> &[String] {
        match self.roles.get(role) {
            Some(r) => &r.fallbacks,
            None => &self.defaults.default_fallbacks,
        }
    }

    pub fn resolve_role_pool(&self, role: &str) -> &[String] {
        match self.roles.get(role) {
            Some(r) => &r.pool,
            None => &[],
        }
    }
}
