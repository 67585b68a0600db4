//! The gateway's bootstrap config: which adapters to register, how routes/
//! aliases/fallback chains wire them together, and the optional scheduler/
//! quota/time-window settings. Deserialized from TOML (the teacher's own
//! `--providers` file was a plain plugin manifest; this generalizes the same
//! "one file describes the whole running topology" idea to the Adapter
//! Router and Priority Scheduler).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use querymt::dialect::Dialect;
use querymt::responses::ResponsesSessionStore;
use querymt::router::{AdapterHandle, AdapterRouter, FallbackAdapter};
use querymt::scheduler::{AccountQuota, CapacityLimits, PriorityScheduler, SchedulerConfig, TimeWindowRule};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub models: Vec<ModelConfig>,
    pub routes: Vec<RouteConfig>,
    /// The base alias source (spec §6: `model_aliases`). Merged with
    /// `model_aliases_file` then `model_aliases_dir`, in that order, each
    /// later source overriding keys from the earlier ones.
    pub aliases: HashMap<String, String>,
    /// `model_aliases_file` - a single TOML or JSON file of `pattern -> id`
    /// overrides, reread on every hot-reload tick.
    pub model_aliases_file: Option<PathBuf>,
    /// `model_aliases_dir` - a directory of such files, merged in filename
    /// order (so deployments can drop one override file per team/tier).
    pub model_aliases_dir: Option<PathBuf>,
    /// How often the file/dir sources are reread and atomically swapped
    /// into the [`AdapterRouter`]'s alias table. `0` disables hot-reload;
    /// the merged sources are still loaded once at startup.
    #[serde(default = "default_alias_reload_secs")]
    pub alias_reload_secs: u64,
    pub fallback: Option<String>,
    pub fallback_chains: Vec<FallbackChainConfig>,
    pub scheduler: SchedulerSection,
    pub account_quotas: Vec<AccountQuotaConfig>,
    pub time_window_rules: Vec<TimeWindowRuleConfig>,
    pub responses: ResponsesSection,
}

fn default_alias_reload_secs() -> u64 {
    60
}

/// One upstream model to register under the Adapter Router. `adapter` names
/// the upstream kind (`openai`, `anthropic`, `ollama`, `passthrough`); `id`
/// is the name requests address it by and is merged into `config` as the
/// `model` field before it's handed to the adapter's factory, since each
/// upstream struct bakes its model in at construction time rather than
/// reading it per-request.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub adapter: String,
    #[serde(default)]
    pub config: Value,
    /// Overrides the adapter's `api_key_name()` environment variable; set
    /// directly when a deployment keys multiple models off different
    /// credentials for the same upstream.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RouteConfig {
    pub pattern: String,
    pub adapter: String,
}

#[derive(Debug, Deserialize)]
pub struct FallbackChainConfig {
    pub name: String,
    pub members: Vec<String>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub priority_levels: usize,
    pub default_priority: u8,
    pub weights: Vec<f64>,
    pub max_concurrent: u32,
    pub max_rps: u32,
    pub max_tokens_per_sec: u32,
    pub max_context_length: u32,
    pub queue_timeout_sec: u64,
    pub tick_interval_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            priority_levels: querymt::scheduler::MAX_PRIORITY_LEVELS,
            default_priority: 5,
            weights: vec![1.0; querymt::scheduler::MAX_PRIORITY_LEVELS],
            max_concurrent: u32::MAX,
            max_rps: u32::MAX,
            max_tokens_per_sec: u32::MAX,
            max_context_length: u32::MAX,
            queue_timeout_sec: 30,
            tick_interval_ms: 200,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountQuotaConfig {
    pub pattern: String,
    #[serde(default = "u32::max_value")]
    pub max_concurrent: u32,
    #[serde(default = "u32::max_value")]
    pub max_rps: u32,
    #[serde(default = "u32::max_value")]
    pub max_tokens_per_sec: u32,
}

#[derive(Debug, Deserialize)]
pub struct TimeWindowRuleConfig {
    pub name: String,
    /// Weekday mask bit `i` (0 = Monday) set means active that weekday.
    pub weekday_mask: u8,
    pub start: (u8, u8),
    pub end: (u8, u8),
    #[serde(default)]
    pub utc_offset_minutes: i32,
    pub weight_overrides: Option<Vec<f64>>,
    pub capacity_overrides: Option<CapacityOverridesConfig>,
}

#[derive(Debug, Deserialize)]
pub struct CapacityOverridesConfig {
    pub max_tokens_per_sec: Option<u32>,
    pub max_rps: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_context_length: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ResponsesSection {
    pub session_ttl_secs: u64,
    pub max_sessions: usize,
    pub sweep_interval_secs: u64,
}

impl Default for ResponsesSection {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            max_sessions: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

/// Parses one alias-override file, either TOML or JSON (tried in that
/// order, since both are plain `pattern -> id` string maps and the `.toml`
/// parser rejects a JSON document outright rather than silently
/// misreading it).
fn parse_alias_file(path: &Path) -> Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading alias file {}", path.display()))?;
    if let Ok(map) = toml::from_str::<HashMap<String, String>>(&raw) {
        return Ok(map);
    }
    serde_json::from_str(&raw).with_context(|| format!("parsing alias file {} as TOML or JSON", path.display()))
}

/// Merges `model_aliases` (base) with `model_aliases_file` then
/// `model_aliases_dir`, in that order (spec §6): each later source
/// overrides keys from the earlier ones. Directory entries are merged in
/// filename order for deterministic precedence; unreadable files are
/// logged and skipped rather than failing the whole reload, so one bad
/// drop-in doesn't take down the live alias table.
fn load_merged_aliases(cfg: &GatewayConfig) -> HashMap<String, String> {
    let mut merged = cfg.aliases.clone();

    if let Some(path) = &cfg.model_aliases_file {
        match parse_alias_file(path) {
            Ok(map) => merged.extend(map),
            Err(e) => warn!(error = %e, path = %path.display(), "skipping unreadable model_aliases_file"),
        }
    }

    if let Some(dir) = &cfg.model_aliases_dir {
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).filter(|p| p.is_file()).collect();
                paths.sort();
                for path in paths {
                    match parse_alias_file(&path) {
                        Ok(map) => merged.extend(map),
                        Err(e) => warn!(error = %e, path = %path.display(), "skipping unreadable model_aliases_dir entry"),
                    }
                }
            }
            Err(e) => warn!(error = %e, dir = %dir.display(), "could not read model_aliases_dir"),
        }
    }

    merged
}

/// Spawns the alias hot-reloader (spec §6, DESIGN NOTES §9): every
/// `alias_reload_secs`, rereads `model_aliases_file`/`model_aliases_dir`
/// and atomically swaps the merged table into the router via
/// [`AdapterRouter::set_aliases`]. Readers (`find_adapter`/`rewrite_alias`)
/// take their own lock snapshot per call, so an in-flight request never
/// observes a half-applied swap. Returns `None` when reload is disabled
/// (`alias_reload_secs == 0`) or neither file nor dir source is configured.
fn spawn_alias_reloader(router: Arc<AdapterRouter>, cfg: Arc<GatewayConfig>) -> Option<tokio::task::JoinHandle<()>> {
    if cfg.alias_reload_secs == 0 || (cfg.model_aliases_file.is_none() && cfg.model_aliases_dir.is_none()) {
        return None;
    }
    let period = Duration::from_secs(cfg.alias_reload_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately; the initial load already happened in build_state
        loop {
            ticker.tick().await;
            let merged = load_merged_aliases(&cfg);
            info!(count = merged.len(), "reloaded model aliases");
            router.set_aliases(merged);
        }
    }))
}

/// Builds one upstream adapter from a registered factory plus its merged
/// config. Not used for `passthrough`, which has no `HTTPLLMProviderFactory`
/// at all and is registered directly as an [`LLMProvider`].
fn build_http_adapter(kind: &str, model_id: &str, mut cfg: Value, api_key_env: Option<&str>) -> Result<AdapterHandle> {
    let factory: Box<dyn querymt::factory::HTTPLLMProviderFactory> = match kind {
        "openai" => qmt_openai::factory(),
        "anthropic" => qmt_anthropic::factory(),
        "ollama" => qmt_ollama::factory(),
        other => return Err(anyhow!("unknown adapter kind `{other}`")),
    };

    let obj = cfg.as_object_mut().ok_or_else(|| anyhow!("model `{model_id}` config must be a table"))?;
    obj.insert("model".to_string(), Value::String(model_id.to_string()));

    if !obj.contains_key("api_key") {
        let env_name = api_key_env.map(str::to_string).or_else(|| factory.api_key_name());
        if let Some(env_name) = env_name {
            if let Ok(key) = std::env::var(&env_name) {
                obj.insert("api_key".to_string(), Value::String(key));
            }
        }
    }

    let schema = factory.config_schema();
    let pruned = querymt::builder::prune_config_by_schema(&cfg, &schema);

    let provider = factory
        .from_config(&pruned)
        .map_err(|e| anyhow!("building `{model_id}` ({kind}): {e}"))?;
    let provider: Arc<dyn querymt::HTTPLLMProvider> = Arc::from(provider);
    Ok(Arc::new(querymt::adapters::LLMProviderFromHTTP::new(provider)))
}

/// Every adapter kind's native tool-calling dialect, used to decide which
/// `(source, target)` pair the Tool Adapter runs for a given request.
fn native_dialect(kind: &str) -> Dialect {
    match kind {
        "anthropic" => Dialect::Anthropic,
        _ => Dialect::OpenAiChat,
    }
}

pub fn build_state(cfg: GatewayConfig, auth_key: Option<String>) -> Result<AppState> {
    let cfg = Arc::new(cfg);
    let router = Arc::new(AdapterRouter::new());
    let mut adapter_dialect: HashMap<String, Dialect> = HashMap::new();
    let mut model_ids: Vec<String> = Vec::new();

    if cfg.models.is_empty() && cfg.fallback_chains.is_empty() {
        info!("no models configured, registering the passthrough loopback adapter");
        let adapter: AdapterHandle = Arc::new(qmt_passthrough::Passthrough::new());
        router.register_adapter("passthrough", adapter)?;
        router.set_fallback(Some("passthrough"));
        adapter_dialect.insert("passthrough".to_string(), Dialect::OpenAiChat);
        model_ids.push("passthrough".to_string());
    } else {
        for model in &cfg.models {
            let adapter = if model.adapter == "passthrough" {
                Arc::new(qmt_passthrough::Passthrough::new()) as AdapterHandle
            } else {
                build_http_adapter(&model.adapter, &model.id, model.config.clone(), model.api_key_env.as_deref())
                    .with_context(|| format!("registering model `{}`", model.id))?
            };
            router.register_adapter(&model.id, adapter)?;
            adapter_dialect.insert(model.id.clone(), native_dialect(&model.adapter));
            model_ids.push(model.id.clone());
        }

        for chain in &cfg.fallback_chains {
            let members: Vec<AdapterHandle> = chain
                .members
                .iter()
                .map(|name| {
                    router
                        .find_adapter(name)
                        .map(|(_, a)| a)
                        .map_err(|e| anyhow!("fallback chain `{}` references unknown adapter `{name}`: {e}", chain.name))
                })
                .collect::<Result<_>>()?;
            let native = chain
                .members
                .first()
                .and_then(|name| adapter_dialect.get(name))
                .copied()
                .unwrap_or(Dialect::OpenAiChat);
            let adapter: AdapterHandle = Arc::new(FallbackAdapter::new(
                members,
                chain.retry_count,
                Duration::from_millis(chain.retry_delay_ms),
            ));
            router.register_adapter(&chain.name, adapter)?;
            adapter_dialect.insert(chain.name.clone(), native);
            model_ids.push(chain.name.clone());
        }

        for route in &cfg.routes {
            router.register_route(&route.pattern, &route.adapter)?;
        }
        if let Some(fallback) = &cfg.fallback {
            router.set_fallback(Some(fallback));
        }
    }

    let merged_aliases = load_merged_aliases(&cfg);
    info!(count = merged_aliases.len(), "loaded model aliases");
    router.set_aliases(merged_aliases);
    // Detached background task; torn down with the process like the
    // Responses session sweeper below.
    let _alias_reloader = spawn_alias_reloader(router.clone(), cfg.clone());

    let scheduler = if cfg.scheduler.enabled {
        let account_quotas = cfg
            .account_quotas
            .iter()
            .map(|q| AccountQuota {
                pattern: querymt::router::Pattern::new(q.pattern.clone()),
                max_concurrent: q.max_concurrent,
                max_rps: q.max_rps,
                max_tokens_per_sec: q.max_tokens_per_sec,
            })
            .collect();

        let config = SchedulerConfig {
            priority_levels: cfg.scheduler.priority_levels,
            weights: cfg.scheduler.weights.clone(),
            limits: CapacityLimits {
                max_tokens_per_sec: cfg.scheduler.max_tokens_per_sec,
                max_rps: cfg.scheduler.max_rps,
                max_concurrent: cfg.scheduler.max_concurrent,
                max_context_length: cfg.scheduler.max_context_length,
            },
            account_quotas,
            queue_timeout: Duration::from_secs(cfg.scheduler.queue_timeout_sec),
            tick_interval: Duration::from_millis(cfg.scheduler.tick_interval_ms),
        };
        let (scheduler, _handle) = PriorityScheduler::start(config);

        if !cfg.time_window_rules.is_empty() {
            let rules = cfg
                .time_window_rules
                .iter()
                .map(|r| TimeWindowRule {
                    name: r.name.clone(),
                    weekday_mask: r.weekday_mask,
                    start: r.start,
                    end: r.end,
                    utc_offset_minutes: r.utc_offset_minutes,
                    weight_overrides: r.weight_overrides.clone(),
                    capacity_overrides: r.capacity_overrides.as_ref().map(|c| CapacityLimits {
                        max_tokens_per_sec: c.max_tokens_per_sec.unwrap_or(u32::MAX),
                        max_rps: c.max_rps.unwrap_or(u32::MAX),
                        max_concurrent: c.max_concurrent.unwrap_or(u32::MAX),
                        max_context_length: c.max_context_length.unwrap_or(u32::MAX),
                    }),
                })
                .collect();
            scheduler.set_rules(rules);
        }

        Some(scheduler)
    } else {
        None
    };

    let responses_store = Arc::new(ResponsesSessionStore::new(
        Duration::from_secs(cfg.responses.session_ttl_secs),
        cfg.responses.max_sessions,
    ));
    responses_store.spawn_sweeper(Duration::from_secs(cfg.responses.sweep_interval_secs));

    Ok(AppState {
        router,
        adapter_dialect: Arc::new(adapter_dialect),
        scheduler,
        default_priority: cfg.scheduler.default_priority,
        responses_store,
        auth_key,
        model_ids: Arc::new(model_ids),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("qmt-alias-test-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn merges_base_file_and_dir_in_precedence_order() {
        let dir = scratch_dir("merge");
        let file_path = dir.join("aliases.toml");
        std::fs::write(&file_path, "claude-3-haiku = \"claude-3-5-haiku-20241022\"\ngpt-4 = \"gpt-4-from-file\"\n").unwrap();

        let overrides_dir = dir.join("overrides");
        std::fs::create_dir_all(&overrides_dir).unwrap();
        std::fs::write(overrides_dir.join("a.json"), r#"{"gpt-4": "gpt-4-from-dir"}"#).unwrap();

        let mut cfg = GatewayConfig::default();
        cfg.aliases.insert("gpt-4".to_string(), "gpt-4-from-base".to_string());
        cfg.aliases.insert("base-only".to_string(), "stays".to_string());
        cfg.model_aliases_file = Some(file_path);
        cfg.model_aliases_dir = Some(overrides_dir);

        let merged = load_merged_aliases(&cfg);
        assert_eq!(merged.get("base-only").map(String::as_str), Some("stays"));
        assert_eq!(merged.get("claude-3-haiku").map(String::as_str), Some("claude-3-5-haiku-20241022"));
        // dir overrides file overrides base for the same key.
        assert_eq!(merged.get("gpt-4").map(String::as_str), Some("gpt-4-from-dir"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_sources_fall_back_to_base_only() {
        let mut cfg = GatewayConfig::default();
        cfg.aliases.insert("only".to_string(), "one".to_string());
        let merged = load_merged_aliases(&cfg);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("only").map(String::as_str), Some("one"));
    }

    #[test]
    fn reloader_is_disabled_without_sources_or_interval() {
        let router = Arc::new(AdapterRouter::new());
        let mut cfg = GatewayConfig::default();
        cfg.model_aliases_file = Some(PathBuf::from("/does/not/matter"));
        cfg.alias_reload_secs = 0;
        assert!(spawn_alias_reloader(router.clone(), Arc::new(cfg)).is_none());

        let cfg_no_sources = GatewayConfig::default();
        assert!(spawn_alias_reloader(router, Arc::new(cfg_no_sources)).is_none());
    }
}
