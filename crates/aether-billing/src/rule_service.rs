use std::sync::LazyLock;

use aether_common::GatewayConfig;
use aether_storage::Storage;

use crate::cache::{RULE_CACHE_MAX_ENTRIES, RULE_CACHE_TTL, TtlCache};
use crate::rule_templates::{RuleTemplateContext, resolve_template_rule};
use crate::rules::{DefaultBillingRuleGenerator, VirtualBillingRule};

/// CLI equals chat in the billing domain.
pub fn effective_rule_task_type(task_type: &str) -> String {
    let normalized = task_type.trim().to_ascii_lowercase();
    if normalized == "cli" {
        "chat".to_string()
    } else {
        normalized
    }
}

#[derive(Debug, Clone)]
pub struct BillingRuleLookupResult {
    pub rule: VirtualBillingRule,
    pub scope: String,
    pub effective_task_type: String,
}

static RULE_CACHE: LazyLock<TtlCache<BillingRuleLookupResult>> =
    LazyLock::new(|| TtlCache::new(RULE_CACHE_TTL, RULE_CACHE_MAX_ENTRIES));

/// Drop every cached rule lookup (process-local).
pub fn invalidate_all() {
    RULE_CACHE.invalidate_all();
}

/// Drop cached lookups for one model name (process-local).
pub fn invalidate_model(model_name: &str) {
    RULE_CACHE.invalidate_containing(model_name);
}

pub struct BillingRuleService;

impl BillingRuleService {
    /// Resolve the billing rule for `(provider, model, task)`.
    ///
    /// Order: model config must exist; code templates by priority; the
    /// runtime default rule for chat (or any task when
    /// `billing_require_rule` is off). Results cache for five minutes keyed
    /// on everything that affects the outcome.
    pub async fn find_rule(
        storage: &dyn Storage,
        config: &GatewayConfig,
        provider_id: Option<i64>,
        model_name: &str,
        task_type: &str,
    ) -> Option<BillingRuleLookupResult> {
        let effective_task = effective_rule_task_type(task_type);
        let pid = provider_id.map(|id| id.to_string()).unwrap_or_default();
        let cache_key = format!(
            "{pid}:{model_name}:{effective_task}:require={}",
            u8::from(config.billing_require_rule)
        );
        if let Some(cached) = RULE_CACHE.get(&cache_key) {
            return Some(cached);
        }

        let global_model = storage.global_model(model_name).await.ok().flatten()?;

        let provider_model = match provider_id {
            Some(provider_id) => storage
                .provider_model(provider_id, global_model.id)
                .await
                .ok()
                .flatten(),
            None => None,
        };

        let ctx = RuleTemplateContext {
            global_config: global_model.config.clone(),
            model_config: provider_model.map(|m| m.config),
            provider_id,
            model_name: model_name.to_string(),
            task_type: effective_task.clone(),
        };

        if let Some(rule) = resolve_template_rule(&ctx) {
            let result = BillingRuleLookupResult {
                rule,
                scope: "default".to_string(),
                effective_task_type: effective_task,
            };
            RULE_CACHE.set(cache_key, result.clone());
            return Some(result);
        }

        // Runtime default keeps chat billing alive without an explicit rule;
        // other task types honor billing_require_rule.
        if effective_task == "chat" || !config.billing_require_rule {
            let rule = DefaultBillingRuleGenerator::generate(
                &ctx.global_config,
                ctx.model_config.as_ref(),
                &effective_task,
            );
            let result = BillingRuleLookupResult {
                rule,
                scope: "default".to_string(),
                effective_task_type: effective_task,
            };
            RULE_CACHE.set(cache_key, result.clone());
            return Some(result);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_normalizes_to_chat() {
        assert_eq!(effective_rule_task_type("cli"), "chat");
        assert_eq!(effective_rule_task_type("CLI"), "chat");
        assert_eq!(effective_rule_task_type("video"), "video");
    }
}
