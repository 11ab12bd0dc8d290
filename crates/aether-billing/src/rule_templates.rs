use serde_json::Value;

use crate::rules::VirtualBillingRule;

/// Everything a template needs to synthesize a rule for one lookup.
#[derive(Debug, Clone)]
pub struct RuleTemplateContext {
    pub global_config: Value,
    pub model_config: Option<Value>,
    pub provider_id: Option<i64>,
    pub model_name: String,
    /// Already normalized (`cli` folded into `chat`).
    pub task_type: String,
}

pub type MatchFn = fn(&RuleTemplateContext) -> bool;
pub type BuildFn = fn(&RuleTemplateContext) -> VirtualBillingRule;

/// A code-defined billing template. Adding a billing mode means adding a
/// module under `rule_defs` and listing it in `discover_rule_templates`.
#[derive(Debug, Clone, Copy)]
pub struct CodeBillingRuleTemplate {
    pub name: &'static str,
    pub description: &'static str,
    /// Billing-domain task types; `cli` never appears here.
    pub task_types: &'static [&'static str],
    pub priority: i32,
    pub matches: Option<MatchFn>,
    pub build: BuildFn,
}

impl CodeBillingRuleTemplate {
    pub fn supports(&self, task_type: &str) -> bool {
        self.task_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(task_type))
    }
}

/// All built-in templates, highest priority first (stable within a module).
pub fn discover_rule_templates() -> Vec<CodeBillingRuleTemplate> {
    let mut templates = crate::rule_defs::universal::TEMPLATES.to_vec();
    templates.sort_by_key(|t| std::cmp::Reverse(t.priority));
    templates
}

/// Resolve the highest-priority template that supports and matches the
/// context, then build its rule.
pub fn resolve_template_rule(ctx: &RuleTemplateContext) -> Option<VirtualBillingRule> {
    for template in discover_rule_templates() {
        if !template.supports(&ctx.task_type) {
            continue;
        }
        if let Some(matches) = template.matches
            && !matches(ctx)
        {
            continue;
        }
        return Some((template.build)(ctx));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(task_type: &str) -> RuleTemplateContext {
        RuleTemplateContext {
            global_config: json!({"billing": {"price": {"input_per_1m": 3.0}}}),
            model_config: None,
            provider_id: Some(1),
            model_name: "gpt-4o".to_string(),
            task_type: task_type.to_string(),
        }
    }

    #[test]
    fn universal_template_covers_all_task_types() {
        for task in ["chat", "video", "image", "audio"] {
            let rule = resolve_template_rule(&ctx(task)).unwrap();
            assert!(rule.expression.contains("video_cost"));
            assert!(rule.is_virtual);
        }
    }
}
