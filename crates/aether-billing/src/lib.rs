pub mod cache;
pub mod collector;
pub mod collector_defs;
pub mod expr;
pub mod formula;
pub mod precision;
pub mod rule_defs;
pub mod rule_service;
pub mod rule_templates;
pub mod rules;
pub mod schema;
pub mod service;
pub mod shadow;
pub mod token_normalization;

pub use collector::{
    CollectorSource, CollectorSpec, CollectorValueType, DimensionCollectInput,
    DimensionCollectorRuntime, DimensionCollectorService,
};
pub use collector_defs::{PresetApplyMode, PresetApplyResult, apply_presets, builtin_collectors};
pub use formula::{EvalOutcome, FormulaEngine};
pub use rule_service::{
    BillingRuleLookupResult, BillingRuleService, effective_rule_task_type, invalidate_all,
    invalidate_model,
};
pub use rule_templates::{CodeBillingRuleTemplate, RuleTemplateContext, discover_rule_templates};
pub use rules::{DefaultBillingRuleGenerator, DimensionMapping, MappingSource, VirtualBillingRule};
pub use schema::{BillingSnapshot, BillingStatus, CostResult};
pub use service::BillingService;
pub use shadow::{
    CostBreakdown, EngineMode, ShadowBillingResult, ShadowBillingService, TruthEngine,
    resolve_engine_mode,
};
pub use token_normalization::normalize_input_tokens_for_billing;
