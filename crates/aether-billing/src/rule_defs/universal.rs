use serde_json::{Map, Value, json};

use crate::rule_templates::{CodeBillingRuleTemplate, RuleTemplateContext};
use crate::rules::{
    DefaultBillingRuleGenerator, DimensionMapping, MappingSource, VirtualBillingRule, get_nested,
};

/// Normalize a resolution key: lowercase, spaces stripped, `×` folded to `x`,
/// and WxH dimensions ordered ascending so `1080x720` and `720x1080` match.
pub fn normalize_resolution_key(raw: &str) -> String {
    let key: String = raw
        .trim()
        .to_ascii_lowercase()
        .replace('×', "x")
        .replace(' ', "");
    if let Some((w, h)) = key.split_once('x')
        && let (Ok(a), Ok(b)) = (w.parse::<u64>(), h.parse::<u64>())
    {
        return if a <= b {
            format!("{a}x{b}")
        } else {
            format!("{b}x{a}")
        };
    }
    key
}

fn effective_unit_price(ctx: &RuleTemplateContext) -> f64 {
    get_nested(ctx.model_config.as_ref(), "billing.video.price_per_second")
        .or_else(|| get_nested(Some(&ctx.global_config), "billing.video.price_per_second"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Resolution key -> price-per-second map, normalized. Falls back to
/// multipliers over the flat unit price for older configs.
fn effective_resolution_price_map(ctx: &RuleTemplateContext) -> Map<String, Value> {
    for config in [ctx.model_config.as_ref(), Some(&ctx.global_config)] {
        if let Some(raw) = get_nested(config, "billing.video.price_per_second_by_resolution")
            .and_then(Value::as_object)
        {
            let out: Map<String, Value> = raw
                .iter()
                .filter_map(|(k, v)| {
                    let key = normalize_resolution_key(k);
                    let value = v.as_f64()?;
                    if key.is_empty() {
                        None
                    } else {
                        Some((key, json!(value)))
                    }
                })
                .collect();
            if !out.is_empty() {
                return out;
            }
        }
    }

    let base = effective_unit_price(ctx);
    if base > 0.0 {
        for config in [ctx.model_config.as_ref(), Some(&ctx.global_config)] {
            if let Some(raw) =
                get_nested(config, "billing.video.resolution_multipliers").and_then(Value::as_object)
            {
                let out: Map<String, Value> = raw
                    .iter()
                    .filter_map(|(k, v)| {
                        let key = normalize_resolution_key(k);
                        let multiplier = v.as_f64()?;
                        if key.is_empty() {
                            None
                        } else {
                            Some((key, json!(base * multiplier)))
                        }
                    })
                    .collect();
                if !out.is_empty() {
                    return out;
                }
            }
        }
    }

    Map::new()
}

/// Universal rule: token costs + request cost + video cost, every component
/// zero when not applicable to the task.
fn build_universal(ctx: &RuleTemplateContext) -> VirtualBillingRule {
    let base = DefaultBillingRuleGenerator::generate(
        &ctx.global_config,
        ctx.model_config.as_ref(),
        &ctx.task_type,
    );

    let unit_price = effective_unit_price(ctx);
    let resolution_price_map = effective_resolution_price_map(ctx);

    let mut dimension_mappings = base.dimension_mappings.clone();
    dimension_mappings.push((
        "duration_seconds".to_string(),
        DimensionMapping::dimension("duration_seconds", json!(0)),
    ));
    dimension_mappings.push((
        "video_price_per_second".to_string(),
        DimensionMapping {
            source: MappingSource::Matrix,
            key: Some("video_resolution_key".to_string()),
            required: false,
            allow_zero: true,
            default: Some(json!(unit_price)),
            map: Some(resolution_price_map),
            expression: None,
        },
    ));
    dimension_mappings.push((
        "video_cost".to_string(),
        DimensionMapping::computed("duration_seconds * video_price_per_second"),
    ));

    VirtualBillingRule {
        id: "__default__".to_string(),
        name: "Universal Billing Rule".to_string(),
        task_type: ctx.task_type.clone(),
        expression: format!("({}) + video_cost", base.expression),
        variables: base.variables,
        dimension_mappings,
        is_virtual: true,
    }
}

pub const TEMPLATES: &[CodeBillingRuleTemplate] = &[CodeBillingRuleTemplate {
    name: "universal",
    description: "token costs + request cost + video cost; unused components stay zero",
    task_types: &["chat", "video", "image", "audio"],
    priority: 100,
    matches: None,
    build: build_universal,
}];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_keys_normalize_to_ascending_wxh() {
        assert_eq!(normalize_resolution_key("1080x720"), "720x1080");
        assert_eq!(normalize_resolution_key("720 × 1080"), "720x1080");
        assert_eq!(normalize_resolution_key("720P"), "720p");
        assert_eq!(normalize_resolution_key(" 4K "), "4k");
    }

    #[test]
    fn multipliers_expand_over_unit_price() {
        let ctx = RuleTemplateContext {
            global_config: json!({"billing": {"video": {
                "price_per_second": 0.1,
                "resolution_multipliers": {"1080x720": 2.0},
            }}}),
            model_config: None,
            provider_id: None,
            model_name: "veo-3".to_string(),
            task_type: "video".to_string(),
        };
        let map = effective_resolution_price_map(&ctx);
        assert_eq!(map["720x1080"], json!(0.2));
    }

    #[test]
    fn explicit_resolution_prices_win_over_multipliers() {
        let ctx = RuleTemplateContext {
            global_config: json!({"billing": {"video": {
                "price_per_second": 0.1,
                "price_per_second_by_resolution": {"720p": 0.05},
                "resolution_multipliers": {"720p": 3.0},
            }}}),
            model_config: None,
            provider_id: None,
            model_name: "veo-3".to_string(),
            task_type: "video".to_string(),
        };
        let map = effective_resolution_price_map(&ctx);
        assert_eq!(map["720p"], json!(0.05));
    }
}
