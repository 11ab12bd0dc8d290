use serde::{Deserialize, Serialize};

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults. Knob names are normative and match the
/// environment variables accepted by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Master switch for cross-family format conversion.
    pub enable_format_conversion: bool,
    /// Upper bound on candidates tried per request before giving up.
    pub max_candidates: usize,
    /// Lines read ahead of the client while screening a stream for errors.
    pub max_prefetch_lines: usize,

    /// Billing engine mode: legacy | shadow | new_with_fallback | new.
    pub billing_engine: String,
    /// JSON map of `provider/model` patterns (fnmatch-style) to engine modes.
    pub billing_engine_overrides: String,
    pub billing_diff_threshold_usd: f64,
    /// When true, non-chat tasks without an explicit rule bill as `no_rule`.
    pub billing_require_rule: bool,
    /// When true, missing required dimensions abort settlement.
    pub billing_strict_mode: bool,
    pub billing_shadow_log_level: String,

    pub video_poll_interval_seconds: u64,
    pub video_poll_batch_size: usize,
    pub video_poll_concurrency: usize,
    pub video_max_poll_count: i32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8084,
            dsn: "sqlite::memory:".to_string(),
            enable_format_conversion: true,
            max_candidates: 10,
            max_prefetch_lines: 5,
            billing_engine: "legacy".to_string(),
            billing_engine_overrides: "{}".to_string(),
            billing_diff_threshold_usd: 0.0001,
            billing_require_rule: false,
            billing_strict_mode: false,
            billing_shadow_log_level: "info".to_string(),
            video_poll_interval_seconds: 10,
            video_poll_batch_size: 20,
            video_poll_concurrency: 4,
            video_max_poll_count: 120,
        }
    }
}

/// Optional layer used when merging gateway config from CLI/ENV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub enable_format_conversion: Option<bool>,
    pub max_candidates: Option<usize>,
    pub max_prefetch_lines: Option<usize>,
    pub billing_engine: Option<String>,
    pub billing_engine_overrides: Option<String>,
    pub billing_diff_threshold_usd: Option<f64>,
    pub billing_require_rule: Option<bool>,
    pub billing_strict_mode: Option<bool>,
    pub billing_shadow_log_level: Option<String>,
    pub video_poll_interval_seconds: Option<u64>,
    pub video_poll_batch_size: Option<usize>,
    pub video_poll_concurrency: Option<usize>,
    pub video_max_poll_count: Option<i32>,
}

macro_rules! overlay_field {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

macro_rules! apply_field {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $src.$field {
                $dst.$field = value;
            }
        )+
    };
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        overlay_field!(
            self,
            other,
            host,
            port,
            dsn,
            enable_format_conversion,
            max_candidates,
            max_prefetch_lines,
            billing_engine,
            billing_engine_overrides,
            billing_diff_threshold_usd,
            billing_require_rule,
            billing_strict_mode,
            billing_shadow_log_level,
            video_poll_interval_seconds,
            video_poll_batch_size,
            video_poll_concurrency,
            video_max_poll_count,
        );
    }

    pub fn into_config(self) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        apply_field!(
            config,
            self,
            host,
            port,
            dsn,
            enable_format_conversion,
            max_candidates,
            max_prefetch_lines,
            billing_engine,
            billing_engine_overrides,
            billing_diff_threshold_usd,
            billing_require_rule,
            billing_strict_mode,
            billing_shadow_log_level,
            video_poll_interval_seconds,
            video_poll_batch_size,
            video_poll_concurrency,
            video_max_poll_count,
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GatewayConfigPatch {
            port: Some(8084),
            billing_engine: Some("legacy".to_string()),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            billing_engine: Some("shadow".to_string()),
            ..Default::default()
        });
        let config = base.into_config();
        assert_eq!(config.port, 8084);
        assert_eq!(config.billing_engine, "shadow");
    }

    #[test]
    fn defaults_cover_normative_knobs() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_candidates, 10);
        assert_eq!(config.max_prefetch_lines, 5);
        assert!((config.billing_diff_threshold_usd - 0.0001).abs() < f64::EPSILON);
    }
}
