use clap::Parser;

use aether_common::GatewayConfigPatch;

#[derive(Parser)]
#[command(name = "aether")]
pub(crate) struct Cli {
    #[arg(long, env = "AETHER_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "AETHER_PORT")]
    pub(crate) port: Option<u16>,
    #[arg(long, env = "AETHER_DSN")]
    pub(crate) dsn: Option<String>,
    #[arg(long, env = "ENABLE_FORMAT_CONVERSION")]
    pub(crate) enable_format_conversion: Option<bool>,

    #[arg(long, env = "BILLING_ENGINE")]
    pub(crate) billing_engine: Option<String>,
    #[arg(long, env = "BILLING_ENGINE_OVERRIDES")]
    pub(crate) billing_engine_overrides: Option<String>,
    #[arg(long, env = "BILLING_DIFF_THRESHOLD_USD")]
    pub(crate) billing_diff_threshold_usd: Option<f64>,
    #[arg(long, env = "BILLING_REQUIRE_RULE")]
    pub(crate) billing_require_rule: Option<bool>,
    #[arg(long, env = "BILLING_STRICT_MODE")]
    pub(crate) billing_strict_mode: Option<bool>,
    #[arg(long, env = "BILLING_SHADOW_LOG_LEVEL")]
    pub(crate) billing_shadow_log_level: Option<String>,

    #[arg(long, env = "VIDEO_POLL_INTERVAL_SECONDS")]
    pub(crate) video_poll_interval_seconds: Option<u64>,
    #[arg(long, env = "VIDEO_POLL_BATCH_SIZE")]
    pub(crate) video_poll_batch_size: Option<usize>,
    #[arg(long, env = "VIDEO_POLL_CONCURRENCY")]
    pub(crate) video_poll_concurrency: Option<usize>,
    #[arg(long, env = "VIDEO_MAX_POLL_COUNT")]
    pub(crate) video_max_poll_count: Option<i32>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            enable_format_conversion: self.enable_format_conversion,
            max_candidates: None,
            max_prefetch_lines: None,
            billing_engine: self.billing_engine,
            billing_engine_overrides: self.billing_engine_overrides,
            billing_diff_threshold_usd: self.billing_diff_threshold_usd,
            billing_require_rule: self.billing_require_rule,
            billing_strict_mode: self.billing_strict_mode,
            billing_shadow_log_level: self.billing_shadow_log_level,
            video_poll_interval_seconds: self.video_poll_interval_seconds,
            video_poll_batch_size: self.video_poll_batch_size,
            video_poll_concurrency: self.video_poll_concurrency,
            video_max_poll_count: self.video_max_poll_count,
        }
    }
}
