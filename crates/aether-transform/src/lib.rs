pub mod compatibility;
#[cfg(test)]
mod tests;
pub mod internal;
pub mod normalizer;
pub mod registry;
pub mod usage;

pub use compatibility::{CompatibilityDecision, FormatAcceptanceConfig, is_format_compatible};
pub use internal::{
    InternalChatRequest, InternalChatResponse, InternalMessage, InternalStreamEvent,
    InternalUsage, InternalVideoPollResult, InternalVideoRequest, MessageRole, VideoStatus,
};
pub use normalizer::{Normalizer, ParsedError};
pub use registry::{ConversionRegistry, StreamConverter};
pub use usage::extract_cache_creation_tokens;
