pub mod cipher;
pub mod dispatch;
pub mod lock;
pub mod scheduler;
pub mod stream;
pub mod upstream_client;
pub mod usage;
pub mod video;

pub use cipher::{PassthroughCipher, SecretCipher};
pub use dispatch::{
    CallerIdentity, ChatDispatchOutcome, DispatchBody, DispatchEngine, build_chat_url,
};
pub use lock::{InProcessLockStore, LockStore};
pub use scheduler::{CacheAwareScheduler, Candidate, endpoint_signature_of};
pub use stream::{
    LineDecoder, LineStream, SharedStreamContext, StreamContext, StreamProcessor, shared_context,
};
pub use upstream_client::{
    ByteStream, HttpMethod, UpstreamBody, UpstreamClient, UpstreamClientConfig,
    UpstreamHttpRequest, UpstreamHttpResponse, WreqUpstreamClient,
};
pub use usage::{PendingUsageInput, UsageService};
pub use video::{
    DownloadOutcome, VIDEO_POLL_LOCK_KEY, VideoPollContext, VideoPoller, VideoService,
    extract_short_id_from_operation,
};
