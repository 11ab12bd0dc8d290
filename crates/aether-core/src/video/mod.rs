mod poller;
mod service;

pub use poller::{VIDEO_POLL_LOCK_KEY, VideoPollContext, VideoPoller};
pub use service::{DownloadOutcome, VideoService, extract_short_id_from_operation};
