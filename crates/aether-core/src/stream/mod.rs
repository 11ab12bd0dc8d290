mod context;
mod processor;

use std::sync::{Arc, Mutex};

pub use context::StreamContext;
pub use processor::{LineDecoder, LineStream, StreamProcessor};

/// Context handle shared between the dispatch loop, the processor task and
/// usage finalization. Locks are short; never held across awaits.
pub type SharedStreamContext = Arc<Mutex<StreamContext>>;

pub fn shared_context(ctx: StreamContext) -> SharedStreamContext {
    Arc::new(Mutex::new(ctx))
}
