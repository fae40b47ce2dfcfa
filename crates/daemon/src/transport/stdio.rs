//! Standard I/O transport.
//!
//! The daemon serves exactly one client on stdin/stdout. Logs go to stderr so
//! they never interleave with protocol lines.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::connection::serve_lines;
use super::{TransportError, TransportKind};
use crate::router::MessageRouter;

/// Serves the protocol on stdin/stdout until stdin closes or shutdown.
pub async fn serve(
    router: Arc<MessageRouter>,
    queue_capacity: usize,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    serve_lines(
        tokio::io::stdin(),
        tokio::io::stdout(),
        router,
        TransportKind::Stdio,
        queue_capacity,
        shutdown,
    )
    .await
}
