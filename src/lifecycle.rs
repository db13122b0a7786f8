//! Per-request lifecycle: drives one admitted generation from registration to
//! a terminal state.
//!
//! Four triggers can end a request, each racing the others: client
//! disconnect, timeout, natural completion, engine failure. The registry's
//! idempotent `end` arbitrates; whichever trigger fires first wins and the
//! rest become no-ops. All engine and transport faults stop here, nothing
//! propagates to the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::engine::GenerationEngine;
use crate::registry::{Admission, EndReason, RequestRegistry};

/// Emitted for a token the engine produced but the server could not decode.
const REPLACEMENT_FRAGMENT: &str = "\u{FFFD}";

/// Stream one generation to `out_tx`, which feeds the chunked HTTP body.
///
/// Sends `preamble` first, then one text fragment per engine token, in
/// production order. Consumes the admission: by the time this returns the
/// request has reached a terminal state and left the registry, and dropping
/// `out_tx` closes the client's stream exactly once.
pub async fn stream_generation(
    registry: Arc<RequestRegistry>,
    engine: Arc<dyn GenerationEngine>,
    admission: Admission,
    timeout: Duration,
    preamble: &'static str,
    prompt: String,
    out_tx: mpsc::Sender<Bytes>,
) {
    let Admission { id, cancel } = admission;

    // Watchdog: fires `end(TimedOut)` unless some other trigger ends the
    // request first. `end` cancels the token, so a finished request disarms
    // the timer and it can never fire against a reused id.
    {
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    registry.end(id, EndReason::TimedOut);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    // Tokenization may hit a slow model runtime; keep it off the reactor.
    let tokens = {
        let engine = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || engine.tokenize(&prompt)).await {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => {
                registry.end(id, EndReason::Failed(format!("tokenize: {e:#}")));
                return;
            }
            Err(e) => {
                registry.end(id, EndReason::Failed(format!("tokenize task: {e}")));
                return;
            }
        }
    };

    if out_tx.send(Bytes::from_static(preamble.as_bytes())).await.is_err() {
        registry.end(id, EndReason::ClientDisconnected);
        return;
    }

    let mut stream = engine.generate(tokens, cancel);
    loop {
        let Some(item) = stream.recv().await else {
            // Engine exhausted its sequence (or already honored a cancel that
            // some other trigger recorded).
            registry.end(id, EndReason::Completed);
            break;
        };

        // Cooperative cancellation, checked once per token: if another
        // trigger already ended this id, relay nothing more even though the
        // engine may keep producing.
        if !registry.is_live(id) {
            debug!("request {id} no longer live, dropping remaining tokens");
            break;
        }

        let fragment = match item {
            Ok(token) => engine.detokenize(token).unwrap_or_else(|e| {
                warn!("request {id}: failed to decode token: {e:#}");
                REPLACEMENT_FRAGMENT.to_string()
            }),
            Err(e) => {
                registry.end(id, EndReason::Failed(format!("{e:#}")));
                break;
            }
        };

        if out_tx.send(Bytes::from(fragment)).await.is_err() {
            registry.end(id, EndReason::ClientDisconnected);
            break;
        }
    }
}
