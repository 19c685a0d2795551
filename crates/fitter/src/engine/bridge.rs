//! Turns a listener-style, one-shot encode API into an awaitable call.

use std::sync::{Arc, Mutex};
use log::debug;
use tokio::sync::oneshot;
use crate::engine::{EncodeRequest, Encoder};
use crate::error::EngineError;

type Outcome = Result<(), EngineError>;

/// Engine that starts an encode and reports its end through a listener
pub trait CallbackEngine: Send + Sync {
    type Handle: EncodeHandle;

    /// Start encoding. Must not block; completion is reported through
    /// `listener` from whatever thread or task the engine uses.
    fn start(&self, request: EncodeRequest, listener: EncodeListener) -> Self::Handle;
}

/// Handle to an in-flight encode
pub trait EncodeHandle: Send {
    /// Stop the encode. Called at most once, and only if the awaiting side
    /// went away before the listener resolved.
    fn cancel(&mut self);
}

/// Completion callbacks handed to a [`CallbackEngine`].
///
/// Clones share one slot: whichever callback fires first resolves the
/// awaiting call, every later one is ignored.
#[derive(Clone)]
pub struct EncodeListener {
    slot: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

impl EncodeListener {
    pub(crate) fn new(sender: oneshot::Sender<Outcome>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        }
    }

    pub fn on_completed(&self) -> bool {
        self.resolve(Ok(()))
    }

    pub fn on_error(&self, error: EngineError) -> bool {
        self.resolve(Err(error))
    }

    /// Returns false when the listener was already resolved
    fn resolve(&self, outcome: Outcome) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match sender {
            Some(tx) => {
                // A closed receiver means the caller was cancelled; nothing to do
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!("Ignoring duplicate engine callback: {:?}", outcome.err());
                false
            }
        }
    }
}

/// Cancels the engine handle unless disarmed
struct CancelOnDrop<H: EncodeHandle> {
    handle: Option<H>,
}

impl<H: EncodeHandle> CancelOnDrop<H> {
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl<H: EncodeHandle> Drop for CancelOnDrop<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            debug!("Encode abandoned before completion, cancelling engine");
            handle.cancel();
        }
    }
}

/// [`Encoder`] over a [`CallbackEngine`]
#[derive(Debug, Clone)]
pub struct Bridged<E> {
    engine: E,
}

impl<E: CallbackEngine> Bridged<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: CallbackEngine> Encoder for Bridged<E> {
    async fn encode(&self, request: &EncodeRequest) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let listener = EncodeListener::new(tx);

        let handle = self.engine.start(request.clone(), listener);
        let mut guard = CancelOnDrop {
            handle: Some(handle),
        };

        let outcome = rx.await;
        guard.disarm();

        match outcome {
            Ok(result) => result,
            Err(_) => Err(EngineError::new(
                "engine released its listener without reporting completion or error",
            )),
        }
    }
}
