//! In-crate test doubles.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::conversation::Conversation;
use crate::errors::BackendError;
use crate::llms::backend::ModelBackend;

type Responder = Box<dyn Fn(&Conversation) -> Result<String, BackendError> + Send + Sync>;

/// Backend replaying a fixed script of replies, then falling back to a
/// responder closure if one is set.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    responder: Option<Responder>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Conversation>>,
}

impl fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("name", &self.name)
            .field("remaining", &self.script.lock().len())
            .finish()
    }
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then_ok(self, reply: &str) -> Self {
        self.script.lock().push_back(Ok(reply.to_string()));
        self
    }

    pub fn then_err(self, err: BackendError) -> Self {
        self.script.lock().push_back(Err(err));
        self
    }

    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Conversation) -> Result<String, BackendError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every conversation received, in call order.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(conversation.clone());

        let next = self.script.lock().pop_front();
        match (next, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(conversation),
            (None, None) => Err(BackendError::InvalidResponse {
                provider: "scripted".into(),
                message: "script exhausted".into(),
            }),
        }
    }
}
