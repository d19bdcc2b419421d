use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use tokn_core::error::{Result, ToknError};
use tokn_llm::{FragmentBoxStream, LlmTransport, PreparedRequest, RawFragment};

/// One canned response.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Yield these fragments, then end the body.
    Fragments(Vec<RawFragment>),
    /// Yield these fragments, then stall forever.
    Hang(Vec<RawFragment>),
    /// Fail the request as a non-success HTTP response would.
    Fail(String),
}

/// Replays canned fragment lists in order and records every request.
///
/// With `repeat_last`, the final script is replayed once the queue is empty,
/// which models a backend that never stops asking for tools.
#[derive(Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Scripted>>,
    last: Mutex<Option<Scripted>>,
    repeat_last: bool,
    requests: Mutex<Vec<PreparedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn push(self, fragments: Vec<RawFragment>) -> Self {
        self.push_script(Scripted::Fragments(fragments))
    }

    pub fn push_hanging(self, fragments: Vec<RawFragment>) -> Self {
        self.push_script(Scripted::Hang(fragments))
    }

    pub fn push_error(self, message: impl Into<String>) -> Self {
        self.push_script(Scripted::Fail(message.into()))
    }

    pub fn push_script(self, script: Scripted) -> Self {
        self.queue.lock().expect("queue lock").push_back(script);
        self
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    fn next_script(&self) -> Option<Scripted> {
        let next = self.queue.lock().expect("queue lock").pop_front();
        let mut last = self.last.lock().expect("last lock");
        match next {
            Some(script) => {
                *last = Some(script.clone());
                Some(script)
            }
            None if self.repeat_last => last.clone(),
            None => None,
        }
    }
}

impl LlmTransport for ScriptedTransport {
    fn open(&self, request: PreparedRequest) -> BoxFuture<'_, Result<FragmentBoxStream>> {
        Box::pin(async move {
            self.requests.lock().expect("requests lock").push(request);
            match self.next_script() {
                Some(Scripted::Fragments(fragments)) => {
                    Ok(stream::iter(fragments.into_iter().map(Ok)).boxed())
                }
                Some(Scripted::Hang(fragments)) => Ok(stream::iter(fragments.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()),
                Some(Scripted::Fail(message)) => Err(ToknError::ProviderRequest(message)),
                None => Err(ToknError::ProviderRequest(
                    "no scripted response left".to_string(),
                )),
            }
        })
    }
}
