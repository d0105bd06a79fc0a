//! Completion channel for asynchronous calls
//!
//! A [`Promise`] is settled at most once. Clones share the same state, so an
//! implementation may hand copies to several workers and let the first one
//! win; later attempts are logged and ignored.

use crate::error::{BridgeError, Exception};
use crate::value::JsValue;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Final outcome delivered through a [`Promise`].
pub type Settlement = Result<JsValue, BridgeError>;

type Callback = Box<dyn FnOnce(Settlement) + Send>;

enum State {
    Pending(Callback),
    Settled,
}

#[derive(Clone)]
struct Origin {
    module: Arc<str>,
    function: Arc<str>,
}

#[derive(Clone)]
pub struct Promise {
    state: Arc<Mutex<State>>,
    origin: Option<Origin>,
}

impl Promise {
    /// Promise that hands its outcome to `on_settle`.
    pub fn new<F>(on_settle: F) -> Self
    where
        F: FnOnce(Settlement) + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Box::new(on_settle)))),
            origin: None,
        }
    }

    /// Promise paired with a receiver, for hosts and tests that block on the
    /// outcome.
    pub fn channel() -> (Self, mpsc::Receiver<Settlement>) {
        let (sender, receiver) = mpsc::channel();
        let promise = Self::new(move |outcome| {
            let _ = sender.send(outcome);
        });
        (promise, receiver)
    }

    /// Same promise, tagged with the call it completes.
    pub(crate) fn for_call(&self, module: &str, function: &str) -> Self {
        Self {
            state: self.state.clone(),
            origin: Some(Origin {
                module: Arc::from(module),
                function: Arc::from(function),
            }),
        }
    }

    pub fn resolve(&self, value: impl Into<JsValue>) -> bool {
        self.settle(Ok(value.into()))
    }

    pub fn reject(&self, error: BridgeError) -> bool {
        self.settle(Err(error))
    }

    /// Reject with a typed failure, tagged with the call this promise belongs to.
    pub fn reject_with(&self, exception: Exception) -> bool {
        let (module, function) = match &self.origin {
            Some(origin) => (origin.module.to_string(), origin.function.to_string()),
            None => (String::new(), String::new()),
        };
        self.reject(BridgeError::Implementation {
            module,
            function,
            code: exception.code().to_string(),
            message: exception.message().to_string(),
            source: Some(Box::new(exception)),
        })
    }

    /// Deliver `outcome` unless the promise was already settled.
    ///
    /// Returns whether this call settled the promise.
    pub fn settle(&self, outcome: Settlement) -> bool {
        let callback = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, State::Settled) {
                State::Pending(callback) => callback,
                State::Settled => {
                    tracing::warn!(
                        outcome = if outcome.is_ok() { "resolve" } else { "reject" },
                        "promise already settled; ignoring"
                    );
                    return false;
                }
            }
        };
        callback(outcome);
        true
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            State::Settled
        )
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn first_settlement_wins() {
        let (promise, receiver) = Promise::channel();
        assert!(promise.resolve(1));
        assert!(!promise.clone().resolve(2));
        assert!(!promise.reject(BridgeError::NotInstalled));

        assert_eq!(receiver.recv().unwrap().unwrap(), JsValue::from(1));
        assert!(receiver.try_recv().is_err());
        assert!(promise.is_settled());
    }

    #[test]
    fn concurrent_settlers_deliver_once() {
        let (promise, receiver) = Promise::channel();
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let promise = promise.clone();
                std::thread::spawn(move || promise.resolve(i))
            })
            .collect();
        let winners = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(receiver.recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn typed_rejections_carry_the_call() {
        let (promise, receiver) = Promise::channel();
        let tagged = promise.for_call("Contacts", "find");
        tagged.reject_with(Exception::new("ERR_MISSING", "nobody home"));

        let error = receiver.recv().unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Implementation);
        assert_eq!(error.code(), "ERR_MISSING");
        assert!(error.to_string().contains("Contacts.find"));
        assert!(promise.is_settled());
    }
}
