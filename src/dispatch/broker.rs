//! The broker client the dispatch worker publishes through.
//!
//! Only the interface is modeled here — the actual broker wire protocol is
//! an externally supplied collaborator, out of scope here.
//! The trait folds the original `session` concept into `&self`: a real
//! implementation owns its connection internally and `create`/`destroy`
//! become its connect/disconnect lifecycle.

use async_trait::async_trait;

use crate::error::BrokerError;

#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Establishes the broker session for `topic` at `endpoint`. Called
    /// once before the dispatch loop starts.
    async fn create(&self, endpoint: &str, topic: &str) -> Result<(), BrokerError>;

    /// Publishes `payload` to `topic`, measured wall time around the call
    /// is the caller's responsibility.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Tears down the session. Called once after the shutdown drain.
    async fn destroy(&self);
}

/// A programmable in-memory broker, exported for this crate's own tests
/// and for embedders exercising the dispatch worker without a real broker.
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A programmable broker for tests: returns a scripted sequence of
    /// results, repeating the last one once exhausted, and records every
    /// payload it was asked to publish.
    pub struct StubBroker {
        script: Mutex<Vec<Result<(), BrokerError>>>,
        published: Mutex<Vec<String>>,
        created: Mutex<bool>,
    }

    impl StubBroker {
        pub fn new(script: Vec<Result<(), BrokerError>>) -> Self {
            Self { script: Mutex::new(script), published: Mutex::new(Vec::new()), created: Mutex::new(false) }
        }

        pub fn always_ok() -> Self {
            Self::new(vec![Ok(())])
        }

        pub fn published(&self) -> Vec<String> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventBroker for StubBroker {
        async fn create(&self, _endpoint: &str, _topic: &str) -> Result<(), BrokerError> {
            *self.created.lock().unwrap() = true;
            Ok(())
        }

        async fn publish(&self, _topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 { script.remove(0) } else { script[0].clone_result() };
            if next.is_ok() {
                self.published.lock().unwrap().push(String::from_utf8_lossy(payload).into_owned());
            }
            next
        }

        async fn destroy(&self) {}
    }

    trait CloneResult {
        fn clone_result(&self) -> Result<(), BrokerError>;
    }

    impl CloneResult for Result<(), BrokerError> {
        fn clone_result(&self) -> Result<(), BrokerError> {
            match self {
                Ok(()) => Ok(()),
                Err(e) => Err(match e {
                    BrokerError::SessionUnavailable(s) => BrokerError::SessionUnavailable(s.clone()),
                    BrokerError::Retryable(s) => BrokerError::Retryable(s.clone()),
                    BrokerError::Network(s) => BrokerError::Network(s.clone()),
                    BrokerError::Unrecoverable(s) => BrokerError::Unrecoverable(s.clone()),
                }),
            }
        }
    }
}
