use crate::codec::Response;
use crate::error::*;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::*;

/// A call that has been sent and is waiting for its response
struct PendingCall {
    method: String,
    created: Instant,
    completion: oneshot::Sender<Response>,
}

/// Tracks calls waiting for responses, keyed by request id.
///
/// Callers insert, the receive loop completes, and a call that gives up (timeout, send failure,
/// or its future being dropped) removes its own entry.  Whichever of complete/remove happens
/// first wins; the other finds nothing and is a no-op.
#[derive(Default)]
pub(super) struct PendingCalls {
    calls: HashMap<u64, PendingCall>,

    /// Set once the connection's receive loop has stopped.  No response can arrive after that, so
    /// new registrations are refused rather than left to time out.
    closed: bool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending call.
    ///
    /// Returns a receiver that will be given the response when it arrives, or dropped without a
    /// value if the connection closes first.
    pub fn register(
        &mut self,
        id: u64,
        method: &str,
    ) -> Result<oneshot::Receiver<Response>> {
        if self.closed {
            return ConnectionClosedSnafu { pending: 0usize }.fail();
        }
        if self.calls.contains_key(&id) {
            return IdInUseSnafu { id }.fail();
        }

        let (completion, receiver) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                created: Instant::now(),
                completion,
            },
        );

        Ok(receiver)
    }

    /// Deliver a response to the call with the matching id.
    ///
    /// Returns false if there is no such call, i.e. the response is unsolicited or arrived after
    /// its call already gave up.
    pub fn complete(&mut self, response: Response) -> bool {
        let id = response.id();
        match self.calls.remove(&id) {
            Some(call) => {
                trace!(
                    id,
                    method = %call.method,
                    elapsed = ?call.created.elapsed(),
                    "Response matched pending call"
                );
                if call.completion.send(response).is_err() {
                    debug!(id, method = %call.method, "Caller stopped waiting before the response was delivered");
                }
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without delivering a response
    pub fn remove(&mut self, id: u64) -> bool {
        self.calls.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Refuse further registrations and abandon every pending call.
    ///
    /// Dropping the completion senders wakes each waiting caller.  Returns the number of calls
    /// abandoned.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let abandoned = self.calls.len();
        self.calls.clear();
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn register_and_complete() {
        let mut pending = PendingCalls::new();

        let mut receiver = pending.register(1, "echo").unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(Response::success(1, json!("hi"))));
        assert_eq!(pending.len(), 0);

        assert_eq!(
            receiver.try_recv().unwrap(),
            Response::success(1, json!("hi"))
        );
    }

    #[test]
    fn id_reuse_while_pending() {
        let mut pending = PendingCalls::new();

        let _receiver = pending.register(7, "echo").unwrap();
        assert_matches!(pending.register(7, "echo"), Err(Error::IdInUse { id: 7 }));

        // Once the first call is gone the id is free again
        assert!(pending.remove(7));
        assert!(pending.register(7, "echo").is_ok());
    }

    #[test]
    fn unmatched_response() {
        let mut pending = PendingCalls::new();
        let _receiver = pending.register(1, "echo").unwrap();

        assert!(!pending.complete(Response::success(2, json!(null))));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn late_response_after_remove() {
        let mut pending = PendingCalls::new();
        let _receiver = pending.register(3, "slow").unwrap();

        assert!(pending.remove(3));
        assert!(!pending.remove(3));
        assert!(!pending.complete(Response::success(3, json!(1))));
    }

    #[test]
    fn close_abandons_everything() {
        let mut pending = PendingCalls::new();
        let mut first = pending.register(1, "a").unwrap();
        let _second = pending.register(2, "b").unwrap();

        assert_eq!(pending.close(), 2);
        assert_eq!(pending.len(), 0);
        assert_matches!(
            first.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed)
        );
        assert_matches!(
            pending.register(3, "c"),
            Err(Error::ConnectionClosed { .. })
        );
    }
}
