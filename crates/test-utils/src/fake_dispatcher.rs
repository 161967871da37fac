use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use deploygraph::errors::{DeployError, Result};
use deploygraph::transaction::{Dispatcher, ExecutionMessage, TransactionStatus, TransactionStore};

/// A fake dispatcher that records every message it was handed.
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<ExecutionMessage>>>,
}

impl RecordingDispatcher {
    pub fn new(sent: Arc<Mutex<Vec<ExecutionMessage>>>) -> Self {
        Self { sent }
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(
        &mut self,
        messages: Vec<ExecutionMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let sent = Arc::clone(&self.sent);

        Box::pin(async move {
            let mut guard = sent.lock().unwrap();
            guard.extend(messages);
            Ok(())
        })
    }
}

/// A dispatcher whose executor is never reachable.
pub struct FailingDispatcher;

impl Dispatcher for FailingDispatcher {
    fn dispatch(
        &mut self,
        _messages: Vec<ExecutionMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { Err(DeployError::Dispatch("executor unavailable".to_string())) })
    }
}

/// A dispatcher whose executor finishes every graph before `dispatch`
/// returns, writing straight to the shared store.
pub struct InlineCompletingDispatcher {
    store: Arc<dyn TransactionStore>,
    completed: Arc<Mutex<Vec<Uuid>>>,
}

impl InlineCompletingDispatcher {
    pub fn new(store: Arc<dyn TransactionStore>, completed: Arc<Mutex<Vec<Uuid>>>) -> Self {
        Self { store, completed }
    }
}

impl Dispatcher for InlineCompletingDispatcher {
    fn dispatch(
        &mut self,
        messages: Vec<ExecutionMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let store = Arc::clone(&self.store);
        let completed = Arc::clone(&self.completed);

        Box::pin(async move {
            for message in messages {
                let sub_id = message.task_uuid;
                let parent = store.find_by_subtransaction(sub_id)?;
                store.update(parent, &mut |tx| {
                    let sub = tx
                        .subtransaction_mut(sub_id)
                        .ok_or(DeployError::TransactionNotFound(sub_id))?;
                    sub.transition(TransactionStatus::Running)?;
                    sub.transition(TransactionStatus::Ready)?;
                    tx.refresh_status();
                    Ok(())
                })?;
                completed.lock().unwrap().push(sub_id);
            }
            Ok(())
        })
    }
}
