use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

type MutateFn<P, T, E> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Why a mutation did not produce data.
#[derive(Debug, Error)]
pub enum MutationError<E> {
    /// The operation ran to completion and reported a failure.
    #[error("mutation failed")]
    Failed(E),
    /// The operation panicked. Unlike query loads, mutations catch the
    /// unwind and surface it as a value.
    #[error("mutation panicked: {0}")]
    Panicked(String),
}

struct MutationState<T, E> {
    loading: bool,
    data: Option<Arc<T>>,
    error: Option<Arc<MutationError<E>>>,
}

impl<T, E> Default for MutationState<T, E> {
    fn default() -> Self {
        MutationState {
            loading: false,
            data: None,
            error: None,
        }
    }
}

/// Snapshot of a mutation's state.
pub struct MutationResult<T, E> {
    /// Whether the operation is currently running.
    pub loading: bool,
    /// Data of the last successful run.
    pub data: Option<Arc<T>>,
    /// Error of the last failed run.
    pub error: Option<Arc<MutationError<E>>>,
}

impl<T, E> Clone for MutationResult<T, E> {
    fn clone(&self) -> Self {
        MutationResult {
            loading: self.loading,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

/// A one-shot write operation with its own loading/error/data state.
///
/// Mutations are not keyed and not cached: nothing is shared between two
/// [`Mutation`] values, and the store plays no part. Each
/// [`mutate`](Mutation::mutate) call clears the previous error, runs the
/// operation, and commits either data or an error; a failure clears the
/// data of earlier runs.
pub struct Mutation<P, T, E> {
    mutate_fn: MutateFn<P, T, E>,
    state: Arc<Mutex<MutationState<T, E>>>,
}

impl<P, T, E> Mutation<P, T, E>
where
    P: Send + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a mutation around the given operation.
    pub fn new<F, Fut>(mutate_fn: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Mutation {
            mutate_fn: Arc::new(move |param| mutate_fn(param).boxed()),
            state: Arc::new(Mutex::new(MutationState::default())),
        }
    }

    /// Runs the operation and returns the settled state.
    ///
    /// The loading flag is cleared on every path, including a panicking
    /// operation, which is caught and reported as
    /// [`MutationError::Panicked`].
    pub async fn mutate(&self, param: P) -> MutationResult<T, E> {
        {
            let mut state = self.state.lock().unwrap();
            state.loading = true;
            state.error = None;
        }

        let mutate_fn = Arc::clone(&self.mutate_fn);
        let outcome = AssertUnwindSafe(async move { mutate_fn(param).await })
            .catch_unwind()
            .await;

        let mut state = self.state.lock().unwrap();
        match outcome {
            Ok(Ok(data)) => {
                state.data = Some(Arc::new(data));
            }
            Ok(Err(error)) => {
                state.data = None;
                state.error = Some(Arc::new(MutationError::Failed(error)));
            }
            Err(panic) => {
                state.data = None;
                state.error = Some(Arc::new(MutationError::Panicked(panic_message(panic))));
            }
        }
        state.loading = false;

        MutationResult {
            loading: state.loading,
            data: state.data.clone(),
            error: state.error.clone(),
        }
    }

    /// Snapshot of the current state.
    pub fn result(&self) -> MutationResult<T, E> {
        let state = self.state.lock().unwrap();
        MutationResult {
            loading: state.loading,
            data: state.data.clone(),
            error: state.error.clone(),
        }
    }

    /// Whether the operation is currently running.
    pub fn loading(&self) -> bool {
        self.state.lock().unwrap().loading
    }

    /// Data of the last successful run.
    pub fn data(&self) -> Option<Arc<T>> {
        self.state.lock().unwrap().data.clone()
    }

    /// Error of the last failed run.
    pub fn error(&self) -> Option<Arc<MutationError<E>>> {
        self.state.lock().unwrap().error.clone()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
