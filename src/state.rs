//! Run-scoped state.
//!
//! Every run owns one [`StateStore`], shared by all of its step
//! invocations. Reads return a consistent snapshot; writes go through
//! [`StateStore::edit_state`], which applies the mutation to a draft and
//! swaps it in only if the mutation succeeds.

use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::Result;

/// Types usable as per-run state.
///
/// Implemented automatically for every type with the required bounds;
/// a plain `#[derive(Debug, Clone, Default, Serialize, Deserialize)]`
/// struct qualifies, and so does `()` for stateless workflows.
pub trait RunState:
    Clone + Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> RunState for T where
    T: Clone + Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// The mutable state of a single run.
///
/// This store uses `Arc<RwLock<...>>` internally, making it cheap to
/// clone and share across step invocations. Multiple readers can take
/// snapshots concurrently; editors get exclusive access.
///
/// # Example
///
/// ```
/// use heddle::StateStore;
///
/// #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
/// struct Progress {
///     file_id: Option<String>,
/// }
///
/// # async fn example() -> heddle::Result<()> {
/// let store = StateStore::new(Progress::default());
///
/// store
///     .edit_state(|state| {
///         state.file_id = Some("file-1".to_string());
///         Ok::<_, heddle::HeddleError>(())
///     })
///     .await?;
///
/// assert_eq!(store.get_state().await.file_id.as_deref(), Some("file-1"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StateStore<S> {
    inner: Arc<RwLock<S>>,
}

impl<S> Clone for StateStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RunState> StateStore<S> {
    /// Creates a store holding `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Returns a snapshot of the state as of this call.
    ///
    /// Later edits are not reflected in the returned value.
    pub async fn get_state(&self) -> S {
        self.inner.read().await.clone()
    }

    /// Mutates the state under exclusive access.
    ///
    /// The closure works on a draft copy. If it returns `Ok`, the draft
    /// replaces the current state in one step; if it returns `Err` (or
    /// panics), the draft is discarded and the prior state is preserved.
    /// Concurrent editors are serialized and readers never observe a
    /// half-applied edit.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error unchanged.
    pub async fn edit_state<F, T, E>(&self, edit: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut S) -> std::result::Result<T, E>,
    {
        let mut guard = self.inner.write().await;
        let mut draft = guard.clone();
        let value = edit(&mut draft)?;
        *guard = draft;
        Ok(value)
    }

    /// Replaces the whole state.
    pub async fn set_state(&self, state: S) {
        *self.inner.write().await = state;
    }

    /// Serializes a snapshot of the state to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Serialization`](crate::HeddleError::Serialization)
    /// if the state cannot be represented as JSON.
    pub async fn to_json(&self) -> Result<JsonValue> {
        let snapshot = self.get_state().await;
        Ok(serde_json::to_value(snapshot)?)
    }

    /// Builds a store from JSON, validating it against `S`.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Serialization`](crate::HeddleError::Serialization)
    /// if the JSON does not describe a valid `S`.
    pub fn from_json(value: JsonValue) -> Result<Self> {
        Ok(Self::new(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeddleError;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct BatchState {
        total_expected: usize,
        filenames: HashMap<String, String>,
    }

    #[tokio::test]
    async fn test_edit_commits_on_success() {
        let store = StateStore::new(BatchState::default());

        let total = store
            .edit_state(|state| {
                state.total_expected = 3;
                Ok::<_, HeddleError>(state.total_expected)
            })
            .await
            .unwrap();

        assert_eq!(total, 3);
        assert_eq!(store.get_state().await.total_expected, 3);
    }

    #[tokio::test]
    async fn test_edit_rolls_back_on_error() {
        let store = StateStore::new(BatchState::default());
        store
            .edit_state(|state| {
                state.filenames.insert("a".into(), "a.pdf".into());
                Ok::<_, HeddleError>(())
            })
            .await
            .unwrap();
        let before = store.get_state().await;

        let result = store
            .edit_state(|state| {
                state.total_expected = 99;
                state.filenames.insert("b".into(), "b.pdf".into());
                Err::<(), _>(HeddleError::StepExecution("rejected".into()))
            })
            .await;

        assert!(matches!(result, Err(HeddleError::StepExecution(_))));
        assert_eq!(store.get_state().await, before);
    }

    #[tokio::test]
    async fn test_edit_rolls_back_on_panic() {
        let store = StateStore::new(BatchState::default());
        let shared = store.clone();

        let joined = tokio::spawn(async move {
            shared
                .edit_state(|state| {
                    state.total_expected = 7;
                    if state.total_expected == 7 {
                        panic!("mid-edit");
                    }
                    Ok::<_, HeddleError>(())
                })
                .await
        })
        .await;

        assert!(joined.is_err());
        assert_eq!(store.get_state().await, BatchState::default());
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let store = StateStore::new(BatchState::default());
        let snapshot = store.get_state().await;

        store
            .edit_state(|state| {
                state.total_expected = 5;
                Ok::<_, HeddleError>(())
            })
            .await
            .unwrap();

        assert_eq!(snapshot.total_expected, 0);
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_edits_all_land() {
        let store = StateStore::new(BatchState::default());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .edit_state(|state| {
                        state
                            .filenames
                            .insert(format!("file-{i}"), format!("doc-{i}.pdf"));
                        Ok::<_, HeddleError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get_state().await.filenames.len(), 16);
    }

    #[tokio::test]
    async fn test_json_round_trip_validates_shape() {
        let store = StateStore::<BatchState>::from_json(json!({
            "total_expected": 2,
            "filenames": {"a": "a.pdf"}
        }))
        .unwrap();
        assert_eq!(store.to_json().await.unwrap()["total_expected"], json!(2));

        let invalid = StateStore::<BatchState>::from_json(json!({"total_expected": "two"}));
        assert!(matches!(invalid, Err(HeddleError::Serialization(_))));
    }
}
