use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::cell::{Cell, Subscription};

/// Cooperative cancellation flag handed to a dispatched task. Checking it is
/// the task's responsibility; the dispatcher itself never force-aborts.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn abort_external(&self) {
        self.abort();
    }

    fn same_as(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A message raised by dispatched work, either because the work itself
/// failed or because it was cancelled before completing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherError(pub String);

impl std::fmt::Display for DispatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl DispatcherError {
    pub fn aborted() -> Self {
        Self("cancelled".to_owned())
    }
}

/// Converts any displayable error into a [`DispatcherError`]; use this at
/// the `.map_err(...)` boundary of a dispatched closure instead of a
/// blanket `From` impl, which would collide with the standard reflexive one.
pub fn to_dispatcher_error(err: impl std::fmt::Display) -> DispatcherError {
    DispatcherError(err.to_string())
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatcherPayload<O> {
    Loading { progress: f64 },
    Ok { data: O },
    Err { error: DispatcherError },
}

#[derive(Clone)]
pub struct DispatcherState<O> {
    pub controller: CancelHandle,
    pub payload: DispatcherPayload<O>,
}

impl<O: PartialEq> PartialEq for DispatcherState<O> {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}

/// Handed to dispatched work so it can report fractional progress without
/// holding a reference to the dispatcher itself. A report is silently
/// dropped once the handle has been cancelled.
pub struct ProgressReporter<O> {
    state: Cell<DispatcherState<O>>,
    handle: CancelHandle,
}

impl<O: Clone + PartialEq + Send + Sync + 'static> ProgressReporter<O> {
    pub fn report(&self, progress: f64) {
        if self.handle.is_cancelled() {
            return;
        }
        self.state.set(DispatcherState {
            controller: self.handle.clone(),
            payload: DispatcherPayload::Loading {
                progress: progress.clamp(0.0, 1.0),
            },
        });
    }
}

/// Runs `f` every time `value_cell` changes, after waiting out `debounce`,
/// and publishes the outcome to `state`. At most one invocation of `f` is
/// ever in flight: starting a new one aborts whichever controller was
/// current before it.
pub struct Dispatcher<I, O> {
    pub state: Cell<DispatcherState<O>>,
    pub filtered: Cell<Option<O>>,
    current: Arc<ArcSwap<CancelHandle>>,
    _value_sub: Subscription,
    _marker: std::marker::PhantomData<I>,
}

impl<I, O> Dispatcher<I, O>
where
    I: Clone + PartialEq + Send + Sync + 'static,
    O: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<F, Fut>(value_cell: Cell<I>, debounce: Duration, f: F) -> Self
    where
        F: Fn(I, ProgressReporter<O>, CancelHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, DispatcherError>> + Send + 'static,
    {
        let state: Cell<DispatcherState<O>> = Cell::new(DispatcherState {
            controller: CancelHandle::new(),
            payload: DispatcherPayload::Loading { progress: 0.0 },
        });
        let filtered = state.map(|s| match &s.payload {
            DispatcherPayload::Ok { data } => Some(data.clone()),
            _ => None,
        });
        let current = Arc::new(ArcSwap::from_pointee(CancelHandle::new()));
        let f = Arc::new(f);

        let dispatch_once = {
            let state = state.clone();
            let current = current.clone();
            let f = f.clone();
            move |value: I| {
                let fresh = CancelHandle::new();
                let previous = current.swap(Arc::new(fresh.clone()));
                previous.abort();
                let handle = fresh;
                state.set(DispatcherState {
                    controller: handle.clone(),
                    payload: DispatcherPayload::Loading { progress: 0.0 },
                });

                let state = state.clone();
                let current = current.clone();
                let f = f.clone();
                let handle_for_task = handle.clone();
                tokio::spawn(async move {
                    if !debounce.is_zero() {
                        tokio::time::sleep(debounce).await;
                        if handle_for_task.is_cancelled() {
                            return;
                        }
                    }
                    let reporter = ProgressReporter {
                        state: state.clone(),
                        handle: handle_for_task.clone(),
                    };
                    let result = f(value, reporter, handle_for_task.clone()).await;

                    let is_current = handle_for_task.same_as(&current.load());
                    if !is_current || handle_for_task.is_cancelled() {
                        return;
                    }

                    let payload = match result {
                        Ok(data) => DispatcherPayload::Ok { data },
                        Err(error) => DispatcherPayload::Err { error },
                    };
                    state.set(DispatcherState {
                        controller: handle_for_task,
                        payload,
                    });
                });
            }
        };

        dispatch_once(value_cell.get());

        let last_value_guard = Mutex::new(value_cell.get());
        let value_sub = value_cell.subscribe(move |v| {
            let mut last = last_value_guard.lock().expect("dispatcher lock poisoned");
            if *last != *v {
                *last = v.clone();
                dispatch_once(v.clone());
            }
        });

        Self {
            state,
            filtered,
            current,
            _value_sub: value_sub,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn abort_current(&self) {
        self.current.load().abort_external();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn resolves_ok_and_updates_filtered_cell() {
        let input = Cell::new(1);
        let dispatcher = Dispatcher::new(input, StdDuration::ZERO, |v, _progress, _cancel| async move {
            Ok::<_, DispatcherError>(v * 10)
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(dispatcher.filtered.get(), Some(10));
    }

    #[tokio::test]
    async fn later_write_cancels_earlier_dispatch() {
        let input = Cell::new(1);
        let ran_to_completion = Arc::new(AtomicUsize::new(0));
        let ran_for_closure = ran_to_completion.clone();

        let dispatcher = Dispatcher::new(input.clone(), StdDuration::from_millis(30), move |v, _progress, cancel| {
            let ran = ran_for_closure.clone();
            async move {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                if cancel.is_cancelled() {
                    return Err(DispatcherError::aborted());
                }
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            }
        });

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        input.set(2);
        tokio::time::sleep(StdDuration::from_millis(120)).await;

        assert_eq!(ran_to_completion.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.filtered.get(), Some(2));
    }

    #[tokio::test]
    async fn errors_surface_in_state_without_panicking() {
        let input = Cell::new(1);
        let dispatcher = Dispatcher::new(input, StdDuration::ZERO, |_v, _progress, _cancel| async move {
            Err::<i32, _>(DispatcherError("boom".to_owned()))
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        match &dispatcher.state.get().payload {
            DispatcherPayload::Err { error } => assert_eq!(error.0, "boom"),
            other => panic!("expected Err payload, got {other:?}"),
        }
    }
}
