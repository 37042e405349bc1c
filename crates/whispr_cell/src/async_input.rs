use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cell::{Cell, Subscription};
use crate::dispatcher::{CancelHandle, Dispatcher, DispatcherError, DispatcherPayload, ProgressReporter};

/// Metadata tying a result to the configuration that produced it. `ts` is a
/// local monotonic counter, not a wall-clock timestamp: a caller retrying on
/// a clock-skewed machine must never regress staleness comparisons.
#[derive(Clone, Debug, PartialEq)]
pub struct Meta<C> {
    pub ts: u64,
    pub config: C,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AsyncInputValue<C, R> {
    pub result: R,
    pub meta: Meta<C>,
}

struct Clocks {
    /// Highest `ts` this instance has assigned to its own edits.
    local: u64,
    /// Highest `ts` known to be reflected in the externally-owned value.
    external: u64,
}

/// Bidirectional gateway between a caller-editable `config` and an
/// externally-owned `AsyncInputValue<C, R>`. The caller edits `config`
/// synchronously through [`AsyncInput::set_config`]; a zero-debounce
/// [`Dispatcher`] recomputes `R` from it and, once a resolved result is
/// fresher than what the external owner currently holds, pushes it out
/// through `setter`. The external owner can also push its own updates in
/// through [`AsyncInput::sync_external`] (e.g. a value written by another
/// client) — whichever side holds the higher `ts` wins.
pub struct AsyncInput<C, R> {
    pub config: Cell<C>,
    pub result: Cell<Option<R>>,
    pub pending: Cell<bool>,
    meta: Cell<Meta<C>>,
    clocks: Arc<Mutex<Clocks>>,
    _dispatcher: Dispatcher<Meta<C>, R>,
    _subs: Vec<Subscription>,
}

impl<C, R> AsyncInput<C, R>
where
    C: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    /// `initial_external` seeds both `config` and the monotonic clock from
    /// the externally-owned value's current `_meta`. `setter` is invoked
    /// with a freshly resolved `AsyncInputValue` every time one supersedes
    /// the external owner's current `ts`; it is never called for a stale
    /// result. `handler` is the async recomputation function, driven
    /// through a zero-debounce `Dispatcher`.
    pub fn new<F, Fut>(
        initial_external: AsyncInputValue<C, R>,
        setter: impl Fn(AsyncInputValue<C, R>) + Send + Sync + 'static,
        handler: F,
    ) -> Self
    where
        F: Fn(C, ProgressReporter<R>, CancelHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, DispatcherError>> + Send + 'static,
    {
        let meta = Cell::new(initial_external.meta.clone());
        let pending = Cell::new(false);
        let result: Cell<Option<R>> = Cell::new(None);
        let clocks = Arc::new(Mutex::new(Clocks {
            local: initial_external.meta.ts,
            external: initial_external.meta.ts,
        }));
        let setter: Arc<dyn Fn(AsyncInputValue<C, R>) + Send + Sync> = Arc::new(setter);
        let handler = Arc::new(handler);

        let dispatcher = Dispatcher::new(meta.clone(), Duration::ZERO, {
            let handler = handler.clone();
            move |dispatched_meta: Meta<C>, progress, cancel| {
                let handler = handler.clone();
                async move { handler(dispatched_meta.config, progress, cancel).await }
            }
        });

        let pending_sub = meta.subscribe({
            let pending = pending.clone();
            move |_| pending.set_if_changed(true)
        });

        let state_sub = {
            let result = result.clone();
            let pending = pending.clone();
            let clocks = clocks.clone();
            let setter = setter.clone();
            let meta = meta.clone();
            dispatcher.state.subscribe(move |s| match &s.payload {
                DispatcherPayload::Loading { .. } => {}
                DispatcherPayload::Ok { data } => {
                    // Debounce is zero and `Cell` notifies synchronously, so
                    // by the time a non-superseded dispatch resolves, `meta`
                    // still holds the exact value that triggered it.
                    let dispatched_meta = meta.get();
                    let mut guard = clocks.lock().expect("async input clocks poisoned");
                    if dispatched_meta.ts > guard.external {
                        guard.external = dispatched_meta.ts;
                        drop(guard);
                        result.set_if_changed(Some(data.clone()));
                        setter(AsyncInputValue {
                            result: data.clone(),
                            meta: dispatched_meta,
                        });
                    }
                    pending.set_if_changed(false);
                }
                DispatcherPayload::Err { .. } => pending.set_if_changed(false),
            })
        };

        Self {
            config: meta.map(|m| m.config.clone()),
            result,
            pending,
            meta,
            clocks,
            _dispatcher: dispatcher,
            _subs: vec![pending_sub, state_sub],
        }
    }

    /// Applies a caller edit. The next `ts` is strictly greater than every
    /// `ts` this instance has assigned or observed so far, so reverting to
    /// a previously-seen `config` value still triggers recomputation — the
    /// dispatcher keys off `Meta<C>`, not `C` alone.
    pub fn set_config(&self, updater: impl FnOnce(&C) -> C) {
        let current = self.meta.get();
        let next_config = updater(&current.config);
        let next_ts = {
            let mut guard = self.clocks.lock().expect("async input clocks poisoned");
            let next = guard.local.max(guard.external) + 1;
            guard.local = next;
            next
        };
        self.meta.set(Meta {
            config: next_config,
            ts: next_ts,
        });
    }

    /// Applies an externally observed `_meta` update (e.g. pushed by
    /// another client). Ignored unless its `ts` is strictly greater than
    /// the internal `meta.ts` — the "external → internal sync" policy.
    pub fn sync_external(&self, incoming: Meta<C>) {
        {
            let mut guard = self.clocks.lock().expect("async input clocks poisoned");
            guard.external = guard.external.max(incoming.ts);
            guard.local = guard.local.max(incoming.ts);
        }
        if incoming.ts > self.meta.get().ts {
            self.meta.set(incoming);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn gateway_with_identity_handler() -> AsyncInput<i32, i32> {
        AsyncInput::new(
            AsyncInputValue {
                result: 1,
                meta: Meta { ts: 0, config: 1 },
            },
            |_value: AsyncInputValue<i32, i32>| {},
            |v, _progress, _cancel| async move { Ok::<_, DispatcherError>(v) },
        )
    }

    #[tokio::test]
    async fn set_config_drives_result_through_handler() {
        let pushed = Arc::new(Mutex::new(None));
        let pushed_for_setter = pushed.clone();
        let gateway = AsyncInput::new(
            AsyncInputValue {
                result: 2,
                meta: Meta { ts: 0, config: 1 },
            },
            move |value: AsyncInputValue<i32, i32>| {
                *pushed_for_setter.lock().unwrap() = Some(value);
            },
            |v, _progress, _cancel| async move { Ok::<_, DispatcherError>(v * 2) },
        );

        gateway.set_config(|_| 5);
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        assert_eq!(gateway.config.get(), 5);
        assert_eq!(gateway.result.get(), Some(10));
        let last = pushed.lock().unwrap().clone().expect("setter called");
        assert_eq!(
            last,
            AsyncInputValue {
                result: 10,
                meta: Meta { ts: 1, config: 5 },
            }
        );
    }

    #[tokio::test]
    async fn editing_back_to_a_previous_config_value_still_redispatches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_handler = calls.clone();
        let gateway = AsyncInput::new(
            AsyncInputValue {
                result: 1,
                meta: Meta { ts: 0, config: 1 },
            },
            |_value: AsyncInputValue<i32, i32>| {},
            move |v, _progress, _cancel| {
                let calls = calls_for_handler.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DispatcherError>(v)
                }
            },
        );
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gateway.set_config(|_| 2);
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        gateway.set_config(|_| 1); // back to the original value
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3, "reverting to a seen config must still redispatch");
    }

    #[tokio::test]
    async fn slow_stale_dispatch_never_reaches_the_external_setter() {
        let pushed_tses = Arc::new(Mutex::new(Vec::new()));
        let pushed_for_setter = pushed_tses.clone();
        let gateway = AsyncInput::new(
            AsyncInputValue {
                result: "".to_owned(),
                meta: Meta { ts: 0, config: "".to_owned() },
            },
            move |value: AsyncInputValue<String, String>| {
                pushed_for_setter.lock().unwrap().push(value.meta.ts);
            },
            |cfg: String, _progress, cancel| async move {
                let delay = if cfg == "a" { 50 } else { 5 };
                tokio::time::sleep(StdDuration::from_millis(delay)).await;
                if cancel.is_cancelled() {
                    return Err(DispatcherError::aborted());
                }
                Ok::<_, DispatcherError>(cfg)
            },
        );

        gateway.set_config(|_| "a".to_owned());
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        gateway.set_config(|_| "ab".to_owned());
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        let pushed = pushed_tses.lock().unwrap();
        assert_eq!(gateway.result.get(), Some("ab".to_owned()));
        assert!(!pushed.contains(&2), "the slow, superseded edit must never reach the setter");
    }

    #[tokio::test]
    async fn sync_external_with_lower_ts_is_ignored() {
        let gateway = gateway_with_identity_handler();
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        gateway.sync_external(Meta { ts: 0, config: 99 });
        assert_eq!(gateway.config.get(), 1, "ts=0 does not exceed the seeded ts=0");
    }

    #[tokio::test]
    async fn sync_external_with_higher_ts_replaces_config_and_redispatches() {
        let gateway = gateway_with_identity_handler();
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        gateway.sync_external(Meta { ts: 7, config: 42 });
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        assert_eq!(gateway.config.get(), 42);
    }

    #[tokio::test]
    async fn pending_clears_after_a_resolved_result() {
        let gateway = gateway_with_identity_handler();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(gateway.pending.get(), false);

        gateway.set_config(|_| 3);
        assert_eq!(gateway.pending.get(), true, "pending flips true as soon as meta changes");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(gateway.pending.get(), false);
    }
}
