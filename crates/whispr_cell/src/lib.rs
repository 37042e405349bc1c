//! Reactive primitives shared across the workspace: a synchronous [`Cell`],
//! a debounced cancellable [`Dispatcher`], and the [`AsyncInput`] gateway
//! built on top of it.

mod async_input;
mod cell;
mod dispatcher;

pub use async_input::{AsyncInput, AsyncInputValue, Meta};
pub use cell::{Cell, Subscription};
pub use dispatcher::{
    to_dispatcher_error, CancelHandle, Dispatcher, DispatcherError, DispatcherPayload,
    DispatcherState, ProgressReporter,
};
