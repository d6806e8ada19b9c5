// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler always returns a future: synchronous work simply completes on
//! first poll. The consumer loop acknowledges a message only once that future
//! has resolved.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use std::future::Future;

/// Processes messages received by a listener.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    /// Handles one message.
    ///
    /// `ctx` carries the trace context propagated by the publisher. An error
    /// is logged and recorded on the consumer span; it does not stop the
    /// listener.
    async fn handle(&self, ctx: &Context, message: T) -> Result<(), HandlerError>;
}

/// A [`MessageHandler`] built from a closure, see [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure taking the decoded message as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, _ctx: &Context, message: T) -> Result<(), HandlerError> {
        (self.f)(message).await
    }
}

#[async_trait]
impl<T, H> MessageHandler<T> for std::sync::Arc<H>
where
    T: Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    async fn handle(&self, ctx: &Context, message: T) -> Result<(), HandlerError> {
        (**self).handle(ctx, message).await
    }
}
