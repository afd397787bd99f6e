use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

use crate::contracts::{ErrorHandlerError, Message, StepError};

/// What a step hands back to the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Feed this message to the next step.
    Forward(Message),
    /// Stop processing. Not an error.
    Drop,
}

/// A unit of work in a [`ProcessorChain`](super::ProcessorChain).
///
/// Steps may run concurrently on different messages when prefetch is above
/// one, so implementations must be reentrant. The chain does not lock around
/// them.
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, message: Message) -> Result<StepOutput, StepError>;
}

/// Side-effecting hook invoked when a step fails.
///
/// It receives the message as it was before the failing step. It cannot change
/// the outcome; returning an error marks the execution unrecoverable. Stateful
/// handlers must synchronize their own state.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(
        &self,
        message: &Message,
        step: &str,
        cause: &StepError,
    ) -> Result<(), ErrorHandlerError>;
}

/// Adapts a synchronous closure into a [`Step`].
pub struct FnStep<F> {
    func: F,
}

pub fn step_fn<F>(func: F) -> FnStep<F>
where
    F: Fn(Message) -> Result<StepOutput, StepError> + Send + Sync,
{
    FnStep { func }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(Message) -> Result<StepOutput, StepError> + Send + Sync,
{
    async fn execute(&self, message: Message) -> Result<StepOutput, StepError> {
        (self.func)(message)
    }
}

/// Adapts an async closure into a [`Step`].
pub struct AsyncFnStep<F, Fut> {
    func: F,
    _future: PhantomData<fn() -> Fut>,
}

pub fn async_step_fn<F, Fut>(func: F) -> AsyncFnStep<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    AsyncFnStep {
        func,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Step for AsyncFnStep<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    async fn execute(&self, message: Message) -> Result<StepOutput, StepError> {
        (self.func)(message).await
    }
}

/// Adapts a synchronous closure into an [`ErrorHandler`].
pub struct FnErrorHandler<F> {
    func: F,
}

pub fn error_handler_fn<F>(func: F) -> FnErrorHandler<F>
where
    F: Fn(&Message, &str, &StepError) -> Result<(), ErrorHandlerError> + Send + Sync,
{
    FnErrorHandler { func }
}

#[async_trait]
impl<F> ErrorHandler for FnErrorHandler<F>
where
    F: Fn(&Message, &str, &StepError) -> Result<(), ErrorHandlerError> + Send + Sync,
{
    async fn on_error(
        &self,
        message: &Message,
        step: &str,
        cause: &StepError,
    ) -> Result<(), ErrorHandlerError> {
        (self.func)(message, step, cause)
    }
}
