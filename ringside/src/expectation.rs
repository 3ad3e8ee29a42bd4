use std::{fmt, future::IntoFuture, marker::PhantomData, pin::Pin, time::Duration};

use crate::{Error, Event, EventQueue, Pattern, Result};

/// A pending wait on an [`EventQueue`].
///
/// Created by [`EventQueue::expect`] (resolves to one [`Event`]) and
/// [`EventQueue::expect_many`] (resolves to `Vec<Event>`). Nothing happens
/// until the expectation is awaited. While it is pending the calling task
/// yields, so producers on the same runtime keep appending.
///
/// The queue's default timeout applies unless overridden. On expiry the
/// wait fails with [`Error::Timeout`] and no event is consumed.
///
/// # Example
///
/// ```ignore
/// // Configured default timeout
/// queue.expect("dbus-return").await?;
///
/// // With a custom timeout
/// queue.expect("dbus-return").within(Duration::from_secs(3)).await?;
///
/// // No timeout at all
/// queue.expect("process-connected").forever().await?;
/// ```
#[must_use = "expectations do nothing unless awaited"]
pub struct Expectation<'a, T> {
    queue: &'a mut EventQueue,
    patterns: Vec<Pattern>,
    timeout: Option<Duration>,
    _output: PhantomData<fn() -> T>,
}

impl<'a, T> Expectation<'a, T> {
    pub(crate) fn new(queue: &'a mut EventQueue, patterns: Vec<Pattern>) -> Self {
        let timeout = queue.default_timeout();
        Self {
            queue,
            patterns,
            timeout,
            _output: PhantomData,
        }
    }

    /// Override the default timeout.
    pub fn within(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait without a timeout.
    pub fn forever(mut self) -> Self {
        self.timeout = None;
        self
    }

    async fn run(self) -> Result<Vec<Event>> {
        for pattern in &self.patterns {
            tracing::trace!(pattern = %pattern, timeout = ?self.timeout, "expecting");
        }
        self.queue.wait(&self.patterns, self.timeout).await
    }
}

impl<'a> IntoFuture for Expectation<'a, Event> {
    type Output = Result<Event>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.run()
                .await?
                .into_iter()
                .next()
                .ok_or(Error::Internal("single expectation resolved without an event"))
        })
    }
}

impl<'a> IntoFuture for Expectation<'a, Vec<Event>> {
    type Output = Result<Vec<Event>>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

impl<T> fmt::Debug for Expectation<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("queue", &self.queue)
            .field("patterns", &self.patterns)
            .field("timeout", &self.timeout)
            .finish()
    }
}
