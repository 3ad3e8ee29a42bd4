use std::{collections::VecDeque, fmt, time::Duration};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::Instant,
};

use crate::{Config, Error, Event, EventSink, Expectation, Pattern, Result, echo::Echo};

/// Identifies a pattern registered with [`EventQueue::forbid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForbidId(u64);

/// Ordered event buffer with a blocking-wait API.
///
/// Producers append through [`EventSink`] handles; the test code is the
/// single consumer and waits for events with [`expect`](Self::expect) and
/// [`expect_many`](Self::expect_many). Events are never reordered or dropped:
/// a wait removes exactly the events it matched and leaves the rest of the
/// buffer, before and after them, in arrival order.
///
/// Matching is first-match: when several buffered events satisfy a pattern,
/// the earliest one is returned.
///
/// # Example
///
/// ```rust
/// use ringside::{Config, Event, EventQueue, Pattern};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> ringside::Result {
/// let mut queue = EventQueue::new(&Config::default());
///
/// let sink = queue.sink();
/// tokio::spawn(async move {
///     sink.append(Event::new("dbus-signal").with("signal", "StatusChanged"));
///     sink.append(Event::new("dbus-return").with("method", "Connect"));
/// });
///
/// // Order of the patterns, not order of arrival
/// let [ret, signal]: [Event; 2] = queue
///     .expect_many([
///         Pattern::new("dbus-return").field("method", "Connect"),
///         Pattern::new("dbus-signal").field("signal", "StatusChanged"),
///     ])
///     .await?
///     .try_into()
///     .unwrap();
/// assert_eq!(ret.kind(), "dbus-return");
/// assert_eq!(signal.kind(), "dbus-signal");
/// # Ok(())
/// # }
/// ```
pub struct EventQueue {
    buffer: VecDeque<Event>,
    receiver: UnboundedReceiver<Event>,
    sender: UnboundedSender<Event>,
    forbidden: Vec<(ForbidId, Pattern)>,
    next_forbid_id: u64,
    echo: Echo,
    default_timeout: Option<Duration>,
    diagnostic_window: usize,
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("buffered", &self.buffer.len())
            .field("forbidden", &self.forbidden.len())
            .field("verbose", &self.echo.verbose())
            .field("observed", &self.echo.observed())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl EventQueue {
    pub fn new(config: &Config) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            buffer: VecDeque::new(),
            receiver,
            sender,
            forbidden: Vec::new(),
            next_forbid_id: 0,
            echo: Echo::new(config.verbose()),
            default_timeout: config.default_timeout(),
            diagnostic_window: config.diagnostic_window(),
        }
    }

    /// Returns a producer handle appending to this queue.
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.sender.clone())
    }

    /// Add `event` to the tail of the queue, behind anything producers have
    /// already appended.
    pub fn append(&mut self, event: Event) {
        // The queue owns the receiver, so the channel cannot be closed here.
        let _ = self.sender.send(event);
    }

    // ==================== Waiting ====================

    /// Wait for the earliest event matching `pattern` and remove it.
    ///
    /// Returns an [`Expectation`]; await it directly, or chain
    /// [`within`](Expectation::within) / [`forever`](Expectation::forever)
    /// to override the configured default timeout.
    ///
    /// ```ignore
    /// let closed = queue.expect(Pattern::new("dbus-signal").field("signal", "Closed")).await?;
    /// let ret = queue.expect("dbus-return").within(Duration::from_secs(1)).await?;
    /// ```
    pub fn expect(&mut self, pattern: impl Into<Pattern>) -> Expectation<'_, Event> {
        Expectation::new(self, vec![pattern.into()])
    }

    /// Wait until every pattern has matched a distinct event.
    ///
    /// Events are visited in arrival order and each one is claimed by the
    /// first still-unsatisfied pattern it matches. The result holds one
    /// event per pattern, in the order of `patterns`.
    pub fn expect_many<I, P>(&mut self, patterns: I) -> Expectation<'_, Vec<Event>>
    where
        I: IntoIterator<Item = P>,
        P: Into<Pattern>,
    {
        let patterns = patterns.into_iter().map(Into::into).collect();
        Expectation::new(self, patterns)
    }

    /// Remove the earliest event matching `pattern` without waiting.
    pub fn try_take(&mut self, pattern: impl Into<Pattern>) -> Result<Option<Event>> {
        let patterns = [pattern.into()];
        let mut claims = [None];
        self.scan(&patterns, &mut claims);
        self.ingest_ready(&patterns, &mut claims)?;
        Ok(claims[0].and_then(|index| self.buffer.remove(index)))
    }

    pub(crate) async fn wait(
        &mut self,
        patterns: &[Pattern],
        timeout: Option<Duration>,
    ) -> Result<Vec<Event>> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut claims = vec![None; patterns.len()];
        self.scan(patterns, &mut claims);

        loop {
            self.ingest_ready(patterns, &mut claims)?;
            if claims.iter().all(Option::is_some) {
                return Ok(self.take(&claims));
            }

            let next = match deadline {
                Some((deadline, waited)) => {
                    match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                        Ok(next) => next,
                        Err(_) => return Err(self.timeout_error(patterns, &claims, waited)),
                    }
                }
                None => self.receiver.recv().await,
            };

            match next {
                Some(event) => self.accept(event, patterns, &mut claims)?,
                None => return Err(Error::Internal("event channel closed under its queue")),
            }
        }
    }

    /// Offer every buffered event to the patterns, oldest first.
    fn scan(&self, patterns: &[Pattern], claims: &mut [Option<usize>]) {
        for (index, event) in self.buffer.iter().enumerate() {
            claim(event, index, patterns, claims);
        }
    }

    /// Move everything producers have appended so far into the buffer.
    fn ingest_ready(&mut self, patterns: &[Pattern], claims: &mut [Option<usize>]) -> Result {
        while let Ok(event) = self.receiver.try_recv() {
            self.accept(event, patterns, claims)?;
        }
        Ok(())
    }

    fn accept(
        &mut self,
        event: Event,
        patterns: &[Pattern],
        claims: &mut [Option<usize>],
    ) -> Result {
        if let Some((_, forbidden)) = self.forbidden.iter().find(|(_, p)| p.matches(&event)) {
            let err = Error::Forbidden {
                pattern: forbidden.to_string(),
                event: Box::new(event.clone()),
            };
            self.echo.observe(&event, false);
            self.buffer.push_back(event);
            return Err(err);
        }

        let handled = claim(&event, self.buffer.len(), patterns, claims);
        self.echo.observe(&event, handled);
        self.buffer.push_back(event);
        Ok(())
    }

    /// Remove the claimed events, returned in pattern order.
    fn take(&mut self, claims: &[Option<usize>]) -> Vec<Event> {
        let mut by_position: Vec<(usize, usize)> = claims
            .iter()
            .enumerate()
            .filter_map(|(slot, index)| index.map(|index| (index, slot)))
            .collect();
        // Highest index first so earlier indices stay valid.
        by_position.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut taken: Vec<Option<Event>> = vec![None; claims.len()];
        for (index, slot) in by_position {
            taken[slot] = self.buffer.remove(index);
        }
        taken.into_iter().flatten().collect()
    }

    fn timeout_error(
        &self,
        patterns: &[Pattern],
        claims: &[Option<usize>],
        waited: Duration,
    ) -> Error {
        let pattern = patterns
            .iter()
            .zip(claims)
            .filter(|(_, claim)| claim.is_none())
            .map(|(p, _)| p.to_string())
            .collect::<Vec<_>>()
            .join(" and ");

        let unmatched: Vec<&Event> = self
            .buffer
            .iter()
            .enumerate()
            .filter(|(index, _)| !claims.contains(&Some(*index)))
            .map(|(_, event)| event)
            .collect();
        let skip = unmatched.len().saturating_sub(self.diagnostic_window);
        let unmatched: Vec<Event> = unmatched.into_iter().skip(skip).cloned().collect();

        tracing::warn!(
            pattern = %pattern,
            waited = ?waited,
            buffered = self.buffer.len(),
            "expectation timed out"
        );

        Error::Timeout {
            pattern,
            waited,
            unmatched,
        }
    }

    // ==================== Forbidden events ====================

    /// Fail any wait during which an event matching `pattern` arrives.
    ///
    /// The offending event is still buffered; the wait returns
    /// [`Error::Forbidden`] without consuming anything.
    pub fn forbid(&mut self, pattern: impl Into<Pattern>) -> ForbidId {
        let id = ForbidId(self.next_forbid_id);
        self.next_forbid_id += 1;
        self.forbidden.push((id, pattern.into()));
        id
    }

    /// Lift a restriction added with [`forbid`](Self::forbid).
    pub fn unforbid(&mut self, id: ForbidId) -> bool {
        let before = self.forbidden.len();
        self.forbidden.retain(|(fid, _)| *fid != id);
        self.forbidden.len() != before
    }

    // ==================== Inspection ====================

    /// Events already moved into the buffer and not yet consumed, oldest
    /// first. Events still in flight from producers are not included.
    pub fn pending(&self) -> impl Iterator<Item = &Event> {
        self.buffer.iter()
    }

    /// Number of buffered, unconsumed events.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard every buffered and in-flight event, returning how many were
    /// dropped. In-flight events are echoed as not handled before they go.
    /// Used between test cases.
    pub fn clear(&mut self) -> usize {
        while let Ok(event) = self.receiver.try_recv() {
            self.echo.observe(&event, false);
            self.buffer.push_back(event);
        }
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.echo.set_verbose(verbose);
    }

    pub fn verbose(&self) -> bool {
        self.echo.verbose()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

/// Hand `event` to the first unsatisfied pattern it matches.
fn claim(event: &Event, index: usize, patterns: &[Pattern], claims: &mut [Option<usize>]) -> bool {
    for (pattern, slot) in patterns.iter().zip(claims.iter_mut()) {
        if slot.is_none() && pattern.matches(event) {
            *slot = Some(index);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{Value, kinds};

    fn queue() -> EventQueue {
        EventQueue::new(&Config::default().with_default_timeout(Some(Duration::from_millis(50))))
    }

    fn numbered(kind: &'static str, n: u32) -> Event {
        Event::new(kind).with("n", n)
    }

    fn n_of(event: &Event) -> Option<i64> {
        event.get("n").and_then(Value::as_i64)
    }

    #[tokio::test]
    async fn returns_buffered_match_immediately() {
        let mut q = queue();
        q.append(numbered("a", 1));
        let event = q.expect("a").await.unwrap();
        assert_eq!(n_of(&event), Some(1));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn earliest_match_wins_and_others_keep_their_order() {
        let mut q = queue();
        q.append(numbered("b", 1));
        q.append(numbered("a", 2));
        q.append(numbered("b", 3));
        q.append(numbered("a", 4));

        let first = q.expect("a").await.unwrap();
        assert_eq!(n_of(&first), Some(2));

        let remaining: Vec<_> = q.pending().filter_map(n_of).collect();
        assert_eq!(remaining, vec![1, 3, 4]);

        let second = q.expect("a").await.unwrap();
        assert_eq!(n_of(&second), Some(4));
        let remaining: Vec<_> = q.pending().filter_map(n_of).collect();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[tokio::test]
    async fn consumed_events_are_a_subsequence_of_appends() {
        let mut q = queue();
        for n in 0..10u32 {
            q.append(numbered(if n % 3 == 0 { "x" } else { "y" }, n));
        }

        let mut seen = Vec::new();
        for kind in ["y", "x", "y", "y", "x", "y", "x", "x", "y", "y"] {
            seen.push((kind, n_of(&q.expect(kind).await.unwrap()).unwrap()));
        }

        let xs: Vec<_> = seen.iter().filter(|(k, _)| *k == "x").map(|(_, n)| *n).collect();
        let ys: Vec<_> = seen.iter().filter(|(k, _)| *k == "y").map(|(_, n)| *n).collect();
        assert_eq!(xs, vec![0, 3, 6, 9]);
        assert_eq!(ys, vec![1, 2, 4, 5, 7, 8]);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_later_append() {
        let mut q = queue();
        let sink = q.sink();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sink.append(numbered("noise", 1));
            tokio::time::sleep(Duration::from_millis(10)).await;
            sink.append(numbered("wanted", 2));
        });

        let event = q.expect("wanted").within(Duration::from_secs(1)).await.unwrap();
        assert_eq!(n_of(&event), Some(2));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_buffer_unchanged() {
        let mut q = queue();
        q.append(numbered("a", 1));
        q.append(numbered("b", 2));

        let err = q.expect("c").await.unwrap_err();
        match &err {
            Error::Timeout {
                pattern, unmatched, ..
            } => {
                assert_eq!(pattern, "c()");
                assert_eq!(unmatched.len(), 2);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        let remaining: Vec<_> = q.pending().filter_map(n_of).collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_expect_many_consumes_nothing() {
        let mut q = queue();
        q.append(numbered("a", 1));

        let err = q.expect_many(["a", "b"]).await.unwrap_err();
        match err {
            Error::Timeout { pattern, unmatched, .. } => {
                assert_eq!(pattern, "b()");
                // the claimed "a" is not reported as unmatched
                assert!(unmatched.is_empty());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(q.len(), 1);
        assert!(q.expect("a").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_diagnostics_keep_most_recent_events() {
        let mut q = EventQueue::new(
            &Config::default()
                .with_default_timeout(Some(Duration::from_millis(10)))
                .with_diagnostic_window(2),
        );
        for n in 0..5 {
            q.append(numbered("noise", n));
        }
        let Error::Timeout { unmatched, .. } = q.expect("never").await.unwrap_err() else {
            panic!("expected timeout");
        };
        let ns: Vec<_> = unmatched.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn expect_many_returns_pattern_order() {
        let mut q = queue();
        let sink = q.sink();
        tokio::spawn(async move {
            sink.append(numbered("second", 1));
            tokio::time::sleep(Duration::from_millis(5)).await;
            sink.append(numbered("unrelated", 2));
            sink.append(numbered("first", 3));
        });

        let events = q.expect_many(["first", "second"]).await.unwrap();
        let ns: Vec<_> = events.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![3, 1]);
        assert_eq!(q.pending().filter_map(n_of).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn expect_many_gives_each_pattern_a_distinct_event() {
        let mut q = queue();
        q.append(numbered("a", 1));
        q.append(numbered("a", 2));

        let events = q.expect_many(["a", "a"]).await.unwrap();
        let ns: Vec<_> = events.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![1, 2]);
    }

    #[tokio::test]
    async fn expect_many_with_no_patterns_is_immediate() {
        let mut q = queue();
        q.append(numbered("a", 1));
        let events = q.expect_many(Vec::<Pattern>::new()).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn property_change_skips_stale_value() {
        let mut q = queue();
        let changed = |value: bool| {
            Event::new(kinds::MODEM_SIGNAL)
                .with("signal", "PropertyChanged")
                .with("args", vec![Value::from("Powered"), Value::from(value)])
        };
        q.append(changed(false));
        q.append(changed(true));

        let powered = Pattern::new(kinds::MODEM_SIGNAL)
            .field("signal", "PropertyChanged")
            .field("args", vec![Value::from("Powered"), Value::from(true)]);
        let event = q.expect(powered).await.unwrap();
        assert_eq!(event.arg(1), Some(&Value::Bool(true)));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_event_fails_the_wait() {
        let mut q = queue();
        let id = q.forbid(Pattern::new("dbus-signal").field("signal", "ConnectionError"));
        let sink = q.sink();
        sink.append(Event::new("dbus-signal").with("signal", "ConnectionError"));

        let err = q.expect("dbus-return").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }), "got {err:?}");
        assert_eq!(q.len(), 1);

        assert!(q.unforbid(id));
        assert!(!q.unforbid(id));
        sink.append(Event::new("dbus-signal").with("signal", "ConnectionError"));
        sink.append(Event::new("dbus-return"));
        assert!(q.expect("dbus-return").await.is_ok());
    }

    #[tokio::test]
    async fn try_take_does_not_wait() {
        let mut q = queue();
        assert!(q.try_take("a").unwrap().is_none());
        q.sink().append(numbered("a", 7));
        let event = q.try_take("a").unwrap().unwrap();
        assert_eq!(n_of(&event), Some(7));
    }

    #[tokio::test]
    async fn clear_drops_buffered_and_in_flight_events() {
        let mut q = queue();
        q.append(numbered("a", 1));
        let _ = q.try_take("nothing");
        q.sink().append(numbered("a", 2));
        let echoed = q.echo.observed();
        assert_eq!(q.clear(), 2);
        assert_eq!(q.echo.observed(), echoed + 1);
        assert!(q.is_empty());
        assert!(q.try_take("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn end_to_end_status_changed() {
        const CONNECTED: u32 = 0;
        const REQUESTED: u32 = 1;

        let mut q = queue();
        q.sink().append(
            Event::new(kinds::DBUS_SIGNAL)
                .with("signal", "StatusChanged")
                .with("args", vec![CONNECTED, REQUESTED]),
        );

        let event = q
            .expect(Pattern::new(kinds::DBUS_SIGNAL).field("signal", "StatusChanged"))
            .await
            .unwrap();
        assert_eq!(event.args(), &[Value::from(CONNECTED), Value::from(REQUESTED)]);
    }
}
