//! Outgoing-request admission control
//!
//! Decides for each query whether to transmit now or queue it. At most one
//! request per (colliding) terminator is outstanding at a time, sends for
//! the same terminator are throttled so the terminal is never hammered with
//! queries (some consoles freeze under a burst of them), and outstanding
//! requests the terminal never answered are evicted after a staleness
//! window so they cannot block new requests forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::TimingConfig;
use crate::parser::Expecter;
use crate::sequence::QueryRequest;

/// Clock function, swappable for deterministic tests. The scheduler only
/// calls it from its own methods, so no thread-safety bounds are needed.
pub type NowFn = Arc<dyn Fn() -> Instant>;

/// Last transmission time per terminator. Shared with background pollers,
/// hence the lock; everything else in the scheduler is single-threaded.
type LastSendMap = Arc<Mutex<HashMap<String, Instant>>>;

/// Why a request cannot go out right now.
enum BlockReason {
    /// The same terminator was sent within the throttle window.
    TooManyRequests,
    /// The parser still expects a reply colliding with this terminator.
    OutstandingRequest,
}

/// Schedules [`QueryRequest`]s against a response parser.
///
/// Owns the parser (the host feeds terminal input through
/// [`RequestScheduler::parser_mut`]) and the raw-output sink, the single
/// seam through which this subsystem writes to the terminal.
pub struct RequestScheduler<P: Expecter> {
    parser: P,
    output: Box<dyn FnMut(&str)>,
    /// Requests not yet sent, FIFO, with enqueue time.
    queued: Vec<(QueryRequest, Instant)>,
    last_send: LastSendMap,
    throttle: Duration,
    scan_throttle: Duration,
    stale_timeout: Duration,
    last_run: Instant,
    now: NowFn,
}

impl<P: Expecter> RequestScheduler<P> {
    /// Create a scheduler with default timings writing through `output`.
    pub fn new(parser: P, output: impl FnMut(&str) + 'static) -> Self {
        Self::with_config(parser, output, &TimingConfig::default())
    }

    /// Create a scheduler with explicit timings.
    pub fn with_config(
        parser: P,
        output: impl FnMut(&str) + 'static,
        config: &TimingConfig,
    ) -> Self {
        Self {
            parser,
            output: Box::new(output),
            queued: Vec::new(),
            last_send: Arc::new(Mutex::new(HashMap::new())),
            throttle: config.throttle(),
            scan_throttle: config.schedule_scan(),
            stale_timeout: config.stale_timeout(),
            last_run: Instant::now(),
            now: Arc::new(Instant::now),
        }
    }

    /// Replace the clock. For tests that need repeatable timings.
    pub fn with_clock(mut self, now: NowFn) -> Self {
        self.last_run = now();
        self.now = now;
        self
    }

    /// The parser this scheduler registers expectations with.
    pub fn parser(&self) -> &P {
        &self.parser
    }

    /// Mutable parser access, for feeding terminal input through it.
    pub fn parser_mut(&mut self) -> &mut P {
        &mut self.parser
    }

    /// Number of requests waiting in the queue.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Handle to the last-send table for background staleness polling.
    pub fn last_send_table(&self) -> Arc<Mutex<HashMap<String, Instant>>> {
        Arc::clone(&self.last_send)
    }

    /// Send `request` immediately if its terminator is clear, otherwise
    /// queue it. Returns `true` if it was sent.
    pub fn send_or_schedule(&mut self, request: QueryRequest) -> bool {
        match self.try_send(request) {
            Ok(()) => true,
            Err(request) => {
                debug!(terminator = request.terminator(), "queueing request");
                let now = (self.now)();
                self.queued.push((request, now));
                false
            }
        }
    }

    /// Re-evaluate the queue; intended to run once per UI tick. Skipped
    /// when called again within the scan throttle unless `force` is set.
    /// Sends at most one request per call (bounded per-tick work) and
    /// returns whether anything went out.
    pub fn run_schedule(&mut self, force: bool) -> bool {
        let now = (self.now)();
        if !force && now - self.last_run < self.scan_throttle {
            return false;
        }
        self.last_run = now;

        // First queued entry that can go now; a blocked terminator must not
        // starve the rest of the queue.
        let sendable = self
            .queued
            .iter()
            .position(|(request, _)| self.can_send(request).is_ok());

        if let Some(idx) = sendable {
            let (request, _) = self.queued.remove(idx);
            self.send(request);
            return true;
        }

        self.evict_all_stale();
        false
    }

    /// Drop still-queued requests whose terminator equals `terminator`
    /// exactly, firing their abandon callbacks. Outstanding requests are
    /// not touched; those resolve through staleness eviction. Returns how
    /// many were cancelled.
    pub fn cancel(&mut self, terminator: &str) -> usize {
        let mut cancelled = 0;
        let mut i = 0;
        while i < self.queued.len() {
            if self.queued[i].0.terminator() == terminator {
                let (request, _) = self.queued.remove(i);
                debug!(terminator, "cancelling queued request");
                request.abandon();
                cancelled += 1;
            } else {
                i += 1;
            }
        }
        cancelled
    }

    fn try_send(&mut self, request: QueryRequest) -> Result<(), QueryRequest> {
        match self.can_send(&request) {
            Ok(()) => {
                self.send(request);
                Ok(())
            }
            Err(BlockReason::OutstandingRequest) => {
                // The outstanding request may be long dead; if so, evict it
                // and try once more.
                if self.evict_if_stale(request.terminator()) && self.can_send(&request).is_ok() {
                    self.send(request);
                    return Ok(());
                }
                Err(request)
            }
            Err(BlockReason::TooManyRequests) => Err(request),
        }
    }

    fn can_send(&self, request: &QueryRequest) -> Result<(), BlockReason> {
        if self.should_throttle(request.terminator()) {
            return Err(BlockReason::TooManyRequests);
        }
        if self.parser.is_expecting(request.terminator()) {
            return Err(BlockReason::OutstandingRequest);
        }
        Ok(())
    }

    fn send(&mut self, request: QueryRequest) {
        let (sequence, on_response, on_abandoned) = request.into_parts();
        let now = (self.now)();
        self.lock_last_send()
            .insert(sequence.terminator().to_string(), now);
        self.parser
            .expect_response(sequence.terminator(), on_response, on_abandoned);
        debug!(request = ?sequence.request(), terminator = sequence.terminator(), "sending request");
        (self.output)(sequence.request());
    }

    fn should_throttle(&self, terminator: &str) -> bool {
        match self.lock_last_send().get(terminator) {
            Some(&sent_at) => (self.now)() - sent_at < self.throttle,
            None => false,
        }
    }

    fn is_stale(&self, sent_at: Instant) -> bool {
        (self.now)() - sent_at > self.stale_timeout
    }

    /// If the last send for `terminator` is old enough to presume the
    /// terminal will never answer, demote its expectation and report `true`.
    fn evict_if_stale(&mut self, terminator: &str) -> bool {
        let sent_at = self.lock_last_send().get(terminator).copied();
        match sent_at {
            Some(at) if self.is_stale(at) => {
                debug!(terminator, "evicting stale request");
                self.parser.stop_expecting(terminator);
                true
            }
            _ => false,
        }
    }

    fn evict_all_stale(&mut self) {
        let stale: Vec<String> = self
            .lock_last_send()
            .iter()
            .filter(|(_, &sent_at)| self.is_stale(sent_at))
            .map(|(terminator, _)| terminator.clone())
            .collect();

        for terminator in stale {
            trace!(terminator = %terminator, "stale sweep");
            self.evict_if_stale(&terminator);
        }
    }

    fn lock_last_send(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // A poisoned lock here only means a panicking reader; the map
        // itself stays usable.
        self.last_send
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::sequence::{AbandonedFn, AnsiSequence, ResponseFn};

    /// Scripted parser stand-in recording what the scheduler asks of it.
    #[derive(Default)]
    struct StubExpecter {
        expecting: HashSet<String>,
        expected_calls: Vec<String>,
        stopped_calls: Vec<String>,
    }

    impl Expecter for StubExpecter {
        fn expect_response(
            &mut self,
            terminator: &str,
            _on_response: ResponseFn,
            _on_abandoned: Option<AbandonedFn>,
        ) {
            self.expected_calls.push(terminator.to_string());
            self.expecting.insert(terminator.to_string());
        }

        fn is_expecting(&self, terminator: &str) -> bool {
            self.expecting.contains(terminator)
        }

        fn stop_expecting(&mut self, terminator: &str) {
            self.stopped_calls.push(terminator.to_string());
            self.expecting.remove(terminator);
        }
    }

    /// Manually-advanced clock, the moral equivalent of the injectable
    /// `now` the scheduler exposes for tests.
    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset: Arc<StdMutex<Duration>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Arc::new(StdMutex::new(Duration::ZERO)),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }

        fn now_fn(&self) -> NowFn {
            let clock = self.clone();
            Arc::new(move || clock.base + *clock.offset.lock().unwrap())
        }
    }

    fn dar_request() -> QueryRequest {
        QueryRequest::new(AnsiSequence::device_attributes(), |_| {})
    }

    fn scheduler_with_clock(
        clock: &ManualClock,
    ) -> (RequestScheduler<StubExpecter>, Rc<RefCell<String>>) {
        let written = Rc::new(RefCell::new(String::new()));
        let sink = written.clone();
        let scheduler = RequestScheduler::new(StubExpecter::default(), move |bytes| {
            sink.borrow_mut().push_str(bytes)
        })
        .with_clock(clock.now_fn());
        (scheduler, written)
    }

    #[test]
    fn test_sends_when_nothing_outstanding() {
        let clock = ManualClock::new();
        let (mut scheduler, written) = scheduler_with_clock(&clock);

        assert!(scheduler.send_or_schedule(dar_request()));
        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(*written.borrow(), "\x1b[0c");
        assert_eq!(scheduler.parser().expected_calls, vec!["c"]);
    }

    #[test]
    fn test_queues_on_outstanding_collision() {
        let clock = ManualClock::new();
        let (mut scheduler, written) = scheduler_with_clock(&clock);
        scheduler.parser_mut().expecting.insert("c".to_string());

        assert!(!scheduler.send_or_schedule(dar_request()));
        assert_eq!(scheduler.queued_len(), 1);
        assert_eq!(*written.borrow(), "");
    }

    #[test]
    fn test_throttle_queues_within_window() {
        let clock = ManualClock::new();
        let (mut scheduler, written) = scheduler_with_clock(&clock);

        assert!(scheduler.send_or_schedule(dar_request()));
        // Pretend the terminal answered instantly.
        scheduler.parser_mut().expecting.clear();

        // 55ms later: inside the 100ms throttle, must queue.
        clock.advance(Duration::from_millis(55));
        assert!(!scheduler.send_or_schedule(dar_request()));
        assert_eq!(scheduler.queued_len(), 1);
        assert_eq!(*written.borrow(), "\x1b[0c");
    }

    #[test]
    fn test_send_allowed_after_throttle_window() {
        let clock = ManualClock::new();
        let (mut scheduler, written) = scheduler_with_clock(&clock);

        assert!(scheduler.send_or_schedule(dar_request()));
        scheduler.parser_mut().expecting.clear();

        clock.advance(Duration::from_millis(101));
        assert!(scheduler.send_or_schedule(dar_request()));
        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(*written.borrow(), "\x1b[0c\x1b[0c");
    }

    #[test]
    fn test_run_schedule_throttled_then_sends() {
        let clock = ManualClock::new();
        let (mut scheduler, _written) = scheduler_with_clock(&clock);

        assert!(scheduler.send_or_schedule(dar_request()));
        scheduler.parser_mut().expecting.clear();

        clock.advance(Duration::from_millis(55));
        assert!(!scheduler.send_or_schedule(dar_request()));

        // Scan throttle still active.
        assert!(!scheduler.run_schedule(false));

        clock.advance(Duration::from_millis(35)); // t = 90ms
        assert!(!scheduler.run_schedule(false));

        clock.advance(Duration::from_millis(15)); // t = 105ms
        assert!(scheduler.run_schedule(false));
        assert_eq!(scheduler.queued_len(), 0);
    }

    #[test]
    fn test_run_schedule_force_bypasses_scan_throttle() {
        let clock = ManualClock::new();
        let (mut scheduler, _written) = scheduler_with_clock(&clock);
        scheduler.parser_mut().expecting.insert("c".to_string());

        assert!(!scheduler.send_or_schedule(dar_request()));

        // Still blocked by the expectation even when forced.
        assert!(!scheduler.run_schedule(true));

        scheduler.parser_mut().expecting.clear();
        clock.advance(Duration::from_millis(200));
        assert!(scheduler.run_schedule(true));
    }

    #[test]
    fn test_stale_eviction_unblocks_terminator() {
        let clock = ManualClock::new();
        let (mut scheduler, written) = scheduler_with_clock(&clock);

        // Sent and never answered.
        assert!(scheduler.send_or_schedule(dar_request()));
        assert!(!scheduler.send_or_schedule(dar_request()));
        assert_eq!(scheduler.queued_len(), 1);

        // Past the staleness window the dead request is demoted and the
        // new send goes straight out.
        clock.advance(Duration::from_millis(5001));
        assert!(scheduler.send_or_schedule(dar_request()));
        assert_eq!(scheduler.parser().stopped_calls, vec!["c"]);
        assert_eq!(*written.borrow(), "\x1b[0c\x1b[0c");
    }

    #[test]
    fn test_queue_scan_skips_blocked_terminator() {
        let clock = ManualClock::new();
        let (mut scheduler, written) = scheduler_with_clock(&clock);
        scheduler.parser_mut().expecting.insert("c".to_string());
        scheduler.parser_mut().expecting.insert("R".to_string());

        // Both collide at enqueue time.
        assert!(!scheduler.send_or_schedule(dar_request()));
        assert!(!scheduler.send_or_schedule(QueryRequest::new(
            AnsiSequence::cursor_position_report(),
            |_| {},
        )));
        assert_eq!(scheduler.queued_len(), 2);

        // Only 'R' clears; the scan must pick it even though the blocked
        // 'c' entry is older.
        scheduler.parser_mut().expecting.remove("R");
        assert!(scheduler.run_schedule(true));
        assert_eq!(scheduler.queued_len(), 1);
        assert_eq!(*written.borrow(), "\x1b[?6n");
        assert_eq!(scheduler.queued[0].0.terminator(), "c");
    }

    #[test]
    fn test_stale_sweep_on_idle_scan() {
        let clock = ManualClock::new();
        let (mut scheduler, _written) = scheduler_with_clock(&clock);

        assert!(scheduler.send_or_schedule(dar_request()));

        clock.advance(Duration::from_millis(5001));
        // Nothing queued: a scan returns false but sweeps stale sends.
        assert!(!scheduler.run_schedule(true));
        assert_eq!(scheduler.parser().stopped_calls, vec!["c"]);
    }

    #[test]
    fn test_cancel_queued_requests() {
        let clock = ManualClock::new();
        let (mut scheduler, _written) = scheduler_with_clock(&clock);
        scheduler.parser_mut().expecting.insert("c".to_string());

        let abandoned = Rc::new(RefCell::new(0));
        let seen = abandoned.clone();
        let request = QueryRequest::new(AnsiSequence::device_attributes(), |_| {})
            .on_abandoned(move || *seen.borrow_mut() += 1);

        assert!(!scheduler.send_or_schedule(request));
        assert_eq!(scheduler.cancel("c"), 1);
        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(*abandoned.borrow(), 1);

        // Nothing left to cancel; outstanding expectations are untouched.
        assert_eq!(scheduler.cancel("c"), 0);
        assert!(scheduler.parser().stopped_calls.is_empty());
    }

    #[test]
    fn test_last_send_table_shared() {
        let clock = ManualClock::new();
        let (mut scheduler, _written) = scheduler_with_clock(&clock);
        let table = scheduler.last_send_table();

        assert!(scheduler.send_or_schedule(dar_request()));
        assert!(table.lock().unwrap().contains_key("c"));
    }
}
