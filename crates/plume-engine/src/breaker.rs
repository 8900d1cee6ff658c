use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use plume_contracts::config::BreakerSettings;
use tracing::{info, warn};

use crate::error::{GenerationError, Result};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.base + *offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub consecutive_failures: u32,
    pub min_requests: u32,
    pub failure_ratio: f64,
    pub open_timeout: Duration,
    pub half_open_max_requests: u32,
    pub interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            consecutive_failures: settings.consecutive_failures.max(1),
            min_requests: settings.min_requests,
            failure_ratio: settings.failure_ratio,
            open_timeout: Duration::from_secs(settings.open_timeout_secs),
            half_open_max_requests: settings.half_open_max_requests.max(1),
            interval: Duration::from_secs(settings.interval_secs),
        }
    }
}

impl BreakerConfig {
    fn should_trip(&self, counts: &Counts) -> bool {
        if counts.consecutive_failures >= self.consecutive_failures {
            return true;
        }
        counts.requests >= self.min_requests
            && counts.requests > 0
            && f64::from(counts.total_failures) / f64::from(counts.requests) > self.failure_ratio
    }
}

pub type TransitionObserver = Arc<dyn Fn(&CircuitTransition) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// End of the counting interval when closed, end of the cooldown when open.
    expiry: Option<Instant>,
}

/// Per-backend-family circuit breaker shared by every client of that family.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    observer: Option<TransitionObserver>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let expiry = interval_end(&config, clock.now());
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.lock();
            self.refresh(&mut inner, self.clock.now(), &mut transitions);
            inner.state
        };
        self.notify(&transitions);
        state
    }

    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Runs `op` if the breaker admits it. Every error returned by `op` counts
    /// as a failure; results that arrive after a state change are discarded.
    pub fn execute<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let generation = self.before_request()?;
        let result = op();
        self.after_request(generation, result.is_ok());
        result
    }

    fn before_request(&self) -> Result<u64> {
        let mut transitions = Vec::new();
        let admitted = {
            let mut inner = self.lock();
            let now = self.clock.now();
            self.refresh(&mut inner, now, &mut transitions);
            match inner.state {
                CircuitState::Open => Err(GenerationError::CircuitOpen {
                    backend: self.name.clone(),
                    retry_in: inner
                        .expiry
                        .map(|expiry| expiry.saturating_duration_since(now))
                        .unwrap_or(self.config.open_timeout),
                }),
                CircuitState::HalfOpen if inner.counts.requests >= self.config.half_open_max_requests => {
                    Err(GenerationError::HalfOpenFull {
                        backend: self.name.clone(),
                        max_requests: self.config.half_open_max_requests,
                    })
                }
                _ => {
                    inner.counts.requests += 1;
                    Ok(inner.generation)
                }
            }
        };
        self.notify(&transitions);
        admitted
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            let now = self.clock.now();
            self.refresh(&mut inner, now, &mut transitions);
            if inner.generation == generation {
                if success {
                    self.on_success(&mut inner, now, &mut transitions);
                } else {
                    self.on_failure(&mut inner, now, &mut transitions);
                }
            }
        }
        self.notify(&transitions);
    }

    fn on_success(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Vec<CircuitTransition>) {
        inner.counts.on_success();
        if inner.state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.config.half_open_max_requests
        {
            self.set_state(inner, CircuitState::Closed, now, transitions);
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Vec<CircuitTransition>) {
        inner.counts.on_failure();
        match inner.state {
            CircuitState::Closed if self.config.should_trip(&inner.counts) => {
                self.set_state(inner, CircuitState::Open, now, transitions);
            }
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open, now, transitions);
            }
            _ => {}
        }
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Vec<CircuitTransition>) {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            CircuitState::Closed if expired => self.new_generation(inner, now),
            CircuitState::Open if expired => {
                self.set_state(inner, CircuitState::HalfOpen, now, transitions);
            }
            _ => {}
        }
    }

    fn set_state(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
        now: Instant,
        transitions: &mut Vec<CircuitTransition>,
    ) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);
        transitions.push(CircuitTransition {
            name: self.name.clone(),
            from,
            to,
        });
    }

    fn new_generation(&self, inner: &mut BreakerState, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => interval_end(&self.config, now),
            CircuitState::Open => Some(now + self.config.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: &[CircuitTransition]) {
        for transition in transitions {
            if transition.to == CircuitState::Open {
                warn!(
                    breaker = %transition.name,
                    from = %transition.from,
                    to = %transition.to,
                    "circuit breaker opened"
                );
            } else {
                info!(
                    breaker = %transition.name,
                    from = %transition.from,
                    to = %transition.to,
                    "circuit breaker state changed"
                );
            }
            if let Some(observer) = &self.observer {
                observer(transition);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.lock().state)
            .finish_non_exhaustive()
    }
}

fn interval_end(config: &BreakerConfig, now: Instant) -> Option<Instant> {
    (!config.interval.is_zero()).then(|| now + config.interval)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::with_clock("bedrock", BreakerConfig::default(), clock.clone());
        (breaker, clock)
    }

    fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| Err(GenerationError::validation("bedrock", "boom")))
    }

    fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| Ok(()))
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let (breaker, _clock) = breaker();
        for _ in 0..4 {
            let _ = fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn opens_on_failure_ratio_with_enough_requests() {
        let (breaker, _clock) = breaker();
        // 7 failures in 10 requests, never 5 in a row.
        let pattern = [false, false, false, true, false, false, false, true, true, false];
        for ok in pattern {
            let _ = if ok { succeed(&breaker) } else { fail(&breaker) };
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn ratio_needs_minimum_request_count() {
        let (breaker, _clock) = breaker();
        for ok in [false, false, true, false, false, true, false, false] {
            let _ = if ok { succeed(&breaker) } else { fail(&breaker) };
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_breaker_rejects_without_running_the_operation() {
        let (breaker, _clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker);
        }
        let mut called = false;
        let result = breaker.execute(|| {
            called = true;
            Ok(())
        });
        assert!(!called);
        assert!(matches!(
            result,
            Err(GenerationError::CircuitOpen { retry_in, .. }) if retry_in == Duration::from_secs(30)
        ));
    }

    #[test]
    fn half_open_admits_limited_trial_calls_then_closes() -> Result<()> {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker);
        }
        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Three trial calls in flight at once; a fourth is turned away.
        let fourth = breaker.execute(|| {
            breaker.execute(|| {
                breaker.execute(|| Ok(breaker.execute(|| Ok(()))))
            })
        })?;
        assert!(matches!(fourth, Err(GenerationError::HalfOpenFull { max_requests: 3, .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
        Ok(())
    }

    #[test]
    fn failed_trial_call_reopens() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker);
        }
        clock.advance(Duration::from_secs(31));
        assert!(succeed(&breaker).is_ok());
        let _ = fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn counts_reset_each_interval_while_closed() {
        let (breaker, clock) = breaker();
        for _ in 0..4 {
            let _ = fail(&breaker);
        }
        clock.advance(Duration::from_secs(60));
        let _ = fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 1);
    }

    #[test]
    fn results_from_a_previous_generation_are_ignored() {
        let (breaker, _clock) = breaker();
        let result = breaker.execute(|| {
            for _ in 0..5 {
                let _ = fail(&breaker);
            }
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn observer_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::with_clock("vertex", BreakerConfig::default(), clock.clone())
            .with_observer(Arc::new(move |transition: &CircuitTransition| {
                if let Ok(mut seen) = sink.lock() {
                    seen.push((transition.from, transition.to));
                }
            }));

        for _ in 0..5 {
            let _ = fail(&breaker);
        }
        clock.advance(Duration::from_secs(30));
        for _ in 0..3 {
            let _ = succeed(&breaker);
        }

        let seen = seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn concurrent_callers_are_counted_exactly() {
        let config = BreakerConfig {
            consecutive_failures: u32::MAX,
            min_requests: u32::MAX,
            ..BreakerConfig::default()
        };
        let breaker = Arc::new(CircuitBreaker::with_clock(
            "gemini",
            config,
            Arc::new(ManualClock::new()),
        ));
        std::thread::scope(|scope| {
            for worker in 0..8 {
                let breaker = breaker.clone();
                scope.spawn(move || {
                    for call in 0..250 {
                        let _ = if (worker + call) % 2 == 0 {
                            succeed(&breaker)
                        } else {
                            fail(&breaker)
                        };
                    }
                });
            }
        });
        let counts = breaker.counts();
        assert_eq!(counts.requests, 2000);
        assert_eq!(counts.total_successes, 1000);
        assert_eq!(counts.total_failures, 1000);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn concurrent_failures_trip_the_breaker_once() {
        let opened = Arc::new(AtomicUsize::new(0));
        let sink = opened.clone();
        let admitted = Arc::new(AtomicUsize::new(0));
        let breaker = Arc::new(
            CircuitBreaker::with_clock("bedrock", BreakerConfig::default(), Arc::new(ManualClock::new()))
                .with_observer(Arc::new(move |transition: &CircuitTransition| {
                    if transition.to == CircuitState::Open {
                        sink.fetch_add(1, Ordering::SeqCst);
                    }
                })),
        );
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let breaker = breaker.clone();
                let admitted = admitted.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        let _ = breaker.execute(|| -> Result<()> {
                            admitted.fetch_add(1, Ordering::SeqCst);
                            Err(GenerationError::validation("bedrock", "boom"))
                        });
                    }
                });
            }
        });
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        // Only calls admitted before the fifth failure landed ran; everything
        // after was rejected without running.
        let ran = admitted.load(Ordering::SeqCst);
        assert!((5..=5 + 7).contains(&ran), "{ran}");
    }
}
