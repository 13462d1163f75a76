//! Per-provider circuit breaker (spec §4.3).
//!
//! ```text
//! CLOSED    --[failures >= threshold]--------------> OPEN
//! OPEN      --[elapsed >= cooldown on is_available]-> HALF_OPEN (probe allowed)
//! HALF_OPEN --[record_success]-----------------------> CLOSED
//! HALF_OPEN --[record_failure]-----------------------> OPEN (cooldown restarted)
//! CLOSED    --[record_success]-----------------------> CLOSED (failures reset to 0)
//! ```
//!
//! The OPEN → HALF_OPEN transition is lazy: it happens the next time
//! `is_available` is queried for that provider, not on a timer (spec §4.3).
//! State is shared across all requests and updated atomically, grounded in
//! the teacher's use of `Arc<Mutex<_>>` for shared mutable agent state
//! (`client.rs`'s interrupt flag), generalized here to per-provider state
//! behind a single map-wide mutex (spec §5: "updated atomically
//! (compare-and-set on counters and state transitions)").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_millis(60_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ProviderCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl Default for ProviderCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

/// Shared, process-wide circuit breaker keyed by provider name.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: Mutex<HashMap<String, ProviderCircuit>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// True unless the provider's circuit is OPEN and its cooldown has not
    /// yet elapsed. Performs the lazy OPEN -> HALF_OPEN transition as a side
    /// effect of the query (spec §4.3).
    pub fn is_available(&self, provider: &str) -> bool {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(provider.to_string()).or_default();

        if circuit.state == CircuitState::Open {
            if let Some(last_failure) = circuit.last_failure {
                if last_failure.elapsed() >= self.cooldown {
                    log::warn!("circuit for {provider} entering half-open after cooldown");
                    circuit.state = CircuitState::HalfOpen;
                }
            }
        }

        circuit.state != CircuitState::Open
    }

    pub fn record_success(&self, provider: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(provider.to_string()).or_default();
        circuit.state = CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.last_failure = None;
    }

    pub fn record_failure(&self, provider: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(provider.to_string()).or_default();
        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(Instant::now());

        if circuit.state == CircuitState::HalfOpen {
            circuit.state = CircuitState::Open;
            log::warn!("circuit for {provider} reopened after half-open probe failure");
        } else if circuit.consecutive_failures >= self.failure_threshold {
            circuit.state = CircuitState::Open;
            log::warn!(
                "circuit for {provider} opened after {} consecutive failures",
                circuit.consecutive_failures
            );
        }
    }

    /// Providers currently OPEN with an unexpired cooldown (spec §4.3).
    /// Does not perform the lazy half-open transition — this is a read-only
    /// snapshot for surfacing in a UI.
    pub fn open_circuits(&self) -> Vec<String> {
        let circuits = self.circuits.lock().unwrap();
        circuits
            .iter()
            .filter(|(_, c)| {
                c.state == CircuitState::Open
                    && c.last_failure
                        .map(|t| t.elapsed() < self.cooldown)
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn state_of(&self, provider: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap();
        circuits.get(provider).map(|c| c.state).unwrap_or(CircuitState::Closed)
    }
}
