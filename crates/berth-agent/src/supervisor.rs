//! The session supervisor.
//!
//! Its only job is to restart the session task after a delay that grows
//! with consecutive failures and is capped at the configured maximum,
//! resetting the schedule after every successful authorization. Delays
//! are fully jittered so a fleet of agents losing the orchestrator at
//! once does not reconnect in lockstep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::exec::Executor;
use crate::identity::{AgentIdentity, OrchestratorKeyCache};
use crate::procreg::ProcessRegistry;
use crate::session::{SessionContext, SessionEnd, run_session};
use crate::verify::CommandVerifier;

/// Capacity of the agent → orchestrator outbound frame channel. Frames
/// beyond it are dropped by non-critical producers while disconnected.
const OUTBOUND_CAPACITY: usize = 1_024;

/// The delay before reconnect attempt number `failures + 1`.
///
/// The ceiling doubles per consecutive failure until it hits `cap_ms`
/// (with the 1 s / 30 s defaults that is five failures in), and the
/// actual delay is drawn uniformly from zero up to the ceiling.
fn reconnect_delay(failures: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let mut ceiling_ms = base_ms.min(cap_ms);
    // Iterative doubling sidesteps shift overflow for large failure
    // counts; the loop exits as soon as the cap is reached.
    for _ in 0..failures {
        if ceiling_ms >= cap_ms {
            break;
        }
        ceiling_ms = ceiling_ms.saturating_mul(2).min(cap_ms);
    }
    Duration::from_millis(fastrand::u64(0..=ceiling_ms))
}

/// Wire the runtime and keep a session alive until shutdown.
///
/// # Errors
///
/// Returns an error only for unrecoverable startup problems (unreadable
/// identity or key cache); transport failures reconnect forever.
pub async fn run(config: AgentConfig, token: Option<String>) -> AgentResult<()> {
    let config = Arc::new(config);
    let identity = Arc::new(AgentIdentity::load_or_generate(&config)?);
    let keys = Arc::new(OrchestratorKeyCache::load(&config)?);
    let verifier = Arc::new(CommandVerifier::new(
        Arc::clone(&keys),
        config.replay_window(),
    ));

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(8);
    let processes = ProcessRegistry::new(config.app_log_capacity);
    let executor = Executor::new(
        Arc::clone(&config),
        outbound_tx,
        processes,
        Arc::clone(&identity),
        control_tx,
    );

    let ctx = SessionContext {
        config: Arc::clone(&config),
        token,
        identity,
        keys,
        verifier,
        executor,
        outbound_rx: Arc::new(Mutex::new(outbound_rx)),
        control_rx: Arc::new(Mutex::new(control_rx)),
        authorized: Arc::new(AtomicBool::new(false)),
    };

    let mut failures: u32 = 0;
    loop {
        ctx.authorized.store(false, Ordering::SeqCst);
        match run_session(&ctx).await {
            Ok(SessionEnd::Shutdown) => {
                info!("agent shutting down");
                return Ok(());
            },
            Ok(SessionEnd::Reconnect) => {
                failures = 0;
                info!("reconnecting immediately");
            },
            Err(e) => {
                // A session that made it to AUTHORIZED and then dropped
                // restarts the schedule; only repeated failures to get
                // that far back off toward the cap.
                if ctx.authorized.load(Ordering::SeqCst) {
                    failures = 0;
                }
                let delay = reconnect_delay(failures, config.backoff_base_ms, config.backoff_max_ms);
                failures = failures.saturating_add(1);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "session ended, reconnecting");
                tokio::time::sleep(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_stays_within_the_base() {
        for _ in 0..50 {
            assert!(reconnect_delay(0, 1_000, 30_000) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn ceiling_doubles_then_caps() {
        // After five failures the 1 s base has doubled past the 30 s cap.
        for failures in [1, 3, 5, 8, 40, u32::MAX] {
            assert!(
                reconnect_delay(failures, 1_000, 30_000) <= Duration::from_millis(30_000),
                "failures = {failures}"
            );
        }
    }

    #[test]
    fn base_above_cap_is_clamped() {
        for _ in 0..20 {
            assert!(reconnect_delay(0, 60_000, 30_000) <= Duration::from_millis(30_000));
        }
    }

    #[test]
    fn zero_base_never_delays() {
        assert_eq!(reconnect_delay(9, 0, 0), Duration::ZERO);
    }
}
