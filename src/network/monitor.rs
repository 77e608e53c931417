//! Connectivity monitor.
//!
//! Holds the best-known [`ConnectivityState`] and publishes a transition
//! event exactly once per change. State comes from a periodic reachability
//! probe, from explicit [`NetworkMonitor::report`] calls, or both.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use super::probe::Probe;

const TRANSITION_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl ConnectivityState {
  pub fn is_online(&self) -> bool {
    matches!(self, ConnectivityState::Online)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ConnectivityState::Online => "online",
      ConnectivityState::Offline => "offline",
    }
  }
}

impl fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Observes connectivity and notifies subscribers of transitions.
///
/// Cheap to clone; clones share state. Starts Offline until the first probe
/// or report says otherwise.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<Inner>,
}

struct Inner {
  /// `None` when forced offline
  probe: Option<Arc<dyn Probe>>,
  interval: Duration,
  timeout: Duration,
  state: watch::Sender<ConnectivityState>,
  transitions: broadcast::Sender<ConnectivityState>,
  nudge: Arc<Notify>,
  initialized: AtomicBool,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    if let Ok(mut task) = self.task.lock() {
      if let Some(handle) = task.take() {
        handle.abort();
      }
    }
  }
}

impl NetworkMonitor {
  /// Monitor driven by `probe`, re-checked every `interval`.
  /// A probe taking longer than `timeout` counts as Offline.
  pub fn new(probe: Arc<dyn Probe>, interval: Duration, timeout: Duration) -> Self {
    Self::build(Some(probe), interval, timeout)
  }

  /// Monitor pinned to Offline. Probes never run and reports of Online
  /// are ignored.
  pub fn forced_offline() -> Self {
    Self::build(None, Duration::MAX, Duration::ZERO)
  }

  fn build(probe: Option<Arc<dyn Probe>>, interval: Duration, timeout: Duration) -> Self {
    let (state, _) = watch::channel(ConnectivityState::Offline);
    let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        probe,
        interval,
        timeout,
        state,
        transitions,
        nudge: Arc::new(Notify::new()),
        initialized: AtomicBool::new(false),
        task: Mutex::new(None),
      }),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    *self.inner.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state().is_online()
  }

  pub fn is_forced_offline(&self) -> bool {
    self.inner.probe.is_none()
  }

  /// Run a first probe and start the background probe loop.
  ///
  /// Idempotent: only the first call does anything.
  pub async fn initialize(&self) {
    if self.inner.initialized.swap(true, Ordering::AcqRel) {
      return;
    }
    if self.inner.probe.is_none() {
      tracing::info!("connectivity forced offline");
      return;
    }

    self.check_now().await;

    let handle = spawn_probe_loop(&self.inner);
    if let Ok(mut task) = self.inner.task.lock() {
      *task = Some(handle);
    }
  }

  /// Probe once and record the result.
  pub async fn check_now(&self) -> ConnectivityState {
    let state = match &self.inner.probe {
      None => ConnectivityState::Offline,
      Some(probe) => match tokio::time::timeout(self.inner.timeout, probe.check()).await {
        Ok(Ok(true)) => ConnectivityState::Online,
        Ok(Ok(false)) => ConnectivityState::Offline,
        Ok(Err(e)) => {
          tracing::debug!(error = %e, "probe failed");
          ConnectivityState::Offline
        }
        Err(_) => {
          tracing::debug!(timeout = ?self.inner.timeout, "probe timed out");
          ConnectivityState::Offline
        }
      },
    };
    self.report(state);
    state
  }

  /// Record a state observed from outside (e.g. a platform connectivity event).
  ///
  /// Returns true if this changed the state. Same-state reports are
  /// swallowed, so subscribers see each transition exactly once.
  pub fn report(&self, state: ConnectivityState) -> bool {
    if self.is_forced_offline() && state.is_online() {
      return false;
    }

    let transitions = &self.inner.transitions;
    let changed = self.inner.state.send_if_modified(|current| {
      if *current == state {
        return false;
      }
      *current = state;
      // Sent under the state lock so events come out in transition order
      let _ = transitions.send(state);
      true
    });

    if changed {
      tracing::info!(state = %state, "connectivity changed");
    }
    changed
  }

  /// Ask the probe loop for an immediate re-check.
  pub fn nudge(&self) {
    if self.inner.probe.is_some() {
      self.inner.nudge.notify_one();
    }
  }

  /// Receive every transition from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityState> {
    self.inner.transitions.subscribe()
  }

  /// Watch the current state (intermediate values may be skipped).
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  /// Stop the probe loop. The last known state is kept.
  pub fn shutdown(&self) {
    if let Ok(mut task) = self.inner.task.lock() {
      if let Some(handle) = task.take() {
        handle.abort();
      }
    }
  }
}

fn spawn_probe_loop(inner: &Arc<Inner>) -> JoinHandle<()> {
  let weak: Weak<Inner> = Arc::downgrade(inner);
  let nudge = inner.nudge.clone();
  let interval = inner.interval;

  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = nudge.notified() => tracing::debug!("probe nudged"),
      }

      let Some(inner) = weak.upgrade() else {
        break;
      };
      NetworkMonitor { inner }.check_now().await;
    }
  })
}
