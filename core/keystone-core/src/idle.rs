//! Idle timeout and proactive token refresh.
//!
//! ## Phases
//!
//! ```text
//!            inactivity timeout                countdown reaches 0
//!   Active ─────────────────────► Warning ────────────────────────► LoggedOut
//!     ▲                              │                                  │
//!     └──── interaction / stay ──────┘                                  │
//!     └──────────────────────────── authenticated ──────────────────────┘
//!
//!   Active | Warning ── authentication lost ──► LoggedOut
//! ```
//!
//! [`reduce_idle`] is pure and owns the transitions. [`IdleMonitor`] feeds it
//! from tokio timers, user activity and the session watch channel, and runs
//! the periodic expiry check that refreshes the access token shortly before it
//! expires. All timers live inside the monitor task, so they stop with it on
//! logout, re-authentication and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keystone_protocol::{StorageKey, REFRESH_IN_PROGRESS_VALUE};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::clock::SessionClock;
use crate::config::SessionPolicy;
use crate::navigation::Navigator;
use crate::reauth::{ReauthCoordinator, RefreshOrigin};
use crate::session::{Session, TokenStore};
use crate::token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    Active,
    /// Countdown dialog is showing.
    Warning { remaining_secs: u64 },
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleInput {
    InactivityElapsed,
    CountdownTick,
    Interaction,
    StayActive,
    AuthenticationLost,
    Authenticated,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEffect {
    None,
    RearmIdleTimer,
    StartCountdown,
    /// Countdown ran out: clear the session and go to the login page.
    EndSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTransition {
    pub phase: IdlePhase,
    pub effect: IdleEffect,
}

impl IdleTransition {
    fn stay(phase: IdlePhase) -> Self {
        Self {
            phase,
            effect: IdleEffect::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdlePolicy {
    pub idle_timeout: Duration,
    pub countdown_secs: u64,
    pub activity_throttle: Duration,
    pub expiry_check_interval: Duration,
    pub refresh_lead: chrono::Duration,
}

impl From<&SessionPolicy> for IdlePolicy {
    fn from(policy: &SessionPolicy) -> Self {
        Self {
            idle_timeout: policy.idle_timeout(),
            countdown_secs: policy.warning_countdown_secs.max(1),
            activity_throttle: policy.activity_throttle(),
            expiry_check_interval: policy.expiry_check_interval(),
            refresh_lead: policy.refresh_lead(),
        }
    }
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::from(&SessionPolicy::default())
    }
}

pub fn reduce_idle(phase: IdlePhase, input: IdleInput, policy: &IdlePolicy) -> IdleTransition {
    use IdleInput::*;

    match (phase, input) {
        (IdlePhase::LoggedOut, Authenticated) => IdleTransition {
            phase: IdlePhase::Active,
            effect: IdleEffect::RearmIdleTimer,
        },
        (IdlePhase::LoggedOut, _) => IdleTransition::stay(IdlePhase::LoggedOut),

        (_, AuthenticationLost) => IdleTransition::stay(IdlePhase::LoggedOut),

        (IdlePhase::Active, InactivityElapsed) => IdleTransition {
            phase: IdlePhase::Warning {
                remaining_secs: policy.countdown_secs,
            },
            effect: IdleEffect::StartCountdown,
        },
        (_, Interaction | StayActive) => IdleTransition {
            phase: IdlePhase::Active,
            effect: IdleEffect::RearmIdleTimer,
        },

        (IdlePhase::Warning { remaining_secs }, CountdownTick) => {
            match remaining_secs.saturating_sub(1) {
                0 => IdleTransition {
                    phase: IdlePhase::LoggedOut,
                    effect: IdleEffect::EndSession,
                },
                remaining_secs => IdleTransition::stay(IdlePhase::Warning { remaining_secs }),
            }
        }

        (phase, CountdownTick | InactivityElapsed | Authenticated) => IdleTransition::stay(phase),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Monitor
// ═══════════════════════════════════════════════════════════════════════════════

/// Interaction kinds the host forwards; any of them counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    Wheel,
    TouchStart,
    Click,
}

#[derive(Debug)]
enum Command {
    Activity(ActivityKind),
    StayActive,
}

/// Cloneable sender for user activity, handed to input sources.
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ActivityHandle {
    pub fn record(&self, kind: ActivityKind) {
        // Send fails only once the monitor has stopped.
        let _ = self.commands.send(Command::Activity(kind));
    }
}

pub struct IdleMonitor {
    store: Arc<TokenStore>,
    reauth: ReauthCoordinator,
    navigator: Arc<dyn Navigator>,
    policy: IdlePolicy,
    clock: SessionClock,
}

impl IdleMonitor {
    pub fn new(
        store: Arc<TokenStore>,
        reauth: ReauthCoordinator,
        navigator: Arc<dyn Navigator>,
        policy: IdlePolicy,
    ) -> Self {
        Self {
            store,
            reauth,
            navigator,
            policy,
            clock: SessionClock::start(),
        }
    }

    pub fn with_clock(mut self, clock: SessionClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> IdleHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let session_rx = self.store.subscribe();
        let authenticated = self.store.is_authenticated();
        let phase = if authenticated {
            IdlePhase::Active
        } else {
            IdlePhase::LoggedOut
        };
        let (phase_tx, phase_rx) = watch::channel(phase);

        let state = MonitorState {
            last_interaction: self.clock.now(),
            idle_deadline: Instant::now() + self.policy.idle_timeout,
            store: self.store,
            reauth: self.reauth,
            navigator: self.navigator,
            policy: self.policy,
            clock: self.clock,
            phase_tx,
            phase,
            authenticated,
            last_persisted: None,
            deferred_check: false,
        };
        let task = tokio::spawn(state.run(command_rx, session_rx));

        IdleHandle {
            activity: ActivityHandle { commands },
            phase: phase_rx,
            task,
        }
    }
}

/// Owner's handle on a running monitor.
pub struct IdleHandle {
    activity: ActivityHandle,
    phase: watch::Receiver<IdlePhase>,
    task: JoinHandle<()>,
}

impl IdleHandle {
    pub fn activity(&self) -> ActivityHandle {
        self.activity.clone()
    }

    pub fn record(&self, kind: ActivityKind) {
        self.activity.record(kind);
    }

    /// The "stay signed in" button of the warning dialog.
    pub fn stay_active(&self) {
        let _ = self.activity.commands.send(Command::StayActive);
    }

    pub fn phase(&self) -> IdlePhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<IdlePhase> {
        self.phase.clone()
    }

    /// Stops the monitor and every timer it owns.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        debug!("Idle monitor stopped");
    }
}

struct MonitorState {
    store: Arc<TokenStore>,
    reauth: ReauthCoordinator,
    navigator: Arc<dyn Navigator>,
    policy: IdlePolicy,
    clock: SessionClock,
    phase_tx: watch::Sender<IdlePhase>,
    phase: IdlePhase,
    authenticated: bool,
    last_interaction: DateTime<Utc>,
    idle_deadline: Instant,
    last_persisted: Option<Instant>,
    deferred_check: bool,
}

impl MonitorState {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut session: watch::Receiver<Session>,
    ) {
        let mut countdown = every(Duration::from_secs(1));
        // The first expiry check waits a full period, so a short-lived runtime
        // does not start a refresh it will not see through.
        let mut expiry_check = every_after(self.policy.expiry_check_interval);
        debug!(phase = ?self.phase, "Idle monitor started");

        loop {
            let phase = self.phase;
            let effect = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Activity(kind)) => self.on_activity(kind),
                    Some(Command::StayActive) => self.on_stay_active(),
                    None => break,
                },
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let authenticated = session.borrow_and_update().is_authenticated;
                    self.on_authentication(authenticated)
                },
                _ = countdown.tick(), if matches!(phase, IdlePhase::Warning { .. }) => {
                    self.on_countdown_tick()
                },
                _ = tokio::time::sleep_until(self.idle_deadline), if phase == IdlePhase::Active => {
                    self.on_idle_deadline()
                },
                _ = expiry_check.tick(), if phase != IdlePhase::LoggedOut => {
                    self.check_expiry();
                    IdleEffect::None
                },
            };

            match effect {
                IdleEffect::StartCountdown => countdown.reset(),
                IdleEffect::RearmIdleTimer if phase == IdlePhase::LoggedOut => expiry_check.reset(),
                _ => {}
            }
        }
        debug!("Idle monitor exiting");
    }

    fn apply(&mut self, input: IdleInput) -> IdleEffect {
        let transition = reduce_idle(self.phase, input, &self.policy);
        if transition.phase != self.phase {
            match transition.phase {
                IdlePhase::Warning { .. } if !matches!(self.phase, IdlePhase::Warning { .. }) => {
                    info!("Inactivity timeout reached; showing logout warning");
                }
                IdlePhase::Warning { remaining_secs } => {
                    trace!(remaining_secs, "Logout countdown");
                }
                next => debug!(from = ?self.phase, to = ?next, ?input, "Idle phase changed"),
            }
            self.phase = transition.phase;
            self.phase_tx.send_replace(transition.phase);
        }

        match transition.effect {
            IdleEffect::RearmIdleTimer => {
                self.idle_deadline = Instant::now() + self.policy.idle_timeout;
            }
            IdleEffect::EndSession => {
                info!("Logout countdown elapsed; ending session");
                self.store.logout();
                self.navigator.redirect_to_login();
            }
            IdleEffect::None | IdleEffect::StartCountdown => {}
        }
        transition.effect
    }

    fn on_activity(&mut self, kind: ActivityKind) -> IdleEffect {
        if self.phase == IdlePhase::LoggedOut {
            return IdleEffect::None;
        }

        let throttled = self
            .last_persisted
            .is_some_and(|at| at.elapsed() < self.policy.activity_throttle);
        if throttled {
            self.last_interaction = self.clock.now();
        } else {
            trace!(?kind, "Recording activity");
            self.stamp_activity();
        }
        self.apply(IdleInput::Interaction)
    }

    /// Counts as an interaction of its own so the idle timer restarts everywhere.
    fn on_stay_active(&mut self) -> IdleEffect {
        if self.phase == IdlePhase::LoggedOut {
            return IdleEffect::None;
        }
        self.stamp_activity();
        self.apply(IdleInput::StayActive)
    }

    fn stamp_activity(&mut self) {
        self.last_interaction = self.clock.now();
        self.store.record_activity(self.last_interaction);
        self.last_persisted = Some(Instant::now());
    }

    fn on_authentication(&mut self, authenticated: bool) -> IdleEffect {
        if authenticated == self.authenticated {
            return IdleEffect::None;
        }
        self.authenticated = authenticated;

        if authenticated {
            self.last_interaction = self.clock.now();
            self.deferred_check = false;
            self.apply(IdleInput::Authenticated)
        } else {
            self.apply(IdleInput::AuthenticationLost)
        }
    }

    /// The local deadline only knows about this tab; another tab may have
    /// seen interaction since, in which case the timer is rearmed instead.
    fn on_idle_deadline(&mut self) -> IdleEffect {
        let latest = self
            .store
            .last_activity()
            .map_or(self.last_interaction, |shared| shared.max(self.last_interaction));
        self.last_interaction = latest;

        let remaining = latest + chrono_duration(self.policy.idle_timeout) - self.clock.now();
        match remaining.to_std() {
            Ok(remaining) if !remaining.is_zero() => {
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Recent activity in another tab; idle timer rearmed"
                );
                self.idle_deadline = Instant::now() + remaining;
                IdleEffect::None
            }
            _ => self.apply(IdleInput::InactivityElapsed),
        }
    }

    fn on_countdown_tick(&mut self) -> IdleEffect {
        let shared = self.store.last_activity();
        if shared.is_some_and(|at| at > self.last_interaction) {
            debug!("Interaction in another tab; cancelling logout warning");
            self.last_interaction = shared.unwrap_or(self.last_interaction);
            return self.apply(IdleInput::Interaction);
        }
        self.apply(IdleInput::CountdownTick)
    }

    fn check_expiry(&mut self) {
        if !self.store.is_authenticated() {
            return;
        }
        let Some(access) = self.store.access_token() else {
            return;
        };
        if !token::needs_proactive_refresh(&access, self.clock.now(), self.policy.refresh_lead) {
            self.deferred_check = false;
            return;
        }
        if self.reauth.is_refreshing() {
            trace!("Refresh already in flight");
            return;
        }

        let other_tab_refreshing = self
            .store
            .storage()
            .get(StorageKey::TokenRefreshInProgress.as_str())
            .is_some_and(|value| value == REFRESH_IN_PROGRESS_VALUE);
        if other_tab_refreshing && !self.deferred_check {
            debug!("Another tab is refreshing; deferring expiry check");
            self.deferred_check = true;
            return;
        }
        self.deferred_check = false;

        info!("Access token close to expiry; refreshing proactively");
        let reauth = self.reauth.clone();
        tokio::spawn(async move {
            // A failure has already ended the session inside the coordinator.
            if let Err(failure) = reauth.refresh(RefreshOrigin::Proactive).await {
                debug!(error = %failure, "Proactive refresh failed");
            }
        });
    }
}

fn every(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn every_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
