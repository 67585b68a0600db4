//! Priority Scheduler + Quota Manager (spec §4.5).
//!
//! Grounded on the aomi `ToolScheduler::run` event-loop pattern (an
//! `mpsc`-fed `tokio::select!` loop plus a periodic `tokio::time::interval`
//! tick) for the dispatcher-task shape, and on
//! [`crate::session::in_memory::InMemorySessionStore`]'s
//! `Arc<Mutex<HashMap<...>>>` idiom for the token-bucket map.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::router::Pattern;

/// `P0` (highest) through `P9` (lowest), matching spec §3's `priority in
/// {P0..P9}`.
pub type Priority = u8;
pub const MAX_PRIORITY_LEVELS: usize = 10;

/// Process-wide admission ceilings, mutable at runtime via the rule engine.
#[derive(Debug, Clone)]
pub struct CapacityLimits {
    pub max_tokens_per_sec: u32,
    pub max_rps: u32,
    pub max_concurrent: u32,
    pub max_context_length: u32,
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            max_tokens_per_sec: u32::MAX,
            max_rps: u32::MAX,
            max_concurrent: u32::MAX,
            max_context_length: u32::MAX,
        }
    }
}

/// A per-account override, matched against `account_id` by glob pattern
/// (first match wins, in registration order).
#[derive(Debug, Clone)]
pub struct AccountQuota {
    pub pattern: Pattern,
    pub max_concurrent: u32,
    pub max_rps: u32,
    pub max_tokens_per_sec: u32,
}

/// The 1-second-window counters shared by the global gate and every
/// account override. `current_concurrent` lives alongside these but is
/// **never** touched by a window rollover - only `admit`/`release` mutate
/// it (DESIGN NOTES §9, testable property / scenario 5).
#[derive(Debug, Clone, Default)]
struct WindowState {
    window_start: Option<Instant>,
    tokens_this_window: u32,
    rps_count: u32,
    current_concurrent: u32,
}

const WINDOW: Duration = Duration::from_secs(1);

impl WindowState {
    fn roll_if_needed(&mut self, now: Instant) {
        match self.window_start {
            Some(start) if now.duration_since(start) < WINDOW => {}
            _ => {
                self.window_start = Some(now);
                self.tokens_this_window = 0;
                self.rps_count = 0;
            }
        }
    }

    fn fits(&self, est_tokens: u32, limits_tokens: u32, limits_rps: u32, limits_concurrent: u32) -> bool {
        self.current_concurrent < limits_concurrent
            && self.tokens_this_window.saturating_add(est_tokens) <= limits_tokens
            && self.rps_count < limits_rps
    }

    fn admit(&mut self, est_tokens: u32) {
        self.current_concurrent += 1;
        self.tokens_this_window = self.tokens_this_window.saturating_add(est_tokens);
        self.rps_count += 1;
    }

    fn release(&mut self) {
        self.current_concurrent = self.current_concurrent.saturating_sub(1);
    }
}

/// Outcome delivered on a submitted request's result channel. A queued
/// request receives exactly `Queued` then `Scheduled`; an immediately
/// admitted request receives only `Scheduled`; a rejected request receives
/// exactly one message.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Queued { position: usize },
    Scheduled,
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    QueueTimeout,
    ShuttingDown,
    ContextTooLarge { max_context_length: u32 },
    QueueFull,
}

struct PendingRequest {
    priority: Priority,
    est_tokens: u32,
    account_id: String,
    queued_at: Instant,
    sender: mpsc::UnboundedSender<SchedulerEvent>,
    released: Arc<AtomicBool>,
}

/// A time-windowed rule overlay (weight/quota/capacity adjustment),
/// active on a weekday mask + HH:MM window with wrap-around-midnight
/// support. Timezone is modeled as a fixed UTC offset in minutes, which is
/// enough to express "9am-5pm Pacific" without pulling in a full tz
/// database.
#[derive(Debug, Clone)]
pub struct TimeWindowRule {
    pub name: String,
    /// Bit `i` (0 = Monday) set means the rule is eligible on that weekday.
    pub weekday_mask: u8,
    pub start: (u8, u8),
    pub end: (u8, u8),
    pub utc_offset_minutes: i32,
    pub weight_overrides: Option<Vec<f64>>,
    pub capacity_overrides: Option<CapacityLimits>,
}

impl TimeWindowRule {
    fn is_active(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        let offset = chrono::FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap());
        let local = now.with_timezone(&offset);
        let weekday_bit = 1u8 << local.weekday().num_days_from_monday();
        if self.weekday_mask & weekday_bit == 0 {
            return false;
        }
        let minutes_now = local.hour() * 60 + local.minute();
        let start = self.start.0 as u32 * 60 + self.start.1 as u32;
        let end = self.end.0 as u32 * 60 + self.end.1 as u32;
        if start <= end {
            (start..end).contains(&minutes_now)
        } else {
            // Wraps past midnight, e.g. 22:00-06:00.
            minutes_now >= start || minutes_now < end
        }
    }
}

#[derive(Debug, Clone)]
struct LiveConfig {
    limits: CapacityLimits,
    weights: Vec<f64>,
}

struct SchedulerState {
    tiers: Vec<VecDeque<PendingRequest>>,
    virtual_time: Vec<f64>,
    global: WindowState,
    accounts: HashMap<String, WindowState>,
    account_quotas: Vec<AccountQuota>,
    config: LiveConfig,
    baseline: LiveConfig,
    rules: Vec<TimeWindowRule>,
    active_rule_names: Vec<String>,
    shutting_down: bool,
}

impl SchedulerState {
    fn account_quota_for(&self, account_id: &str) -> Option<&AccountQuota> {
        self.account_quotas.iter().find(|q| q.pattern.matches(account_id))
    }

    fn admits(&mut self, priority: Priority, est_tokens: u32, account_id: &str, now: Instant) -> bool {
        self.global.roll_if_needed(now);
        let limits = &self.config.limits;
        if !self.global.fits(est_tokens, limits.max_tokens_per_sec, limits.max_rps, limits.max_concurrent) {
            return false;
        }
        if let Some(quota) = self.account_quota_for(account_id).cloned() {
            let state = self.accounts.entry(account_id.to_string()).or_default();
            state.roll_if_needed(now);
            if !state.fits(est_tokens, quota.max_tokens_per_sec, quota.max_rps, quota.max_concurrent) {
                return false;
            }
        }
        let _ = priority;
        true
    }

    fn admit(&mut self, est_tokens: u32, account_id: &str) {
        self.global.admit(est_tokens);
        if self.account_quota_for(account_id).is_some() {
            self.accounts.entry(account_id.to_string()).or_default().admit(est_tokens);
        }
    }

    fn release(&mut self, account_id: &str) {
        self.global.release();
        if let Some(state) = self.accounts.get_mut(account_id) {
            state.release();
        }
    }

    /// Weighted-fair-queueing pass: repeatedly admits the eligible tier with
    /// the smallest virtual time (ties broken by tier index) until no more
    /// head-of-line requests fit.
    fn dispatch(&mut self, now: Instant) {
        loop {
            // Snapshot each tier's head-of-line fields first so the borrow of
            // `self.tiers` ends before `admits` needs `&mut self` - holding
            // the shared iterator borrow across that call doesn't compile.
            let heads: Vec<(usize, Priority, u32, String)> = self
                .tiers
                .iter()
                .enumerate()
                .filter_map(|(i, queue)| {
                    queue.front().map(|head| (i, head.priority, head.est_tokens, head.account_id.clone()))
                })
                .collect();

            let mut best: Option<usize> = None;
            for (i, priority, est_tokens, account_id) in &heads {
                if !self.admits(*priority, *est_tokens, account_id, now) {
                    continue;
                }
                match best {
                    None => best = Some(*i),
                    Some(b) if self.virtual_time[*i] < self.virtual_time[b] => best = Some(*i),
                    _ => {}
                }
            }
            let Some(tier) = best else { break };
            let req = self.tiers[tier].pop_front().unwrap();
            self.admit(req.est_tokens, &req.account_id);
            let weight = self.config.weights.get(tier).copied().unwrap_or(1.0).max(0.001);
            self.virtual_time[tier] += 1.0 / weight;
            if !req.released.swap(true, Ordering::SeqCst) {
                let _ = req.sender.send(SchedulerEvent::Scheduled);
            } else {
                // Already timed out/cancelled while sitting at the head; undo the admit.
                self.release(&req.account_id);
            }
        }
    }

    fn reject_expired(&mut self, queue_timeout: Duration, now: Instant) {
        for queue in self.tiers.iter_mut() {
            let mut i = 0;
            while i < queue.len() {
                let expired = now.duration_since(queue[i].queued_at) >= queue_timeout;
                if expired {
                    let req = queue.remove(i).unwrap();
                    if !req.released.swap(true, Ordering::SeqCst) {
                        let _ = req.sender.send(SchedulerEvent::Rejected { reason: RejectReason::QueueTimeout });
                    }
                } else {
                    i += 1;
                }
            }
        }
    }

    fn apply_rules(&mut self, now: chrono::DateTime<chrono::Utc>) {
        let active: Vec<String> = self.rules.iter().filter(|r| r.is_active(now)).map(|r| r.name.clone()).collect();
        if active == self.active_rule_names {
            // Idle refresh: no rule-set change, so any manual runtime tweaks
            // made directly against `config` become the new baseline.
            self.baseline = self.config.clone();
            return;
        }
        let mut overlay = self.baseline.clone();
        for rule in self.rules.iter().filter(|r| active.contains(&r.name)) {
            if let Some(w) = &rule.weight_overrides {
                overlay.weights = w.clone();
            }
            if let Some(c) = &rule.capacity_overrides {
                overlay.limits = c.clone();
            }
        }
        self.config = overlay;
        self.active_rule_names = active;
    }

    fn drain_on_shutdown(&mut self) {
        self.shutting_down = true;
        for queue in self.tiers.iter_mut() {
            while let Some(req) = queue.pop_front() {
                if !req.released.swap(true, Ordering::SeqCst) {
                    let _ = req.sender.send(SchedulerEvent::Rejected { reason: RejectReason::ShuttingDown });
                }
            }
        }
    }
}

/// The `Release` guard returned once a submitted request is admitted.
/// `Release` (via `Drop`) is idempotent and must never drive
/// `current_concurrent` negative, even if called (dropped) more than once
/// is logically impossible since `Drop` runs once, but the inner flag also
/// guards against a double-admit race with queue-timeout eviction.
pub struct SchedulerLease {
    state: Arc<Mutex<SchedulerState>>,
    account_id: String,
    released: Arc<AtomicBool>,
}

impl Drop for SchedulerLease {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.state.lock().unwrap().release(&self.account_id);
        }
    }
}

/// Configuration for a fresh scheduler: priority tier count, per-tier WFQ
/// weights, and the initial capacity limits.
pub struct SchedulerConfig {
    pub priority_levels: usize,
    pub weights: Vec<f64>,
    pub limits: CapacityLimits,
    pub account_quotas: Vec<AccountQuota>,
    pub queue_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_levels: MAX_PRIORITY_LEVELS,
            weights: vec![1.0; MAX_PRIORITY_LEVELS],
            limits: CapacityLimits::default(),
            account_quotas: Vec::new(),
            queue_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_millis(200),
        }
    }
}

/// The priority scheduler and quota manager (spec §4.5).
pub struct PriorityScheduler {
    state: Arc<Mutex<SchedulerState>>,
    next_id: AtomicU64,
}

impl PriorityScheduler {
    /// Builds the scheduler and spawns its background dispatcher tick task
    /// (queue-timeout eviction + rule-engine evaluation). Dropping the
    /// returned `JoinHandle` does not stop the task; call [`Self::shutdown`]
    /// to stop admitting and drain pending requests.
    pub fn start(config: SchedulerConfig) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let live = LiveConfig { limits: config.limits, weights: config.weights };
        let state = Arc::new(Mutex::new(SchedulerState {
            tiers: (0..config.priority_levels).map(|_| VecDeque::new()).collect(),
            virtual_time: vec![0.0; config.priority_levels],
            global: WindowState::default(),
            accounts: HashMap::new(),
            account_quotas: config.account_quotas,
            config: live.clone(),
            baseline: live,
            rules: Vec::new(),
            active_rule_names: Vec::new(),
            shutting_down: false,
        }));
        let scheduler = Arc::new(Self {
            state: state.clone(),
            next_id: AtomicU64::new(0),
        });
        let tick = config.tick_interval;
        let queue_timeout = config.queue_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut guard = state.lock().unwrap();
                if guard.shutting_down {
                    break;
                }
                guard.reject_expired(queue_timeout, now);
                guard.apply_rules(chrono::Utc::now());
                guard.dispatch(now);
            }
        });
        (scheduler, handle)
    }

    pub fn set_rules(&self, rules: Vec<TimeWindowRule>) {
        self.state.lock().unwrap().rules = rules;
    }

    /// Submits a request for admission. Non-blocking: returns an event
    /// stream the caller awaits for `Queued`/`Scheduled`/`Rejected`
    /// notifications, and - once `Scheduled` arrives - should hold the
    /// returned lease for the request's entire execution, dropping it to
    /// release capacity exactly once.
    #[instrument(skip(self))]
    pub fn submit(
        &self,
        priority: Priority,
        est_tokens: u32,
        account_id: &str,
    ) -> (mpsc::UnboundedReceiver<SchedulerEvent>, SchedulerLease) {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let lease = SchedulerLease { state: self.state.clone(), account_id: account_id.to_string(), released: released.clone() };
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if state.shutting_down {
            released.store(true, Ordering::SeqCst);
            let _ = tx.send(SchedulerEvent::Rejected { reason: RejectReason::ShuttingDown });
            return (rx, lease);
        }

        if est_tokens > state.config.limits.max_context_length {
            released.store(true, Ordering::SeqCst);
            let _ = tx.send(SchedulerEvent::Rejected {
                reason: RejectReason::ContextTooLarge { max_context_length: state.config.limits.max_context_length },
            });
            return (rx, lease);
        }

        if state.admits(priority, est_tokens, account_id, now) {
            state.admit(est_tokens, account_id);
            let _ = tx.send(SchedulerEvent::Scheduled);
            return (rx, lease);
        }

        let tier = (priority as usize).min(state.tiers.len().saturating_sub(1));
        let position = state.tiers[tier].len();
        state.tiers[tier].push_back(PendingRequest {
            priority,
            est_tokens,
            account_id: account_id.to_string(),
            queued_at: now,
            sender: tx.clone(),
            released: released.clone(),
        });
        let _ = tx.send(SchedulerEvent::Queued { position });
        let _ = self.next_id.fetch_add(1, Ordering::Relaxed);
        (rx, lease)
    }

    /// Closes the dispatcher and rejects every pending request with
    /// `shutting_down`.
    pub fn shutdown(&self) {
        self.state.lock().unwrap().drain_on_shutdown();
    }

    pub fn current_concurrent(&self) -> u32 {
        self.state.lock().unwrap().global.current_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config(max_concurrent: u32) -> SchedulerConfig {
        SchedulerConfig {
            priority_levels: 10,
            weights: vec![1.0; 10],
            limits: CapacityLimits { max_concurrent, ..CapacityLimits::default() },
            account_quotas: Vec::new(),
            queue_timeout: StdDuration::from_millis(50),
            tick_interval: StdDuration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn scenario_4_concurrency_cap_queues_the_third_request() {
        let (scheduler, _handle) = PriorityScheduler::start(test_config(2));
        let (mut rx1, lease1) = scheduler.submit(5, 10, "acct");
        let (mut rx2, lease2) = scheduler.submit(5, 10, "acct");
        let (mut rx3, _lease3) = scheduler.submit(5, 10, "acct");

        assert!(matches!(rx1.recv().await.unwrap(), SchedulerEvent::Scheduled));
        assert!(matches!(rx2.recv().await.unwrap(), SchedulerEvent::Scheduled));
        assert!(matches!(rx3.recv().await.unwrap(), SchedulerEvent::Queued { position: 0 }));
        assert_eq!(scheduler.current_concurrent(), 2);

        drop(lease1);
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert!(matches!(rx3.recv().await.unwrap(), SchedulerEvent::Scheduled));
        drop(lease2);
    }

    #[tokio::test]
    async fn scenario_5_window_rollover_does_not_leak_concurrency_slots() {
        let (scheduler, _handle) = PriorityScheduler::start(test_config(2));
        let (mut rx1, _lease1) = scheduler.submit(5, 10, "acct");
        let (mut rx2, _lease2) = scheduler.submit(5, 10, "acct");
        assert!(matches!(rx1.recv().await.unwrap(), SchedulerEvent::Scheduled));
        assert!(matches!(rx2.recv().await.unwrap(), SchedulerEvent::Scheduled));
        assert_eq!(scheduler.current_concurrent(), 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let (mut rx3, _lease3) = scheduler.submit(5, 10, "acct");
        assert!(matches!(rx3.recv().await.unwrap(), SchedulerEvent::Queued { .. }));
        assert_eq!(scheduler.current_concurrent(), 2);
    }

    #[test]
    fn release_is_idempotent_and_never_underflows() {
        let (scheduler, _handle) = {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async { PriorityScheduler::start(test_config(1)) })
        };
        let (_rx, lease) = scheduler.submit(5, 1, "acct");
        assert_eq!(scheduler.current_concurrent(), 1);
        drop(lease);
        assert_eq!(scheduler.current_concurrent(), 0);
        scheduler.state.lock().unwrap().release("acct");
        assert_eq!(scheduler.current_concurrent(), 0);
    }

    #[test]
    fn time_window_rule_handles_midnight_wraparound() {
        use chrono::TimeZone;
        let rule = TimeWindowRule {
            name: "night".into(),
            weekday_mask: 0b0111_1111,
            start: (22, 0),
            end: (6, 0),
            utc_offset_minutes: 0,
            weight_overrides: None,
            capacity_overrides: None,
        };
        let at_23 = chrono::Utc.with_ymd_and_hms(2026, 1, 5, 23, 0, 0).unwrap();
        let at_3 = chrono::Utc.with_ymd_and_hms(2026, 1, 5, 3, 0, 0).unwrap();
        let at_12 = chrono::Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(rule.is_active(at_23));
        assert!(rule.is_active(at_3));
        assert!(!rule.is_active(at_12));
    }
}
