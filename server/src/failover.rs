//! Exit-node health checking and race-free failover.
//!
//! Health is a circuit breaker per exit: three consecutive failed probes
//! degrade it, five fail it, and a single success restores it (a node
//! recovers faster than it fails). All reassignment decisions run on one
//! sequential worker, each inside an IMMEDIATE transaction, so two remotes
//! sharing a failing exit always land on the same replacement. Recovery
//! never triggers automatic failback.

use std::{
    collections::HashMap,
    process::Command,
    sync::mpsc,
    thread,
    time::Duration,
};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use wgfleet_shared::{
    Endpoint, ExitGroupMember, ExitHealth, HealthState, SelectionStrategy,
};

use crate::{
    db::{
        self, Db, DatabaseExit, DatabaseExitGroup, DatabaseExitHealth, DatabaseFailover,
        DatabaseRemote,
    },
    journal::{Event, EventBus},
    Error,
};

/// Consecutive failures before a healthy exit is degraded.
pub const DEGRADED_AFTER: u32 = 3;
/// Consecutive failures before a degraded exit is failed.
pub const FAILED_AFTER: u32 = 5;

/// Result of probing one exit once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: Option<u32>,
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn up(latency_ms: u32) -> Self {
        ProbeOutcome {
            success: true,
            latency_ms: Some(latency_ms),
            reason: None,
        }
    }

    pub fn down(reason: &str) -> Self {
        ProbeOutcome {
            success: false,
            latency_ms: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Applies one probe result to a health row. Pure; persistence is the
/// caller's business.
pub fn apply_probe(health: &mut ExitHealth, outcome: &ProbeOutcome) {
    let now = Utc::now();
    health.last_check_at = Some(now);
    if outcome.success {
        health.consecutive_successes += 1;
        health.consecutive_failures = 0;
        health.latency_ms = outcome.latency_ms;
        if let Some(ms) = outcome.latency_ms {
            health.record_latency(ms);
        }
        health.last_success_at = Some(now);
        health.failure_reason = None;
        health.state = HealthState::Healthy;
    } else {
        health.consecutive_failures += 1;
        health.consecutive_successes = 0;
        health.last_failure_at = Some(now);
        health.failure_reason = outcome.reason.clone();
        if health.consecutive_failures >= FAILED_AFTER {
            health.state = HealthState::Failed;
        } else if health.consecutive_failures >= DEGRADED_AFTER {
            health.state = HealthState::Degraded;
        }
    }
}

/// Chooses an exit for a group. Deterministic: the same members, health and
/// cursor always produce the same result.
///
/// Returns the chosen exit and the advanced round-robin cursor.
pub fn select_exit(
    strategy: SelectionStrategy,
    members: &[ExitGroupMember],
    health: &HashMap<i64, ExitHealth>,
    rr_cursor: i64,
) -> (Option<i64>, i64) {
    let eligible: Vec<&ExitGroupMember> = members
        .iter()
        .filter(|m| m.enabled)
        .filter(|m| {
            health
                .get(&m.exit_id)
                .map(|h| h.state != HealthState::Failed)
                .unwrap_or(true)
        })
        .collect();
    if eligible.is_empty() {
        return (None, rr_cursor);
    }

    match strategy {
        SelectionStrategy::Priority => {
            let chosen = eligible
                .iter()
                .min_by_key(|m| (m.static_priority + m.priority_adjustment, m.exit_id))
                .map(|m| m.exit_id);
            (chosen, rr_cursor)
        },
        SelectionStrategy::RoundRobin => {
            let mut slots = Vec::new();
            for member in &eligible {
                for _ in 0..member.weight.max(1) {
                    slots.push(member.exit_id);
                }
            }
            let index = (rr_cursor.rem_euclid(slots.len() as i64)) as usize;
            (Some(slots[index]), rr_cursor + 1)
        },
        SelectionStrategy::Latency => {
            // Median of the rolling sample window, so one fast or slow
            // outlier probe cannot flap the assignment.
            let with_latency: Vec<(&&ExitGroupMember, u32)> = eligible
                .iter()
                .filter_map(|m| {
                    health
                        .get(&m.exit_id)
                        .and_then(|h| h.median_latency())
                        .map(|latency| (m, latency))
                })
                .collect();
            if with_latency.is_empty() {
                return select_exit(SelectionStrategy::Priority, members, health, rr_cursor);
            }
            let chosen = with_latency
                .iter()
                .min_by_key(|(m, latency)| (*latency, m.exit_id))
                .map(|(m, _)| m.exit_id);
            (chosen, rr_cursor)
        },
    }
}

/// Something that can probe an exit's public endpoint.
pub trait Prober: Send {
    fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeOutcome;
}

static PING_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"time[=<]([0-9.]+)\s*ms").unwrap());

/// ICMP echo via the system `ping` binary, which carries the necessary
/// privileges on every platform we deploy to.
pub struct PingProber;

impl Prober for PingProber {
    fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeOutcome {
        let host = endpoint.host().to_string().replace(['[', ']'], "");
        let timeout_secs = timeout.as_secs().max(1).to_string();
        let output = Command::new("ping")
            .args(["-c", "1", "-W", &timeout_secs, &host])
            .output();
        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let latency = PING_TIME
                    .captures(&stdout)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .map(|ms| ms.round() as u32)
                    .unwrap_or(0);
                ProbeOutcome::up(latency)
            },
            Ok(_) => ProbeOutcome::down("icmp echo timed out"),
            Err(e) => ProbeOutcome::down(&format!("ping invocation failed: {e}")),
        }
    }
}

/// One failover decision made for one remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailoverDecision {
    pub remote_id: i64,
    pub from_exit_id: Option<i64>,
    pub to_exit_id: Option<i64>,
    pub reason: String,
}

/// Applies probe outcomes to a group and reassigns remotes whose active
/// exit is no longer serviceable. Runs entirely inside one IMMEDIATE
/// transaction; callers inject probe outcomes, which keeps the decision
/// path deterministic and testable.
pub fn run_group_decision(
    conn: &mut Connection,
    group_id: i64,
    outcomes: &HashMap<i64, ProbeOutcome>,
    trigger: &str,
) -> Result<Vec<FailoverDecision>, Error> {
    let tx = db::immediate(conn)?;
    let group = DatabaseExitGroup::get(&tx, group_id)?;
    let members = group.members(&tx)?;

    let mut health: HashMap<i64, ExitHealth> = HashMap::new();
    for member in &members {
        let mut row = DatabaseExitHealth::get(&tx, member.exit_id)?;
        if let Some(outcome) = outcomes.get(&member.exit_id) {
            apply_probe(&mut row, outcome);
            DatabaseExitHealth::store(&tx, &row)?;
        }
        health.insert(member.exit_id, row);
    }

    let mut decisions = Vec::new();
    let mut rr_cursor = group.rr_cursor(&tx)?;
    let mut stmt = tx.prepare(
        "SELECT id, active_exit_id FROM remotes WHERE exit_group_id = ?1 ORDER BY id",
    )?;
    let assignments: Vec<(i64, Option<i64>)> = stmt
        .query_map([group_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    // Choose once per event: every displaced remote lands on the same
    // target.
    let (target, advanced) = select_exit(group.strategy, &members, &health, rr_cursor);
    rr_cursor = advanced;

    for (remote_id, active) in assignments {
        let active_ok = active
            .map(|id| {
                members.iter().any(|m| m.exit_id == id && m.enabled)
                    && health
                        .get(&id)
                        .map(|h| h.state != HealthState::Failed)
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if active_ok {
            continue;
        }

        match target {
            Some(to) if active != Some(to) => {
                DatabaseRemote::set_active_exit(&tx, remote_id, Some(to))?;
                DatabaseFailover::record(
                    &tx, remote_id, group_id, active, Some(to), trigger, true, None,
                )?;
                decisions.push(FailoverDecision {
                    remote_id,
                    from_exit_id: active,
                    to_exit_id: Some(to),
                    reason: trigger.to_string(),
                });
            },
            Some(_) => {},
            None => {
                // Already parked on the sentinel; nothing new to record.
                if active.is_none() {
                    continue;
                }
                DatabaseRemote::set_active_exit(&tx, remote_id, None)?;
                DatabaseFailover::record(
                    &tx,
                    remote_id,
                    group_id,
                    active,
                    None,
                    "no_healthy_member",
                    false,
                    Some("every member of the group is failed or disabled"),
                )?;
                decisions.push(FailoverDecision {
                    remote_id,
                    from_exit_id: active,
                    to_exit_id: None,
                    reason: "no_healthy_member".to_string(),
                });
            },
        }
    }

    group.set_rr_cursor(&tx, rr_cursor)?;
    tx.commit()?;
    Ok(decisions)
}

/// Work accepted by the failover worker.
#[derive(Clone, Debug)]
pub enum FailoverJob {
    /// Scheduled or operator-requested health check of a whole group.
    CheckGroup { group_id: i64 },
    /// Operator-forced failover, bypassing probes.
    Force { group_id: i64, reason: String },
    Shutdown,
}

/// The sequential failover worker. Concurrent triggers enqueue; the single
/// thread drains them in order, which is what makes reassignment decisions
/// totally ordered per group.
pub struct FailoverController {
    tx: mpsc::Sender<FailoverJob>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FailoverController {
    pub fn spawn(db: Db, bus: EventBus, prober: Box<dyn Prober>) -> Self {
        let (tx, rx) = mpsc::channel::<FailoverJob>();
        let handle = thread::Builder::new()
            .name("exit-failover".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        FailoverJob::Shutdown => break,
                        FailoverJob::CheckGroup { group_id } => {
                            if let Err(e) =
                                Self::check_group(&db, &bus, prober.as_ref(), group_id)
                            {
                                log::error!("health check of group {group_id} failed: {e}");
                            }
                        },
                        FailoverJob::Force { group_id, reason } => {
                            let outcomes = HashMap::new();
                            let result = {
                                let mut conn = db.lock();
                                run_group_decision(&mut conn, group_id, &outcomes, &reason)
                            };
                            match result {
                                Ok(decisions) => Self::publish(&bus, group_id, &reason, &decisions),
                                Err(e) => log::error!("forced failover failed: {e}"),
                            }
                        },
                    }
                }
            })
            .expect("failed to spawn failover worker");
        FailoverController {
            tx,
            handle: Some(handle),
        }
    }

    fn check_group(
        db: &Db,
        bus: &EventBus,
        prober: &dyn Prober,
        group_id: i64,
    ) -> Result<(), Error> {
        // Probe outside any lock; only the decision takes the writer.
        let (timeout, targets) = {
            let conn = db.lock();
            let group = DatabaseExitGroup::get(&conn, group_id)?;
            let timeout = Duration::from_secs(group.check_timeout_secs as u64);
            let targets: Vec<(i64, Endpoint)> = group
                .members(&conn)?
                .iter()
                .filter(|m| m.enabled)
                .map(|m| {
                    DatabaseExit::get(&conn, m.exit_id)
                        .map(|e| (m.exit_id, e.endpoint.clone()))
                })
                .collect::<Result<_, _>>()?;
            (timeout, targets)
        };

        let mut outcomes = HashMap::new();
        for (exit_id, endpoint) in targets {
            outcomes.insert(exit_id, prober.probe(&endpoint, timeout));
        }

        let decisions = {
            let mut conn = db.lock();
            run_group_decision(&mut conn, group_id, &outcomes, "health_check_failed")?
        };
        Self::publish(bus, group_id, "health_check_failed", &decisions);
        Ok(())
    }

    fn publish(bus: &EventBus, group_id: i64, reason: &str, decisions: &[FailoverDecision]) {
        if decisions.is_empty() {
            return;
        }
        let to_exit_id = decisions[0].to_exit_id;
        bus.publish(&Event::FailoverOccurred {
            group_id,
            moved_remotes: decisions.len(),
            to_exit_id,
            reason: reason.to_string(),
        });
    }

    pub fn enqueue(&self, job: FailoverJob) {
        if self.tx.send(job).is_err() {
            log::error!("failover worker is gone; job dropped");
        }
    }
}

impl Drop for FailoverController {
    fn drop(&mut self) {
        let _ = self.tx.send(FailoverJob::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(exit_id: i64, priority: i64, weight: u32, enabled: bool) -> ExitGroupMember {
        ExitGroupMember {
            exit_id,
            seq: exit_id,
            static_priority: priority,
            priority_adjustment: 0,
            weight,
            enabled,
        }
    }

    fn healthy(exit_id: i64) -> ExitHealth {
        ExitHealth::new(exit_id)
    }

    fn failed(exit_id: i64) -> ExitHealth {
        let mut h = ExitHealth::new(exit_id);
        for _ in 0..FAILED_AFTER {
            apply_probe(&mut h, &ProbeOutcome::down("probe timed out"));
        }
        h
    }

    #[test]
    fn breaker_degrades_then_fails_then_recovers_on_one_success() {
        let mut h = ExitHealth::new(1);
        for _ in 0..2 {
            apply_probe(&mut h, &ProbeOutcome::down("x"));
            assert_eq!(h.state, HealthState::Healthy);
        }
        apply_probe(&mut h, &ProbeOutcome::down("x"));
        assert_eq!(h.state, HealthState::Degraded);
        apply_probe(&mut h, &ProbeOutcome::down("x"));
        assert_eq!(h.state, HealthState::Degraded);
        apply_probe(&mut h, &ProbeOutcome::down("x"));
        assert_eq!(h.state, HealthState::Failed);

        apply_probe(&mut h, &ProbeOutcome::up(12));
        assert_eq!(h.state, HealthState::Healthy);
        assert_eq!(h.latency_ms, Some(12));
        assert_eq!(h.consecutive_failures, 0);
    }

    #[test]
    fn priority_picks_lowest_effective_priority_with_id_tiebreak() {
        let members = vec![member(1, 1, 1, true), member(2, 2, 1, true)];
        let mut health = HashMap::new();
        health.insert(1, healthy(1));
        health.insert(2, healthy(2));
        let (chosen, _) = select_exit(SelectionStrategy::Priority, &members, &health, 0);
        assert_eq!(chosen, Some(1));

        // E1 failed: E2 takes over.
        health.insert(1, failed(1));
        let (chosen, _) = select_exit(SelectionStrategy::Priority, &members, &health, 0);
        assert_eq!(chosen, Some(2));
    }

    #[test]
    fn priority_ties_break_by_exit_id() {
        let members = vec![member(9, 1, 1, true), member(3, 1, 1, true)];
        let health = HashMap::new();
        let (chosen, _) = select_exit(SelectionStrategy::Priority, &members, &health, 0);
        assert_eq!(chosen, Some(3));
    }

    #[test]
    fn round_robin_respects_weights_and_cursor() {
        let members = vec![member(1, 0, 2, true), member(2, 0, 1, true)];
        let health = HashMap::new();
        // Slots: [1, 1, 2]
        let (first, cursor) = select_exit(SelectionStrategy::RoundRobin, &members, &health, 0);
        assert_eq!(first, Some(1));
        let (second, cursor) =
            select_exit(SelectionStrategy::RoundRobin, &members, &health, cursor);
        assert_eq!(second, Some(1));
        let (third, _) = select_exit(SelectionStrategy::RoundRobin, &members, &health, cursor);
        assert_eq!(third, Some(2));
    }

    #[test]
    fn latency_prefers_fastest_and_falls_back_to_priority() {
        let members = vec![member(1, 0, 1, true), member(2, 1, 1, true)];
        let mut health = HashMap::new();
        let mut h1 = healthy(1);
        apply_probe(&mut h1, &ProbeOutcome::up(80));
        let mut h2 = healthy(2);
        apply_probe(&mut h2, &ProbeOutcome::up(15));
        health.insert(1, h1);
        health.insert(2, h2);
        let (chosen, _) = select_exit(SelectionStrategy::Latency, &members, &health, 0);
        assert_eq!(chosen, Some(2));

        // No latency data at all: behaves like priority.
        let mut blank = HashMap::new();
        blank.insert(1, healthy(1));
        blank.insert(2, healthy(2));
        let (chosen, _) = select_exit(SelectionStrategy::Latency, &members, &blank, 0);
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn latency_selection_uses_the_window_median_not_the_latest_sample() {
        let members = vec![member(1, 0, 1, true), member(2, 1, 1, true)];
        let mut h1 = healthy(1);
        for ms in [100, 100, 5] {
            apply_probe(&mut h1, &ProbeOutcome::up(ms));
        }
        let mut h2 = healthy(2);
        for ms in [50, 50, 50] {
            apply_probe(&mut h2, &ProbeOutcome::up(ms));
        }
        assert_eq!(h1.median_latency(), Some(100));
        assert_eq!(h2.median_latency(), Some(50));

        let mut health = HashMap::new();
        health.insert(1, h1);
        health.insert(2, h2);
        // The latest sample would favor exit 1 (5 ms); the median favors 2.
        let (chosen, _) = select_exit(SelectionStrategy::Latency, &members, &health, 0);
        assert_eq!(chosen, Some(2));
    }

    #[test]
    fn latency_window_keeps_the_five_newest_samples() {
        let mut h = ExitHealth::new(1);
        for ms in [10, 20, 30, 40, 50, 60, 70] {
            apply_probe(&mut h, &ProbeOutcome::up(ms));
        }
        assert_eq!(h.latency_samples, vec![30, 40, 50, 60, 70]);
        assert_eq!(h.median_latency(), Some(50));
        // A failed probe breaks the streak but keeps the window.
        apply_probe(&mut h, &ProbeOutcome::down("blip"));
        assert_eq!(h.latency_samples.len(), 5);
    }

    #[test]
    fn no_eligible_member_selects_nothing() {
        let members = vec![member(1, 0, 1, true), member(2, 0, 1, false)];
        let mut health = HashMap::new();
        health.insert(1, failed(1));
        let (chosen, _) = select_exit(SelectionStrategy::Priority, &members, &health, 0);
        assert_eq!(chosen, None);
    }

    #[test]
    fn selection_is_deterministic() {
        let members = vec![member(1, 1, 1, true), member(2, 2, 1, true)];
        let mut health = HashMap::new();
        health.insert(1, healthy(1));
        health.insert(2, healthy(2));
        for _ in 0..10 {
            let (chosen, _) = select_exit(SelectionStrategy::Priority, &members, &health, 0);
            assert_eq!(chosen, Some(1));
        }
    }
}
