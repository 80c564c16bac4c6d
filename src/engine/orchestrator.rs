use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{
	sync::{Mutex, MutexGuard},
	task::JoinHandle,
	time::MissedTickBehavior,
};

use super::{
	reconciler::{PassReport, Reconciler, SyncError},
	retry::RetryPolicy,
};
use crate::{
	config::SyncConfig,
	mirror::{self, FlatFileMirror},
	models::SyncDirection,
};

/// What asked for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
	Startup,
	Timer,
	Manual,
	Mutation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
	#[default]
	Idle,
	Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
	Succeeded,
	Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
	pub trigger: Trigger,
	pub direction: SyncDirection,
	pub outcome: PassOutcome,
	pub finished_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub report: Option<PassReport>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
	pub state: PassState,
	pub running: Option<(Trigger, SyncDirection)>,
	pub last_started_at: Option<DateTime<Utc>>,
	pub last_finished_at: Option<DateTime<Utc>>,
	pub next_run_at: Option<DateTime<Utc>>,
	pub last: Option<PassSummary>,
	pub succeeded: u64,
	pub failed: u64,
	pub skipped: u64,
}

/// Schedules reconciliation passes and keeps at most one in flight.
///
/// Lifecycle per pass: Idle -> Running -> {Succeeded, Failed} -> Idle.
pub struct Orchestrator {
	reconciler: Reconciler,
	gate: Mutex<()>,
	status: RwLock<SyncStatus>,
	config: SyncConfig,
	mirror: Option<Arc<dyn FlatFileMirror>>,
}

impl Orchestrator {
	pub fn new(reconciler: Reconciler, config: SyncConfig, mirror: Option<Arc<dyn FlatFileMirror>>) -> Arc<Self> {
		Arc::new(Orchestrator {
			reconciler,
			gate: Mutex::new(()),
			status: RwLock::new(SyncStatus::default()),
			config,
			mirror,
		})
	}

	pub fn status(&self) -> SyncStatus {
		self.status.read().clone()
	}

	/// Run a pass for an explicit caller, waiting a short while for a pass
	/// already in flight. Fails with `Busy` if it does not finish in time.
	pub async fn trigger(&self, trigger: Trigger, direction: SyncDirection) -> Result<PassReport, SyncError> {
		let guard = match tokio::time::timeout(self.config.busy_wait(), self.gate.lock()).await {
			Ok(guard) => guard,
			Err(_) => {
				tracing::info!(?trigger, %direction, "pass rejected, another pass is running");
				return Err(SyncError::Busy);
			}
		};
		self.run_locked(guard, trigger, direction).await
	}

	/// A timer tick: runs only if nothing else is. `None` means skipped.
	pub async fn tick(&self) -> Option<Result<PassReport, SyncError>> {
		let direction = self.config.timer_direction;
		let Ok(guard) = self.gate.try_lock() else {
			self.status.write().skipped += 1;
			tracing::debug!("timer pass skipped, another pass is running");
			return None;
		};
		Some(self.run_locked(guard, Trigger::Timer, direction).await)
	}

	/// The startup pass, retried per the policy. After the immediate
	/// attempts are spent, a single deferred attempt is scheduled in the
	/// background; if that fails too the node keeps serving stale data.
	pub async fn startup(self: &Arc<Self>) -> Result<PassReport, SyncError> {
		let policy = self.config.retry;
		let direction = self.config.startup_direction;
		let mut attempt = 1;
		loop {
			let err = match self.trigger(Trigger::Startup, direction).await {
				Ok(report) => return Ok(report),
				Err(e) if !e.is_retryable() => return Err(e),
				Err(e) => e,
			};

			match policy.delay_after(attempt) {
				Some(delay) => {
					tracing::warn!(attempt, error = %err, "startup pass failed, retrying in {delay:?}");
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				None => {
					self.schedule_deferred(policy, direction);
					return Err(err);
				}
			}
		}
	}

	fn schedule_deferred(self: &Arc<Self>, policy: RetryPolicy, direction: SyncDirection) {
		let Some(delay) = policy.deferred_delay else {
			tracing::warn!("startup pass gave up, serving stale data");
			return;
		};
		tracing::warn!("startup pass failed {} time(s), one more try in {delay:?}", policy.max_attempts);
		let this = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if let Err(e) = this.trigger(Trigger::Startup, direction).await {
				tracing::error!(error = %e, "deferred startup pass failed, serving stale data");
			}
		});
	}

	/// Periodic passes. `None` when the interval is disabled.
	pub fn spawn_timer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
		let period = self.config.interval()?;
		let this = Arc::clone(self);
		Some(tokio::spawn(async move {
			let start = tokio::time::Instant::now() + period;
			let mut interval = tokio::time::interval_at(start, period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
			this.set_next_run(period);
			loop {
				interval.tick().await;
				this.set_next_run(period);
				if let Some(Err(e)) = this.tick().await {
					tracing::warn!(error = %e, "timer pass failed");
				}
			}
		}))
	}

	fn set_next_run(&self, period: Duration) {
		let next = chrono::Duration::from_std(period).ok().map(|d| Utc::now() + d);
		self.status.write().next_run_at = next;
	}

	async fn run_locked(
		&self,
		_guard: MutexGuard<'_, ()>,
		trigger: Trigger,
		direction: SyncDirection,
	) -> Result<PassReport, SyncError> {
		{
			let mut status = self.status.write();
			status.state = PassState::Running;
			status.running = Some((trigger, direction));
			status.last_started_at = Some(Utc::now());
		}
		tracing::info!(?trigger, %direction, "reconciliation pass started");

		let result = self.reconciler.run(direction).await;

		let changed_local = match &result {
			Ok(report) => report.pull.is_some(),
			Err(SyncError::PartialBatch { report, .. }) => report.pull.is_some(),
			Err(_) => false,
		};
		if changed_local {
			self.regenerate_mirror().await;
		}

		let finished_at = Utc::now();
		let summary = match &result {
			Ok(report) => {
				tracing::info!(?trigger, %direction, "reconciliation pass succeeded");
				PassSummary {
					trigger,
					direction,
					outcome: PassOutcome::Succeeded,
					finished_at,
					report: Some(report.clone()),
					error: None,
				}
			}
			Err(e) => {
				tracing::warn!(?trigger, %direction, error = %e, "reconciliation pass failed");
				let report = match e {
					SyncError::PartialBatch { report, .. } => Some((**report).clone()),
					_ => None,
				};
				PassSummary {
					trigger,
					direction,
					outcome: PassOutcome::Failed,
					finished_at,
					report,
					error: Some(e.to_string()),
				}
			}
		};

		let mut status = self.status.write();
		match summary.outcome {
			PassOutcome::Succeeded => status.succeeded += 1,
			PassOutcome::Failed => status.failed += 1,
		}
		status.state = PassState::Idle;
		status.running = None;
		status.last_finished_at = Some(finished_at);
		status.last = Some(summary);
		drop(status);

		result
	}

	async fn regenerate_mirror(&self) {
		let Some(mirror) = &self.mirror else { return };
		if let Err(e) = mirror::regenerate(self.reconciler.store(), mirror.as_ref()).await {
			tracing::warn!(error = %e, "mirror regeneration failed");
		}
	}
}
