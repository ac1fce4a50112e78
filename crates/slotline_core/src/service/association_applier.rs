//! Association application over a partition timeline.
//!
//! # Responsibility
//! - Fold one association into the stored slots of its timeline: split the
//!   impacted slots, persist the fragments, re-merge with the neighbors.
//! - Bound each run with step windows and a cooperative step timeout.
//!
//! # Invariants
//! - Every write is one `replace_slots` call; a window never commits half of
//!   its split.
//! - A concurrent modification restarts the window from a fresh read.
//! - After each committed window the timeline is non-overlapping; it is fully
//!   merged once the window's merge pass finished.
//! - An interrupted window resumes from its lower bound, so a merge pass cut
//!   short by the timeout runs again on the next run.

use crate::config::AnalysisConfig;
use crate::model::association::Association;
use crate::model::range::{Bound, Timestamp, UtcRange};
use crate::model::slot::{Slot, SlotData, Timeline};
use crate::repo::slot_repo::{Direction, RepoError, SlotStore};
use crate::service::merge_policy::{is_mergeable, merge, MergeError};
use crate::service::step_span::StepSpanPolicy;
use crate::service::strategy::{strategy_for, AssociationStrategy};
use crate::service::timeout_guard::{StepTimeoutAbort, TimeoutGuard};
use log::{debug, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Stages of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Pending,
    ComputingImpactedSlots,
    Splitting,
    Persisting,
    Merging,
    Completed,
    Failed,
    Interrupted,
}

impl ApplyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ComputingImpactedSlots => "computing_impacted_slots",
            Self::Splitting => "splitting",
            Self::Persisting => "persisting",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Result of one application run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The remaining range is applied.
    Completed { slots_written: usize, merges: usize },
    /// The association carries no representable fact; nothing was written.
    Skipped { reason: String },
    /// Stopped by the step timeout at a consistent point.
    Interrupted {
        /// Everything before this bound is applied.
        resume_from: Bound,
        slots_written: usize,
    },
}

/// Outcome plus the step span to use on the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    pub step_span: Option<Duration>,
}

/// Application failure; the association stays eligible for retry.
#[derive(Debug)]
pub enum ApplyError {
    Store(RepoError),
    /// Every retry hit a concurrent modification.
    RetriesExhausted {
        timeline: Timeline,
        attempts: u32,
        last: RepoError,
    },
    /// Merge requested on a non-mergeable pair.
    Merge(MergeError),
}

impl Display for ApplyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "slot store failure: {err}"),
            Self::RetriesExhausted {
                timeline,
                attempts,
                last,
            } => write!(
                f,
                "gave up on {timeline} after {attempts} concurrent modifications: {last}"
            ),
            Self::Merge(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ApplyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::RetriesExhausted { last, .. } => Some(last),
            Self::Merge(err) => Some(err),
        }
    }
}

impl From<RepoError> for ApplyError {
    fn from(value: RepoError) -> Self {
        Self::Store(value)
    }
}

impl From<MergeError> for ApplyError {
    fn from(value: MergeError) -> Self {
        Self::Merge(value)
    }
}

enum WindowError {
    Store(RepoError),
    Merge(MergeError),
    /// The window is rerun from its lower bound; `slots_written` were
    /// committed before the abort.
    Timeout {
        abort: StepTimeoutAbort,
        slots_written: usize,
    },
}

impl From<RepoError> for WindowError {
    fn from(value: RepoError) -> Self {
        Self::Store(value)
    }
}

impl From<MergeError> for WindowError {
    fn from(value: MergeError) -> Self {
        Self::Merge(value)
    }
}

#[derive(Default)]
struct WindowReport {
    slots_written: usize,
    merges: usize,
    /// A current slot stopped a past-only association; nothing later applies.
    reached_present: bool,
}

struct WindowPlan<'a> {
    association: &'a Association,
    timeline: Timeline,
    strategy: AssociationStrategy,
    converted: &'a SlotData,
    window: UtcRange,
    now: Timestamp,
    merge_left: bool,
    merge_right: bool,
}

/// Applies associations to a slot store.
pub struct AssociationApplier<'s, S: SlotStore> {
    store: &'s S,
    span_policy: StepSpanPolicy,
    max_retries: u32,
}

impl<'s, S: SlotStore> AssociationApplier<'s, S> {
    pub fn new(store: &'s S, config: &AnalysisConfig) -> Self {
        Self {
            store,
            span_policy: StepSpanPolicy::from_config(config),
            max_retries: config.max_concurrent_retries,
        }
    }

    /// Applies the not yet applied part of `association` as of `now`.
    ///
    /// # Errors
    /// - `Store` for persistence faults (nothing of the failing window is
    ///   committed).
    /// - `RetriesExhausted` when every retry of a window hit a concurrent
    ///   modification.
    pub fn apply(
        &self,
        association: &Association,
        now: Timestamp,
    ) -> Result<ApplyReport, ApplyError> {
        let timeline = association.timeline();
        self.transition(association, ApplyState::Pending);

        let Some(strategy) = strategy_for(association.kind()) else {
            return Ok(self.skip(association, "no strategy registered".to_string()));
        };
        let Some(converted) = (strategy.convert)(&association.data) else {
            return Ok(self.skip(association, "no representable slot data".to_string()));
        };

        let target = effective_range(association, now);
        let mut step_span = association.progress.step_span;
        let mut cursor = target.lower();
        let mut slots_written = 0;
        let mut merges = 0;

        while cursor < target.upper() {
            let window = next_window(cursor, step_span, &target);
            let guard = self.guard_for(&window, step_span, now);
            let plan = WindowPlan {
                association,
                timeline,
                strategy,
                converted: &converted,
                window,
                now,
                merge_left: !(association.options.no_left_merge
                    && window.lower() == association.range.lower()),
                merge_right: !(association.options.no_right_merge
                    && window.upper() == target.upper()),
            };

            match self.apply_window_with_retries(&plan, &guard) {
                Ok(report) => {
                    slots_written += report.slots_written;
                    merges += report.merges;
                    if window.lower() < Bound::At(now) {
                        step_span = self.span_policy.after_success(step_span, guard.elapsed());
                    }
                    if report.reached_present {
                        break;
                    }
                    cursor = window.upper();
                }
                Err(WindowError::Timeout {
                    abort,
                    slots_written: window_written,
                }) => {
                    slots_written += window_written;
                    let resume_from = window.lower();
                    let remaining = target.with_lower(resume_from);
                    let next_span = self.span_policy.after_timeout(step_span, &remaining);
                    self.transition(association, ApplyState::Interrupted);
                    info!(
                        "event=association_apply module=applier status=interrupted partition={} association={} resume_from={} elapsed_ms={} next_step_span_ms={}",
                        association.partition_key,
                        association.id,
                        resume_from,
                        abort.elapsed.as_millis(),
                        next_span.as_millis()
                    );
                    return Ok(ApplyReport {
                        outcome: ApplyOutcome::Interrupted {
                            resume_from,
                            slots_written,
                        },
                        step_span: Some(next_span),
                    });
                }
                Err(WindowError::Store(err)) => {
                    self.transition(association, ApplyState::Failed);
                    return Err(self.escalate(timeline, err));
                }
                Err(WindowError::Merge(err)) => {
                    self.transition(association, ApplyState::Failed);
                    return Err(ApplyError::Merge(err));
                }
            }
        }

        self.transition(association, ApplyState::Completed);
        info!(
            "event=association_apply module=applier status=ok partition={} association={} kind={} slots_written={} merges={}",
            association.partition_key,
            association.id,
            association.kind(),
            slots_written,
            merges
        );
        Ok(ApplyReport {
            outcome: ApplyOutcome::Completed {
                slots_written,
                merges,
            },
            step_span,
        })
    }

    fn skip(&self, association: &Association, reason: String) -> ApplyReport {
        warn!(
            "event=association_apply module=applier status=skip partition={} association={} kind={} reason={}",
            association.partition_key,
            association.id,
            association.kind(),
            reason
        );
        self.transition(association, ApplyState::Completed);
        ApplyReport {
            outcome: ApplyOutcome::Skipped { reason },
            step_span: association.progress.step_span,
        }
    }

    fn escalate(&self, timeline: Timeline, err: RepoError) -> ApplyError {
        if err.is_concurrent_modification() {
            return ApplyError::RetriesExhausted {
                timeline,
                attempts: self.max_retries + 1,
                last: err,
            };
        }
        ApplyError::Store(err)
    }

    fn guard_for(
        &self,
        window: &UtcRange,
        step_span: Option<Duration>,
        now: Timestamp,
    ) -> TimeoutGuard {
        if window.lower() < Bound::At(now) && self.span_policy.can_shrink(step_span) {
            TimeoutGuard::new(self.span_policy.step_timeout())
        } else {
            TimeoutGuard::disarmed()
        }
    }

    fn apply_window_with_retries(
        &self,
        plan: &WindowPlan<'_>,
        guard: &TimeoutGuard,
    ) -> Result<WindowReport, WindowError> {
        let mut attempt = 0;
        loop {
            match self.apply_window(plan, guard) {
                Err(WindowError::Store(err))
                    if err.is_concurrent_modification() && attempt < self.max_retries =>
                {
                    attempt += 1;
                    warn!(
                        "event=association_apply module=applier status=retry partition={} association={} attempt={} window={} reason={}",
                        plan.association.partition_key,
                        plan.association.id,
                        attempt,
                        plan.window,
                        err
                    );
                }
                other => return other,
            }
        }
    }

    fn apply_window(
        &self,
        plan: &WindowPlan<'_>,
        guard: &TimeoutGuard,
    ) -> Result<WindowReport, WindowError> {
        let mut report = WindowReport::default();

        self.transition(plan.association, ApplyState::ComputingImpactedSlots);
        let mut window = plan.window;
        let mut impacted = self.store.find_overlapping(plan.timeline, &window)?;
        if plan.association.options.past_only {
            let present = Bound::At(plan.now);
            if let Some(first_current) = impacted.iter().position(|slot| slot.range.upper() > present)
            {
                window = window.with_upper(impacted[first_current].range.lower());
                impacted.truncate(first_current);
                report.reached_present = true;
            }
        }
        if window.is_empty() {
            return Ok(report);
        }
        guard
            .check_step_timeout()
            .map_err(|abort| WindowError::Timeout {
                abort,
                slots_written: 0,
            })?;

        self.transition(plan.association, ApplyState::Splitting);
        let fragments = coalesce(split_impacted(plan, &window, &impacted))?;

        let edges = if same_slots(&impacted, &fragments) {
            debug!(
                "event=association_apply module=applier status=noop partition={} association={} window={}",
                plan.association.partition_key, plan.association.id, window
            );
            impacted
        } else {
            self.transition(plan.association, ApplyState::Persisting);
            let stored = self
                .store
                .replace_slots(plan.timeline, &impacted, &fragments)?;
            report.slots_written = stored.len();
            stored
        };

        self.transition(plan.association, ApplyState::Merging);
        report.merges = self.merge_pass(plan, edges, guard, report.slots_written)?;
        Ok(report)
    }

    /// Merges the leftmost and rightmost stored slots with their neighbors.
    fn merge_pass(
        &self,
        plan: &WindowPlan<'_>,
        mut edges: Vec<Slot>,
        guard: &TimeoutGuard,
        slots_written: usize,
    ) -> Result<usize, WindowError> {
        let mut merges = 0;
        let check = |guard: &TimeoutGuard| {
            guard
                .check_step_timeout()
                .map_err(|abort| WindowError::Timeout {
                    abort,
                    slots_written,
                })
        };

        if plan.merge_left {
            while let Some(edge) = edges.first().cloned() {
                let Some(lower) = edge.range.lower().timestamp() else {
                    break;
                };
                let Some(neighbor) = self
                    .store
                    .find_adjacent(plan.timeline, lower, Direction::Left)?
                else {
                    break;
                };
                if !is_mergeable(&neighbor, &edge) {
                    break;
                }
                check(guard)?;
                let merged = merge(&neighbor, &edge)?;
                let mut stored = self
                    .store
                    .replace_slots(plan.timeline, &[neighbor, edge], &[merged])?;
                merges += 1;
                match stored.pop() {
                    Some(merged) => edges[0] = merged,
                    None => break,
                }
            }
        }

        if plan.merge_right {
            while let Some(edge) = edges.last().cloned() {
                let Some(upper) = edge.range.upper().timestamp() else {
                    break;
                };
                let Some(neighbor) = self
                    .store
                    .find_adjacent(plan.timeline, upper, Direction::Right)?
                else {
                    break;
                };
                if plan.association.options.past_only
                    && neighbor.range.upper() > Bound::At(plan.now)
                {
                    break;
                }
                if !is_mergeable(&edge, &neighbor) {
                    break;
                }
                check(guard)?;
                let merged = merge(&edge, &neighbor)?;
                let mut stored = self
                    .store
                    .replace_slots(plan.timeline, &[edge, neighbor], &[merged])?;
                merges += 1;
                let last = edges.len() - 1;
                match stored.pop() {
                    Some(merged) => edges[last] = merged,
                    None => break,
                }
            }
        }

        Ok(merges)
    }

    fn transition(&self, association: &Association, state: ApplyState) {
        debug!(
            "event=association_state module=applier partition={} association={} state={}",
            association.partition_key,
            association.id,
            state.as_str()
        );
    }
}

/// Remaining range, cut at the present for past-only associations.
fn effective_range(association: &Association, now: Timestamp) -> UtcRange {
    let remaining = association.remaining_range();
    if !association.options.past_only {
        return remaining;
    }
    let cutoff = Bound::At(association.application_date_time.min(now));
    remaining.with_upper(remaining.upper().min(cutoff))
}

fn next_window(cursor: Bound, step_span: Option<Duration>, target: &UtcRange) -> UtcRange {
    let upper = match (cursor, step_span) {
        (Bound::At(start), Some(span)) => Bound::At(start.saturating_add(span)).min(target.upper()),
        _ => target.upper(),
    };
    target.with_lower(cursor).with_upper(upper)
}

/// Fragments replacing `impacted` over `window`, ascending, possibly with gaps.
fn split_impacted(plan: &WindowPlan<'_>, window: &UtcRange, impacted: &[Slot]) -> Vec<Slot> {
    let key = plan.association.partition_key;
    let mut fragments = Vec::with_capacity(impacted.len() * 3 + 1);
    let mut push = |range: Option<UtcRange>, data: &SlotData| {
        if let Some(range) = range {
            if !data.is_empty() {
                fragments.push(Slot::new(key, range, data.clone()));
            }
        }
    };

    let mut cursor = window.lower();
    for slot in impacted {
        push(span(cursor, slot.range.lower()), plan.converted);
        push(span(slot.range.lower(), window.lower()), &slot.data);
        if let Some(overlap) = slot.range.intersect(window) {
            let merged = (plan.strategy.merge_with_old)(&plan.association.data, slot, &overlap)
                .unwrap_or_else(|| plan.converted.clone());
            push(Some(overlap), &merged);
        }
        push(span(window.upper(), slot.range.upper()), &slot.data);
        cursor = cursor.max(slot.range.upper());
    }
    push(span(cursor, window.upper()), plan.converted);
    fragments
}

fn span(lower: Bound, upper: Bound) -> Option<UtcRange> {
    UtcRange::new(lower, upper)
        .ok()
        .filter(|range| !range.is_empty())
}

fn coalesce(fragments: Vec<Slot>) -> Result<Vec<Slot>, MergeError> {
    let mut coalesced: Vec<Slot> = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        match coalesced.last_mut() {
            Some(last) if is_mergeable(last, &fragment) => *last = merge(last, &fragment)?,
            _ => coalesced.push(fragment),
        }
    }
    Ok(coalesced)
}

fn same_slots(stored: &[Slot], fragments: &[Slot]) -> bool {
    stored.len() == fragments.len()
        && stored
            .iter()
            .zip(fragments)
            .all(|(stored, fragment)| stored.same_content(fragment))
}
