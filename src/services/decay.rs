//! Importance decay and staleness.
//!
//! Each non-critical tier loses a fixed fraction of its importance score
//! per elapsed week once its grace period is over. Records accessed in the
//! last seven days are shielded from decay entirely.
//!
//! Decay is charged in whole weeks from the later of grace end, last
//! access and the previous charge, so the result depends on elapsed time
//! only, never on how often a sweep runs.

use chrono::{DateTime, Duration, Utc};

use crate::models::{Entity, ImportanceTier};

/// Records accessed within this many days never decay.
pub const ACCESS_SHIELD_DAYS: i64 = 7;

/// Lowest score decay will produce.
pub const MIN_IMPORTANCE: f64 = 0.0;

/// Why a record did or did not decay on this step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayOutcome {
    /// `weeks` whole weeks charged, moving the score from `from` to `to`.
    /// The next charge counts from `through`.
    Decayed {
        from: f64,
        to: f64,
        weeks: u32,
        through: DateTime<Utc>,
    },
    /// Critical tier, never decays.
    Exempt,
    /// Still inside the tier grace period.
    InGracePeriod,
    /// Accessed within [`ACCESS_SHIELD_DAYS`].
    RecentlyAccessed,
    /// Less than a week since the last charge.
    NotDue,
}

impl DecayOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, DecayOutcome::Decayed { .. })
    }
}

/// Score after `weeks` weekly decay steps for `tier`.
pub fn decayed_importance(tier: ImportanceTier, score: f64, weeks: u32) -> f64 {
    match tier.weekly_decay_factor() {
        Some(factor) => (score * factor.powi(weeks as i32)).max(MIN_IMPORTANCE),
        None => score,
    }
}

fn recently_accessed(entity: &Entity, now: DateTime<Utc>) -> bool {
    entity
        .last_accessed_at
        .map(|at| now.signed_duration_since(at) < Duration::days(ACCESS_SHIELD_DAYS))
        .unwrap_or(false)
}

/// Decide how much decay `entity` owes at `now`.
///
/// The grace period runs from the last content update.
pub fn decay_step(entity: &Entity, now: DateTime<Utc>) -> DecayOutcome {
    if entity.importance.weekly_decay_factor().is_none() {
        return DecayOutcome::Exempt;
    }
    if recently_accessed(entity, now) {
        return DecayOutcome::RecentlyAccessed;
    }
    let grace_end = entity.updated_at + Duration::days(entity.importance.grace_period_days());
    if now <= grace_end {
        return DecayOutcome::InGracePeriod;
    }

    let anchor = [Some(grace_end), entity.last_decayed_at, entity.last_accessed_at]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(grace_end);
    let weeks = now.signed_duration_since(anchor).num_weeks();
    if weeks <= 0 {
        return DecayOutcome::NotDue;
    }
    let weeks = u32::try_from(weeks).unwrap_or(u32::MAX);

    let from = entity.importance_score;
    DecayOutcome::Decayed {
        from,
        to: decayed_importance(entity.importance, from, weeks),
        weeks,
        through: anchor + Duration::weeks(i64::from(weeks)),
    }
}

/// Charge the owed decay in place. Returns whether the record changed.
pub fn apply_decay(entity: &mut Entity, now: DateTime<Utc>) -> bool {
    match decay_step(entity, now) {
        DecayOutcome::Decayed { to, through, .. } => {
            entity.importance_score = to;
            entity.last_decayed_at = Some(through);
            true
        }
        _ => false,
    }
}

/// Whether a record has gone untouched longer than its memory type allows.
pub fn is_stale(entity: &Entity, now: DateTime<Utc>) -> bool {
    let last_touch = match entity.last_accessed_at {
        Some(accessed) if accessed > entity.updated_at => accessed,
        _ => entity.updated_at,
    };
    now.signed_duration_since(last_touch) > Duration::days(entity.memory_type.stale_after_days())
}

/// Whether cleanup should archive the record.
pub fn should_archive(entity: &Entity, importance_floor: f64, now: DateTime<Utc>) -> bool {
    entity.importance_score < importance_floor && is_stale(entity, now)
}
