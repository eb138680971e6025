use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use backupd_core::config::ProfileConfig;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::{
    error::SchedulerError,
    types::{CancellationScope, InvocationDescriptor, Profile},
};

/// One active profile generation: the profile and the scope that dies with it.
#[derive(Debug, Clone)]
struct ActiveProfile {
    profile: Arc<Profile>,
    scope: CancellationScope,
}

/// Immutable view of every active profile. Replaced wholesale, never edited.
#[derive(Debug, Default)]
struct Snapshot {
    profiles: BTreeMap<String, ActiveProfile>,
}

#[derive(Debug, Default)]
struct State {
    snapshot: Arc<Snapshot>,
    closed: bool,
}

/// A config record that could not be activated.
#[derive(Debug)]
pub struct RejectedProfile {
    /// The record's `name` as written in the config.
    pub profile_id: String,
    pub error: SchedulerError,
}

/// What a configuration change did, per profile id.
#[derive(Debug, Default)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub rejected: Vec<RejectedProfile>,
}

impl ReloadReport {
    /// True when no profile generation was created or retired.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Authoritative set of active profiles and their cancellation scopes.
///
/// Readers clone the current snapshot `Arc` under a short read lock; a
/// configuration change builds the next snapshot and swaps it in under the
/// write lock, so a reader sees either the old set or the new one, never a
/// mix. Scopes retired by a change are revoked before the write lock is
/// released.
#[derive(Debug)]
pub struct ProfileRegistry {
    state: RwLock<State>,
    default_time_zone: Tz,
}

impl ProfileRegistry {
    /// Empty registry. Profiles without their own zone are evaluated in
    /// `default_time_zone`.
    pub fn new(default_time_zone: Tz) -> Self {
        Self {
            state: RwLock::new(State::default()),
            default_time_zone,
        }
    }

    pub fn default_time_zone(&self) -> Tz {
        self.default_time_zone
    }

    /// One descriptor per active profile that has an occurrence after `now`.
    ///
    /// A profile whose expression has no next occurrence is skipped for this
    /// call only; it is asked again on the next one.
    pub fn get_invocations(&self, now: DateTime<Utc>) -> Vec<InvocationDescriptor> {
        let snapshot = self.snapshot();
        snapshot
            .profiles
            .values()
            .filter_map(|active| {
                let invocation = active.profile.next_invocation(now, &active.scope);
                if invocation.is_none() {
                    debug!(
                        profile_id = %active.profile.id(),
                        expression = %active.profile.clock().expression(),
                        "no next occurrence, skipping profile this tick"
                    );
                }
                invocation
            })
            .collect()
    }

    /// Bind `records` and make them the complete set of active profiles.
    ///
    /// Records that fail to bind are reported and treated as absent.
    pub fn apply_configuration(&self, records: &[ProfileConfig]) -> ReloadReport {
        let mut rejected = Vec::new();
        let mut profiles = Vec::with_capacity(records.len());
        for record in records {
            match Profile::bind(record, self.default_time_zone) {
                Ok(profile) => profiles.push(profile),
                Err(error) => {
                    warn!(profile_id = %record.name, error = %error, "profile rejected");
                    rejected.push(RejectedProfile {
                        profile_id: record.name.clone(),
                        error,
                    });
                }
            }
        }

        let mut report = self.apply_profiles(profiles);
        rejected.append(&mut report.rejected);
        report.rejected = rejected;
        report
    }

    /// Make `profiles` the complete set of active profiles.
    ///
    /// Unchanged profiles keep their scope. Changed profiles get a fresh scope
    /// under the same id and the old one is revoked. Removed profiles have
    /// their scope revoked. A repeated id keeps its first occurrence.
    pub fn apply_profiles(&self, profiles: Vec<Profile>) -> ReloadReport {
        let mut report = ReloadReport::default();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            warn!("profile registry is shut down, ignoring configuration change");
            return report;
        }

        let current = Arc::clone(&state.snapshot);
        let mut next = BTreeMap::new();
        let mut retired = Vec::new();

        for profile in profiles {
            let id = profile.id().to_string();
            if next.contains_key(&id) {
                warn!(profile_id = %id, "duplicate profile id, keeping the first record");
                report.rejected.push(RejectedProfile {
                    profile_id: id.clone(),
                    error: SchedulerError::DuplicateProfile { id },
                });
                continue;
            }

            let active = match current.profiles.get(&id) {
                Some(existing) if *existing.profile == profile => {
                    report.unchanged.push(id.clone());
                    existing.clone()
                }
                Some(existing) => {
                    retired.push(existing.scope.clone());
                    report.changed.push(id.clone());
                    ActiveProfile {
                        profile: Arc::new(profile),
                        scope: CancellationScope::new(),
                    }
                }
                None => {
                    report.added.push(id.clone());
                    ActiveProfile {
                        profile: Arc::new(profile),
                        scope: CancellationScope::new(),
                    }
                }
            };
            next.insert(id, active);
        }

        for (id, existing) in &current.profiles {
            if !next.contains_key(id) {
                retired.push(existing.scope.clone());
                report.removed.push(id.clone());
            }
        }

        state.snapshot = Arc::new(Snapshot { profiles: next });
        for scope in &retired {
            scope.revoke();
        }
        drop(state);

        if !report.is_noop() {
            info!(
                added = ?report.added,
                changed = ?report.changed,
                removed = ?report.removed,
                unchanged = report.unchanged.len(),
                "profile configuration applied"
            );
        }
        report
    }

    /// Revoke every live scope and clear the registry. Later calls do nothing,
    /// and later configuration changes are ignored.
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.closed = true;
        let retired = std::mem::take(&mut state.snapshot);
        for active in retired.profiles.values() {
            active.scope.revoke();
        }
        info!(profiles = retired.profiles.len(), "profile registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Ids of the active profiles, sorted.
    pub fn profile_ids(&self) -> Vec<String> {
        self.snapshot().profiles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.snapshot)
    }
}

impl Drop for ProfileRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
