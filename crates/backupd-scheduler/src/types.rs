use std::sync::Arc;

use backupd_core::config::{ProfileConfig, SearchDefinitionConfig};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use globset::GlobBuilder;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, SchedulerError},
    schedule::{parse_time_zone, CronClock},
};

/// Which files a profile archives.
///
/// Equality compares both pattern lists element by element, so the same
/// patterns in a different order make a *different* definition. The registry
/// relies on this to detect changed profiles; keep pattern order stable in
/// the config file to avoid needless reschedules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchDefinition {
    pub directory: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl From<&SearchDefinitionConfig> for SearchDefinition {
    fn from(config: &SearchDefinitionConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            include_patterns: config.include_patterns.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
        }
    }
}

/// Revocable handle tied to one generation of one profile.
///
/// Clones observe the same state. Revocation is one-way and idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancellationScope {
    token: CancellationToken,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.token.cancel();
    }

    pub fn is_revoked(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope has been revoked.
    pub async fn revoked(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for handing to code that only knows tokio-util.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A validated, immutable backup profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    id: String,
    clock: CronClock,
    search_definition: Arc<SearchDefinition>,
}

impl Profile {
    pub fn new(id: impl Into<String>, clock: CronClock, search_definition: SearchDefinition) -> Self {
        Self {
            id: id.into(),
            clock,
            search_definition: Arc::new(search_definition),
        }
    }

    /// Validate a raw config record. This is the only way a record becomes
    /// schedulable; a record that fails here never reaches the registry.
    pub fn bind(config: &ProfileConfig, default_time_zone: Tz) -> Result<Self> {
        let id = config.name.trim();
        if id.is_empty() {
            return Err(SchedulerError::InvalidProfile {
                id: config.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }

        let time_zone = match config.time_zone.as_deref() {
            Some(name) => parse_time_zone(name)?,
            None => default_time_zone,
        };
        let clock = CronClock::parse(&config.cron, time_zone)?;

        let search = &config.search_definition;
        for pattern in search.include_patterns.iter().chain(&search.exclude_patterns) {
            check_pattern(id, pattern)?;
        }

        Ok(Self::new(id, clock, SearchDefinition::from(search)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn clock(&self) -> &CronClock {
        &self.clock
    }

    pub fn search_definition(&self) -> &SearchDefinition {
        &self.search_definition
    }

    /// Descriptor for this profile's next occurrence after `now`, carrying `scope`.
    pub fn next_invocation(
        &self,
        now: DateTime<Utc>,
        scope: &CancellationScope,
    ) -> Option<InvocationDescriptor> {
        let invoke_at = self.clock.next_occurrence(now)?;
        Some(InvocationDescriptor {
            profile_id: self.id.clone(),
            invoke_at,
            search_definition: Arc::clone(&self.search_definition),
            scope: scope.clone(),
        })
    }
}

/// Compile `pattern` with the matcher's settings (`*` stays within one path
/// component) and discard the result.
fn check_pattern(id: &str, pattern: &str) -> Result<()> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(drop)
        .map_err(|e| SchedulerError::InvalidProfile {
            id: id.to_string(),
            reason: format!("invalid glob pattern '{pattern}': {e}"),
        })
}

/// One concrete firing of a profile. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct InvocationDescriptor {
    pub profile_id: String,
    pub invoke_at: DateTime<Utc>,
    pub search_definition: Arc<SearchDefinition>,
    pub scope: CancellationScope,
}

impl InvocationDescriptor {
    /// Name of the archive this invocation produces in the sink.
    pub fn archive_name(&self) -> String {
        format!("{}.tar.gz", self.profile_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_revoked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(include: &[&str], exclude: &[&str]) -> SearchDefinition {
        SearchDefinition {
            directory: "/backup/path".to_string(),
            include_patterns: include.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn record(name: &str, cron: &str) -> ProfileConfig {
        ProfileConfig {
            name: name.to_string(),
            cron: cron.to_string(),
            time_zone: None,
            search_definition: SearchDefinitionConfig {
                directory: "/backup/path".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn identical_search_definitions_are_equal() {
        let a = definition(&["*.txt", "*.doc"], &["temp/*", "*.log"]);
        let b = definition(&["*.txt", "*.doc"], &["temp/*", "*.log"]);
        assert_eq!(a, b);
    }

    #[test]
    fn search_definitions_differ_on_directory_or_patterns() {
        let base = definition(&["*.txt", "*.doc"], &["temp/*", "*.log"]);

        let mut moved = base.clone();
        moved.directory = "/different/path".to_string();
        assert_ne!(base, moved);

        assert_ne!(base, definition(&["*.txt", "*.pdf"], &["temp/*", "*.log"]));
        assert_ne!(base, definition(&["*.txt", "*.doc"], &["temp/*", "*.bak"]));
    }

    // Reordered patterns match the same files but deliberately count as a change.
    #[test]
    fn pattern_order_is_significant() {
        let base = definition(&["*.txt", "*.doc"], &["temp/*", "*.log"]);
        assert_ne!(base, definition(&["*.doc", "*.txt"], &["temp/*", "*.log"]));
        assert_ne!(base, definition(&["*.txt", "*.doc"], &["*.log", "temp/*"]));
    }

    #[test]
    fn profiles_compare_id_clock_and_definition() {
        let utc = chrono_tz::UTC;
        let midnight = CronClock::parse("0 0 * * *", utc).unwrap();
        let noon = CronClock::parse("0 12 * * *", utc).unwrap();
        let search = definition(&["*.txt"], &[]);

        let a = Profile::new("profile-123", midnight.clone(), search.clone());
        assert_eq!(a, Profile::new("profile-123", midnight.clone(), search.clone()));
        assert_ne!(a, Profile::new("profile-456", midnight.clone(), search.clone()));
        assert_ne!(a, Profile::new("profile-123", noon, search.clone()));
        assert_ne!(a, Profile::new("profile-123", midnight, definition(&["*.doc"], &[])));
    }

    #[test]
    fn bind_accepts_valid_record() {
        let profile = Profile::bind(&record(" profile-123 ", "* * * * *"), chrono_tz::UTC).unwrap();
        assert_eq!(profile.id(), "profile-123");
        assert_eq!(profile.clock().time_zone(), chrono_tz::UTC);
        assert_eq!(profile.search_definition().directory, "/backup/path");
    }

    #[test]
    fn bind_uses_profile_time_zone_over_default() {
        let mut cfg = record("p", "0 9 * * *");
        cfg.time_zone = Some("Europe/Amsterdam".to_string());
        let profile = Profile::bind(&cfg, chrono_tz::UTC).unwrap();
        assert_eq!(profile.clock().time_zone(), chrono_tz::Europe::Amsterdam);
    }

    #[test]
    fn bind_rejects_invalid_records() {
        let utc = chrono_tz::UTC;
        assert!(matches!(
            Profile::bind(&record("   ", "* * * * *"), utc),
            Err(SchedulerError::InvalidProfile { .. })
        ));
        assert!(matches!(
            Profile::bind(&record("p", "every day"), utc),
            Err(SchedulerError::InvalidCron { .. })
        ));

        let mut bad_zone = record("p", "* * * * *");
        bad_zone.time_zone = Some("Nowhere/Special".to_string());
        assert!(matches!(
            Profile::bind(&bad_zone, utc),
            Err(SchedulerError::InvalidTimeZone(_))
        ));
    }

    #[test]
    fn bind_rejects_uncompilable_glob_patterns() {
        let mut bad_include = record("p", "* * * * *");
        bad_include.search_definition.include_patterns = vec!["[unclosed".to_string()];
        assert!(matches!(
            Profile::bind(&bad_include, chrono_tz::UTC),
            Err(SchedulerError::InvalidProfile { ref id, .. }) if id == "p"
        ));

        let mut bad_exclude = record("p", "* * * * *");
        bad_exclude.search_definition.include_patterns = vec!["**/*.txt".to_string()];
        bad_exclude.search_definition.exclude_patterns = vec!["{a,b".to_string()];
        assert!(matches!(
            Profile::bind(&bad_exclude, chrono_tz::UTC),
            Err(SchedulerError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn scope_revocation_is_shared_by_clones() {
        let scope = CancellationScope::new();
        let held = scope.clone();
        assert!(!held.is_revoked());

        scope.revoke();
        scope.revoke();
        assert!(held.is_revoked());
    }

    #[tokio::test]
    async fn revoked_future_resolves_after_revoke() {
        let scope = CancellationScope::new();
        let waiter = scope.clone();
        let handle = tokio::spawn(async move { waiter.revoked().await });
        scope.revoke();
        handle.await.unwrap();
    }

    #[test]
    fn next_invocation_carries_scope_and_snapshot() {
        use chrono::TimeZone;

        let profile = Profile::bind(&record("profile-123", "*/5 * * * *"), chrono_tz::UTC).unwrap();
        let scope = CancellationScope::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 30).unwrap();

        let invocation = profile.next_invocation(now, &scope).unwrap();
        assert_eq!(invocation.profile_id, "profile-123");
        assert_eq!(invocation.invoke_at, Utc.with_ymd_and_hms(2024, 1, 15, 12, 5, 0).unwrap());
        assert_eq!(invocation.archive_name(), "profile-123.tar.gz");
        assert_eq!(*invocation.search_definition, *profile.search_definition());

        scope.revoke();
        assert!(invocation.is_cancelled());
    }
}
