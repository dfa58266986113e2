use std::collections::HashSet;

use tracing::info;
use ulid::Ulid;

use crate::generator::parse_timezone;
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::slots::plan_generation;
use super::{Engine, EngineError, GenerationReport, ValidationError};

/// Result of a successful pattern upsert.
#[derive(Debug, Clone)]
pub struct PatternUpsert {
    /// The scope's full pattern set after the upsert, deactivated ones included.
    pub patterns: Vec<AvailabilityPattern>,
    pub report: GenerationReport,
}

/// Reject the whole submission if any two active patterns on the same day
/// intersect.
pub(crate) fn check_no_overlap(patterns: &[AvailabilityPattern]) -> Result<(), ValidationError> {
    let mut active: Vec<&AvailabilityPattern> = patterns.iter().filter(|p| p.is_active).collect();
    active.sort_by_key(|p| (p.day_of_week, p.start_time, p.end_time));
    // Sorted by start, any overlap shows up between neighbours.
    for pair in active.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if first.overlaps(second) {
            return Err(ValidationError::Overlap {
                day: first.day_of_week,
                first_start: first.start_time,
                first_end: first.end_time,
                second_start: second.start_time,
                second_end: second.end_time,
            });
        }
    }
    Ok(())
}

fn validate_timezone(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    if parse_timezone(name).is_none() {
        return Err(ValidationError::UnknownTimezone(name.to_string()).into());
    }
    Ok(())
}

fn validate_slug(slug: &str) -> Result<(), EngineError> {
    if slug.is_empty() {
        return Err(ValidationError::MissingField("slug").into());
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(EngineError::LimitExceeded("slug too long"));
    }
    if !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ValidationError::InvalidField {
            field: "slug",
            reason: format!("{slug:?} may only contain letters, digits, '-' and '_'"),
        }
        .into());
    }
    Ok(())
}

impl Engine {
    pub async fn register_provider(&self, id: Ulid, slug: &str, timezone: &str) -> Result<ProviderInfo, EngineError> {
        let slug = slug.trim();
        validate_slug(slug)?;
        validate_timezone(timezone)?;
        if self.providers.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }

        let _directory = self.directory_lock.lock().await;
        if self.providers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }
        if self.slugs.contains_key(slug) {
            return Err(EngineError::AlreadyExists(slug.to_string()));
        }
        let event = Event::ProviderRegistered {
            id,
            slug: slug.to_string(),
            timezone: timezone.to_string(),
        };
        self.persist_shared(&event).await?;
        info!("registered provider {slug} ({id}) in {timezone}");
        Ok(ProviderInfo { id, slug: slug.to_string(), timezone: timezone.to_string() })
    }

    /// Public slug → provider, for unauthenticated client calls.
    pub fn resolve_provider(&self, slug: &str) -> Result<ProviderInfo, EngineError> {
        self.slugs
            .get(slug.trim())
            .and_then(|id| self.provider(id.value()))
            .ok_or_else(|| EngineError::UnknownProvider(slug.to_string()))
    }

    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut providers: Vec<ProviderInfo> = self.providers.iter().map(|p| p.value().clone()).collect();
        providers.sort_by(|a, b| a.slug.cmp(&b.slug));
        providers
    }

    pub async fn list_patterns(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<Vec<AvailabilityPattern>, EngineError> {
        self.require_provider(&provider_id)?;
        let Some(rs) = self.get_scope(&Scope::new(provider_id, session_type)) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        let mut patterns = guard.patterns.clone();
        patterns.sort_by_key(|p| (p.day_of_week, p.start_time));
        Ok(patterns)
    }

    /// Replace the scope's pattern set with `drafts`.
    ///
    /// Validation covers the entire submission before anything is written;
    /// the new set is one WAL record. Stored patterns missing from the
    /// submission are deactivated, never deleted. The rolling horizon is
    /// regenerated under the same lock, and a set whose slots would not fit
    /// the scope is refused up front.
    pub async fn upsert_patterns(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        drafts: Vec<PatternDraft>,
    ) -> Result<PatternUpsert, EngineError> {
        let provider = self.require_provider(&provider_id)?;
        let scope = Scope::new(provider_id, session_type);
        if drafts.len() > MAX_PATTERNS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many patterns"));
        }

        let mut seen = HashSet::new();
        let mut submitted = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if draft.day_of_week > 6 {
                return Err(ValidationError::InvalidDay(draft.day_of_week).into());
            }
            if draft.start_time >= draft.end_time {
                return Err(ValidationError::MalformedRange {
                    day: draft.day_of_week,
                    start: draft.start_time,
                    end: draft.end_time,
                }
                .into());
            }
            let timezone = draft.timezone.unwrap_or_else(|| provider.timezone.clone());
            validate_timezone(&timezone)?;
            let id = draft.id.unwrap_or_else(Ulid::new);
            if !seen.insert(id) {
                return Err(ValidationError::DuplicatePattern(id).into());
            }
            if self.pattern_index.get(&id).is_some_and(|owner| *owner.value() != scope) {
                return Err(ValidationError::ForeignPattern(id).into());
            }
            submitted.push(AvailabilityPattern {
                id,
                provider_id,
                session_type,
                day_of_week: draft.day_of_week,
                start_time: draft.start_time,
                end_time: draft.end_time,
                timezone,
                is_active: draft.is_active,
            });
        }
        check_no_overlap(&submitted)?;

        let now = now_ms();
        let window = self.horizon_for(&provider_id, now)?;
        let rs = self.scope_state(scope).await?;
        let mut guard = rs.write().await;

        let deactivated_count =
            guard.patterns.iter().filter(|p| p.is_active && !seen.contains(&p.id)).count();
        let mut patterns = submitted;
        let deactivated: Vec<AvailabilityPattern> = guard
            .patterns
            .iter()
            .filter(|p| !seen.contains(&p.id))
            .map(|p| AvailabilityPattern { is_active: false, ..p.clone() })
            .collect();
        patterns.extend(deactivated);

        // A set that would overflow the scope is rejected before it is stored.
        let duration_ms = self.settings.session(session_type).duration_ms;
        plan_generation(&guard, &patterns, &window, duration_ms, now)?;

        let event = Event::PatternsReplaced { scope, patterns: patterns.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "patterns for {scope}: {} active, {deactivated_count} deactivated",
            patterns.iter().filter(|p| p.is_active).count()
        );

        let report = self.materialize_locked(&mut guard, &window, now).await?;
        Ok(PatternUpsert { patterns, report })
    }

    /// Deactivate every pattern of the scope.
    pub async fn deactivate_patterns(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<PatternUpsert, EngineError> {
        self.upsert_patterns(provider_id, session_type, Vec::new()).await
    }
}
