use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{EngineError, validate_window};
use crate::limits::MAX_SYNC_EVENTS;
use crate::model::*;
use crate::reconciler::Trigger;
use crate::service::AvailabilityService;

/// Opaque provider credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// An event as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub id: String,
    pub window: Span,
    pub title: Option<String>,
    /// Set on events this service pushed for one of its own bookings.
    pub booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExternalEvent {
    pub window: Span,
    pub title: String,
    pub booking_id: Option<Ulid>,
}

/// A third-party calendar provider.
#[async_trait]
pub trait ExternalCalendar: Send + Sync {
    /// Events overlapping `range`.
    async fn list_events(
        &self,
        credential: &Credential,
        calendar_id: &str,
        range: Span,
    ) -> Result<Vec<ExternalEvent>, EngineError>;

    /// Returns the provider's id for the new event.
    async fn create_event(
        &self,
        credential: &Credential,
        calendar_id: &str,
        event: &NewExternalEvent,
    ) -> Result<String, EngineError>;

    async fn update_event(
        &self,
        credential: &Credential,
        calendar_id: &str,
        event_id: &str,
        event: &NewExternalEvent,
    ) -> Result<(), EngineError>;

    async fn delete_event(&self, credential: &Credential, calendar_id: &str, event_id: &str)
    -> Result<(), EngineError>;
}

/// Outcome of one pull from an external calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    /// Set when anything changed and reconciliation was triggered.
    pub trigger: Option<Trigger>,
}

impl SyncReport {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Keeps `External` calendar entries in step with a provider, and mirrors
/// bookings out to it.
pub struct CalendarSync<P: ExternalCalendar> {
    provider: Arc<P>,
    timeout: Duration,
}

impl<P: ExternalCalendar> CalendarSync<P> {
    pub fn new(provider: Arc<P>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    async fn call<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| EngineError::ExternalCalendar(format!("{call} timed out after {:?}", self.timeout)))?
    }

    /// Pull the provider's events in `range` and make the stored external
    /// blocks of `professional_id` match: new events are added, moved ones
    /// updated, vanished ones removed. Events mirroring this professional's
    /// own bookings and malformed events are skipped. Triggers one
    /// reconciliation if anything changed.
    pub async fn sync_professional(
        &self,
        service: &AvailabilityService,
        credential: &Credential,
        calendar_id: &str,
        professional_id: Ulid,
        range: Span,
    ) -> Result<SyncReport, EngineError> {
        validate_window(&range)?;
        let engine = service.engine();
        let stored = engine.calendar_entries(professional_id).await?;
        let bookings: HashSet<Ulid> = engine
            .bookings(professional_id)
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect();

        let events = self
            .call(
                "list_events",
                self.provider.list_events(credential, calendar_id, range),
            )
            .await?;
        if events.len() > MAX_SYNC_EVENTS {
            return Err(EngineError::LimitExceeded("too many external events"));
        }

        // Keyed over every stored external block, not just those in `range`,
        // so an event moved into the range updates its existing entry.
        let mut known: HashMap<String, CalendarEntry> = HashMap::new();
        let mut duplicates = Vec::new();
        for entry in stored.into_iter().filter(|e| e.source == CalendarSource::External) {
            let Some(ext) = entry.external_event_id.clone() else {
                continue;
            };
            if known.contains_key(&ext) {
                duplicates.push(entry);
            } else {
                known.insert(ext, entry);
            }
        }

        let mut report = SyncReport::default();
        let result: Result<(), EngineError> = async {
            let mut seen = HashSet::new();
            for event in events {
                if event.booking_id.is_some_and(|id| bookings.contains(&id)) || !seen.insert(event.id.clone()) {
                    report.skipped += 1;
                    continue;
                }
                if let Err(e) = validate_window(&event.window) {
                    debug!(event = %event.id, error = %e, "skipping external event");
                    report.skipped += 1;
                    continue;
                }
                match known.remove(&event.id) {
                    Some(entry) if entry.window == event.window => {}
                    Some(entry) => {
                        engine
                            .upsert_calendar_entry(
                                entry.id,
                                professional_id,
                                event.window,
                                CalendarSource::External,
                                Some(event.id),
                            )
                            .await?;
                        report.updated += 1;
                    }
                    None => {
                        engine
                            .upsert_calendar_entry(
                                Ulid::new(),
                                professional_id,
                                event.window,
                                CalendarSource::External,
                                Some(event.id),
                            )
                            .await?;
                        report.created += 1;
                    }
                }
            }

            // Only blocks inside the listed range can be known to have vanished.
            let vanished = known.into_values().filter(|e| e.window.overlaps(&range));
            for entry in duplicates.into_iter().chain(vanished) {
                engine.remove_calendar_entry(entry.id).await?;
                report.deleted += 1;
            }
            Ok(())
        }
        .await;

        // Entries written before a failure are committed, so reconcile either way.
        if report.changed() > 0 {
            report.trigger = Some(service.on_fact_changed(professional_id).await);
            info!(
                professional = %professional_id,
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                "external calendar synced"
            );
        }
        if let Err(e) = result {
            warn!(professional = %professional_id, error = %e, "external calendar sync aborted");
            return Err(e);
        }
        Ok(report)
    }

    /// Mirror a booking to the provider. Updates `existing_event` when given,
    /// otherwise creates one. Returns the provider's event id.
    pub async fn push_booking(
        &self,
        service: &AvailabilityService,
        credential: &Credential,
        calendar_id: &str,
        booking_id: Ulid,
        existing_event: Option<&str>,
    ) -> Result<String, EngineError> {
        let booking = service.get_booking(booking_id).await?;
        let event = NewExternalEvent {
            window: booking.window,
            title: format!("Booking {booking_id}"),
            booking_id: Some(booking_id),
        };
        match existing_event {
            Some(event_id) => {
                self.call(
                    "update_event",
                    self.provider.update_event(credential, calendar_id, event_id, &event),
                )
                .await?;
                Ok(event_id.to_string())
            }
            None => {
                let event_id = self
                    .call(
                        "create_event",
                        self.provider.create_event(credential, calendar_id, &event),
                    )
                    .await?;
                debug!(booking = %booking_id, event = %event_id, "booking pushed to external calendar");
                Ok(event_id)
            }
        }
    }

    /// Delete a previously pushed event, e.g. after a cancellation.
    pub async fn retract_event(
        &self,
        credential: &Credential,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), EngineError> {
        let result = self
            .call(
                "delete_event",
                self.provider.delete_event(credential, calendar_id, event_id),
            )
            .await;
        if let Err(ref e) = result {
            warn!(event = %event_id, error = %e, "failed to retract external event");
        }
        result
    }
}
