mod calendar;
mod conflict;
mod error;
mod lifecycle;
mod queries;
#[cfg(test)]
mod tests;

pub use calendar::{month_grid, CalendarDay, CalendarEntry};
pub use conflict::find_conflicts;
pub use error::EngineError;
pub use lifecycle::{BookingRequest, Role, Session};
pub use queries::{BookingFilter, BookingPage};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends are group-committed: the first
/// Append starts a batch, anything already queued behind it joins, a single
/// fsync covers them all, and every waiter is answered with the result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Whatever is already queued rides in the same fsync
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Commit the batch before the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // nothing queued
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even when an append failed: callers saw this batch fail, so its
    // buffered bytes must not ride into a later batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The authoritative facility store. Each facility's bookings live behind a
/// single RwLock, so conflict-check-and-insert is serialized per facility.
pub struct Engine {
    pub state: DashMap<Ulid, SharedFacilityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → facility id
    pub(super) booking_to_facility: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a FacilityState (no locking — caller holds the lock).
fn apply_to_facility(fs: &mut FacilityState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingRequested {
            id,
            facility_id,
            title,
            created_by,
            span,
            note,
            created_at,
        } => {
            fs.insert_booking(Booking {
                id: *id,
                facility_id: *facility_id,
                title: title.clone(),
                created_by: created_by.clone(),
                span: *span,
                status: BookingStatus::Pending,
                note: note.clone(),
                review_reason: None,
                reviewed_by: None,
                cancelled_by: None,
                created_at: *created_at,
            });
            booking_map.insert(*id, *facility_id);
        }
        Event::BookingApproved { id, reason, reviewed_by, .. } => {
            if let Some(b) = fs.get_booking_mut(id) {
                b.status = BookingStatus::Approved;
                b.review_reason = reason.clone();
                b.reviewed_by = Some(reviewed_by.clone());
            }
        }
        Event::BookingRejected { id, reason, reviewed_by, .. } => {
            if let Some(b) = fs.get_booking_mut(id) {
                b.status = BookingStatus::Rejected;
                b.review_reason = reason.clone();
                b.reviewed_by = Some(reviewed_by.clone());
            }
        }
        Event::BookingCancelled { id, cancelled_by, .. } => {
            if let Some(b) = fs.get_booking_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_by = Some(cancelled_by.clone());
            }
        }
        // FacilityCreated is handled at the DashMap level, not here
        Event::FacilityCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_facility: DashMap::new(),
        };

        // Nobody else holds these Arcs yet, so try_write cannot fail.
        // blocking_write would panic here: replay runs in async context.
        for event in &events {
            match event {
                Event::FacilityCreated { id, name, description } => {
                    let fs = FacilityState::new(*id, name.clone(), description.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(fs)));
                }
                other => {
                    if let Some(facility_id) = event_facility_id(other)
                        && let Some(entry) = engine.state.get(&facility_id)
                    {
                        let fs_arc = entry.value().clone();
                        let mut guard = fs_arc.try_write().expect("replay: uncontended write");
                        apply_to_facility(&mut guard, other, &engine.booking_to_facility);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(engine.state.len() as f64);

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn facility_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_facility.get(booking_id).map(|e| *e.value())
    }

    /// The commit sequence for every mutation: durable in the WAL first,
    /// then applied in memory, then announced.
    pub(super) async fn persist_and_apply(
        &self,
        facility_id: Ulid,
        fs: &mut FacilityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_facility(fs, event, &self.booking_to_facility);
        self.notify.send(facility_id, event);
        Ok(())
    }

    /// Resolve a booking id to its facility and take that facility's write
    /// lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<FacilityState>), EngineError> {
        let facility_id = self
            .facility_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.write_owned().await;
        Ok((facility_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Terminal bookings are preserved (requested
    /// event followed by the status event) so history survives compaction.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let facility_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in facility_ids {
            let Some(fs) = self.get_facility(&id) else { continue };
            let guard = fs.read().await;

            events.push(Event::FacilityCreated {
                id: guard.id,
                name: guard.name.clone(),
                description: guard.description.clone(),
            });

            for b in &guard.bookings {
                events.push(Event::BookingRequested {
                    id: b.id,
                    facility_id: guard.id,
                    title: b.title.clone(),
                    created_by: b.created_by.clone(),
                    span: b.span,
                    note: b.note.clone(),
                    created_at: b.created_at,
                });
                match b.status {
                    BookingStatus::Pending => {}
                    BookingStatus::Approved => events.push(Event::BookingApproved {
                        id: b.id,
                        facility_id: guard.id,
                        reason: b.review_reason.clone(),
                        reviewed_by: b.reviewed_by.clone().unwrap_or_default(),
                    }),
                    BookingStatus::Rejected => events.push(Event::BookingRejected {
                        id: b.id,
                        facility_id: guard.id,
                        reason: b.review_reason.clone(),
                        reviewed_by: b.reviewed_by.clone().unwrap_or_default(),
                    }),
                    BookingStatus::Cancelled => events.push(Event::BookingCancelled {
                        id: b.id,
                        facility_id: guard.id,
                        cancelled_by: b.cancelled_by.clone().unwrap_or_default(),
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Extract the facility_id from an event (for non-FacilityCreated events).
fn event_facility_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingRequested { facility_id, .. }
        | Event::BookingApproved { facility_id, .. }
        | Event::BookingRejected { facility_id, .. }
        | Event::BookingCancelled { facility_id, .. } => Some(*facility_id),
        Event::FacilityCreated { .. } => None,
    }
}
