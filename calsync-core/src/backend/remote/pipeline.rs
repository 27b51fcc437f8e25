//! The remote job pipeline.
//!
//! One actor task per remote backend owns a FIFO of jobs and advances them
//! through explicit stages. At most one stage future is in flight at any
//! time, so traffic toward the server is strictly serialized. New jobs are
//! accepted while a stage is in flight, which is what lets a duplicate item
//! load be recognised and dropped.
//!
//! ```text
//! Load:     Idle -> Listing -> (Fetching) -> Idle
//! Discover: Idle -> Discovering -> Idle
//! Store:    Idle -> Storing -> Idle
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::remote::caldav::{DavTransport, RemoteCalendar, Resource, ResourceRef};
use crate::backend::{BackendEvent, ErrorScope, EventSink};
use crate::error::{CalSyncError, CalSyncResult};
use crate::ics::{generate_ics, parse_item};
use crate::model::{CalendarItem, CalendarMetadata, CalendarRef};
use crate::utils::normalize_name;

/// Work accepted by the pipeline.
#[derive(Debug)]
pub(crate) enum Job {
    Discover {
        collection_id: String,
    },
    Load(CalendarRef),
    StoreCalendars {
        collection_id: String,
        calendars: Vec<CalendarMetadata>,
    },
    StoreItems {
        calendar: CalendarRef,
        items: Vec<CalendarItem>,
    },
    UpdateItem {
        calendar_id: String,
        item_id: String,
        payload: String,
    },
}

impl Job {
    fn loads(&self, calendar_id: &str) -> bool {
        matches!(self, Job::Load(calendar) if calendar.calendar_id == calendar_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Discovering,
    Listing,
    Fetching,
    Storing,
}

/// Result of one completed stage future.
enum Outcome {
    Discovered(CalSyncResult<Vec<RemoteCalendar>>),
    Listed(CalSyncResult<Vec<ResourceRef>>),
    Fetched(CalSyncResult<Vec<Resource>>),
    /// Per item: (item id, href, new etag or error)
    Stored(Vec<(String, String, CalSyncResult<Option<String>>)>),
    /// Per calendar: (calendar id, href or error)
    CalendarsCreated(Vec<(String, CalSyncResult<String>)>),
}

type StageFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

/// Where a fetched item lives on the server, and the version we saw.
#[derive(Debug, Clone)]
struct Locator {
    href: String,
    etag: Option<String>,
}

pub(crate) struct Pipeline<T: DavTransport> {
    backend_id: String,
    transport: Arc<T>,
    events: EventSink,
    jobs: mpsc::UnboundedReceiver<Job>,
    queue: VecDeque<Job>,
    stage: Stage,
    in_flight: Option<StageFuture>,
    /// calendar id -> collection href, filled by discovery
    calendars: HashMap<String, String>,
    /// (calendar id, item id) -> locator, filled by fetches and stores
    locators: HashMap<(String, String), Locator>,
    active: Arc<AtomicUsize>,
    stage_timeout: Option<Duration>,
}

enum Step {
    Accept(Job),
    Complete(Outcome),
    Shutdown,
}

async fn wait_for(in_flight: &mut Option<StageFuture>) -> Outcome {
    match in_flight {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn with_deadline<R>(
    deadline: Option<Duration>,
    request: impl Future<Output = CalSyncResult<R>>,
) -> CalSyncResult<R> {
    match deadline {
        Some(limit) => timeout(limit, request)
            .await
            .map_err(|_| CalSyncError::Timeout(limit))?,
        None => request.await,
    }
}

impl<T: DavTransport> Pipeline<T> {
    pub(crate) fn new(
        backend_id: String,
        transport: Arc<T>,
        events: EventSink,
        jobs: mpsc::UnboundedReceiver<Job>,
        active: Arc<AtomicUsize>,
        stage_timeout: Option<Duration>,
    ) -> Self {
        Pipeline {
            backend_id,
            transport,
            events,
            jobs,
            queue: VecDeque::new(),
            stage: Stage::Idle,
            in_flight: None,
            calendars: HashMap::new(),
            locators: HashMap::new(),
            active,
            stage_timeout,
        }
    }

    /// Run until every job sender is gone.
    pub(crate) async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                job = self.jobs.recv() => match job {
                    Some(job) => Step::Accept(job),
                    None => Step::Shutdown,
                },
                outcome = wait_for(&mut self.in_flight) => Step::Complete(outcome),
            };

            match step {
                Step::Accept(job) => self.accept(job),
                Step::Complete(outcome) => {
                    self.in_flight = None;
                    self.complete(outcome);
                }
                Step::Shutdown => break,
            }

            self.start_next();
        }

        debug!(backend = %self.backend_id, dropped = self.queue.len(), "Pipeline stopped");
    }

    fn accept(&mut self, job: Job) {
        if let Job::Load(calendar) = &job
            && self.queue.iter().any(|queued| queued.loads(&calendar.calendar_id))
        {
            debug!(
                backend = %self.backend_id,
                calendar = %calendar.calendar_id,
                "Load already queued"
            );
            self.active.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        self.queue.push_back(job);
    }

    /// Pop the head job. Called before the job's final event is sent so that
    /// observers of that event already see the reduced job count.
    fn finish(&mut self) {
        self.queue.pop_front();
        self.stage = Stage::Idle;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn emit(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            debug!(backend = %self.backend_id, "Event receiver dropped");
        }
    }

    fn emit_error(&self, scope: ErrorScope, error: &CalSyncError) {
        warn!(backend = %self.backend_id, ?scope, error = %error, "Remote job failed");
        self.emit(BackendEvent::ErrorOccurred {
            backend_id: self.backend_id.clone(),
            scope,
            message: error.to_string(),
        });
    }

    /// Start jobs until one is in flight or the queue is empty. Jobs that
    /// fail before reaching the wire are finished immediately.
    fn start_next(&mut self) {
        while self.stage == Stage::Idle {
            let Some(job) = self.queue.front() else {
                return;
            };

            match self.begin(job) {
                Ok((stage, future)) => {
                    self.stage = stage;
                    self.in_flight = Some(future);
                }
                Err((scope, error)) => {
                    self.finish();
                    self.emit_error(scope, &error);
                }
            }
        }
    }

    fn begin(&self, job: &Job) -> Result<(Stage, StageFuture), (ErrorScope, CalSyncError)> {
        let transport = Arc::clone(&self.transport);
        let deadline = self.stage_timeout;

        match job {
            Job::Discover { collection_id } => {
                debug!(backend = %self.backend_id, collection = %collection_id, "Discovering calendars");
                Ok((
                    Stage::Discovering,
                    Box::pin(async move {
                        Outcome::Discovered(with_deadline(deadline, transport.discover()).await)
                    }),
                ))
            }
            Job::Load(calendar) => {
                let href = self
                    .calendar_href(calendar)
                    .map_err(|e| (ErrorScope::Load(calendar.clone()), e))?;
                debug!(backend = %self.backend_id, calendar = %calendar.calendar_id, "Listing items");
                Ok((
                    Stage::Listing,
                    Box::pin(async move {
                        Outcome::Listed(with_deadline(deadline, transport.list(&href)).await)
                    }),
                ))
            }
            Job::StoreCalendars {
                collection_id,
                calendars,
            } => {
                debug!(
                    backend = %self.backend_id,
                    collection = %collection_id,
                    count = calendars.len(),
                    "Creating calendars"
                );
                let missing: Vec<CalendarMetadata> = calendars
                    .iter()
                    .filter(|meta| !self.calendars.contains_key(&meta.id))
                    .cloned()
                    .collect();
                Ok((
                    Stage::Storing,
                    Box::pin(async move {
                        let mut created = Vec::with_capacity(missing.len());
                        for meta in missing {
                            let result =
                                with_deadline(deadline, transport.make_calendar(&meta.name)).await;
                            created.push((meta.id, result));
                        }
                        Outcome::CalendarsCreated(created)
                    }),
                ))
            }
            Job::StoreItems { calendar, items } => {
                let scope = || ErrorScope::Store {
                    calendar_id: calendar.calendar_id.clone(),
                    item_ids: items.iter().map(|item| item.id.clone()).collect(),
                };
                let calendar_href = self.calendar_href(calendar).map_err(|e| (scope(), e))?;

                let mut writes = Vec::with_capacity(items.len());
                for item in items {
                    let payload = generate_ics(item).map_err(|e| (scope(), e))?;
                    let (href, etag) =
                        self.target(&calendar.calendar_id, &item.id, &calendar_href);
                    writes.push((item.id.clone(), href, etag, payload));
                }
                Ok((Stage::Storing, Self::store_future(transport, deadline, writes)))
            }
            Job::UpdateItem {
                calendar_id,
                item_id,
                payload,
            } => {
                let calendar_href = self
                    .calendars
                    .get(calendar_id)
                    .cloned()
                    .ok_or_else(|| {
                        (
                            ErrorScope::Store {
                                calendar_id: calendar_id.clone(),
                                item_ids: vec![item_id.clone()],
                            },
                            CalSyncError::CalendarNotFound(calendar_id.clone()),
                        )
                    })?;
                let (href, etag) = self.target(calendar_id, item_id, &calendar_href);
                let writes = vec![(item_id.clone(), href, etag, payload.clone())];
                Ok((Stage::Storing, Self::store_future(transport, deadline, writes)))
            }
        }
    }

    fn store_future(
        transport: Arc<T>,
        deadline: Option<Duration>,
        writes: Vec<(String, String, Option<String>, String)>,
    ) -> StageFuture {
        Box::pin(async move {
            let mut results = Vec::with_capacity(writes.len());
            for (item_id, href, etag, payload) in writes {
                let result =
                    with_deadline(deadline, transport.put(&href, &payload, etag.as_deref())).await;
                results.push((item_id, href, result));
            }
            Outcome::Stored(results)
        })
    }

    fn calendar_href(&self, calendar: &CalendarRef) -> CalSyncResult<String> {
        self.calendars
            .get(&calendar.calendar_id)
            .cloned()
            .ok_or_else(|| CalSyncError::CalendarNotFound(calendar.calendar_id.clone()))
    }

    /// Existing location and version of an item, or a fresh href for a new one.
    fn target(&self, calendar_id: &str, item_id: &str, calendar_href: &str) -> (String, Option<String>) {
        match self
            .locators
            .get(&(calendar_id.to_string(), item_id.to_string()))
        {
            Some(locator) => (locator.href.clone(), locator.etag.clone()),
            None => (self.transport.item_href(calendar_href, item_id), None),
        }
    }

    fn complete(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Discovered(result) => self.complete_discovery(result),
            Outcome::Listed(result) => self.complete_listing(result),
            Outcome::Fetched(result) => self.complete_fetch(result),
            Outcome::Stored(results) => self.complete_store(results),
            Outcome::CalendarsCreated(results) => self.complete_calendar_creation(results),
        }
    }

    fn complete_discovery(&mut self, result: CalSyncResult<Vec<RemoteCalendar>>) {
        let Some(Job::Discover { collection_id }) = self.queue.front() else {
            return;
        };
        let collection_id = collection_id.clone();

        match result {
            Ok(found) => {
                let mut calendars = Vec::new();
                for remote in found.into_iter().filter(RemoteCalendar::holds_items) {
                    let id = format!("{}_{}", collection_id, normalize_name(&remote.display_name));
                    self.calendars.insert(id.clone(), remote.href);
                    calendars.push(CalendarMetadata::new(id, remote.display_name));
                }

                info!(backend = %self.backend_id, count = calendars.len(), "Remote calendars discovered");
                self.finish();
                self.emit(BackendEvent::CalendarsLoaded {
                    backend_id: self.backend_id.clone(),
                    collection_id,
                    calendars,
                });
            }
            Err(e) => {
                self.finish();
                self.emit_error(ErrorScope::Discovery { collection_id }, &e);
            }
        }
    }

    fn complete_listing(&mut self, result: CalSyncResult<Vec<ResourceRef>>) {
        let Some(Job::Load(calendar)) = self.queue.front() else {
            return;
        };
        let calendar = calendar.clone();

        match result {
            Ok(refs) if refs.is_empty() => {
                debug!(backend = %self.backend_id, calendar = %calendar.calendar_id, "Calendar is empty");
                self.finish();
                self.emit(BackendEvent::DataLoaded {
                    backend_id: self.backend_id.clone(),
                    calendar,
                });
            }
            Ok(refs) => {
                let href = match self.calendar_href(&calendar) {
                    Ok(href) => href,
                    Err(e) => {
                        self.finish();
                        self.emit_error(ErrorScope::Load(calendar), &e);
                        return;
                    }
                };
                let hrefs: Vec<String> = refs.into_iter().map(|r| r.href).collect();
                debug!(
                    backend = %self.backend_id,
                    calendar = %calendar.calendar_id,
                    count = hrefs.len(),
                    "Fetching items"
                );

                let transport = Arc::clone(&self.transport);
                let deadline = self.stage_timeout;
                self.stage = Stage::Fetching;
                self.in_flight = Some(Box::pin(async move {
                    Outcome::Fetched(with_deadline(deadline, transport.multiget(&href, &hrefs)).await)
                }));
            }
            Err(e) => {
                self.finish();
                self.emit_error(ErrorScope::Load(calendar), &e);
            }
        }
    }

    fn complete_fetch(&mut self, result: CalSyncResult<Vec<Resource>>) {
        let Some(Job::Load(calendar)) = self.queue.front() else {
            return;
        };
        let calendar = calendar.clone();

        let resources = match result {
            Ok(resources) => resources,
            Err(e) => {
                self.finish();
                self.emit_error(ErrorScope::Load(calendar), &e);
                return;
            }
        };

        let mut items = Vec::with_capacity(resources.len());
        for resource in resources {
            let Some(mut item) = parse_item(&resource.data) else {
                warn!(
                    backend = %self.backend_id,
                    href = %resource.href,
                    "Skipping empty or unparsable item"
                );
                continue;
            };
            item.etag = resource.etag.clone();
            self.locators.insert(
                (calendar.calendar_id.clone(), item.id.clone()),
                Locator {
                    href: resource.href,
                    etag: resource.etag,
                },
            );
            items.push(item);
        }

        info!(
            backend = %self.backend_id,
            calendar = %calendar.calendar_id,
            count = items.len(),
            "Calendar loaded"
        );
        self.finish();
        if !items.is_empty() {
            self.emit(BackendEvent::ItemsLoaded {
                backend_id: self.backend_id.clone(),
                calendar: calendar.clone(),
                items,
            });
        }
        self.emit(BackendEvent::DataLoaded {
            backend_id: self.backend_id.clone(),
            calendar,
        });
    }

    fn complete_store(&mut self, results: Vec<(String, String, CalSyncResult<Option<String>>)>) {
        let calendar_id = match self.queue.front() {
            Some(Job::StoreItems { calendar, .. }) => calendar.calendar_id.clone(),
            Some(Job::UpdateItem { calendar_id, .. }) => calendar_id.clone(),
            _ => return,
        };

        let mut stored = Vec::new();
        let mut failures = Vec::new();
        for (item_id, href, result) in results {
            match result {
                Ok(etag) => {
                    self.locators
                        .insert((calendar_id.clone(), item_id.clone()), Locator { href, etag });
                    stored.push(item_id);
                }
                Err(e) => failures.push((item_id, e)),
            }
        }

        self.finish();
        for (item_id, e) in failures {
            self.emit_error(
                ErrorScope::Store {
                    calendar_id: calendar_id.clone(),
                    item_ids: vec![item_id],
                },
                &e,
            );
        }
        if !stored.is_empty() {
            self.emit(BackendEvent::ItemsStored {
                backend_id: self.backend_id.clone(),
                calendar_id,
                item_ids: stored,
            });
        }
    }

    fn complete_calendar_creation(&mut self, results: Vec<(String, CalSyncResult<String>)>) {
        let mut failures = Vec::new();
        for (calendar_id, result) in results {
            match result {
                Ok(href) => {
                    self.calendars.insert(calendar_id, href);
                }
                Err(e) => failures.push((calendar_id, e)),
            }
        }

        self.finish();
        for (calendar_id, e) in failures {
            self.emit_error(
                ErrorScope::Store {
                    calendar_id,
                    item_ids: Vec::new(),
                },
                &e,
            );
        }
    }
}
