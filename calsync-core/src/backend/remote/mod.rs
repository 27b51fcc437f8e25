//! Remote (CalDAV) backend.
//!
//! The handle only enqueues jobs; a worker task owns the job queue and all
//! server traffic. See [`pipeline`] for the stage machine.

mod caldav;
mod pipeline;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendEvent, BackendKind, ErrorScope, EventSink};
use crate::config::BackendDetails;
use crate::error::{CalSyncError, CalSyncResult};
use crate::model::{CalendarItem, CalendarMetadata, CalendarRef};

pub use caldav::{CalDavClient, DavTransport, RemoteCalendar, Resource, ResourceRef};

use pipeline::{Job, Pipeline};

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Deadline for each network stage; `None` waits forever.
    pub stage_timeout: Option<Duration>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            stage_timeout: Some(DEFAULT_STAGE_TIMEOUT),
        }
    }
}

pub struct RemoteBackend {
    id: String,
    details: BackendDetails,
    jobs: mpsc::UnboundedSender<Job>,
    active: Arc<AtomicUsize>,
    events: EventSink,
    worker: JoinHandle<()>,
}

impl RemoteBackend {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn<T: DavTransport>(
        details: BackendDetails,
        transport: T,
        events: EventSink,
        options: RemoteOptions,
    ) -> CalSyncResult<Self> {
        let BackendDetails::Caldav {
            server_url,
            username,
            ..
        } = &details
        else {
            return Err(CalSyncError::Config(
                "a remote backend needs caldav connection details".into(),
            ));
        };
        let id = format!("caldav:{}@{}", username, host_of(server_url));

        let (jobs, receiver) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            id.clone(),
            Arc::new(transport),
            events.clone(),
            receiver,
            Arc::clone(&active),
            options.stage_timeout,
        );
        let worker = tokio::spawn(pipeline.run());

        debug!(backend = %id, "Remote backend started");
        Ok(RemoteBackend {
            id,
            details,
            jobs,
            active,
            events,
            worker,
        })
    }

    fn submit(&self, job: Job) -> Result<(), Job> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.jobs.send(job).map_err(|rejected| {
            self.active.fetch_sub(1, Ordering::SeqCst);
            rejected.0
        })
    }

    /// Load requests report through events, so a dead worker is reported
    /// the same way.
    fn submit_load(&self, job: Job, scope: ErrorScope) {
        if self.submit(job).is_err() {
            warn!(backend = %self.id, "Remote worker is gone");
            let event = BackendEvent::ErrorOccurred {
                backend_id: self.id.clone(),
                scope,
                message: CalSyncError::BackendGone(self.id.clone()).to_string(),
            };
            if self.events.send(event).is_err() {
                debug!(backend = %self.id, "Event receiver dropped");
            }
        }
    }

    fn submit_store(&self, job: Job) -> CalSyncResult<()> {
        self.submit(job)
            .map_err(|_| CalSyncError::BackendGone(self.id.clone()))
    }
}

fn host_of(server_url: &str) -> String {
    url::Url::parse(server_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| server_url.to_string())
}

impl Backend for RemoteBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn details(&self) -> BackendDetails {
        self.details.clone()
    }

    fn load_calendars(&self, collection_id: &str) {
        self.submit_load(
            Job::Discover {
                collection_id: collection_id.to_string(),
            },
            ErrorScope::Discovery {
                collection_id: collection_id.to_string(),
            },
        );
    }

    fn load_items(&self, calendar: &CalendarRef) {
        self.submit_load(Job::Load(calendar.clone()), ErrorScope::Load(calendar.clone()));
    }

    fn store_calendars(
        &self,
        collection_id: &str,
        calendars: &[CalendarMetadata],
    ) -> CalSyncResult<()> {
        self.submit_store(Job::StoreCalendars {
            collection_id: collection_id.to_string(),
            calendars: calendars.to_vec(),
        })
    }

    fn store_items(&self, calendar: &CalendarRef, items: &[CalendarItem]) -> CalSyncResult<()> {
        self.submit_store(Job::StoreItems {
            calendar: calendar.clone(),
            items: items.to_vec(),
        })
    }

    fn update_item(&self, calendar_id: &str, item_id: &str, payload: &str) -> CalSyncResult<()> {
        self.submit_store(Job::UpdateItem {
            calendar_id: calendar_id.to_string(),
            item_id: item_id.to_string(),
            payload: payload.to_string(),
        })
    }

    fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        // Queued and in-flight jobs are abandoned without further events.
        self.worker.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::ics::generate_ics;

    /// In-memory CalDAV server.
    #[derive(Default)]
    pub(crate) struct MockDav {
        pub calendars: Vec<RemoteCalendar>,
        /// collection href -> resources
        pub resources: Mutex<HashMap<String, Vec<Resource>>>,
        pub list_calls: Arc<AtomicUsize>,
        pub fail_list: bool,
        /// Reject writes to these hrefs with a precondition failure
        pub fail_puts: Vec<String>,
        pub hang: bool,
        /// (href, If-Match etag) of every write
        pub puts: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    impl MockDav {
        pub(crate) fn with_calendar(mut self, href: &str, name: &str) -> Self {
            self.calendars.push(RemoteCalendar {
                href: href.into(),
                display_name: name.into(),
                components: vec!["VEVENT".into(), "VTODO".into()],
            });
            self
        }

        pub(crate) fn with_item(self, calendar_href: &str, item: &CalendarItem) -> Self {
            let data = generate_ics(item).unwrap();
            self.with_raw(calendar_href, &format!("{}.ics", item.id), &data)
        }

        pub(crate) fn with_raw(self, calendar_href: &str, name: &str, data: &str) -> Self {
            let href = format!("{}{}", calendar_href, name);
            self.resources
                .lock()
                .unwrap()
                .entry(calendar_href.to_string())
                .or_default()
                .push(Resource {
                    href,
                    etag: Some(format!("\"{}\"", name)),
                    data: data.to_string(),
                });
            self
        }
    }

    impl DavTransport for MockDav {
        async fn discover(&self) -> CalSyncResult<Vec<RemoteCalendar>> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.calendars.clone())
        }

        async fn list(&self, calendar_href: &str) -> CalSyncResult<Vec<ResourceRef>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list {
                return Err(CalSyncError::Transport("HTTP 503".into()));
            }
            let resources = self.resources.lock().unwrap();
            Ok(resources
                .get(calendar_href)
                .map(|all| {
                    all.iter()
                        .map(|r| ResourceRef {
                            href: r.href.clone(),
                            etag: r.etag.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn multiget(
            &self,
            calendar_href: &str,
            hrefs: &[String],
        ) -> CalSyncResult<Vec<Resource>> {
            let resources = self.resources.lock().unwrap();
            Ok(resources
                .get(calendar_href)
                .map(|all| {
                    all.iter()
                        .filter(|r| hrefs.contains(&r.href))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn put(
            &self,
            href: &str,
            _data: &str,
            etag: Option<&str>,
        ) -> CalSyncResult<Option<String>> {
            if self.fail_puts.iter().any(|failing| failing == href) {
                return Err(CalSyncError::Transport("HTTP 412".into()));
            }
            self.puts
                .lock()
                .unwrap()
                .push((href.to_string(), etag.map(str::to_string)));
            Ok(Some("\"new\"".into()))
        }

        async fn make_calendar(&self, display_name: &str) -> CalSyncResult<String> {
            Ok(format!("/dav/{}/", display_name.to_lowercase()))
        }
    }

    pub(crate) fn caldav_details() -> BackendDetails {
        BackendDetails::Caldav {
            server_url: "https://dav.example.com/dav/".into(),
            username: "alice".into(),
            password: "secret".into(),
        }
    }

    pub(crate) fn spawn_mock(
        dav: MockDav,
        events: EventSink,
        options: RemoteOptions,
    ) -> RemoteBackend {
        RemoteBackend::spawn(caldav_details(), dav, events, options).unwrap()
    }

    fn spawn(dav: MockDav) -> (RemoteBackend, UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (spawn_mock(dav, tx, RemoteOptions::default()), rx)
    }

    pub(crate) async fn discover(
        backend: &RemoteBackend,
        rx: &mut UnboundedReceiver<BackendEvent>,
    ) {
        backend.load_calendars("home");
        match rx.recv().await.unwrap() {
            BackendEvent::CalendarsLoaded { .. } => {}
            other => panic!("Expected CalendarsLoaded, got {:?}", other),
        }
    }

    pub(crate) fn work_ref() -> CalendarRef {
        CalendarRef {
            collection_id: "home".into(),
            calendar_id: "home_work".into(),
            name: "Work".into(),
        }
    }

    #[tokio::test]
    async fn test_discovery_synthesizes_ids_and_filters_collections() {
        let mut dav = MockDav::default()
            .with_calendar("/dav/work/", "Work Stuff")
            .with_calendar("/dav/inbox/", "Inbox");
        dav.calendars[1].components.clear();
        let (backend, mut rx) = spawn(dav);

        backend.load_calendars("home");
        match rx.recv().await.unwrap() {
            BackendEvent::CalendarsLoaded {
                backend_id,
                collection_id,
                calendars,
            } => {
                assert_eq!(backend_id, "caldav:alice@dav.example.com");
                assert_eq!(collection_id, "home");
                assert_eq!(
                    calendars,
                    vec![CalendarMetadata::new("home_work_stuff", "Work Stuff")]
                );
            }
            other => panic!("Expected CalendarsLoaded, got {:?}", other),
        }
        assert_eq!(backend.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_load_is_ignored() {
        let dav = MockDav::default()
            .with_calendar("/dav/work/", "Work")
            .with_item("/dav/work/", &CalendarItem::event("e1", "Standup"));
        let list_calls = Arc::clone(&dav.list_calls);
        let (backend, mut rx) = spawn(dav);
        discover(&backend, &mut rx).await;

        let work = work_ref();
        backend.load_items(&work);
        backend.load_items(&work);

        match rx.recv().await.unwrap() {
            BackendEvent::ItemsLoaded { items, .. } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].etag.as_deref(), Some("\"e1.ics\""));
            }
            other => panic!("Expected ItemsLoaded, got {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(BackendEvent::DataLoaded { .. })));
        assert_eq!(backend.active_jobs(), 0);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_calendar_reports_only_data_loaded() {
        let dav = MockDav::default().with_calendar("/dav/work/", "Work");
        let (backend, mut rx) = spawn(dav);
        discover(&backend, &mut rx).await;

        backend.load_items(&work_ref());
        assert!(matches!(rx.recv().await, Some(BackendEvent::DataLoaded { .. })));
    }

    #[tokio::test]
    async fn test_unparsable_payload_is_skipped() {
        let dav = MockDav::default()
            .with_calendar("/dav/work/", "Work")
            .with_raw("/dav/work/", "broken.ics", "")
            .with_item("/dav/work/", &CalendarItem::event("e1", "Standup"));
        let (backend, mut rx) = spawn(dav);
        discover(&backend, &mut rx).await;

        backend.load_items(&work_ref());
        match rx.recv().await.unwrap() {
            BackendEvent::ItemsLoaded { items, .. } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "e1");
            }
            other => panic!("Expected ItemsLoaded, got {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(BackendEvent::DataLoaded { .. })));
    }

    #[tokio::test]
    async fn test_failed_job_advances_queue() {
        let dav = MockDav {
            fail_list: true,
            ..MockDav::default()
        }
        .with_calendar("/dav/work/", "Work");
        let (backend, mut rx) = spawn(dav);
        discover(&backend, &mut rx).await;

        let unknown = CalendarRef {
            collection_id: "home".into(),
            calendar_id: "home_missing".into(),
            name: "Missing".into(),
        };
        backend.load_items(&unknown);
        backend.load_items(&work_ref());

        match rx.recv().await.unwrap() {
            BackendEvent::ErrorOccurred { scope, .. } => {
                assert_eq!(scope, ErrorScope::Load(unknown));
            }
            other => panic!("Expected ErrorOccurred, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            BackendEvent::ErrorOccurred { scope, message, .. } => {
                assert_eq!(scope, ErrorScope::Load(work_ref()));
                assert!(message.contains("503"));
            }
            other => panic!("Expected ErrorOccurred, got {:?}", other),
        }
        assert_eq!(backend.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_store_reports_stored_items() {
        let dav = MockDav::default()
            .with_calendar("/dav/work/", "Work")
            .with_item("/dav/work/", &CalendarItem::event("e1", "Standup"));
        let puts = Arc::clone(&dav.puts);
        let (backend, mut rx) = spawn(dav);
        discover(&backend, &mut rx).await;
        backend.load_items(&work_ref());
        let _ = rx.recv().await;
        let _ = rx.recv().await;

        backend
            .store_items(
                &work_ref(),
                &[
                    CalendarItem::event("e1", "Standup moved"),
                    CalendarItem::event("e2", "Retro"),
                ],
            )
            .unwrap();

        match rx.recv().await.unwrap() {
            BackendEvent::ItemsStored { item_ids, .. } => assert_eq!(item_ids, vec!["e1", "e2"]),
            other => panic!("Expected ItemsStored, got {:?}", other),
        }
        assert_eq!(
            *puts.lock().unwrap(),
            vec![
                ("/dav/work/e1.ics".to_string(), Some("\"e1.ics\"".to_string())),
                ("/dav/work/e2.ics".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_put_names_the_item() {
        let dav = MockDav {
            fail_puts: vec!["/dav/work/e2.ics".into()],
            ..MockDav::default()
        }
        .with_calendar("/dav/work/", "Work");
        let (backend, mut rx) = spawn(dav);
        discover(&backend, &mut rx).await;

        backend
            .store_items(
                &work_ref(),
                &[CalendarItem::event("e1", "Standup"), CalendarItem::event("e2", "Retro")],
            )
            .unwrap();

        match rx.recv().await.unwrap() {
            BackendEvent::ErrorOccurred { scope, message, .. } => {
                assert_eq!(
                    scope,
                    ErrorScope::Store {
                        calendar_id: "home_work".into(),
                        item_ids: vec!["e2".into()],
                    }
                );
                assert!(message.contains("412"));
            }
            other => panic!("Expected ErrorOccurred, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            BackendEvent::ItemsStored { item_ids, .. } => assert_eq!(item_ids, vec!["e1"]),
            other => panic!("Expected ItemsStored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_before_discovery_fails_every_item() {
        let (backend, mut rx) = spawn(MockDav::default().with_calendar("/dav/work/", "Work"));

        backend
            .store_items(&work_ref(), &[CalendarItem::event("e1", "Standup")])
            .unwrap();

        match rx.recv().await.unwrap() {
            BackendEvent::ErrorOccurred { scope, .. } => assert_eq!(
                scope,
                ErrorScope::Store {
                    calendar_id: "home_work".into(),
                    item_ids: vec!["e1".into()],
                }
            ),
            other => panic!("Expected ErrorOccurred, got {:?}", other),
        }
        assert_eq!(backend.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_stage_deadline_fails_job_and_advances() {
        let dav = MockDav {
            hang: true,
            ..MockDav::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = spawn_mock(
            dav,
            tx,
            RemoteOptions {
                stage_timeout: Some(Duration::from_millis(50)),
            },
        );

        backend.load_calendars("home");
        backend.load_calendars("away");

        for collection in ["home", "away"] {
            match rx.recv().await.unwrap() {
                BackendEvent::ErrorOccurred { scope, message, .. } => {
                    assert_eq!(
                        scope,
                        ErrorScope::Discovery {
                            collection_id: collection.into()
                        }
                    );
                    assert!(message.contains("50ms"), "unexpected message: {message}");
                }
                other => panic!("Expected ErrorOccurred, got {:?}", other),
            }
        }
        assert_eq!(backend.active_jobs(), 0);
    }

    #[test]
    fn test_spawn_rejects_local_details() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = RemoteBackend::spawn(
            BackendDetails::Local {
                root_path: "/tmp/calendars".into(),
            },
            MockDav::default(),
            tx,
            RemoteOptions::default(),
        );
        assert!(matches!(result, Err(CalSyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_dead_worker_reports_through_events() {
        let (mut backend, mut rx) = spawn(MockDav::default());
        backend.worker.abort();
        let _ = (&mut backend.worker).await;

        backend.load_calendars("home");
        match rx.recv().await.unwrap() {
            BackendEvent::ErrorOccurred { scope, message, .. } => {
                assert_eq!(
                    scope,
                    ErrorScope::Discovery {
                        collection_id: "home".into()
                    }
                );
                assert!(message.contains("no longer running"));
            }
            other => panic!("Expected ErrorOccurred, got {:?}", other),
        }
        assert_eq!(backend.active_jobs(), 0);

        // Nobody listening any more: logged and dropped
        drop(rx);
        backend.load_items(&work_ref());
        assert_eq!(backend.active_jobs(), 0);
        assert!(matches!(
            backend.store_items(&work_ref(), &[]),
            Err(CalSyncError::BackendGone(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_cancels_quietly() {
        let dav = MockDav {
            hang: true,
            ..MockDav::default()
        };
        let (backend, mut rx) = spawn(dav);
        backend.load_calendars("home");
        assert_eq!(backend.active_jobs(), 1);

        drop(backend);
        assert!(rx.recv().await.is_none());
    }
}
