//! CalDAV transport.
//!
//! [`DavTransport`] is the seam between the job pipeline and the wire: the
//! pipeline only ever lists locators, bulk-fetches resources and writes them
//! back. [`CalDavClient`] implements it over HTTP with hand-built WebDAV
//! requests and parses multistatus bodies with roxmltree.

use std::future::Future;

use reqwest::header::{CONTENT_TYPE, ETAG, HeaderMap};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::error::{CalSyncError, CalSyncResult};
use crate::utils::file_slug;

/// A calendar collection found on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCalendar {
    pub href: String,
    pub display_name: String,
    /// Supported component names (VEVENT, VTODO, ...). Empty when the server
    /// does not advertise any.
    pub components: Vec<String>,
}

impl RemoteCalendar {
    /// Whether this collection can hold events or to-dos.
    pub fn holds_items(&self) -> bool {
        self.components.is_empty()
            || self
                .components
                .iter()
                .any(|c| c.eq_ignore_ascii_case("VEVENT") || c.eq_ignore_ascii_case("VTODO"))
    }
}

/// Where an item lives, without its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub href: String,
    pub etag: Option<String>,
}

/// A fetched calendar resource with its ICS data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub href: String,
    pub etag: Option<String>,
    pub data: String,
}

/// Wire operations the remote pipeline needs.
pub trait DavTransport: Send + Sync + 'static {
    /// List the calendar collections under the configured home.
    fn discover(&self) -> impl Future<Output = CalSyncResult<Vec<RemoteCalendar>>> + Send;

    /// Item locators of one collection; content is not transferred.
    fn list(
        &self,
        calendar_href: &str,
    ) -> impl Future<Output = CalSyncResult<Vec<ResourceRef>>> + Send;

    /// Fetch many items of one collection in a single request.
    fn multiget(
        &self,
        calendar_href: &str,
        hrefs: &[String],
    ) -> impl Future<Output = CalSyncResult<Vec<Resource>>> + Send;

    /// Create or replace one item. `etag` guards against overwriting a newer
    /// version; `None` means the resource must not exist yet. Returns the
    /// new entity tag when the server reports one.
    fn put(
        &self,
        href: &str,
        data: &str,
        etag: Option<&str>,
    ) -> impl Future<Output = CalSyncResult<Option<String>>> + Send;

    /// Create a calendar collection and return its href.
    fn make_calendar(&self, display_name: &str)
    -> impl Future<Output = CalSyncResult<String>> + Send;

    /// Href for a new item in a collection.
    fn item_href(&self, calendar_href: &str, item_id: &str) -> String {
        format!(
            "{}/{}.ics",
            calendar_href.trim_end_matches('/'),
            file_slug(item_id)
        )
    }
}

const DISCOVER_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
    <c:supported-calendar-component-set/>
  </d:prop>
</d:propfind>"#;

const LIST_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getetag/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

/// CalDAV over HTTP with basic authentication.
///
/// `server_url` must point at the calendar home collection.
pub struct CalDavClient {
    http: reqwest::Client,
    server_url: Url,
    username: String,
    password: String,
}

impl CalDavClient {
    pub fn new(server_url: &str, username: &str, password: &str) -> CalSyncResult<Self> {
        let mut server_url = Url::parse(server_url)
            .map_err(|e| CalSyncError::Config(format!("Invalid server URL '{}': {}", server_url, e)))?;

        // Relative hrefs resolve against the home collection itself
        if !server_url.path().ends_with('/') {
            let path = format!("{}/", server_url.path());
            server_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(CalDavClient {
            http,
            server_url,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    fn resolve(&self, href: &str) -> CalSyncResult<Url> {
        self.server_url
            .join(href)
            .map_err(|e| CalSyncError::Transport(format!("Invalid href '{}': {}", href, e)))
    }

    fn method(name: &'static [u8]) -> CalSyncResult<Method> {
        Method::from_bytes(name).map_err(|e| CalSyncError::Transport(e.to_string()))
    }

    /// Send a WebDAV request with an XML body and return the response body.
    async fn dav_request(
        &self,
        method: Method,
        url: Url,
        depth: Option<&str>,
        body: String,
    ) -> CalSyncResult<String> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body);
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CalSyncError::Transport(format!(
                "{} {} failed with status {}",
                method, url, status
            )));
        }

        Ok(response.text().await?)
    }
}

impl DavTransport for CalDavClient {
    async fn discover(&self) -> CalSyncResult<Vec<RemoteCalendar>> {
        let body = self
            .dav_request(
                Self::method(b"PROPFIND")?,
                self.server_url.clone(),
                Some("1"),
                DISCOVER_BODY.to_string(),
            )
            .await?;

        parse_calendar_list(&body, self.server_url.path())
    }

    async fn list(&self, calendar_href: &str) -> CalSyncResult<Vec<ResourceRef>> {
        let url = self.resolve(calendar_href)?;
        let collection_path = url.path().to_string();
        let body = self
            .dav_request(
                Self::method(b"PROPFIND")?,
                url,
                Some("1"),
                LIST_BODY.to_string(),
            )
            .await?;

        parse_resource_refs(&body, &collection_path)
    }

    async fn multiget(&self, calendar_href: &str, hrefs: &[String]) -> CalSyncResult<Vec<Resource>> {
        let url = self.resolve(calendar_href)?;
        let body = self
            .dav_request(
                Self::method(b"REPORT")?,
                url,
                Some("1"),
                multiget_body(hrefs),
            )
            .await?;

        parse_calendar_resources(&body)
    }

    async fn put(&self, href: &str, data: &str, etag: Option<&str>) -> CalSyncResult<Option<String>> {
        let url = self.resolve(href)?;
        let mut request = self
            .http
            .put(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .body(data.to_string());
        request = match etag {
            Some(etag) => request.header("If-Match", etag),
            None => request.header("If-None-Match", "*"),
        };

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(CalSyncError::Transport(format!(
                "{} changed on the server since it was fetched",
                url
            )));
        }
        if !status.is_success() {
            return Err(CalSyncError::Transport(format!(
                "PUT {} failed with status {}",
                url, status
            )));
        }

        Ok(etag_header(response.headers()))
    }

    async fn make_calendar(&self, display_name: &str) -> CalSyncResult<String> {
        let href = format!("{}{}/", self.server_url.path(), file_slug(display_name));
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<c:mkcalendar xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:set>
    <d:prop>
      <d:displayname>{}</d:displayname>
    </d:prop>
  </d:set>
</c:mkcalendar>"#,
            xml_escape(display_name)
        );

        self.dav_request(Self::method(b"MKCALENDAR")?, self.resolve(&href)?, None, body)
            .await?;
        Ok(href)
    }
}

fn etag_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn multiget_body(hrefs: &[String]) -> String {
    let hrefs: String = hrefs
        .iter()
        .map(|href| format!("    <d:href>{}</d:href>\n", xml_escape(href)))
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
{}</c:calendar-multiget>"#,
        hrefs
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn parse_document(body: &str) -> CalSyncResult<roxmltree::Document<'_>> {
    roxmltree::Document::parse(body)
        .map_err(|e| CalSyncError::Transport(format!("Malformed multistatus body: {}", e)))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.descendants()
        .find(|n| n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(str::trim)
}

fn same_collection(href: &str, collection_path: &str) -> bool {
    href.trim_end_matches('/') == collection_path.trim_end_matches('/')
}

/// Parse calendar collections from a Depth:1 PROPFIND on the calendar home.
fn parse_calendar_list(body: &str, home_path: &str) -> CalSyncResult<Vec<RemoteCalendar>> {
    let doc = parse_document(body)?;
    let mut calendars = Vec::new();

    for response in doc
        .root_element()
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
    {
        let Some(href) = child_text(response, "href") else {
            continue;
        };
        if same_collection(href, home_path) {
            continue;
        }

        let is_calendar = response
            .descendants()
            .filter(|n| n.tag_name().name() == "resourcetype")
            .flat_map(|n| n.children())
            .any(|n| n.tag_name().name() == "calendar");
        if !is_calendar {
            continue;
        }

        let display_name = child_text(response, "displayname")
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                href.trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or("calendar")
                    .to_string()
            });

        let components = response
            .descendants()
            .filter(|n| n.tag_name().name() == "comp")
            .filter_map(|n| n.attribute("name"))
            .map(str::to_string)
            .collect();

        calendars.push(RemoteCalendar {
            href: href.to_string(),
            display_name,
            components,
        });
    }

    Ok(calendars)
}

/// Parse item locators from a Depth:1 PROPFIND on a calendar collection.
fn parse_resource_refs(body: &str, collection_path: &str) -> CalSyncResult<Vec<ResourceRef>> {
    let doc = parse_document(body)?;

    let refs = doc
        .root_element()
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
        .filter_map(|response| {
            let href = child_text(response, "href")?;
            if same_collection(href, collection_path) {
                return None;
            }
            // Nested collections are not items
            let is_collection = response
                .descendants()
                .any(|n| n.tag_name().name() == "collection");
            if is_collection {
                return None;
            }
            Some(ResourceRef {
                href: href.to_string(),
                etag: child_text(response, "getetag").map(str::to_string),
            })
        })
        .collect();

    Ok(refs)
}

/// Parse calendar resources from a multiget multistatus response.
fn parse_calendar_resources(body: &str) -> CalSyncResult<Vec<Resource>> {
    let doc = parse_document(body)?;

    let resources = doc
        .root_element()
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
        .filter_map(|response| {
            let href = child_text(response, "href")?;
            let data = response
                .descendants()
                .find(|n| n.tag_name().name() == "calendar-data")
                .and_then(|n| n.text())
                .unwrap_or_default();
            Some(Resource {
                href: href.to_string(),
                etag: child_text(response, "getetag").map(str::to_string),
                data: data.to_string(),
            })
        })
        .collect();

    Ok(resources)
}
