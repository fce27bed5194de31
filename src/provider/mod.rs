//! Catalog providers and the client that drives them.
//!
//! A [`CatalogProvider`] only describes its dialect: how to authenticate, how a
//! search request looks and how a response page is read. [`ProviderClient`] owns
//! the I/O, sending every request through the retry policy and the provider's
//! throttle, and walks the pages of a query in order.
use crate::config::{Credentials, ProviderOptions};
use crate::date_window::DateUnit;
use crate::error::{IngestError, Result};
use crate::geo_area::AreaOfInterest;
use crate::http::{ApiRequest, HttpResponse, Throttle, Transport};
use crate::normalize::FieldMap;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stac::ItemCollection;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub mod airbus;
pub mod maxar;
pub mod planet;
pub mod skyfi;
pub mod umbra;

pub type RawFeature = Value;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Airbus,
    Planet,
    Maxar,
    Skyfi,
    Umbra,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Airbus,
        ProviderKind::Planet,
        ProviderKind::Maxar,
        ProviderKind::Skyfi,
        ProviderKind::Umbra,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Airbus => "airbus",
            ProviderKind::Planet => "planet",
            ProviderKind::Maxar => "maxar",
            ProviderKind::Skyfi => "skyfi",
            ProviderKind::Umbra => "umbra",
        }
    }

    pub fn default_page_size(&self) -> u32 {
        match self {
            ProviderKind::Airbus => 500,
            ProviderKind::Planet => 250,
            ProviderKind::Maxar => 100,
            ProviderKind::Skyfi => 100,
            ProviderKind::Umbra => 100,
        }
    }

    pub fn default_request_delay_ms(&self) -> u64 {
        match self {
            ProviderKind::Airbus => 1100,
            _ => 0,
        }
    }

    pub fn build(&self, options: &ProviderOptions) -> Result<Box<dyn CatalogProvider>> {
        let provider: Box<dyn CatalogProvider> = match self {
            ProviderKind::Airbus => Box::new(airbus::Airbus::new(options)?),
            ProviderKind::Planet => Box::new(planet::Planet::new(options)?),
            ProviderKind::Maxar => Box::new(maxar::Maxar::new(options)?),
            ProviderKind::Skyfi => Box::new(skyfi::Skyfi::new(options)?),
            ProviderKind::Umbra => Box::new(umbra::Umbra::new(options)?),
        };
        Ok(provider)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider '{s}'"))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PaginationStyle {
    /// Keep paging while pages come back full.
    SizeBased,
    /// Keep paging while the provider hands out a next-page marker.
    TokenBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub requires_token_exchange: bool,
    pub pagination_style: PaginationStyle,
    pub supports_thumbnail_download: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpec {
    pub span_days: u32,
}

impl Default for DateSpec {
    fn default() -> Self {
        Self { span_days: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    Number(u32),
    Token(String),
    Link(Url),
}

impl PageState {
    fn advance(&self) -> Option<PageState> {
        match self {
            PageState::Number(n) => Some(PageState::Number(n + 1)),
            _ => None,
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageState::Number(n) => write!(f, "page {n}"),
            PageState::Token(_) => write!(f, "token page"),
            PageState::Link(url) => write!(f, "{}", url.path()),
        }
    }
}

/// Access token or static key used on search requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(***)")
    }
}

#[derive(Debug, Clone)]
pub struct CatalogQuery<'a> {
    pub area: &'a AreaOfInterest,
    pub unit: &'a DateUnit,
    pub page_size: u32,
    pub page: PageState,
}

/// One parsed response page. `next` is only consulted for token-based providers.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub features: Vec<RawFeature>,
    pub next: Option<PageState>,
}

pub trait CatalogProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn capabilities(&self) -> Capabilities;

    fn date_spec(&self) -> DateSpec {
        DateSpec::default()
    }

    fn first_page(&self) -> PageState {
        PageState::Number(1)
    }

    /// Request exchanging the API key for an access token, if the provider needs one.
    fn auth_request(&self, _api_key: &str) -> Result<Option<ApiRequest>> {
        Ok(None)
    }

    fn parse_session(&self, _body: &Value) -> Result<Session> {
        Err(IngestError::auth(self.name(), "provider has no token exchange"))
    }

    fn search_request(&self, session: &Session, query: &CatalogQuery) -> Result<ApiRequest>;

    fn parse_page(&self, body: &Value, query: &CatalogQuery) -> Result<Page>;

    fn field_map(&self) -> &FieldMap;
}

/// Result of paging through one (area, date unit) pair. Features from pages
/// read before a failure are kept.
#[derive(Debug, Default)]
pub struct UnitOutcome {
    pub features: Vec<RawFeature>,
    pub requests: u32,
    pub error: Option<IngestError>,
    pub cancelled: bool,
}

pub struct ProviderClient<T: Transport> {
    provider: Box<dyn CatalogProvider>,
    transport: Arc<T>,
    policy: RetryPolicy,
    throttle: Throttle,
    page_size: u32,
    max_pages: u32,
}

impl<T: Transport> ProviderClient<T> {
    pub fn new(
        provider: Box<dyn CatalogProvider>,
        transport: Arc<T>,
        policy: RetryPolicy,
        request_delay: Duration,
        page_size: u32,
        max_pages: u32,
    ) -> Self {
        Self {
            provider,
            transport,
            policy,
            throttle: Throttle::new(request_delay),
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    pub fn provider(&self) -> &dyn CatalogProvider {
        self.provider.as_ref()
    }

    pub fn transport(&self) -> &T {
        self.transport.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn send(&self, request: &ApiRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        let response = self
            .policy
            .execute(&self.throttle, cancel, || self.transport.send(request))
            .await?;
        Ok(response)
    }

    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let name = self.provider.name();
        let api_key = credentials
            .resolve()
            .ok_or_else(|| IngestError::auth(name, "no API key configured"))?;

        let request = match self.provider.auth_request(&api_key)? {
            Some(request) => request,
            None => return Ok(Session::new(api_key)),
        };

        let response = self.send(&request, cancel).await.map_err(|e| match e {
            IngestError::Cancelled => e,
            e => IngestError::auth(name, e),
        })?;
        let body = response
            .json()
            .map_err(|e| IngestError::auth(name, format!("token response is not JSON: {e}")))?;
        let session = self.provider.parse_session(&body)?;
        info!("{name}: access token obtained");
        Ok(session)
    }

    /// Fetches a single page; the returned state is `None` once the query is exhausted.
    pub async fn search(
        &self,
        session: &Session,
        query: &CatalogQuery<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RawFeature>, Option<PageState>)> {
        let request = self.provider.search_request(session, query)?;
        let response = self.send(&request, cancel).await?;
        let body = response.json()?;
        let page = self.provider.parse_page(&body, query)?;

        let next = match self.provider.capabilities().pagination_style {
            PaginationStyle::SizeBased => {
                if page.features.len() >= query.page_size as usize {
                    query.page.advance()
                } else {
                    None
                }
            }
            PaginationStyle::TokenBased => {
                if page.features.is_empty() {
                    None
                } else {
                    page.next.filter(|next| *next != query.page)
                }
            }
        };
        Ok((page.features, next))
    }

    /// Walks every page of one area and date unit in order.
    pub async fn search_all(
        &self,
        session: &Session,
        area: &AreaOfInterest,
        unit: &DateUnit,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        let name = self.provider.name();
        let mut outcome = UnitOutcome::default();
        let mut query = CatalogQuery {
            area,
            unit,
            page_size: self.page_size,
            page: self.provider.first_page(),
        };

        loop {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            if outcome.requests >= self.max_pages {
                warn!(
                    "{name}: {unit} {}: stopped after {} pages",
                    area.geohash(),
                    self.max_pages
                );
                break;
            }

            let result = self.search(session, &query, cancel).await;
            if let Err(IngestError::Cancelled) = result {
                outcome.cancelled = true;
                break;
            }
            outcome.requests += 1;
            match result {
                Ok((features, next)) => {
                    debug!(
                        "{name}: {unit} {} {}: {} features",
                        area.geohash(),
                        query.page,
                        features.len()
                    );
                    outcome.features.extend(features);
                    match next {
                        Some(page) => query.page = page,
                        None => break,
                    }
                }
                Err(e) => {
                    warn!("{name}: {unit} {} {}: {e}", area.geohash(), query.page);
                    outcome.error = Some(IngestError::skipped(
                        format!("{name} {unit} {}", area.geohash()),
                        e,
                    ));
                    break;
                }
            }
        }
        outcome
    }
}

pub(crate) fn endpoint(configured: Option<&String>, default: &str) -> Result<Url> {
    let raw = configured.map(String::as_str).unwrap_or(default);
    Url::parse(raw).map_err(|e| IngestError::Config(format!("invalid endpoint '{raw}': {e}")))
}

/// Features under `pointer`; a missing array is an empty page.
pub(crate) fn features_at(body: &Value, pointer: &str) -> Result<Vec<RawFeature>> {
    match body.pointer(pointer) {
        Some(Value::Array(features)) => Ok(features.clone()),
        None | Some(Value::Null) => Ok(vec![]),
        Some(other) => Err(IngestError::Parse {
            field: pointer.to_string(),
            value: other.to_string().chars().take(80).collect(),
        }),
    }
}

/// Items and the `rel=next` link of a STAC API search response.
pub(crate) fn stac_page(body: &Value) -> Result<(Vec<RawFeature>, Option<Value>)> {
    let collection: ItemCollection = serde_json::from_value(body.clone())?;
    let features = collection
        .items
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<Vec<_>>>()?;
    let next = collection
        .links
        .iter()
        .find(|link| link.rel == "next")
        .map(serde_json::to_value)
        .transpose()?;
    Ok((features, next))
}
