//! Maxar Discovery, a STAC API searched per day.
use super::{
    endpoint, stac_page, Capabilities, CatalogProvider, CatalogQuery, Page, PageState,
    PaginationStyle, ProviderKind, Session,
};
use crate::config::ProviderOptions;
use crate::error::{IngestError, Result};
use crate::http::ApiRequest;
use crate::normalize::{Field, FieldMap, Format};
use chrono::SecondsFormat;
use serde_json::Value;
use url::Url;

const SEARCH_URL: &str = "https://api.maxar.com/discovery/v1/search";
const COLLECTIONS: [&str; 2] = ["wv01", "wv02"];

pub struct Maxar {
    search_url: Url,
    collections: Vec<String>,
    fields: FieldMap,
}

impl Maxar {
    pub fn new(options: &ProviderOptions) -> Result<Self> {
        let collections = if options.collections.is_empty() {
            COLLECTIONS.iter().map(|c| c.to_string()).collect()
        } else {
            options.collections.clone()
        };
        Ok(Self {
            search_url: endpoint(options.search_url.as_ref(), SEARCH_URL)?,
            collections,
            fields: FieldMap::new()
                .map(Field::Identifier, "/id", Format::Text)
                .map(Field::Geometry, "/geometry", Format::GeoJson)
                .map(Field::AcquisitionDate, "/properties/datetime", Format::Timestamp)
                .map(Field::PublicationDate, "/properties/created", Format::Timestamp)
                .map(Field::Platform, "/properties/platform", Format::Text)
                .map(Field::Sensor, "/properties/instruments/0", Format::Text)
                .map(Field::Resolution, "/properties/gsd", Format::Decimal)
                .map(Field::Constellation, "/properties/constellation", Format::Text)
                .map(Field::Constellation, "/collection", Format::Text)
                .map(Field::CloudCover, "/properties/eo:cloud_cover", Format::Text)
                .map(Field::IncidenceAngle, "/properties/view:off_nadir", Format::Decimal)
                .map(Field::AzimuthAngle, "/properties/view:azimuth", Format::Decimal),
        })
    }
}

impl CatalogProvider for Maxar {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Maxar
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_token_exchange: false,
            pagination_style: PaginationStyle::TokenBased,
            supports_thumbnail_download: false,
        }
    }

    fn search_request(&self, session: &Session, query: &CatalogQuery) -> Result<ApiRequest> {
        let page = match query.page {
            PageState::Number(n) => n,
            ref other => {
                return Err(IngestError::Parse {
                    field: "page".to_string(),
                    value: other.to_string(),
                })
            }
        };
        let datetime = format!(
            "{}/{}",
            query.unit.start().to_rfc3339_opts(SecondsFormat::Secs, true),
            query.unit.end_exclusive().to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let request = ApiRequest::get(self.search_url.clone())
            .query(&[
                ("collections", self.collections.join(",")),
                ("bbox", query.area.bbox().to_bbox_string()),
                ("datetime", datetime),
                ("limit", query.page_size.to_string()),
                ("page", page.to_string()),
            ])
            .header("MAXAR-API-KEY", session.token());
        Ok(request)
    }

    fn parse_page(&self, body: &Value, query: &CatalogQuery) -> Result<Page> {
        let (features, next_link) = stac_page(body)?;
        // the link only signals that another page exists; pages are addressed by number
        let next = next_link.and_then(|_| match query.page {
            PageState::Number(n) => Some(PageState::Number(n + 1)),
            _ => None,
        });
        Ok(Page { features, next })
    }

    fn field_map(&self) -> &FieldMap {
        &self.fields
    }
}
