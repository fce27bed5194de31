//! Planet Data API quick search.
use super::{
    endpoint, features_at, Capabilities, CatalogProvider, CatalogQuery, Page, PageState,
    PaginationStyle, ProviderKind, Session,
};
use crate::config::ProviderOptions;
use crate::error::Result;
use crate::http::ApiRequest;
use crate::normalize::{Field, FieldMap, Format};
use chrono::SecondsFormat;
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

const SEARCH_URL: &str = "https://api.planet.com/data/v1/quick-search";
const ITEM_TYPE: &str = "SkySatCollect";

pub struct Planet {
    search_url: Url,
    item_types: Vec<String>,
    fields: FieldMap,
}

impl Planet {
    pub fn new(options: &ProviderOptions) -> Result<Self> {
        let item_types = if options.item_types.is_empty() {
            vec![ITEM_TYPE.to_string()]
        } else {
            options.item_types.clone()
        };
        Ok(Self {
            search_url: endpoint(options.search_url.as_ref(), SEARCH_URL)?,
            item_types,
            fields: FieldMap::new()
                .map(Field::Identifier, "/id", Format::Text)
                .map(Field::Geometry, "/geometry", Format::GeoJson)
                .map(Field::AcquisitionDate, "/properties/acquired", Format::Timestamp)
                .map(Field::PublicationDate, "/properties/published", Format::Timestamp)
                .map(Field::Platform, "/properties/provider", Format::Text)
                .map(Field::Sensor, "/properties/instrument", Format::Text)
                .map(Field::Sensor, "/properties/item_type", Format::Text)
                .map(Field::Resolution, "/properties/pixel_resolution", Format::Decimal)
                .map(Field::Resolution, "/properties/gsd", Format::Decimal)
                .map(Field::Constellation, "/properties/satellite_id", Format::Text)
                .map(Field::CloudCover, "/properties/cloud_percent", Format::Text)
                .map(Field::CloudCover, "/properties/cloud_cover", Format::Text)
                .map(Field::IncidenceAngle, "/properties/view_angle", Format::Decimal)
                .map(Field::AzimuthAngle, "/properties/satellite_azimuth", Format::Decimal),
        })
    }

    fn filter(&self, query: &CatalogQuery) -> Value {
        json!({
            "type": "AndFilter",
            "config": [
                {
                    "type": "GeometryFilter",
                    "field_name": "geometry",
                    "config": query.area.bbox().to_geojson(),
                },
                {
                    "type": "DateRangeFilter",
                    "field_name": "acquired",
                    "config": {
                        "gte": query.unit.start().to_rfc3339_opts(SecondsFormat::Millis, true),
                        "lte": query.unit.end_inclusive().to_rfc3339_opts(SecondsFormat::Millis, true),
                    },
                },
            ],
        })
    }
}

impl CatalogProvider for Planet {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Planet
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_token_exchange: false,
            pagination_style: PaginationStyle::TokenBased,
            supports_thumbnail_download: false,
        }
    }

    fn search_request(&self, session: &Session, query: &CatalogQuery) -> Result<ApiRequest> {
        let auth = format!("api-key {}", session.token());
        let request = match &query.page {
            PageState::Link(next) => ApiRequest::get(next.clone()),
            _ => ApiRequest::post_json(
                self.search_url.clone(),
                json!({
                    "item_types": self.item_types,
                    "filter": self.filter(query),
                }),
            )
            .query(&[("_page_size", query.page_size.to_string())]),
        };
        Ok(request.header("Authorization", auth))
    }

    fn parse_page(&self, body: &Value, _query: &CatalogQuery) -> Result<Page> {
        let next = match body.pointer("/_links/_next").and_then(Value::as_str) {
            Some(href) => match Url::parse(href) {
                Ok(url) => Some(PageState::Link(url)),
                Err(e) => {
                    warn!("planet: ignoring unparsable next link '{href}': {e}");
                    None
                }
            },
            None => None,
        };
        Ok(Page {
            features: features_at(body, "/features")?,
            next,
        })
    }

    fn field_map(&self) -> &FieldMap {
        &self.fields
    }
}
