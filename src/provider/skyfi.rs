//! SkyFi archive search. The only catalog here that hands out thumbnails.
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
use url::Url;

const SEARCH_URL: &str = "https://app.skyfi.com/platform-api/archives";
const PRODUCT_TYPE: &str = "SAR";

pub struct Skyfi {
    search_url: Url,
    product_types: Vec<String>,
    open_data: bool,
    fields: FieldMap,
}

impl Skyfi {
    pub fn new(options: &ProviderOptions) -> Result<Self> {
        let product_types = if options.product_types.is_empty() {
            vec![PRODUCT_TYPE.to_string()]
        } else {
            options.product_types.clone()
        };
        Ok(Self {
            search_url: endpoint(options.search_url.as_ref(), SEARCH_URL)?,
            product_types,
            open_data: options.open_data,
            fields: FieldMap::new()
                .map(Field::Identifier, "/archiveId", Format::Text)
                .map(Field::Geometry, "/footprint", Format::Wkt)
                .map(Field::AcquisitionDate, "/captureTimestamp", Format::Timestamp)
                .map(Field::Platform, "/provider", Format::Text)
                .map(Field::Sensor, "/productType", Format::Text)
                .map(Field::Resolution, "/gsd", Format::Decimal)
                .map(Field::Constellation, "/constellation", Format::Text)
                .map(Field::CloudCover, "/cloudCoveragePercent", Format::Text)
                .map(Field::IncidenceAngle, "/offNadirAngle", Format::Decimal)
                .map(Field::ThumbnailUrl, "/thumbnailUrls/300x300", Format::Text),
        })
    }
}

impl CatalogProvider for Skyfi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Skyfi
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_token_exchange: false,
            pagination_style: PaginationStyle::TokenBased,
            supports_thumbnail_download: true,
        }
    }

    fn first_page(&self) -> PageState {
        PageState::Number(0)
    }

    fn search_request(&self, session: &Session, query: &CatalogQuery) -> Result<ApiRequest> {
        let mut body = json!({
            "aoi": query.area.bbox().to_wkt(),
            "fromDate": query.unit.start().to_rfc3339_opts(SecondsFormat::Secs, true),
            "toDate": query.unit.end_inclusive().to_rfc3339_opts(SecondsFormat::Secs, true),
            "productTypes": self.product_types,
            "openData": self.open_data,
            "pageSize": query.page_size,
        });
        match &query.page {
            PageState::Number(n) => body["pageNumber"] = json!(n),
            PageState::Token(token) => body["nextPage"] = json!(token),
            PageState::Link(_) => {}
        }

        let request = match &query.page {
            PageState::Link(next) => ApiRequest::get(next.clone()),
            _ => ApiRequest::post_json(self.search_url.clone(), body),
        };
        Ok(request.header("X-Skyfi-Api-Key", session.token()))
    }

    fn parse_page(&self, body: &Value, _query: &CatalogQuery) -> Result<Page> {
        let next = match body.get("nextPage") {
            Some(Value::Number(n)) => n.as_u64().map(|n| PageState::Number(n as u32)),
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(match s.parse::<u32>() {
                Ok(n) => PageState::Number(n),
                Err(_) => match Url::parse(s) {
                    Ok(url) => PageState::Link(url),
                    Err(_) => PageState::Token(s.clone()),
                },
            }),
            _ => None,
        };
        Ok(Page {
            features: features_at(body, "/archives")?,
            next,
        })
    }

    fn field_map(&self) -> &FieldMap {
        &self.fields
    }
}
