//! Airbus OneAtlas opensearch catalog.
use super::{
    endpoint, features_at, Capabilities, CatalogProvider, CatalogQuery, Page, PageState,
    PaginationStyle, ProviderKind, Session,
};
use crate::config::ProviderOptions;
use crate::error::{IngestError, Result};
use crate::http::ApiRequest;
use crate::normalize::{Field, FieldMap, Format};
use serde_json::Value;
use url::Url;

const AUTH_URL: &str =
    "https://authenticate.foundation.api.oneatlas.airbus.com/auth/realms/IDP/protocol/openid-connect/token";
const SEARCH_URL: &str = "https://search.foundation.api.oneatlas.airbus.com/api/v2/opensearch";
const WORKSPACE: &str = "public-pneo";
const RANGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub struct Airbus {
    auth_url: Url,
    search_url: Url,
    workspace: String,
    fields: FieldMap,
}

impl Airbus {
    pub fn new(options: &ProviderOptions) -> Result<Self> {
        Ok(Self {
            auth_url: endpoint(options.auth_url.as_ref(), AUTH_URL)?,
            search_url: endpoint(options.search_url.as_ref(), SEARCH_URL)?,
            workspace: options
                .workspace
                .clone()
                .unwrap_or_else(|| WORKSPACE.to_string()),
            fields: FieldMap::new()
                .map(Field::Identifier, "/properties/acquisitionIdentifier", Format::Text)
                .map(Field::Identifier, "/properties/id", Format::Text)
                .map(Field::Geometry, "/geometry", Format::GeoJson)
                .map(Field::AcquisitionDate, "/properties/acquisitionDate", Format::Timestamp)
                .map(Field::PublicationDate, "/properties/publicationDate", Format::Timestamp)
                .map(Field::Platform, "/properties/platform", Format::Text)
                .map(Field::Sensor, "/properties/sensorType", Format::Text)
                .map(Field::Resolution, "/properties/resolution", Format::Decimal)
                .map(Field::Constellation, "/properties/constellation", Format::Text)
                .map(Field::CloudCover, "/properties/cloudCover", Format::Text)
                .map(Field::IncidenceAngle, "/properties/incidenceAngle", Format::Decimal)
                .map(Field::AzimuthAngle, "/properties/azimuthAngle", Format::Decimal),
        })
    }
}

impl CatalogProvider for Airbus {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Airbus
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_token_exchange: true,
            pagination_style: PaginationStyle::SizeBased,
            supports_thumbnail_download: false,
        }
    }

    fn auth_request(&self, api_key: &str) -> Result<Option<ApiRequest>> {
        let form = vec![
            ("apikey".to_string(), api_key.to_string()),
            ("grant_type".to_string(), "api_key".to_string()),
            ("client_id".to_string(), "IDP".to_string()),
        ];
        Ok(Some(ApiRequest::post_form(self.auth_url.clone(), form)))
    }

    fn parse_session(&self, body: &Value) -> Result<Session> {
        body.get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(Session::new)
            .ok_or_else(|| IngestError::auth(self.name(), "token response has no access_token"))
    }

    fn search_request(&self, session: &Session, query: &CatalogQuery) -> Result<ApiRequest> {
        let page = match query.page {
            PageState::Number(n) => n,
            ref other => {
                return Err(IngestError::Parse {
                    field: "startPage".to_string(),
                    value: other.to_string(),
                })
            }
        };
        let acquisition = format!(
            "[{},{}]",
            query.unit.start().format(RANGE_FORMAT),
            query.unit.end_inclusive().format(RANGE_FORMAT)
        );

        let request = ApiRequest::get(self.search_url.clone())
            .query(&[
                ("bbox", query.area.bbox().to_bbox_string()),
                ("acquisitionDate", acquisition),
                ("itemsPerPage", query.page_size.to_string()),
                ("startPage", page.to_string()),
                ("workspace", self.workspace.clone()),
            ])
            .header("Authorization", format!("Bearer {}", session.token()))
            .header("Cache-Control", "no-cache");
        Ok(request)
    }

    fn parse_page(&self, body: &Value, _query: &CatalogQuery) -> Result<Page> {
        Ok(Page {
            features: features_at(body, "/features")?,
            next: None,
        })
    }

    fn field_map(&self) -> &FieldMap {
        &self.fields
    }
}
