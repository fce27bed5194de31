//! Umbra Canopy archive, a STAC API searched with POST bodies.
use super::{
    endpoint, stac_page, Capabilities, CatalogProvider, CatalogQuery, Page, PageState,
    PaginationStyle, ProviderKind, Session,
};
use crate::config::ProviderOptions;
use crate::error::Result;
use crate::http::ApiRequest;
use crate::normalize::{Field, FieldMap, Format};
use chrono::SecondsFormat;
use serde_json::{json, Value};
use url::Url;

const SEARCH_URL: &str = "https://api.canopy.umbra.space/archive/search";

pub struct Umbra {
    search_url: Url,
    collections: Vec<String>,
    fields: FieldMap,
}

impl Umbra {
    pub fn new(options: &ProviderOptions) -> Result<Self> {
        Ok(Self {
            search_url: endpoint(options.search_url.as_ref(), SEARCH_URL)?,
            collections: options.collections.clone(),
            fields: FieldMap::new()
                .map(Field::Identifier, "/id", Format::Text)
                .map(Field::Geometry, "/geometry", Format::GeoJson)
                .map(Field::AcquisitionDate, "/properties/datetime", Format::Timestamp)
                .map(Field::AcquisitionDate, "/properties/start_datetime", Format::Timestamp)
                .map(Field::PublicationDate, "/properties/created", Format::Timestamp)
                .map(Field::Platform, "/properties/platform", Format::Text)
                .map(Field::Sensor, "/properties/sar:instrument_mode", Format::Text)
                .map(Field::Resolution, "/properties/sar:resolution_range", Format::Decimal)
                .map(Field::Constellation, "/properties/constellation", Format::Text)
                .map(Field::IncidenceAngle, "/properties/view:incidence_angle", Format::Decimal)
                .map(Field::AzimuthAngle, "/properties/view:azimuth", Format::Decimal),
        })
    }
}

impl CatalogProvider for Umbra {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Umbra
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_token_exchange: false,
            pagination_style: PaginationStyle::TokenBased,
            supports_thumbnail_download: false,
        }
    }

    fn search_request(&self, session: &Session, query: &CatalogQuery) -> Result<ApiRequest> {
        let mut body = json!({
            "limit": query.page_size,
            "bbox": query.area.bbox().to_array(),
            "datetime": format!(
                "{}/{}",
                query.unit.start().to_rfc3339_opts(SecondsFormat::Secs, true),
                query.unit.end_exclusive().to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        });
        if !self.collections.is_empty() {
            body["collections"] = json!(self.collections);
        }

        let request = match &query.page {
            PageState::Link(next) => ApiRequest::get(next.clone()),
            PageState::Token(token) => {
                body["token"] = json!(token);
                ApiRequest::post_json(self.search_url.clone(), body)
            }
            PageState::Number(_) => ApiRequest::post_json(self.search_url.clone(), body),
        };
        Ok(request.header("Authorization", format!("Bearer {}", session.token())))
    }

    fn parse_page(&self, body: &Value, _query: &CatalogQuery) -> Result<Page> {
        let (features, link) = stac_page(body)?;
        let next = link.and_then(|link| {
            if let Some(token) = link.pointer("/body/token").and_then(Value::as_str) {
                return Some(PageState::Token(token.to_string()));
            }
            link.get("href")
                .and_then(Value::as_str)
                .and_then(|href| Url::parse(href).ok())
                .map(PageState::Link)
        });
        Ok(Page { features, next })
    }

    fn field_map(&self) -> &FieldMap {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{ok_json, StubTransport};
    use crate::http::{Body, Method};
    use crate::normalize::normalize;
    use crate::provider::tests::{area, client, query, unit};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn umbra() -> Umbra {
        Umbra::new(&ProviderOptions::default()).unwrap()
    }

    fn item(id: &str) -> Value {
        json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": id,
            "geometry": {"type": "Point", "coordinates": [139.6, 35.6]},
            "bbox": [139.6, 35.6, 139.6, 35.6],
            "properties": {
                "datetime": "2024-05-04T20:15:00Z",
                "created": "2024-05-05T02:45:00Z",
                "platform": "UMBRA_08",
                "sar:instrument_mode": "SPOTLIGHT",
                "sar:resolution_range": 0.5,
                "view:incidence_angle": 41.987
            },
            "links": [],
            "assets": {}
        })
    }

    #[test]
    fn test_search_body() {
        let (area, unit) = (area(), unit());
        let request = umbra()
            .search_request(&Session::new("ub"), &query(&area, &unit))
            .unwrap();
        assert_eq!(request.method, Method::Post);
        assert!(request
            .headers
            .contains(&("Authorization".into(), "Bearer ub".into())));
        let Body::Json(body) = &request.body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["bbox"].as_array().unwrap().len(), 4);
        assert_eq!(body["datetime"], "2024-05-04T00:00:00Z/2024-05-05T00:00:00Z");
        assert_eq!(body["limit"], 500);
        assert!(body.get("token").is_none());
    }

    #[tokio::test]
    async fn test_next_token_is_sent_back() {
        let first = json!({
            "type": "FeatureCollection",
            "features": [item("u1")],
            "links": [{
                "rel": "next",
                "href": "https://api.canopy.umbra.space/archive/search",
                "method": "POST",
                "body": {"token": "next:abc"}
            }]
        });
        let last = json!({"type": "FeatureCollection", "features": [item("u2")], "links": []});
        let transport = Arc::new(StubTransport::new(vec![ok_json(first), ok_json(last)]));
        let client = client(Box::new(umbra()), transport.clone(), 1);

        let outcome = client
            .search_all(&Session::new("ub"), &area(), &unit(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.features.len(), 2);

        let requests = transport.requests();
        let Body::Json(second) = &requests[1].body else {
            panic!("expected JSON body");
        };
        assert_eq!(second["token"], "next:abc");
    }

    #[test]
    fn test_field_map() {
        let (features, _) = stac_page(&json!({
            "type": "FeatureCollection",
            "features": [item("u1")],
            "links": []
        }))
        .unwrap();
        let record = normalize("umbra", &features[0], umbra().field_map());
        assert_eq!(record.sensor.as_deref(), Some("SPOTLIGHT"));
        assert_eq!(record.incidence_angle.as_deref(), Some("41.99"));
        assert_eq!(record.withhold.unwrap().readable, "0 days 6 hours");
    }
}
