//! Generic JSON-over-HTTP collaborator.
//!
//! Routes, relative to the base URL:
//!
//! | Operation              | Request                                         |
//! |------------------------|-------------------------------------------------|
//! | list                   | `GET {kind}?limit=N&cursor=C`                   |
//! | create                 | `POST {kind}`                                   |
//! | bulk create            | `POST {kind}/bulk` with `{"items": [...]}`      |
//! | natural-key lookup     | `GET {kind}/lookup?key=K`                       |
//! | balance read / set     | `GET` / `POST {kind}/{id}/balance`              |
//! | balance adjust         | `POST {kind}/{id}/balance/adjust`               |
//! | payments               | `GET` / `POST orders/{id}/payments`             |
//! | order lines            | `GET orders/{id}/lines`                         |
//! | fulfillments           | `POST orders/{id}/fulfillments`                 |
//!
//! The transport itself is an [`HttpClient`] supplied by the caller.

use crate::collaborator::{
    create_each, BalanceService, BalanceSnapshot, Lookup, OrderLedger, OrderLine, Page,
    RemoteSystem,
};
use crate::error::{EngineError, EngineResult};
use carryover_ledger::{EntityKind, SystemId};
use serde_json::{json, Value};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl Method {
    /// Upper-case method name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// A request built by [`HttpSystem`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: String,
    /// Headers beyond content negotiation.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
}

/// A response, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw body.
    pub body: String,
}

impl HttpResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes requests.
///
/// Implementations return `Ok` for any response the server sent, error
/// statuses included, and `Err` only when no response arrived.
pub trait HttpClient: Send + Sync {
    /// Sends one request.
    fn execute(&self, request: &HttpRequest) -> EngineResult<HttpResponse>;
}

/// A [`RemoteSystem`] speaking JSON over HTTP.
#[derive(Debug)]
pub struct HttpSystem<C> {
    id: SystemId,
    base_url: String,
    client: C,
    token: Option<String>,
    bulk: bool,
    lookup: bool,
    balances: bool,
    orders: bool,
}

impl<C: HttpClient> HttpSystem<C> {
    /// Creates a collaborator rooted at `base_url`.
    ///
    /// Bulk create and lookup are on; balances and orders are off.
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, client: C) -> Self {
        Self {
            id: SystemId::new(id),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: None,
            bulk: true,
            lookup: true,
            balances: false,
            orders: false,
        }
    }

    /// Sends `Authorization: Bearer <token>` when a token is given.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Whether the server has a bulk endpoint.
    #[must_use]
    pub fn with_bulk(mut self, enabled: bool) -> Self {
        self.bulk = enabled;
        self
    }

    /// Whether the server has a lookup endpoint.
    #[must_use]
    pub fn with_lookup(mut self, enabled: bool) -> Self {
        self.lookup = enabled;
        self
    }

    /// Whether the server keeps balances.
    #[must_use]
    pub fn with_balances(mut self, enabled: bool) -> Self {
        self.balances = enabled;
        self
    }

    /// Whether the server keeps order payments and fulfillments.
    #[must_use]
    pub fn with_orders(mut self, enabled: bool) -> Self {
        self.orders = enabled;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> String {
        let mut url = format!("{}/{}", self.base_url, path);
        for (n, (name, value)) in query.iter().enumerate() {
            url.push(if n == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    fn send(&self, method: Method, url: String, body: Option<Value>) -> EngineResult<HttpResponse> {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        self.client.execute(&HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }

    /// Sends a request and parses a successful JSON body.
    fn call(&self, method: Method, url: String, body: Option<Value>) -> EngineResult<Value> {
        let what = format!("{} {}", method.as_str(), url);
        let response = self.send(method, url, body)?;
        if !response.is_success() {
            return Err(status_error(&what, &response));
        }
        parse_body(&what, &response.body)
    }
}

fn status_error(what: &str, response: &HttpResponse) -> EngineError {
    EngineError::transport(
        format!("{what} returned HTTP {}", response.status),
        Some(response.body.clone()).filter(|b| !b.is_empty()),
        response.status >= 500 || response.status == 429,
    )
}

fn parse_body(what: &str, body: &str) -> EngineResult<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| {
        EngineError::transport(format!("{what} returned invalid JSON: {err}"), Some(body.to_string()), false)
    })
}

/// Pulls an array out of `body`, bare or under one of `fields`.
fn array_in(body: Value, fields: &[&str]) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut object) => fields
            .iter()
            .find_map(|field| match object.remove(*field) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}

fn snapshot_from(what: &str, body: &Value) -> EngineResult<BalanceSnapshot> {
    let points = body
        .get("points")
        .or_else(|| body.get("balance"))
        .and_then(Value::as_i64);
    let revision = body
        .get("revision")
        .or_else(|| body.get("version"))
        .and_then(Value::as_u64);
    match (points, revision) {
        (Some(points), Some(revision)) => Ok(BalanceSnapshot { points, revision }),
        _ => Err(EngineError::Collaborator(format!(
            "{what} returned no points and revision"
        ))),
    }
}

impl<C: HttpClient> RemoteSystem for HttpSystem<C> {
    fn id(&self) -> &SystemId {
        &self.id
    }

    fn list(&self, kind: EntityKind, cursor: Option<&str>, limit: usize) -> EngineResult<Page> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let url = self.url(kind.collection(), &query);
        let body = self.call(Method::Get, url, None)?;

        let next_cursor = ["next_cursor", "next", "cursor"]
            .iter()
            .find_map(|field| body.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .filter(|c| !c.is_empty());
        let items = array_in(body, &["items", "data", "results", kind.collection()]).ok_or_else(|| {
            EngineError::Collaborator(format!("{} listing has no item array", kind.collection()))
        })?;
        Ok(Page { items, next_cursor })
    }

    fn create(&self, kind: EntityKind, payload: &Value) -> EngineResult<Value> {
        let url = self.url(kind.collection(), &[]);
        let what = format!("POST {url}");
        let response = self.send(Method::Post, url, Some(payload.clone()))?;
        if response.is_success() {
            return parse_body(&what, &response.body);
        }
        if response.status >= 500 || response.status == 429 {
            return Err(status_error(&what, &response));
        }
        // A 4xx is this payload's problem, reported in the result object.
        let detail = parse_body(&what, &response.body).unwrap_or(Value::String(response.body.clone()));
        Ok(match detail {
            Value::Object(mut object) => {
                object.insert("success".into(), Value::Bool(false));
                object
                    .entry("error")
                    .or_insert_with(|| Value::String(format!("HTTP {}", response.status)));
                Value::Object(object)
            }
            other => json!({ "success": false, "error": format!("HTTP {}: {}", response.status, other) }),
        })
    }

    fn bulk_create(&self, kind: EntityKind, payloads: &[Value]) -> EngineResult<Vec<Value>> {
        if !self.bulk {
            return Ok(create_each(self, kind, payloads));
        }
        let url = self.url(&format!("{}/bulk", kind.collection()), &[]);
        let body = self.call(Method::Post, url, Some(json!({ "items": payloads })))?;
        let raw = body.to_string();
        array_in(body, &["results", "items", "data"]).ok_or_else(|| {
            EngineError::transport("bulk create returned no result array", Some(raw), false)
        })
    }

    fn find_by_natural_key(&self, kind: EntityKind, key: &str) -> EngineResult<Lookup> {
        if !self.lookup {
            return Err(EngineError::Unsupported(format!(
                "{} has no lookup endpoint",
                self.id
            )));
        }
        let url = self.url(&format!("{}/lookup", kind.collection()), &[("key", key.to_string())]);
        let what = format!("GET {url}");
        let response = self.send(Method::Get, url, None)?;
        match response.status {
            404 => Ok(Lookup::NotFound),
            405 | 501 => Err(EngineError::Unsupported(format!("{what} is not implemented"))),
            _ if response.is_success() => match parse_body(&what, &response.body)? {
                Value::Null => Ok(Lookup::NotFound),
                entity => Ok(Lookup::Found(entity)),
            },
            _ => Err(status_error(&what, &response)),
        }
    }

    fn balances(&self) -> Option<&dyn BalanceService> {
        self.balances.then_some(self as &dyn BalanceService)
    }

    fn orders(&self) -> Option<&dyn OrderLedger> {
        self.orders.then_some(self as &dyn OrderLedger)
    }
}

impl<C: HttpClient> BalanceService for HttpSystem<C> {
    fn read_balance(&self, kind: EntityKind, entity_id: &str) -> EngineResult<BalanceSnapshot> {
        let url = self.url(&format!("{}/{}/balance", kind.collection(), urlencoding::encode(entity_id)), &[]);
        let what = format!("GET {url}");
        snapshot_from(&what, &self.call(Method::Get, url, None)?)
    }

    fn set_balance(
        &self,
        kind: EntityKind,
        entity_id: &str,
        points: i64,
        expected_revision: u64,
    ) -> EngineResult<BalanceSnapshot> {
        let url = self.url(&format!("{}/{}/balance", kind.collection(), urlencoding::encode(entity_id)), &[]);
        let what = format!("POST {url}");
        let body = json!({ "points": points, "expected_revision": expected_revision });
        let response = self.send(Method::Post, url, Some(body))?;
        match response.status {
            409 | 412 => Err(EngineError::ConcurrencyConflict {
                resource: format!("{kind}/{entity_id}"),
                expected: expected_revision,
            }),
            _ if response.is_success() => snapshot_from(&what, &parse_body(&what, &response.body)?),
            _ => Err(status_error(&what, &response)),
        }
    }

    fn adjust_balance(&self, kind: EntityKind, entity_id: &str, delta: i64) -> EngineResult<BalanceSnapshot> {
        let url = self.url(
            &format!("{}/{}/balance/adjust", kind.collection(), urlencoding::encode(entity_id)),
            &[],
        );
        let what = format!("POST {url}");
        snapshot_from(&what, &self.call(Method::Post, url, Some(json!({ "delta": delta })))?)
    }
}

impl<C: HttpClient> OrderLedger for HttpSystem<C> {
    fn list_payments(&self, order_id: &str) -> EngineResult<Vec<Value>> {
        let url = self.url(&format!("orders/{}/payments", urlencoding::encode(order_id)), &[]);
        let body = self.call(Method::Get, url, None)?;
        Ok(array_in(body, &["payments", "items", "data"]).unwrap_or_default())
    }

    fn create_payment(&self, order_id: &str, payment: &Value) -> EngineResult<Value> {
        let url = self.url(&format!("orders/{}/payments", urlencoding::encode(order_id)), &[]);
        self.call(Method::Post, url, Some(payment.clone()))
    }

    fn order_lines(&self, order_id: &str) -> EngineResult<Vec<OrderLine>> {
        let url = self.url(&format!("orders/{}/lines", urlencoding::encode(order_id)), &[]);
        let body = self.call(Method::Get, url, None)?;
        let lines = array_in(body, &["lines", "line_items", "items"]).unwrap_or_default();
        lines
            .into_iter()
            .map(|line| {
                serde_json::from_value(line)
                    .map_err(|err| EngineError::Collaborator(format!("invalid order line: {err}")))
            })
            .collect()
    }

    fn create_fulfillment(&self, order_id: &str, fulfillment: &Value) -> EngineResult<Value> {
        let url = self.url(&format!("orders/{}/fulfillments", urlencoding::encode(order_id)), &[]);
        self.call(Method::Post, url, Some(fulfillment.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned responses and records requests.
    #[derive(Default)]
    struct Canned {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl Canned {
        fn with(responses: Vec<(u16, &str)>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(status, body)| HttpResponse {
                            status,
                            body: body.to_string(),
                        })
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for Canned {
        fn execute(&self, request: &HttpRequest) -> EngineResult<HttpResponse> {
            self.requests.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| EngineError::transport("connection refused", None, true))
        }
    }

    fn system(responses: Vec<(u16, &str)>) -> HttpSystem<Canned> {
        HttpSystem::new("shop", "https://shop.test/api/", Canned::with(responses))
            .with_token(Some("secret".into()))
    }

    #[test]
    fn list_builds_query_and_reads_cursor() {
        let shop = system(vec![(200, r#"{"data": [{"id": 1}], "next_cursor": "abc"}"#)]);
        let page = shop.list(EntityKind::GiftCard, Some("a b&c"), 25).unwrap();

        assert_eq!(page.items, vec![json!({"id": 1})]);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        let requests = shop.client().requests.lock();
        assert_eq!(requests[0].url, "https://shop.test/api/gift_cards?limit=25&cursor=a%20b%26c");
        assert!(requests[0]
            .headers
            .contains(&("Authorization".to_string(), "Bearer secret".to_string())));
    }

    #[test]
    fn anonymous_requests_carry_no_authorization() {
        let shop = HttpSystem::new("shop", "https://shop.test", Canned::with(vec![(200, "[]")]))
            .with_token(None);
        shop.list(EntityKind::Brand, None, 10).unwrap();
        let requests = shop.client().requests.lock();
        assert!(requests[0].headers.iter().all(|(name, _)| name != "Authorization"));
    }

    #[test]
    fn bulk_failures_carry_the_raw_body() {
        let shop = system(vec![(503, "upstream down")]);
        let err = shop.bulk_create(EntityKind::Coupon, &[json!({"code": "A"})]).unwrap_err();
        assert!(matches!(err, EngineError::Transport { retryable: true, .. }));
        assert!(err.record_message().ends_with("upstream down"));

        let shop = system(vec![(200, r#"{"results": [{"id": "d-1"}]}"#)]);
        let results = shop.bulk_create(EntityKind::Coupon, &[json!({"code": "A"})]).unwrap();
        assert_eq!(results, vec![json!({"id": "d-1"})]);
        assert_eq!(
            shop.client().requests.lock()[0].body,
            Some(json!({"items": [{"code": "A"}]}))
        );
    }

    #[test]
    fn create_failures_without_bulk_keep_earlier_items() {
        let shop = system(vec![
            (201, r#"{"id": "d-1"}"#),
            (503, "upstream down"),
            (201, r#"{"id": "d-3"}"#),
        ])
        .with_bulk(false);
        let payloads = [json!({"code": "A"}), json!({"code": "B"}), json!({"code": "C"})];

        let results = shop.bulk_create(EntityKind::Coupon, &payloads).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], json!({"id": "d-1"}));
        assert_eq!(results[1]["success"], false);
        assert!(results[1]["error"].as_str().unwrap().ends_with("upstream down"));
        assert_eq!(results[2], json!({"id": "d-3"}));

        let interpreted = crate::chunker::interpret_results(&results, 3);
        assert_eq!(interpreted[0], crate::chunker::ItemResult::Created("d-1".into()));
        assert!(matches!(interpreted[1], crate::chunker::ItemResult::Failed(_)));
        assert_eq!(interpreted[2], crate::chunker::ItemResult::Created("d-3".into()));
        assert_eq!(shop.client().requests.lock().len(), 3);
    }

    #[test]
    fn lookup_keys_are_percent_encoded() {
        let shop = system(vec![(404, "")]);
        shop.find_by_natural_key(EntityKind::Coupon, "café 10%").unwrap();
        assert_eq!(
            shop.client().requests.lock()[0].url,
            "https://shop.test/api/coupons/lookup?key=caf%C3%A9%2010%25"
        );
    }

    #[test]
    fn client_errors_become_item_failures() {
        let shop = system(vec![(422, r#"{"error": "code taken"}"#), (400, "nope")]);
        assert_eq!(
            shop.create(EntityKind::Coupon, &json!({"code": "A"})).unwrap(),
            json!({"success": false, "error": "code taken"})
        );
        assert_eq!(
            shop.create(EntityKind::Coupon, &json!({"code": "B"})).unwrap()["success"],
            false
        );
    }

    #[test]
    fn lookup_statuses() {
        let shop = system(vec![(404, ""), (200, r#"{"id": "d-1", "code": "SAVE10"}"#), (501, "")]);
        assert_eq!(shop.find_by_natural_key(EntityKind::Coupon, "x").unwrap(), Lookup::NotFound);
        assert!(matches!(
            shop.find_by_natural_key(EntityKind::Coupon, "save10").unwrap(),
            Lookup::Found(_)
        ));
        assert!(matches!(
            shop.find_by_natural_key(EntityKind::Coupon, "y"),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn balance_conflicts_map_to_concurrency_errors() {
        let shop = system(vec![
            (200, r#"{"points": 10, "revision": 4}"#),
            (409, r#"{"error": "stale"}"#),
        ])
        .with_balances(true);
        let balances = shop.balances().unwrap();

        let snapshot = balances.read_balance(EntityKind::LoyaltyAccount, "a 1").unwrap();
        assert_eq!(snapshot, BalanceSnapshot { points: 10, revision: 4 });
        assert!(matches!(
            balances.set_balance(EntityKind::LoyaltyAccount, "a 1", 20, 4),
            Err(EngineError::ConcurrencyConflict { expected: 4, .. })
        ));
        assert_eq!(
            shop.client().requests.lock()[0].url,
            "https://shop.test/api/loyalty_accounts/a%201/balance"
        );
        assert!(system(Vec::new()).orders().is_none());
    }
}
