// ===============================
// src/api.rs (client HTTP API)
// ===============================
//
//   POST   /api/orders                             place
//   GET    /api/orders                             all, most-recent-first
//   GET    /api/orders/active                      PENDING + ACTIVE
//   GET    /api/orders/{id}
//   DELETE /api/orders/{id}                        cancel
//   GET    /api/portfolio
//   GET    /api/positions
//   GET    /api/trades
//   GET    /api/stocks                             latest quote per tracked symbol
//   GET    /api/stocks/{symbol}/{exchange}/price
//   GET    /health
//
// Errors are `{"error": kind, "message": text}` with the status from EngineError.
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::book::OrderBook;
use crate::domain::{Exchange, PositionKey};
use crate::error::EngineError;
use crate::feed::PriceBoard;
use crate::metrics::API_REQUESTS;
use crate::portfolio;
use crate::risk::OrderRequest;
use crate::store::{LedgerStore, OrderFilter};

const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct AppState {
    pub book: Arc<OrderBook>,
    pub store: Arc<dyn LedgerStore>,
    pub board: Arc<PriceBoard>,
}

fn respond(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn json_ok<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, body),
        Err(e) => {
            error!(?e, "response serialization failed");
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "StoreError", &e.to_string())
        }
    }
}

fn plain_error(status: StatusCode, kind: &str, message: &str) -> Response<Body> {
    let body = json!({ "error": kind, "message": message });
    respond(status, body.to_string().into_bytes())
}

fn engine_error(e: &EngineError) -> Response<Body> {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    plain_error(status, e.kind(), &e.to_string())
}

fn bad_request(message: &str) -> Response<Body> {
    plain_error(StatusCode::BAD_REQUEST, "ValidationError", message)
}

fn parse_id(raw: &str) -> Result<u64, Response<Body>> {
    raw.parse().map_err(|_| bad_request(&format!("invalid order id {raw:?}")))
}

/// `?symbol=TCS&exchange=BSE` narrows the listing to one instrument; exchange defaults to NSE.
fn instrument_filter(query: Option<&str>) -> Result<OrderFilter, Response<Body>> {
    let (mut symbol, mut exchange) = (None, Exchange::Nse);
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("symbol", v)) if !v.is_empty() => symbol = Some(v),
            Some(("exchange", v)) => {
                exchange = Exchange::parse(v).ok_or_else(|| bad_request(&format!("unknown exchange {v:?}")))?
            }
            _ => {}
        }
    }
    Ok(match symbol {
        Some(s) => OrderFilter::all().with_key(PositionKey::new(s, exchange)),
        None => OrderFilter::all(),
    })
}

/// Route label for metrics; ids and symbols are folded so label cardinality stays fixed.
fn route_label(method: &Method, segments: &[&str]) -> String {
    let path = match segments {
        ["api", "orders", id] if *id != "active" => "/api/orders/{id}".to_string(),
        ["api", "stocks", _, _, "price"] => "/api/stocks/{symbol}/{exchange}/price".to_string(),
        _ if segments.len() <= 3 => format!("/{}", segments.join("/")),
        _ => "other".to_string(),
    };
    format!("{method} {path}")
}

pub async fn handle(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let route = route_label(&method, &segments);

    let resp = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_ok(StatusCode::OK, &json!({ "status": "ok" })),

        (&Method::POST, ["api", "orders"]) => place(&state, req).await,
        (&Method::GET, ["api", "orders"]) => match instrument_filter(req.uri().query()) {
            Ok(filter) => json_ok(StatusCode::OK, &state.book.list(&filter)),
            Err(r) => r,
        },
        (&Method::GET, ["api", "orders", "active"]) => {
            json_ok(StatusCode::OK, &state.book.list(&OrderFilter::open()))
        }
        (&Method::GET, ["api", "orders", id]) => match parse_id(id) {
            Ok(id) => match state.book.get(id) {
                Ok(o) => json_ok(StatusCode::OK, &o),
                Err(e) => engine_error(&e),
            },
            Err(r) => r,
        },
        (&Method::DELETE, ["api", "orders", id]) => match parse_id(id) {
            Ok(id) => match state.book.cancel(id) {
                Ok(o) => json_ok(StatusCode::OK, &o),
                Err(e) => {
                    warn!(order_id = id, error = %e, "cancel refused");
                    engine_error(&e)
                }
            },
            Err(r) => r,
        },

        (&Method::GET, ["api", "portfolio"]) => {
            let view = portfolio::project(&state.store.snapshot(), |k| state.board.price(k));
            portfolio::publish_gauges(&view);
            json_ok(StatusCode::OK, &view)
        }
        (&Method::GET, ["api", "positions"]) => {
            let open: Vec<_> = state.store.snapshot().positions.into_iter().filter(|p| p.quantity != 0).collect();
            json_ok(StatusCode::OK, &open)
        }
        (&Method::GET, ["api", "trades"]) => json_ok(StatusCode::OK, &state.store.list_trades()),
        (&Method::GET, ["api", "stocks"]) => json_ok(StatusCode::OK, &state.board.all()),
        (&Method::GET, ["api", "stocks", symbol, exchange, "price"]) => match Exchange::parse(exchange) {
            None => bad_request(&format!("exchange must be NSE or BSE, got {exchange:?}")),
            Some(exch) => {
                let key = PositionKey::new(*symbol, exch);
                match state.board.latest(&key) {
                    Some(q) => json_ok(StatusCode::OK, &q),
                    None => plain_error(StatusCode::NOT_FOUND, "NotFoundError", &format!("no quote for {key}")),
                }
            }
        },

        (_, ["api", ..]) | (_, ["health"]) => {
            plain_error(StatusCode::NOT_FOUND, "NotFoundError", &format!("no route {method} {path}"))
        }
        _ => plain_error(StatusCode::NOT_FOUND, "NotFoundError", "not found"),
    };

    API_REQUESTS.with_label_values(&[&route, resp.status().as_str()]).inc();
    resp
}

async fn place(state: &AppState, req: Request<Body>) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return bad_request(&format!("unreadable body: {e}")),
    };
    if bytes.len() > MAX_BODY_BYTES {
        return bad_request("body too large");
    }
    let order_req: OrderRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => return bad_request(&format!("malformed order: {e}")),
    };
    match state.book.place(&order_req) {
        Ok(order) => json_ok(StatusCode::CREATED, &order),
        Err(e) => engine_error(&e),
    }
}

pub async fn serve(state: Arc<AppState>, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "api bind failed");
            return;
        }
    };
    info!("api listening on http://{addr}/api");
    if let Err(e) = server.await {
        error!(?e, "api server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::BracketEvaluator;
    use crate::config::Limits;
    use crate::domain::Tick;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use serde_json::Value;

    fn state(cash: rust_decimal::Decimal) -> (Arc<AppState>, Arc<BracketEvaluator>) {
        let store = Arc::new(MemoryStore::new(cash));
        let evaluator = Arc::new(BracketEvaluator::new(store.clone()));
        let book = Arc::new(OrderBook::new(store.clone(), evaluator.clone(), Limits::default()));
        let board = Arc::new(PriceBoard::new());
        (Arc::new(AppState { book, store, board }), evaluator)
    }

    async fn call(state: &Arc<AppState>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let resp = handle(state.clone(), req).await;
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn order_body() -> Value {
        json!({
            "symbol": "reliance", "exchange": "NSE", "orderType": "BUY", "quantity": 10,
            "limitPrice": 100, "takeProfitType": "PERCENTAGE", "takeProfitValue": 5,
            "stopLossType": "ABSOLUTE", "stopLossValue": 0
        })
    }

    #[tokio::test]
    async fn place_list_and_cancel() {
        let (st, _ev) = state(dec!(10_000));
        let (status, order) = call(&st, Method::POST, "/api/orders", Some(order_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["status"], "ACTIVE");
        assert_eq!(order["symbol"], "RELIANCE");
        assert_eq!(order["takeProfit"]["type"], "PERCENTAGE");
        assert!(order["stopLoss"].is_null());
        let id = order["id"].as_u64().unwrap();

        let (_, active) = call(&st, Method::GET, "/api/orders/active", None).await;
        assert_eq!(active.as_array().unwrap().len(), 1);

        let (status, cancelled) = call(&st, Method::DELETE, &format!("/api/orders/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "CANCELLED");

        let (status, err) = call(&st, Method::DELETE, &format!("/api/orders/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "InvalidStateError");

        let (_, all) = call(&st, Method::GET, "/api/orders", None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
        let (_, mine) = call(&st, Method::GET, "/api/orders?symbol=RELIANCE&exchange=NSE", None).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
        let (_, other) = call(&st, Method::GET, "/api/orders?symbol=RELIANCE&exchange=BSE", None).await;
        assert!(other.as_array().unwrap().is_empty());
        let (_, active) = call(&st, Method::GET, "/api/orders/active", None).await;
        assert!(active.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let (st, _ev) = state(dec!(500));
        let (status, err) = call(&st, Method::POST, "/api/orders", Some(order_body())).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "InsufficientFundsError");

        let mut bad = order_body();
        bad["quantity"] = json!(0);
        let (status, err) = call(&st, Method::POST, "/api/orders", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "ValidationError");

        let (status, _) = call(&st, Method::POST, "/api/orders", Some(json!({"symbol": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, err) = call(&st, Method::GET, "/api/orders/77", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "NotFoundError");

        let (status, _) = call(&st, Method::DELETE, "/api/orders/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn portfolio_trades_and_quotes() {
        let (st, ev) = state(dec!(10_000));
        call(&st, Method::POST, "/api/orders", Some(order_body())).await;
        let tick = Tick { ts_ns: 1, key: PositionKey::new("RELIANCE", Exchange::Nse), price: dec!(100), high: None, low: None };
        st.board.record(&tick);
        ev.on_tick(&tick);
        st.board.record(&Tick { ts_ns: 2, price: dec!(103), ..tick });

        let (_, pf) = call(&st, Method::GET, "/api/portfolio", None).await;
        assert_eq!(pf["availableCash"], "9000");
        assert_eq!(pf["unrealizedPnl"], "30");
        assert_eq!(pf["totalValue"], "10030");
        assert_eq!(pf["positions"][0]["currentPrice"], "103");

        let (_, trades) = call(&st, Method::GET, "/api/trades", None).await;
        assert_eq!(trades[0]["side"], "BUY");
        let (_, positions) = call(&st, Method::GET, "/api/positions", None).await;
        assert_eq!(positions[0]["quantity"], 10);

        let (status, q) = call(&st, Method::GET, "/api/stocks/reliance/nse/price", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(q["currentPrice"], "103");
        assert_eq!(q["change"], "3");
        let (status, _) = call(&st, Method::GET, "/api/stocks/TCS/NSE/price", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&st, Method::GET, "/api/stocks/TCS/NYSE/price", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (_, stocks) = call(&st, Method::GET, "/api/stocks", None).await;
        assert_eq!(stocks.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let (st, _ev) = state(dec!(1));
        assert_eq!(call(&st, Method::GET, "/health", None).await.0, StatusCode::OK);
        assert_eq!(call(&st, Method::GET, "/api/nope", None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&st, Method::PUT, "/api/orders", None).await.0, StatusCode::NOT_FOUND);
    }
}
