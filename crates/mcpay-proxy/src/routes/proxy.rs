use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use tracing::Instrument;

use crate::pipeline::context::{InboundRequest, ProxyResponse};
use crate::state::AppState;

/// Snapshot an actix request into the pipeline's transport-neutral form.
pub fn inbound_request(req: &HttpRequest, body: Bytes) -> InboundRequest {
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let query = Some(req.query_string())
        .filter(|q| !q.is_empty())
        .map(str::to_string);

    InboundRequest {
        method: req.method().as_str().to_ascii_uppercase(),
        path: req.path().to_string(),
        query,
        headers,
        body,
        client_ip: req.connection_info().realip_remote_addr().map(str::to_string),
    }
}

pub fn into_http_response(response: ProxyResponse) -> HttpResponse {
    let mut builder = HttpResponse::build(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    for (name, value) in &response.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.body(response.body)
}

/// ANY /proxy/{server_id}/{path...}
async fn proxy(req: HttpRequest, body: web::Bytes, state: web::Data<AppState>) -> HttpResponse {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "proxy",
        request_id = %request_id,
        method = %req.method(),
        path = %req.path()
    );
    let inbound = inbound_request(&req, body);

    let response = state
        .pipeline
        .clone()
        .handle_detached(inbound, request_id)
        .instrument(span)
        .await;
    into_http_response(response)
}

/// Configure the proxy routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/proxy/{server_id}").route(web::route().to(proxy)))
        .service(web::resource("/proxy/{server_id}/{path:.*}").route(web::route().to(proxy)));
}
