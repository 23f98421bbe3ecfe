use actix_web::{web, HttpResponse};

use mcpay::amount::format_units;

use crate::db::ToolStats;
use crate::error::ProxyError;
use crate::state::AppState;

/// Pagination query parameters for analytics
#[derive(Debug, serde::Deserialize)]
pub struct AnalyticsPagination {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    100
}

/// Raw smallest-unit revenue rendered with the tool's token decimals.
fn human_revenue(stats: &ToolStats) -> String {
    format_units(&stats.revenue_total, stats.token_decimals)
        .unwrap_or_else(|_| stats.revenue_total.clone())
}

fn stats_json(stats: &ToolStats) -> serde_json::Value {
    serde_json::json!({
        "tool_id": stats.tool_id,
        "request_count": stats.request_count,
        "payment_count": stats.payment_count,
        "revenue_total": stats.revenue_total,
        "revenue": human_revenue(stats),
        "token_decimals": stats.token_decimals,
        "last_accessed_at": stats.last_accessed_at,
    })
}

/// GET /analytics/tools - per-tool stats (paginated)
pub async fn list_tool_analytics(
    query: web::Query<AnalyticsPagination>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let stats = state.db.list_tool_stats(query.limit.min(1000), query.offset)?;

    let total_payments: i64 = stats.iter().map(|s| s.payment_count).sum();
    let total_requests: i64 = stats.iter().map(|s| s.request_count).sum();
    let tools: Vec<serde_json::Value> = stats.iter().map(stats_json).collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "tools": tools,
        "total_requests": total_requests,
        "total_payments": total_payments,
    })))
}

/// GET /analytics/tools/{tool_id}
pub async fn get_tool_analytics(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let tool_id = path.into_inner();

    let stats = state
        .db
        .get_tool_stats(&tool_id)?
        .ok_or_else(|| ProxyError::ToolNotFound(tool_id.clone()))?;

    Ok(HttpResponse::Ok().json(stats_json(&stats)))
}

/// Configure analytics routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/analytics/tools").route(web::get().to(list_tool_analytics)))
        .service(
            web::resource("/analytics/tools/{tool_id}").route(web::get().to(get_tool_analytics)),
        );
}
