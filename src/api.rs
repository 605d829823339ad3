use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::events::{NatsEventPublisher, PublishError};
use crate::model::{OrderTicket, SubmissionReceipt};
use crate::subjects;
use crate::toggles::{Applied, BotStatus, RailMode, ToggleCoordinator};
use crate::trade_gate::{GateRejection, SubmitError, TradeGate};

pub struct ApiState {
    pub coordinator: Arc<ToggleCoordinator>,
    pub gate: Arc<TradeGate>,
    pub publisher: Arc<NatsEventPublisher>,
    pub nats: async_nats::Client,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: "0.1.0".to_string(),
    })
}

pub async fn get_risk_status(data: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "risk_mode": data.coordinator.get_risk_status(),
        "safe_mode": data.coordinator.is_in_safe_mode(),
    }))
}

pub async fn get_toggles(data: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(data.coordinator.snapshot())
}

#[derive(Deserialize)]
pub struct BotToggleBody {
    pub status: BotStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn set_bot_toggle(
    data: web::Data<ApiState>,
    path: web::Path<String>,
    body: web::Json<BotToggleBody>,
) -> impl Responder {
    let bot_id = path.into_inner();
    match data
        .coordinator
        .set_bot_status(&bot_id, body.status, body.reason.as_deref())
    {
        Ok(applied) => applied_response(&data, applied).await,
        Err(denial) => HttpResponse::Conflict().json(json!({ "error": denial.to_string() })),
    }
}

#[derive(Deserialize)]
pub struct RailToggleBody {
    pub mode: RailMode,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn set_rail_toggle(
    data: web::Data<ApiState>,
    path: web::Path<String>,
    body: web::Json<RailToggleBody>,
) -> impl Responder {
    let rail_id = path.into_inner();
    match data
        .coordinator
        .set_rail_mode(&rail_id, body.mode, body.reason.as_deref())
    {
        Ok(applied) => applied_response(&data, applied).await,
        Err(denial) => HttpResponse::Conflict().json(json!({ "error": denial.to_string() })),
    }
}

#[derive(Deserialize, Default)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn clear_risk_mode(
    data: web::Data<ApiState>,
    body: web::Json<ReasonBody>,
) -> impl Responder {
    let reason = body.reason.as_deref().unwrap_or("operator clear");
    let applied = data.coordinator.clear_risk_mode(reason);
    applied_response(&data, applied).await
}

pub async fn reset_safe_defaults(
    data: web::Data<ApiState>,
    body: web::Json<ReasonBody>,
) -> impl Responder {
    let reason = body.reason.as_deref().unwrap_or("operator reset");
    let applied = data.coordinator.reset_to_safe_defaults(reason);
    applied_response(&data, applied).await
}

/// Gate an order ticket and, if it passes, publish the accepted order for
/// the downstream brokerage bridge. The publish runs inside the
/// idempotency guard, so a duplicate ticket returns the original receipt
/// without a second event.
pub async fn submit_order(
    data: web::Data<ApiState>,
    body: web::Json<OrderTicket>,
) -> impl Responder {
    let ticket = body.into_inner();
    let client = data.nats.clone();
    let outbound = ticket.clone();

    let result = data
        .gate
        .submit(&ticket, move || async move {
            let receipt = SubmissionReceipt {
                order_id: uuid::Uuid::new_v4().to_string(),
                symbol: outbound.symbol.clone(),
                side: outbound.side,
                quantity: outbound.quantity,
                accepted_at: Utc::now().timestamp_millis(),
            };
            let payload = serde_json::to_vec(&json!({
                "ticket": outbound,
                "receipt": receipt,
            }))?;
            client
                .publish(subjects::EVT_ORDER_ACCEPTED.to_string(), payload.into())
                .await?;
            Ok::<_, PublishError>(receipt)
        })
        .await;

    match result {
        Ok(receipt) => HttpResponse::Ok().json(receipt),
        Err(SubmitError::Rejected(rejection)) => {
            let mut response = match rejection {
                GateRejection::InvalidTicket { .. } => HttpResponse::BadRequest(),
                _ => HttpResponse::Conflict(),
            };
            response.json(json!({ "error": rejection.to_string() }))
        }
        Err(SubmitError::Submission(e)) => {
            error!("order event publish failed: {}", e);
            HttpResponse::BadGateway().json(json!({ "error": "event channel unavailable" }))
        }
    }
}

async fn applied_response(data: &web::Data<ApiState>, applied: Applied) -> HttpResponse {
    data.publisher.publish_all(&applied.events).await;
    HttpResponse::Ok().json(json!({
        "changed": applied.changed,
        "state": applied.snapshot,
    }))
}

// Route table
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/risk/status").route(web::get().to(get_risk_status)))
        .service(web::resource("/risk/clear").route(web::post().to(clear_risk_mode)))
        .service(web::resource("/risk/reset").route(web::post().to(reset_safe_defaults)))
        .service(web::resource("/toggles").route(web::get().to(get_toggles)))
        .service(web::resource("/toggles/bot/{bot_id}").route(web::post().to(set_bot_toggle)))
        .service(web::resource("/toggles/rail/{rail_id}").route(web::post().to(set_rail_toggle)))
        .service(web::resource("/orders").route(web::post().to(submit_order)));
}
