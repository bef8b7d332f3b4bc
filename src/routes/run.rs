use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::create_timestamp;
use crate::sandbox::{ExecutionRequest, RunOutcome};
use crate::worker::{RunHandle, SubmitError};

#[derive(Deserialize, Debug)]
pub struct RunSubmission {
    pub source: String,
    #[serde(default)]
    pub stdin: String,
}

#[derive(Serialize, Debug)]
pub struct RunResponse {
    pub outcome: RunOutcome,
    pub verdict: &'static str,
    pub message: String,
    pub finished_time: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AbortResponse {
    pub aborted: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub busy: bool,
}

#[post("/run")]
pub async fn post_run_handler(
    runner: web::Data<RunHandle>,
    body: web::Json<RunSubmission>,
) -> impl Responder {
    let RunSubmission { source, stdin } = body.into_inner();

    match runner.run(ExecutionRequest::new(source, stdin)).await {
        Ok(outcome) => {
            log::debug!("Run answered with {}", outcome.label());
            HttpResponse::Ok().json(RunResponse {
                verdict: outcome.label(),
                message: outcome.to_string(),
                finished_time: create_timestamp(),
                outcome,
            })
        }
        Err(SubmitError::Busy) => HttpResponse::Conflict().json(ErrorResponseWithMessage {
            reason: "ERR_RATE_LIMIT",
            code: 4,
            message: SubmitError::Busy.to_string(),
        }),
        Err(e) => {
            log::error!("Failed to submit run: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            })
        }
    }
}

#[post("/run/abort")]
pub async fn abort_run_handler(runner: web::Data<RunHandle>) -> impl Responder {
    HttpResponse::Ok().json(AbortResponse {
        aborted: runner.abort(),
    })
}

#[get("/run/status")]
pub async fn get_status_handler(runner: web::Data<RunHandle>) -> impl Responder {
    HttpResponse::Ok().json(StatusResponse {
        busy: runner.is_busy(),
    })
}
