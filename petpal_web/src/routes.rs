use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use petpal::{EngineStatus, FEEDING_TIME_FORMAT};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use crate::AppState;
use crate::error::AppError;
use crate::page;

pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub async fn index(State(app): State<AppState>) -> Html<String> {
    Html(page::render_index(&app.engine.snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct FeedingTimeForm {
    #[serde(default)]
    pub feeding_time: Option<String>,
}

/// An empty or missing field leaves the schedule alone; anything else must
/// parse or the previous feeding time stays in effect.
pub async fn set_feeding_time(
    State(app): State<AppState>,
    Form(form): Form<FeedingTimeForm>,
) -> Result<Redirect, AppError> {
    let raw = form.feeding_time.as_deref().map(str::trim).unwrap_or("");
    if !raw.is_empty() {
        app.engine.set_feeding_time(raw)?;
    }
    Ok(Redirect::to("/"))
}

/// Starts a sequence and returns at once; the sequence finishes on its own.
pub async fn manual_trigger(State(app): State<AppState>) -> Result<Redirect, AppError> {
    let _sequence = app.engine.manual_trigger()?;
    tracing::info!("manual feed requested");
    Ok(Redirect::to("/"))
}

pub async fn reset(State(app): State<AppState>) -> Redirect {
    app.engine.reset();
    Redirect::to("/")
}

pub async fn video_feed(State(app): State<AppState>) -> Response {
    let Some(mut viewer) = app.engine.subscribe() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "stream closed").into_response();
    };
    tracing::info!(viewer = viewer.id(), "viewer connected");

    // Each part is `--frame`, a JPEG header and the JPEG bytes. The stream
    // ends when the hub closes; dropping it on disconnect deregisters the
    // viewer.
    let parts = async_stream::stream! {
        while let Some(packet) = viewer.next_frame().await {
            yield Ok::<Bytes, Infallible>(multipart_part(&packet.data));
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(parts))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut part = BytesMut::with_capacity(HEAD.len() + jpeg.len() + 2);
    part.extend_from_slice(HEAD);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Answers first, then releases the hardware; the server stops once the
/// engine reports it has stopped.
pub async fn shutdown(State(app): State<AppState>) -> Html<&'static str> {
    tracing::info!("shutdown requested");
    let engine = app.engine.clone();
    tokio::spawn(async move { engine.shutdown().await });
    Html(page::render_shutdown())
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub feeding_time: String,
    pub last_reset_date: String,
    pub activated_today: bool,
    pub controller: &'static str,
    pub viewers: usize,
    pub log: Vec<String>,
    pub pump: PumpBody,
}

#[derive(Debug, Serialize)]
pub struct PumpBody {
    pub frames: u64,
    pub capture_failures: u64,
    pub detector_failures: u64,
    pub scheduled_actuations: u64,
    pub deadline_misses: u64,
}

impl From<EngineStatus> for StatusBody {
    fn from(status: EngineStatus) -> Self {
        Self {
            feeding_time: status
                .schedule
                .feeding_time
                .format(FEEDING_TIME_FORMAT)
                .to_string(),
            last_reset_date: status.schedule.last_reset_date.to_string(),
            activated_today: status.schedule.activated_today,
            controller: status.controller.as_str(),
            viewers: status.viewers,
            log: status.schedule.log.iter().map(ToString::to_string).collect(),
            pump: PumpBody {
                frames: status.pump.frames,
                capture_failures: status.pump.capture_failures,
                detector_failures: status.pump.detector_failures,
                scheduled_actuations: status.pump.scheduled_actuations,
                deadline_misses: status.pump.deadline_misses,
            },
        }
    }
}

pub async fn status(State(app): State<AppState>) -> Json<StatusBody> {
    Json(app.engine.status().into())
}
