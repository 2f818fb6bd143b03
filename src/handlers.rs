//! HTTP handlers for the submission form, results and captcha image.

use askama::Template;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::abuse::{self, AbuseConfig};
use crate::session::{self, Session};
use crate::settings::EventPhase;
use crate::state::{AppState, SubmissionOutcome, MAX_SUBMISSION_CHARS};
use crate::tally::TallyRow;

/// Form field carrying one theme suggestion (repeated)
const SUBMISSION_FIELD: &str = "submission[]";
const SUBMISSION_FIELD_PLAIN: &str = "submission";
const CAPTCHA_FIELD: &str = "captcha";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

/// Build the application router
pub fn router(state: Arc<AppState>, abuse_config: Arc<AbuseConfig>, static_dir: &Path) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/results", get(results))
        .route("/captcha", get(captcha_image))
        .route("/api/results", get(api_results))
        .layer(middleware::from_fn_with_state(
            abuse_config,
            abuse::submission_rate_limit,
        ))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate<'a> {
    title: &'a str,
    text: &'a str,
    use_header: bool,
    use_captcha: bool,
    slots: Vec<usize>,
    max_chars: usize,
    is_started: bool,
    is_ended: bool,
    start_date: String,
    end_date: String,
    is_submission: bool,
    captcha_failed: bool,
    submission_count: usize,
    rejected_closed: bool,
    invalid_reason: String,
}

impl<'a> IndexTemplate<'a> {
    fn new(state: &'a AppState, phase: EventPhase) -> Self {
        let settings = &state.settings;
        Self {
            title: &settings.title,
            text: &settings.text,
            use_header: settings.use_header,
            use_captcha: settings.use_captcha,
            slots: (1..=settings.entries).collect(),
            max_chars: MAX_SUBMISSION_CHARS,
            is_started: phase.is_started(),
            is_ended: phase.is_ended(),
            start_date: settings.start_date.format(DATE_FORMAT).to_string(),
            end_date: settings.end_date.format(DATE_FORMAT).to_string(),
            is_submission: false,
            captcha_failed: false,
            submission_count: 0,
            rejected_closed: false,
            invalid_reason: String::new(),
        }
    }
}

#[derive(Template)]
#[template(path = "results.html")]
struct ResultsTemplate<'a> {
    title: &'a str,
    text: &'a str,
    use_header: bool,
    rows: Vec<TallyRow>,
    total: u64,
}

/// JSON body of `GET /api/results`
#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub title: String,
    pub total: u64,
    pub entries: Vec<TallyRow>,
}

fn render<T: Template>(template: &T, status: StatusCode) -> Response {
    match template.render() {
        Ok(body) => (status, Html(body)).into_response(),
        Err(e) => {
            tracing::error!("Failed to render template: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

fn with_session_cookie(mut response: Response, token: Option<&str>) -> Response {
    if let Some(token) = token {
        response
            .headers_mut()
            .insert(header::SET_COOKIE, session::set_cookie(token));
    }
    response
}

/// Rotate the caller's session and issue a fresh challenge for the next form.
///
/// Returns the new token, or None when captcha is off, the event is not open,
/// or generation failed.
async fn prepare_challenge(state: &AppState, session: &Session, phase: EventPhase) -> Option<String> {
    if !state.settings.use_captcha || !phase.is_open() {
        return None;
    }
    match state.issue_challenge(session).await {
        Ok(issued) => Some(issued.token),
        Err(e) => {
            tracing::error!("Failed to issue captcha: {}", e);
            None
        }
    }
}

/// GET / - render the submission form
pub async fn index(State(state): State<Arc<AppState>>, session: Session) -> Response {
    let phase = state.phase();
    let token = prepare_challenge(&state, &session, phase).await;

    let page = IndexTemplate::new(&state, phase);
    with_session_cookie(render(&page, StatusCode::OK), token.as_deref())
}

/// Split posted form pairs into submissions and the captcha answer
fn collect_form(pairs: Vec<(String, String)>) -> (Vec<String>, Option<String>) {
    let mut submissions = Vec::new();
    let mut captcha = None;
    for (key, value) in pairs {
        match key.as_str() {
            SUBMISSION_FIELD | SUBMISSION_FIELD_PLAIN => submissions.push(value),
            // First answer wins if the field is repeated
            CAPTCHA_FIELD if captcha.is_none() => captcha = Some(value),
            _ => {}
        }
    }
    (submissions, captcha)
}

/// POST / - tally a batch of submissions
pub async fn submit(
    State(state): State<Arc<AppState>>,
    session: Session,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Response {
    let (submissions, captcha) = collect_form(pairs);
    let outcome = state
        .submit(&session, &submissions, captcha.as_deref())
        .await;

    let phase = state.phase();
    let mut page = IndexTemplate::new(&state, phase);
    let status = match outcome {
        SubmissionOutcome::Closed(_) => {
            page.rejected_closed = true;
            StatusCode::FORBIDDEN
        }
        SubmissionOutcome::Invalid(invalid) => {
            page.invalid_reason = invalid.message();
            StatusCode::BAD_REQUEST
        }
        SubmissionOutcome::CaptchaFailed => {
            page.is_submission = true;
            page.captcha_failed = true;
            StatusCode::OK
        }
        SubmissionOutcome::Accepted { count, durable } => {
            tracing::info!(count, durable, "Accepted submissions");
            page.is_submission = true;
            page.submission_count = count;
            StatusCode::OK
        }
    };

    let token = prepare_challenge(&state, &session, phase).await;
    with_session_cookie(render(&page, status), token.as_deref())
}

/// GET /results - render the aggregate tally
pub async fn results(State(state): State<Arc<AppState>>) -> Response {
    let rows = state.tally.sorted().await;
    let total = rows.iter().map(|r| r.count).sum();
    let settings = &state.settings;

    let page = ResultsTemplate {
        title: &settings.title,
        text: &settings.text,
        use_header: settings.use_header,
        rows,
        total,
    };
    render(&page, StatusCode::OK)
}

/// GET /api/results - the tally as JSON
pub async fn api_results(State(state): State<Arc<AppState>>) -> Json<ResultsResponse> {
    let entries = state.tally.sorted().await;
    Json(ResultsResponse {
        title: state.settings.title.clone(),
        total: entries.iter().map(|r| r.count).sum(),
        entries,
    })
}

fn png(bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        bytes,
    )
        .into_response()
}

/// GET /captcha - image of the caller's current challenge
///
/// Callers without a challenge (new visitor, or swept) get a fresh one under a
/// rotated session token.
pub async fn captcha_image(State(state): State<Arc<AppState>>, session: Session) -> Response {
    if !state.settings.use_captcha {
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(ref token) = session.token {
        if let Some(image) = state.captchas.image(token).await {
            return png(image);
        }
    }

    match state.issue_challenge(&session).await {
        Ok(issued) => with_session_cookie(png(issued.png), Some(&issued.token)),
        Err(e) => {
            tracing::error!("Failed to issue captcha: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate captcha").into_response()
        }
    }
}
