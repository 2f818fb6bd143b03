use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::captcha::{CaptchaError, CaptchaStore, ChallengeGenerator, ImageChallengeGenerator};
use crate::config::AppConfig;
use crate::error::StartupError;
use crate::session::Session;
use crate::settings::{EventPhase, Settings};
use crate::tally::EntryTally;

/// Longest accepted suggestion, in characters after trimming
pub const MAX_SUBMISSION_CHARS: usize = 200;

/// Why a batch was refused before any captcha check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidBatch {
    /// More values than the form has slots
    TooMany { limit: usize },
    /// A value longer than `MAX_SUBMISSION_CHARS`
    TooLong { limit: usize },
}

impl InvalidBatch {
    pub fn message(self) -> String {
        match self {
            InvalidBatch::TooMany { limit } => {
                format!("At most {} themes can be submitted at once.", limit)
            }
            InvalidBatch::TooLong { limit } => {
                format!("Themes can be at most {} characters long.", limit)
            }
        }
    }
}

/// Shared application state
pub struct AppState {
    /// Read-only for the life of the process
    pub settings: Settings,
    pub tally: EntryTally,
    pub captchas: CaptchaStore,
}

/// What happened to a submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The event window is not open; nothing was tallied
    Closed(EventPhase),
    /// The batch was malformed; nothing was tallied
    Invalid(InvalidBatch),
    /// Captcha answer was missing or wrong; nothing was tallied
    CaptchaFailed,
    /// `count` non-empty submissions were tallied. `durable` is false when
    /// they could not be written to disk.
    Accepted { count: usize, durable: bool },
}

/// A freshly issued challenge and the session token it belongs to
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub token: String,
    pub png: Vec<u8>,
}

impl AppState {
    pub fn new(settings: Settings, tally: EntryTally, generator: Arc<dyn ChallengeGenerator>) -> Self {
        Self {
            settings,
            tally,
            captchas: CaptchaStore::new(generator),
        }
    }

    /// Load settings and entries from the paths in `config`
    pub async fn load(config: &AppConfig) -> Result<Self, StartupError> {
        let settings = Settings::load_or_init(&config.settings_path, Utc::now()).await?;
        let tally = EntryTally::load(&config.entries_path).await;

        tracing::info!(
            title = %settings.title,
            captcha = settings.use_captcha,
            start = %settings.start_date,
            end = %settings.end_date,
            "Event settings loaded"
        );

        Ok(Self::new(
            settings,
            tally,
            Arc::new(ImageChallengeGenerator::default()),
        ))
    }

    pub fn phase(&self) -> EventPhase {
        self.phase_at(Utc::now())
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> EventPhase {
        self.settings.phase(now)
    }

    /// Rotate the caller's session token and issue a challenge under the new one
    pub async fn issue_challenge(&self, session: &Session) -> Result<IssuedChallenge, CaptchaError> {
        let (previous, token) = session.rotate();
        let png = self.captchas.issue(previous, &token).await?;
        Ok(IssuedChallenge { token, png })
    }

    /// Validate and tally a batch of submissions
    pub async fn submit(
        &self,
        session: &Session,
        submissions: &[String],
        captcha_answer: Option<&str>,
    ) -> SubmissionOutcome {
        self.submit_at(Utc::now(), session, submissions, captcha_answer)
            .await
    }

    pub async fn submit_at(
        &self,
        now: DateTime<Utc>,
        session: &Session,
        submissions: &[String],
        captcha_answer: Option<&str>,
    ) -> SubmissionOutcome {
        let phase = self.phase_at(now);
        if !phase.is_open() {
            tracing::info!(?phase, "Rejected submission outside the event window");
            return SubmissionOutcome::Closed(phase);
        }

        if let Err(invalid) = self.check_batch(submissions) {
            tracing::info!(
                ?invalid,
                values = submissions.len(),
                "Rejected malformed submission batch"
            );
            return SubmissionOutcome::Invalid(invalid);
        }

        if self.settings.use_captcha {
            let passed = match (session.token.as_deref(), captcha_answer) {
                (Some(token), Some(answer)) => self.captchas.verify(token, answer).await,
                _ => false,
            };
            if !passed {
                tracing::info!(
                    has_session = session.token.is_some(),
                    "Captcha failed, discarding {} submissions",
                    submissions.len()
                );
                return SubmissionOutcome::CaptchaFailed;
            }
        }

        match self.tally.record_batch(submissions).await {
            Ok(count) => SubmissionOutcome::Accepted {
                count,
                durable: true,
            },
            Err(e) => {
                // Counted in memory, the next successful flush will include it
                tracing::error!(
                    path = %self.tally.path().display(),
                    "Failed to persist entries: {}",
                    e
                );
                SubmissionOutcome::Accepted {
                    count: e.accepted(),
                    durable: false,
                }
            }
        }
    }

    fn check_batch(&self, submissions: &[String]) -> Result<(), InvalidBatch> {
        let limit = self.settings.entries;
        if submissions.len() > limit {
            return Err(InvalidBatch::TooMany { limit });
        }
        if submissions
            .iter()
            .any(|s| s.trim().chars().count() > MAX_SUBMISSION_CHARS)
        {
            return Err(InvalidBatch::TooLong {
                limit: MAX_SUBMISSION_CHARS,
            });
        }
        Ok(())
    }

    /// Final flush before exit
    pub async fn shutdown(&self) {
        match self.tally.flush().await {
            Ok(()) => tracing::info!("Entries flushed"),
            Err(e) => tracing::error!("Failed to flush entries on shutdown: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::FixedChallengeGenerator;
    use chrono::Duration;

    fn open_settings(use_captcha: bool) -> Settings {
        let now = Utc::now();
        Settings {
            use_captcha,
            start_date: now - Duration::days(1),
            end_date: now + Duration::days(1),
            ..Settings::defaults(now)
        }
    }

    fn test_state(settings: Settings, dir: &tempfile::TempDir) -> AppState {
        AppState::new(
            settings,
            EntryTally::new(dir.path().join("entries.json")),
            Arc::new(FixedChallengeGenerator::new("Zq7Kp")),
        )
    }

    fn batch(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_submit_without_captcha() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(false), &dir);

        let outcome = state
            .submit(
                &Session::default(),
                &batch(&["Pirates", "pirates ", "Robots", ""]),
                None,
            )
            .await;

        assert_eq!(
            outcome,
            SubmissionOutcome::Accepted {
                count: 3,
                durable: true
            }
        );
        assert_eq!(state.tally.count("pirates").await, 2);
        assert_eq!(state.tally.count("robots").await, 1);
    }

    #[tokio::test]
    async fn test_submit_with_correct_captcha() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(true), &dir);

        let issued = state.issue_challenge(&Session::default()).await.unwrap();
        let session = Session {
            token: Some(issued.token),
        };

        let outcome = state
            .submit(&session, &batch(&["Lava"]), Some("Zq7Kp"))
            .await;
        assert!(matches!(outcome, SubmissionOutcome::Accepted { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_wrong_captcha_discards_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(true), &dir);

        let issued = state.issue_challenge(&Session::default()).await.unwrap();
        let session = Session {
            token: Some(issued.token),
        };

        let outcome = state
            .submit(&session, &batch(&["Lava", "Ice"]), Some("zq7kp"))
            .await;
        assert_eq!(outcome, SubmissionOutcome::CaptchaFailed);
        assert!(state.tally.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_captcha_answer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(true), &dir);

        let issued = state.issue_challenge(&Session::default()).await.unwrap();
        let session = Session {
            token: Some(issued.token),
        };

        let outcome = state.submit(&session, &batch(&["Lava"]), None).await;
        assert_eq!(outcome, SubmissionOutcome::CaptchaFailed);

        let outcome = state
            .submit(&Session::default(), &batch(&["Lava"]), Some("Zq7Kp"))
            .await;
        assert_eq!(outcome, SubmissionOutcome::CaptchaFailed);
        assert!(state.tally.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_outside_window_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(false), &dir);
        let start = state.settings.start_date;
        let end = state.settings.end_date;

        let outcome = state
            .submit_at(
                start - Duration::seconds(1),
                &Session::default(),
                &batch(&["Early"]),
                None,
            )
            .await;
        assert_eq!(outcome, SubmissionOutcome::Closed(EventPhase::NotStarted));

        let outcome = state
            .submit_at(end, &Session::default(), &batch(&["Late"]), None)
            .await;
        assert_eq!(outcome, SubmissionOutcome::Closed(EventPhase::Ended));

        assert!(state.tally.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported_as_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(
            open_settings(false),
            EntryTally::new(dir.path().join("gone").join("entries.json")),
            Arc::new(FixedChallengeGenerator::new("x")),
        );

        let outcome = state
            .submit(&Session::default(), &batch(&["Lava"]), None)
            .await;
        assert_eq!(
            outcome,
            SubmissionOutcome::Accepted {
                count: 1,
                durable: false
            }
        );
        assert_eq!(state.tally.count("lava").await, 1);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(false), &dir);

        let outcome = state
            .submit(&Session::default(), &batch(&["a", "b", "c", "d", "e"]), None)
            .await;
        assert_eq!(
            outcome,
            SubmissionOutcome::Invalid(InvalidBatch::TooMany { limit: 4 })
        );

        let long = "x".repeat(MAX_SUBMISSION_CHARS + 1);
        let outcome = state
            .submit(&Session::default(), &[long, "ok".to_string()], None)
            .await;
        assert_eq!(
            outcome,
            SubmissionOutcome::Invalid(InvalidBatch::TooLong {
                limit: MAX_SUBMISSION_CHARS
            })
        );
        assert!(state.tally.snapshot().await.is_empty());

        // Surrounding whitespace does not count toward the limit
        let padded = format!("  {}  ", "é".repeat(MAX_SUBMISSION_CHARS));
        let outcome = state.submit(&Session::default(), &[padded], None).await;
        assert!(matches!(outcome, SubmissionOutcome::Accepted { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_invalid_batch_keeps_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(open_settings(true), &dir);

        let issued = state.issue_challenge(&Session::default()).await.unwrap();
        let session = Session {
            token: Some(issued.token),
        };

        let outcome = state
            .submit(&session, &batch(&["a", "b", "c", "d", "e"]), Some("Zq7Kp"))
            .await;
        assert!(matches!(outcome, SubmissionOutcome::Invalid(_)));

        let outcome = state
            .submit(&session, &batch(&["a"]), Some("Zq7Kp"))
            .await;
        assert!(matches!(outcome, SubmissionOutcome::Accepted { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_unpersisted_counts() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let path = data_dir.join("entries.json");
        let state = AppState::new(
            open_settings(false),
            EntryTally::new(path.clone()),
            Arc::new(FixedChallengeGenerator::new("x")),
        );

        let outcome = state
            .submit(&Session::default(), &batch(&["Lava", "lava", "Ice"]), None)
            .await;
        assert!(matches!(outcome, SubmissionOutcome::Accepted { durable: false, .. }));
        assert!(!path.exists());

        std::fs::create_dir(&data_dir).unwrap();
        state.shutdown().await;

        let on_disk: std::collections::HashMap<String, u64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk["lava"], 2);
        assert_eq!(on_disk["ice"], 1);
    }

    #[tokio::test]
    async fn test_load_creates_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            settings_path: dir.path().join("settings.json"),
            entries_path: dir.path().join("entries.json"),
            ..AppConfig::default()
        };

        let state = AppState::load(&config).await.unwrap();
        assert!(config.settings_path.exists());
        assert_eq!(state.phase(), EventPhase::NotStarted);
        assert!(state.tally.snapshot().await.is_empty());
    }
}
