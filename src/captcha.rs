//! Session-scoped CAPTCHA challenges.
//!
//! Each caller's session token maps to at most one outstanding challenge.
//! Issuing a new one for a caller drops the old one, verifying consumes it,
//! and a background sweep clears everything on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use captcha::filters::{Noise, Wave};

pub const IMAGE_WIDTH: u32 = 250;
pub const IMAGE_HEIGHT: u32 = 100;
const ANSWER_CHARS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("failed to render captcha image")]
    Render,

    #[error("captcha generator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A rendered challenge and the text that solves it
#[derive(Clone)]
pub struct Challenge {
    pub answer: String,
    pub png: Vec<u8>,
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("png_bytes", &self.png.len())
            .finish_non_exhaustive()
    }
}

/// Something that can produce challenges
pub trait ChallengeGenerator: Send + Sync {
    fn generate(&self) -> Result<Challenge, CaptchaError>;
}

/// Renders distorted text images with the `captcha` crate
#[derive(Debug, Clone)]
pub struct ImageChallengeGenerator {
    pub width: u32,
    pub height: u32,
    pub chars: u32,
}

impl Default for ImageChallengeGenerator {
    fn default() -> Self {
        Self {
            width: IMAGE_WIDTH,
            height: IMAGE_HEIGHT,
            chars: ANSWER_CHARS,
        }
    }
}

impl ChallengeGenerator for ImageChallengeGenerator {
    fn generate(&self) -> Result<Challenge, CaptchaError> {
        let mut image = captcha::Captcha::new();
        image
            .add_chars(self.chars)
            .apply_filter(Noise::new(0.3))
            .apply_filter(Wave::new(2.0, 12.0).horizontal())
            .view(self.width, self.height);

        let answer = image.chars_as_string();
        let png = image.as_png().ok_or(CaptchaError::Render)?;
        Ok(Challenge { answer, png })
    }
}

/// Always produces the same answer. Used by tests and for local debugging.
#[derive(Debug, Clone)]
pub struct FixedChallengeGenerator {
    pub answer: String,
}

impl FixedChallengeGenerator {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

impl ChallengeGenerator for FixedChallengeGenerator {
    fn generate(&self) -> Result<Challenge, CaptchaError> {
        Ok(Challenge {
            answer: self.answer.clone(),
            png: format!("fixed:{}", self.answer).into_bytes(),
        })
    }
}

/// Outstanding challenges keyed by session token
#[derive(Clone)]
pub struct CaptchaStore {
    challenges: Arc<Mutex<HashMap<String, Challenge>>>,
    generator: Arc<dyn ChallengeGenerator>,
}

impl CaptchaStore {
    pub fn new(generator: Arc<dyn ChallengeGenerator>) -> Self {
        Self {
            challenges: Arc::new(Mutex::new(HashMap::new())),
            generator,
        }
    }

    /// Generate a challenge for `token`, dropping the one held by `previous`.
    ///
    /// Returns the PNG to show the caller.
    pub async fn issue(&self, previous: Option<&str>, token: &str) -> Result<Vec<u8>, CaptchaError> {
        // Rendering is CPU work, keep it off the async workers and out of the lock
        let generator = self.generator.clone();
        let challenge = tokio::task::spawn_blocking(move || generator.generate()).await??;
        let png = challenge.png.clone();

        let mut challenges = self.challenges.lock().await;
        if let Some(previous) = previous {
            challenges.remove(previous);
        }
        challenges.insert(token.to_string(), challenge);
        tracing::debug!(outstanding = challenges.len(), "Issued captcha challenge");

        Ok(png)
    }

    /// Image of the challenge currently held by `token`
    pub async fn image(&self, token: &str) -> Option<Vec<u8>> {
        self.challenges
            .lock()
            .await
            .get(token)
            .map(|c| c.png.clone())
    }

    /// Check `claimed` against the challenge held by `token`.
    ///
    /// Exact, case-sensitive match. The challenge is consumed either way.
    pub async fn verify(&self, token: &str, claimed: &str) -> bool {
        match self.challenges.lock().await.remove(token) {
            Some(challenge) => challenge.answer == claimed,
            None => false,
        }
    }

    /// Drop every outstanding challenge. Returns how many were cleared.
    pub async fn sweep(&self) -> usize {
        let mut challenges = self.challenges.lock().await;
        let cleared = challenges.len();
        challenges.clear();
        cleared
    }

    pub async fn outstanding(&self) -> usize {
        self.challenges.lock().await.len()
    }
}
