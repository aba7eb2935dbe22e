//! Voice-session lifecycle collaborator and the cook-mode handoff context.
//!
//! The lifecycle service persists dialogue history across visits to the
//! voice page; the handoff context carries recipe/step/elapsed state in and
//! out of the pipeline. All network calls here are best-effort: failures
//! are logged and the pipeline proceeds without history.

use crate::config::BackendConfig;
use crate::dialogue::SavedTurn;
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One recipe step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeStep {
    /// 1-based display number.
    pub no: u32,
    /// Step description.
    pub desc: String,
}

/// The recipe being cooked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    /// Description of the step at `index`, if present.
    pub fn step_desc(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(|s| s.desc.as_str())
    }

    /// Neighbour-step summary for the generation request, e.g.
    /// `인접 단계: 1. 물을 끓인다 / 3. 면을 넣는다`.
    pub fn neighbour_context(&self, index: usize) -> String {
        let mut parts = Vec::new();
        for i in [index.wrapping_sub(1), index + 1] {
            if let Some(step) = self.steps.get(i) {
                parts.push(format!("{}. {}", step.no, step.desc.trim()));
            }
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("인접 단계: {}", parts.join(" / "))
        }
    }
}

/// Session context handed to the pipeline at start and written back at
/// step transitions and termination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CookHandoff {
    pub recipe: Recipe,
    /// Zero-based active step index.
    pub current_step_index: usize,
    /// Accumulated cooking time in seconds.
    pub elapsed_secs: u64,
    /// Voice-history session id from a previous visit, if any.
    pub voice_session_id: Option<String>,
    /// Set when the backend signalled the end of cooking.
    pub cooking_finished: bool,
}

impl CookHandoff {
    /// Read the handoff context from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Persist the handoff context to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// One restored history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

/// HTTP client for the voice-session lifecycle service.
#[derive(Debug, Clone)]
pub struct SessionClient {
    client: reqwest::Client,
    base_url: String,
}

impl SessionClient {
    /// Create a client for the configured backend.
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Create a new voice session, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::LifecycleSync`]; callers treat this as
    /// non-fatal.
    pub async fn create_session(&self, member_id: i64) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/voice/session", self.base_url))
            .json(&serde_json::json!({ "member_id": member_id }))
            .send()
            .await
            .map_err(|e| VoiceError::LifecycleSync(format!("create session: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::LifecycleSync(format!(
                "create session: HTTP {}",
                response.status()
            )));
        }

        let created: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::LifecycleSync(format!("create session: {e}")))?;
        Ok(created.session_id)
    }

    /// Fetch the ordered history of a prior session.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::LifecycleSync`]; callers treat this as
    /// non-fatal.
    pub async fn fetch_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let response = self
            .client
            .get(format!("{}/api/voice/history/{session_id}", self.base_url))
            .send()
            .await
            .map_err(|e| VoiceError::LifecycleSync(format!("fetch history: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::LifecycleSync(format!(
                "fetch history: HTTP {}",
                response.status()
            )));
        }

        let history: HistoryResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::LifecycleSync(format!("fetch history: {e}")))?;
        Ok(history.messages)
    }

    /// Append the session's turns to persistent history. Idempotent on the
    /// backend; skipped when there is nothing to save.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::LifecycleSync`]; callers treat this as
    /// non-fatal.
    pub async fn save_history(
        &self,
        member_id: i64,
        session_id: &str,
        messages: &[SavedTurn],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/api/voice/save-history", self.base_url))
            .json(&serde_json::json!({
                "member_id": member_id,
                "session_id": session_id,
                "messages": messages,
            }))
            .send()
            .await
            .map_err(|e| VoiceError::LifecycleSync(format!("save history: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::LifecycleSync(format!(
                "save history: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe() -> Recipe {
        Recipe {
            name: "김치찌개".into(),
            steps: vec![
                RecipeStep {
                    no: 1,
                    desc: "물을 끓인다".into(),
                },
                RecipeStep {
                    no: 2,
                    desc: "김치를 넣는다".into(),
                },
                RecipeStep {
                    no: 3,
                    desc: "두부를 넣는다".into(),
                },
            ],
        }
    }

    #[test]
    fn neighbour_context_middle_step() {
        let ctx = recipe().neighbour_context(1);
        assert_eq!(ctx, "인접 단계: 1. 물을 끓인다 / 3. 두부를 넣는다");
    }

    #[test]
    fn neighbour_context_first_step_has_only_next() {
        let ctx = recipe().neighbour_context(0);
        assert_eq!(ctx, "인접 단계: 2. 김치를 넣는다");
    }

    #[test]
    fn neighbour_context_last_step_has_only_prev() {
        let ctx = recipe().neighbour_context(2);
        assert_eq!(ctx, "인접 단계: 2. 김치를 넣는다");
    }

    #[test]
    fn neighbour_context_empty_recipe() {
        let recipe = Recipe::default();
        assert_eq!(recipe.neighbour_context(0), "");
    }

    #[test]
    fn handoff_round_trip() {
        let dir = std::env::temp_dir().join("sous-test-handoff");
        let path = dir.join("cook_state.json");

        let mut handoff = CookHandoff {
            recipe: recipe(),
            current_step_index: 1,
            elapsed_secs: 125,
            voice_session_id: Some("vs-1".into()),
            cooking_finished: false,
        };
        assert!(handoff.save(&path).is_ok());

        handoff.cooking_finished = true;
        assert!(handoff.save(&path).is_ok());

        let loaded = match CookHandoff::load(&path) {
            Ok(h) => h,
            Err(_) => unreachable!("saved handoff loads"),
        };
        assert_eq!(loaded.current_step_index, 1);
        assert_eq!(loaded.elapsed_secs, 125);
        assert_eq!(loaded.voice_session_id.as_deref(), Some("vs-1"));
        assert!(loaded.cooking_finished);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn handoff_load_missing_file_errors() {
        assert!(CookHandoff::load(Path::new("/nonexistent/cook_state.json")).is_err());
    }
}
