//! Challenge types shared by the router, the provider adapters, and the
//! manual solver pool.

pub mod autosolve;
pub mod manual;
pub mod providers;
pub mod router;

use serde::{Deserialize, Serialize};

use crate::tasks::TaskId;

/// Anti-bot challenge families the engine can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Geetest,
    Datadome,
    /// Third-party queue gateway in front of the store.
    Queue,
    /// Free-form question only a human can answer.
    Question,
}

impl ChallengeKind {
    /// Manual questions can never be machine-solved.
    pub fn requires_human(&self) -> bool {
        matches!(self, ChallengeKind::Question)
    }
}

/// A verification requirement blocking a task until answered.
#[derive(Debug, Clone)]
pub struct ChallengeRequest {
    /// Stable challenge id; answers and hand-offs correlate on this.
    pub id: String,
    /// Task that raised the challenge.
    pub task_id: TaskId,
    /// Originating context tag, matched against solver scopes.
    pub where_tag: String,
    pub kind: ChallengeKind,
    pub url: String,
    pub site_key: Option<String>,
    pub user_agent: Option<String>,
    /// Session cookies the solver context should carry.
    pub cookies: Vec<(String, String)>,
    /// Literal HTML to render instead of fetching `url` live.
    pub html: Option<String>,
}

impl ChallengeRequest {
    pub fn new(
        id: impl Into<String>,
        task_id: impl Into<TaskId>,
        where_tag: impl Into<String>,
        kind: ChallengeKind,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            where_tag: where_tag.into(),
            kind,
            url: url.into(),
            site_key: None,
            user_agent: None,
            cookies: Vec::new(),
            html: None,
        }
    }

    pub fn with_site_key(mut self, key: impl Into<String>) -> Self {
        self.site_key = Some(key.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn with_cookies(mut self, cookies: Vec<(String, String)>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }
}

/// Typed answer payload matching the originating kind's contract.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeAnswer {
    /// Captcha-style token.
    Token(String),
    /// Clearance cookies (datadome, queue gateways).
    Cookies(Vec<(String, String)>),
    /// Free-text answer to a manual question.
    Text(String),
    /// Provider-specific structured payload.
    Payload(serde_json::Value),
}

/// Result of waiting on a challenge. A canceled wait resolves to
/// `Abandoned` rather than an error; callers must distinguish the two.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeOutcome {
    Answered(ChallengeAnswer),
    Abandoned,
}

impl ChallengeOutcome {
    pub fn answer(self) -> Option<ChallengeAnswer> {
        match self {
            ChallengeOutcome::Answered(answer) => Some(answer),
            ChallengeOutcome::Abandoned => None,
        }
    }
}
