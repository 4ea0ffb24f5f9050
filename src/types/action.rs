//! Typed browser actions and their execution results.
//!
//! Actions are a tagged union: the decision oracle produces them, the
//! executor pattern-matches over them exhaustively. Every variant carries a
//! flattened [`ActionMeta`] envelope with the decision metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decision metadata shared by every action kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMeta {
    /// Oracle confidence in [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Position-independent hash of the target element, used for decision
    /// cache personalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_content_hash: Option<String>,
    /// Whether a failure of this action ends the step.
    #[serde(default = "default_true")]
    pub stop_execution_on_failure: bool,
}

fn default_confidence() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for ActionMeta {
    fn default() -> Self {
        Self {
            confidence: 1.0,
            reasoning: None,
            element_content_hash: None,
            stop_execution_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

/// One unit of browser interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Coordinates>,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    InputText {
        element_ref: String,
        text: String,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    SelectOption {
        element_ref: String,
        option: String,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    UploadFile {
        element_ref: String,
        /// Blob uri or parameter-resolved file reference.
        file_ref: String,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    DownloadFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    Wait {
        seconds: f64,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    Extract {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    Scroll {
        dx: f64,
        dy: f64,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    Screenshot {
        #[serde(flatten)]
        meta: ActionMeta,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extracted_data: Option<Value>,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    Terminate {
        reason: String,
        #[serde(flatten)]
        meta: ActionMeta,
    },
    NullAction {
        #[serde(flatten)]
        meta: ActionMeta,
    },
    SolveCaptcha {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_ref: Option<String>,
        #[serde(flatten)]
        meta: ActionMeta,
    },
}

/// Discriminant-only view of an action, used for cache eligibility and
/// artifact labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    InputText,
    SelectOption,
    UploadFile,
    DownloadFile,
    Wait,
    Extract,
    Scroll,
    Screenshot,
    Complete,
    Terminate,
    NullAction,
    SolveCaptcha,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::InputText => "input_text",
            Self::SelectOption => "select_option",
            Self::UploadFile => "upload_file",
            Self::DownloadFile => "download_file",
            Self::Wait => "wait",
            Self::Extract => "extract",
            Self::Scroll => "scroll",
            Self::Screenshot => "screenshot",
            Self::Complete => "complete",
            Self::Terminate => "terminate",
            Self::NullAction => "null_action",
            Self::SolveCaptcha => "solve_captcha",
        }
    }

    /// Kinds eligible for decision-cache replay.
    pub fn cacheable(&self) -> bool {
        matches!(
            self,
            Self::Click | Self::InputText | Self::Wait | Self::Complete | Self::SelectOption
        )
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::InputText { .. } => ActionKind::InputText,
            Self::SelectOption { .. } => ActionKind::SelectOption,
            Self::UploadFile { .. } => ActionKind::UploadFile,
            Self::DownloadFile { .. } => ActionKind::DownloadFile,
            Self::Wait { .. } => ActionKind::Wait,
            Self::Extract { .. } => ActionKind::Extract,
            Self::Scroll { .. } => ActionKind::Scroll,
            Self::Screenshot { .. } => ActionKind::Screenshot,
            Self::Complete { .. } => ActionKind::Complete,
            Self::Terminate { .. } => ActionKind::Terminate,
            Self::NullAction { .. } => ActionKind::NullAction,
            Self::SolveCaptcha { .. } => ActionKind::SolveCaptcha,
        }
    }

    pub fn meta(&self) -> &ActionMeta {
        match self {
            Self::Click { meta, .. }
            | Self::InputText { meta, .. }
            | Self::SelectOption { meta, .. }
            | Self::UploadFile { meta, .. }
            | Self::DownloadFile { meta, .. }
            | Self::Wait { meta, .. }
            | Self::Extract { meta, .. }
            | Self::Scroll { meta, .. }
            | Self::Screenshot { meta, .. }
            | Self::Complete { meta, .. }
            | Self::Terminate { meta, .. }
            | Self::NullAction { meta, .. }
            | Self::SolveCaptcha { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ActionMeta {
        match self {
            Self::Click { meta, .. }
            | Self::InputText { meta, .. }
            | Self::SelectOption { meta, .. }
            | Self::UploadFile { meta, .. }
            | Self::DownloadFile { meta, .. }
            | Self::Wait { meta, .. }
            | Self::Extract { meta, .. }
            | Self::Scroll { meta, .. }
            | Self::Screenshot { meta, .. }
            | Self::Complete { meta, .. }
            | Self::Terminate { meta, .. }
            | Self::NullAction { meta, .. }
            | Self::SolveCaptcha { meta, .. } => meta,
        }
    }

    /// The element reference this action resolves against, if any.
    pub fn element_ref(&self) -> Option<&str> {
        match self {
            Self::Click { element_ref, .. }
            | Self::DownloadFile { element_ref, .. }
            | Self::SolveCaptcha { element_ref, .. } => element_ref.as_deref(),
            Self::InputText { element_ref, .. }
            | Self::SelectOption { element_ref, .. }
            | Self::UploadFile { element_ref, .. } => Some(element_ref),
            _ => None,
        }
    }

    /// Rewrite the element reference after cache personalization.
    pub fn set_element_ref(&mut self, new_ref: String) {
        match self {
            Self::Click { element_ref, .. }
            | Self::DownloadFile { element_ref, .. }
            | Self::SolveCaptcha { element_ref, .. } => *element_ref = Some(new_ref),
            Self::InputText { element_ref, .. }
            | Self::SelectOption { element_ref, .. }
            | Self::UploadFile { element_ref, .. } => *element_ref = new_ref,
            _ => {}
        }
    }

    /// `complete` and `terminate` end the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Terminate { .. })
    }

    pub fn null(reasoning: Option<String>) -> Self {
        Self::NullAction {
            meta: ActionMeta {
                reasoning,
                stop_execution_on_failure: false,
                ..ActionMeta::default()
            },
        }
    }
}

/// Outcome of applying one action against a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Stable error code when the action failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_kind: Option<String>,
    pub stop_execution_on_failure: bool,
}

impl ActionResult {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            exception_kind: None,
            stop_execution_on_failure: false,
        }
    }

    pub fn failed(error: &crate::error::ExecutionError, stop: bool) -> Self {
        Self {
            success: false,
            data: None,
            exception_kind: Some(error.code().to_string()),
            stop_execution_on_failure: stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_tagged_json() {
        let action = Action::InputText {
            element_ref: "el_3".into(),
            text: "alice".into(),
            meta: ActionMeta::default(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "input_text");
        assert_eq!(json["element_ref"], "el_3");
        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn oracle_style_payload_parses_with_defaults() {
        let raw = serde_json::json!({
            "kind": "click",
            "element_ref": "el_9",
            "confidence": 0.8,
            "reasoning": "submit button"
        });
        let action: Action = serde_json::from_value(raw).unwrap();
        assert_eq!(action.kind(), ActionKind::Click);
        assert!(action.meta().stop_execution_on_failure);
        assert_eq!(action.element_ref(), Some("el_9"));
    }

    #[test]
    fn cacheable_kinds_are_the_closed_set() {
        assert!(ActionKind::Click.cacheable());
        assert!(ActionKind::InputText.cacheable());
        assert!(ActionKind::Complete.cacheable());
        assert!(!ActionKind::Extract.cacheable());
        assert!(!ActionKind::DownloadFile.cacheable());
        assert!(!ActionKind::SolveCaptcha.cacheable());
    }

    #[test]
    fn terminal_detection() {
        assert!(Action::Complete { extracted_data: None, meta: ActionMeta::default() }.is_terminal());
        assert!(!Action::null(None).is_terminal());
    }
}
