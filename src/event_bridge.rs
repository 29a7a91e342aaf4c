use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const EVALUATING_THOUGHT: &str =
    "Evaluating whether this question needs tools or can be answered directly...";

/// What the agent runtime reports while a run progresses, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RunStarted { task: String },
    ReasoningStarted,
    Token(String),
    Decision {
        thought: String,
        action: String,
        input: String,
    },
    ActionStarted { name: String, input: String },
    ActionFinished { output: String },
    RunFinished { output: String },
    Fault { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseType {
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "tool-based")]
    ToolBased,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepNotification {
    pub thought: String,
    pub action: String,
    pub action_input: String,
    pub observation: String,
}

/// Observer-visible event, serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ObserverEvent {
    Step(StepNotification),
    Token {
        token: String,
    },
    Final {
        output: String,
        response_type: ResponseType,
    },
    Error {
        error: String,
        /// Set on frames refusing an inbound message. These never end a run.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        rejected: bool,
    },
}

impl ObserverEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            rejected: false,
        }
    }

    pub fn rejection(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            rejected: true,
        }
    }

    pub fn to_frame(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            serde_json::json!({ "type": "error", "data": { "error": err.to_string() } })
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { rejected: false, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    ModelThinking,
    ToolRunning,
    Finished,
}

/// Per-connection translator from lifecycle events to observer events.
///
/// Each input maps to at most one output. The `action_invoked` flag decides
/// both token suppression and the final `direct` / `tool-based`
/// classification, and is reset at every run boundary.
#[derive(Debug)]
pub struct EventBridge {
    phase: RunPhase,
    action_invoked: bool,
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            action_invoked: false,
        }
    }

    pub fn handle(&mut self, event: LifecycleEvent) -> Option<ObserverEvent> {
        if let LifecycleEvent::RunStarted { task } = &event {
            debug!("run started ({} chars of input)", task.chars().count());
            self.phase = RunPhase::ModelThinking;
            self.action_invoked = false;
            return Some(step(EVALUATING_THOUGHT, "Thinking", "", ""));
        }

        if matches!(self.phase, RunPhase::Idle | RunPhase::Finished) {
            debug!("dropping lifecycle event outside an active run: {event:?}");
            return None;
        }

        match event {
            LifecycleEvent::RunStarted { .. } => None,
            LifecycleEvent::ReasoningStarted => {
                self.phase = RunPhase::ModelThinking;
                None
            }
            LifecycleEvent::Token(token) => {
                if self.action_invoked {
                    None
                } else {
                    Some(ObserverEvent::Token { token })
                }
            }
            LifecycleEvent::Decision {
                thought,
                action,
                input,
            } => Some(step(&thought, &action, &input, "")),
            LifecycleEvent::ActionStarted { name, input } => {
                self.action_invoked = true;
                self.phase = RunPhase::ToolRunning;
                Some(step(
                    &format!("This task requires using a tool: {name}"),
                    "Starting tool",
                    &input,
                    "",
                ))
            }
            LifecycleEvent::ActionFinished { output } => {
                self.phase = RunPhase::ModelThinking;
                Some(step("Tool operation completed", "Tool output", "", &output))
            }
            LifecycleEvent::RunFinished { output } => {
                let response_type = if self.action_invoked {
                    ResponseType::ToolBased
                } else {
                    ResponseType::Direct
                };
                self.finish();
                Some(ObserverEvent::Final {
                    output,
                    response_type,
                })
            }
            LifecycleEvent::Fault { message } => {
                self.finish();
                Some(ObserverEvent::error(message))
            }
        }
    }

    fn finish(&mut self) {
        self.phase = RunPhase::Finished;
        self.action_invoked = false;
    }
}

fn step(thought: &str, action: &str, action_input: &str, observation: &str) -> ObserverEvent {
    ObserverEvent::Step(StepNotification {
        thought: thought.to_owned(),
        action: action.to_owned(),
        action_input: action_input.to_owned(),
        observation: observation.to_owned(),
    })
}
