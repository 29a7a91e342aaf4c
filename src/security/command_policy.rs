use std::fmt;

pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "mv", "cp", "pwd", "echo", "mkdir", "touch", "cat", "find", "basename", "dirname", "rm",
];

pub const DEFAULT_DENIED_PATTERNS: &[&str] = &[
    "rm -rf", "rmdir", "del", "format", ">", ">>", "|", "&", "sudo", ";", "`", "$(",
];

/// Commands whose non-flag arguments name files that must stay in the root.
pub const PATH_MUTATING_COMMANDS: &[&str] = &["mv", "cp", "rm", "touch"];

const REMOVE_COMMAND: &str = "rm";
const REMOVE_FORBIDDEN_FLAGS: &[&str] = &["-r", "-rf", "-fr", "-f", "--recursive"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Permitted,
    Empty,
    NotAllowlisted(String),
    DeniedPattern(String),
    RecursiveRemove,
}

impl CommandVerdict {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Permitted)
    }
}

impl fmt::Display for CommandVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permitted => write!(f, "permitted"),
            Self::Empty => write!(f, "command is empty"),
            Self::NotAllowlisted(command) => write!(f, "`{command}` is not an allowed command"),
            Self::DeniedPattern(pattern) => write!(f, "`{pattern}` is not permitted"),
            Self::RecursiveRemove => write!(f, "recursive or forced removal is not permitted"),
        }
    }
}

/// Textual allow/deny filter over raw shell command lines.
///
/// Not a shell grammar: metacharacters are rejected wholesale instead of being
/// parsed, so anything clever is denied rather than interpreted.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALLOWED_COMMANDS.iter().map(|value| (*value).to_owned()),
            DEFAULT_DENIED_PATTERNS.iter().map(|value| (*value).to_owned()),
        )
    }
}

impl CommandPolicy {
    pub fn new(
        allowed: impl IntoIterator<Item = String>,
        denied: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            allowed: normalize_entries(allowed),
            denied: normalize_entries(denied),
        }
    }

    pub fn is_permitted(&self, command_line: &str) -> bool {
        self.evaluate(command_line).is_permitted()
    }

    pub fn evaluate(&self, command_line: &str) -> CommandVerdict {
        let lowered = command_line.to_lowercase();
        let Some(leading) = leading_command(&lowered) else {
            return CommandVerdict::Empty;
        };

        if leading == REMOVE_COMMAND
            && REMOVE_FORBIDDEN_FLAGS
                .iter()
                .any(|flag| lowered.contains(flag))
        {
            return CommandVerdict::RecursiveRemove;
        }

        if !self.allowed.iter().any(|allowed| allowed == leading) {
            return CommandVerdict::NotAllowlisted(leading.to_owned());
        }

        if let Some(pattern) = self
            .denied
            .iter()
            .find(|pattern| lowered.contains(pattern.as_str()))
        {
            return CommandVerdict::DeniedPattern(pattern.clone());
        }

        CommandVerdict::Permitted
    }
}

pub fn leading_command(command_line: &str) -> Option<&str> {
    command_line.split_whitespace().next()
}

pub fn is_path_mutating(command: &str) -> bool {
    PATH_MUTATING_COMMANDS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(command))
}

fn normalize_entries(entries: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut normalized = Vec::new();
    for entry in entries {
        let value = entry.trim().to_lowercase();
        if !value.is_empty() && !normalized.contains(&value) {
            normalized.push(value);
        }
    }
    normalized
}
