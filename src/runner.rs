/// Language runners: a closed set of supported interpreters and the
/// per-language command/environment they need.
///
/// The set is deliberately closed. An unsupported language is rejected at
/// run time with a `lang_unsupported:<lang>` reason rather than guessed
/// at; adding a language means adding a variant here and a binary to
/// `RuntimeSettings`.
use crate::config::RuntimeSettings;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Bash,
}

impl Language {
    /// Infer the language from the entry filename. Unknown extensions
    /// default to python, matching how submissions are overwhelmingly
    /// used; the explicit `lang` field on the job can still override.
    pub fn infer(entry: &str) -> Language {
        match entry.rsplit('.').next() {
            Some("py") => Language::Python,
            Some("js") => Language::Node,
            Some("sh") => Language::Bash,
            _ => Language::Python,
        }
    }

    /// Parse an explicit language name. `None` means unsupported.
    pub fn parse(name: &str) -> Option<Language> {
        match name {
            "python" => Some(Language::Python),
            "node" | "javascript" => Some(Language::Node),
            "bash" | "sh" => Some(Language::Bash),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Node => "node",
            Language::Bash => "bash",
        }
    }

    /// Resolve the runner argv for an entry file. The entry is passed as
    /// given (relative to the workspace); the spawner sets the working
    /// directory, and namespace wrapping re-anchors it when active.
    pub fn build_command(self, runtimes: &RuntimeSettings, entry: &str) -> Vec<String> {
        let bin = match self {
            Language::Python => &runtimes.python,
            Language::Node => &runtimes.node,
            Language::Bash => &runtimes.bash,
        };
        vec![bin.clone(), entry.to_string()]
    }

    /// Extra environment the interpreter needs inside the sandbox.
    pub fn env(self) -> Vec<(&'static str, &'static str)> {
        match self {
            // Unbuffered stdout so partial output survives a SIGKILL.
            Language::Python => vec![("PYTHONUNBUFFERED", "1")],
            Language::Node | Language::Bash => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_follows_extension() {
        assert_eq!(Language::infer("main.py"), Language::Python);
        assert_eq!(Language::infer("index.js"), Language::Node);
        assert_eq!(Language::infer("run.sh"), Language::Bash);
        assert_eq!(Language::infer("README"), Language::Python);
        assert_eq!(Language::infer("archive.tar.gz"), Language::Python);
    }

    #[test]
    fn explicit_names_parse_and_unknown_is_none() {
        assert_eq!(Language::parse("python"), Some(Language::Python));
        assert_eq!(Language::parse("javascript"), Some(Language::Node));
        assert_eq!(Language::parse("sh"), Some(Language::Bash));
        assert_eq!(Language::parse("cobol"), None);
    }

    #[test]
    fn command_uses_configured_binaries() {
        let runtimes = RuntimeSettings {
            python: "/opt/py/bin/python3".to_string(),
            ..RuntimeSettings::default()
        };
        let cmd = Language::Python.build_command(&runtimes, "main.py");
        assert_eq!(cmd, vec!["/opt/py/bin/python3", "main.py"]);
    }

    #[test]
    fn python_runs_unbuffered() {
        assert_eq!(Language::Python.env(), vec![("PYTHONUNBUFFERED", "1")]);
        assert!(Language::Bash.env().is_empty());
    }
}
