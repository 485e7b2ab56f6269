//! Rule file handling for log translation.
//!
//! The rule file holds one rule per line: a regular expression and a template
//! separated by the first `#`. Lines without a `#` are ignored, and so are
//! lines whose pattern part is empty, which lets `#` start a comment.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

/// Rules written when no rule file exists yet.
pub const DEFAULT_RULES: &str = r"Player [a-zA-Z0-9_]+ joined#玩家 $0 加入游戏
Done \(\d+\.\d+s\)!#启动完成 (耗时 $0 秒)
Stopping server#正在停止服务器
Preparing spawn area: (\d+)%#生成出生点区域: $1%
";

/// An uncompiled rule as read from the rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRule {
    pub pattern: String,
    pub template: String,
}

/// Parses rule file contents, keeping file order.
pub fn parse_rules(text: &str) -> Vec<RawRule> {
    text.lines()
        .filter_map(|line| {
            let (pattern, template) = line.split_once('#')?;
            if pattern.is_empty() {
                return None;
            }
            Some(RawRule {
                pattern: pattern.to_string(),
                template: template.to_string(),
            })
        })
        .collect()
}

/// The on-disk rule file.
#[derive(Debug, Clone)]
pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seeds the default rules if the file is missing.
    ///
    /// Returns `true` when the file was created.
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.restore_default()?;
        Ok(true)
    }

    /// Overwrites the file with the default rules.
    pub fn restore_default(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, DEFAULT_RULES)
            .with_context(|| format!("failed to write rule file {}", self.path.display()))
    }

    pub fn read_raw(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read rule file {}", self.path.display()))
    }

    /// Reads and parses the whole file.
    pub fn load(&self) -> Result<Vec<RawRule>> {
        Ok(parse_rules(&self.read_raw()?))
    }

    /// Opens the file in an editor and blocks until the editor exits.
    ///
    /// `editor` may carry arguments (`"code --wait"`); it is split with shell rules.
    pub fn edit(&self, editor: &str) -> Result<()> {
        let mut parts = shell_words::split(editor)
            .with_context(|| format!("failed to parse editor command {:?}", editor))?;
        if parts.is_empty() {
            return Err(anyhow!("empty editor command"));
        }
        let program = parts.remove(0);
        let status = Command::new(&program)
            .args(parts)
            .arg(&self.path)
            .status()
            .with_context(|| format!("failed to launch editor {}", program))?;
        if !status.success() {
            return Err(anyhow!(
                "editor {} exited with code {}",
                program,
                status.code().unwrap_or(1)
            ));
        }
        Ok(())
    }
}

/// Editor used when none is configured.
pub fn default_editor() -> String {
    if let Some(editor) = std::env::var("EDITOR").ok().filter(|e| !e.trim().is_empty()) {
        return editor;
    }
    if cfg!(windows) {
        "notepad".to_string()
    } else {
        "nano".to_string()
    }
}
