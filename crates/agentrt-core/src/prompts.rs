// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System-prompt assembly.
//!
//! Prompt templating proper (skill/subagent/knowledge-base injection) is an
//! external collaborator per this workspace's scope — the core only needs a
//! `system_prompt` string to seed a run. This module builds a minimal
//! default prompt from the run's [`PromptContext`] (project/git/CI context)
//! plus a fixed set of operating-mode instructions and tool-usage
//! guidelines; callers that want skill/knowledge injection build their own
//! string and pass it as the `custom` override.
use chrono::Local;
use std::path::Path;

use agentrt_config::AgentMode;

/// Optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count).  When prompt caching is enabled
    /// this content should be placed in a separate, uncached system block so
    /// the stable prefix remains cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of a project context file (AGENTS.md / similar).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    /// Used to build the stable (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    /// `None` when neither is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self.git_context.filter(|s| !s.trim().is_empty()).map(str::to_string);
        let ci = self.ci_context.filter(|s| !s.trim().is_empty()).map(str::to_string);
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - Verify changes (read back a file, run relevant tests) before reporting completion."
    }

    pub fn tool_usage() -> &'static str {
        "- Discovery workflow: `glob` to find files → `grep` to narrow → `read_file` with \
           specific ranges for context.\n\
         - Prefer `edit_file` over `write` for modifying existing files (preserves surrounding \
           context).\n\
         - Batch independent tool calls in parallel rather than issuing them one at a time."
    }

    pub fn code_quality() -> &'static str {
        "- Production-quality code following the surrounding file's existing conventions.\n\
         - Do not create new files unless the task requires them.\n\
         - Write tests for new functionality where the project has a test harness."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool call fails, try a different approach rather than repeating the same call.\n\
         - Never skip safety checks (git hooks, force-push, etc.) without explicit user permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n{}\n\n\
         ### Tool Usage Patterns\n{}\n\n\
         ### Code Quality\n{}\n\n\
         ### Error Handling\n{}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt for the given agent mode.
///
/// When `custom` is set it replaces the generated identity/mode/guidelines
/// text entirely; `ctx.append` (if any) is still honoured so callers can
/// layer project-specific instructions onto either path.
pub fn system_prompt(mode: AgentMode, custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = format!(
        "You are an AI coding agent driven by a ReAct-style execution loop: you call tools, \
         observe their results, and continue until the task is done or a guardrail stops you.\n\n\
         Operating Mode: `{mode}`\n\
         Current date and time: `{current_date_time}`\n\
         Current working directory: `{current_working_directory}`",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        current_working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string()),
    );

    let mode_instructions = match mode {
        AgentMode::Research => {
            "You are a research assistant. You may read files and search, but MUST NOT write, \
             modify, or delete anything. Focus on gathering the information needed to answer \
             the request."
        }
        AgentMode::Plan => {
            "You are a planning assistant. Analyse the request and produce a clear, structured \
             plan with numbered steps. You may read files to inform the plan, but MUST NOT \
             modify them."
        }
        AgentMode::Agent => {
            "You are a capable coding agent. You can read and write files and run shell commands. \
             Work systematically, verify your changes, and report your progress clearly."
        }
    };

    let project_section = ctx
        .project_root
        .map(|root| {
            format!(
                "\n\n## Project Context\nProject root directory: `{}`\n\
                 - Prefer absolute paths over relative paths in every tool call.",
                root.display()
            )
        })
        .unwrap_or_default();

    let git_section = ctx.git_context.map(|g| format!("\n\n{g}")).unwrap_or_default();
    let context_file_section = ctx
        .project_context_file
        .map(|content| format!("\n\n## Project Instructions\n\n{content}"))
        .unwrap_or_default();
    let ci_section = ctx.ci_context.map(|ci| format!("\n\n{ci}")).unwrap_or_default();
    let guidelines_section = build_guidelines_section();
    let append_section = ctx.append.map(|extra| format!("\n\n{extra}")).unwrap_or_default();

    format!(
        "{agent_identity}\n\n\
         {mode_instructions}{project_section}{git_section}{context_file_section}{ci_section}\n\n\
         {guidelines_section}{append_section}",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn custom_prompt_overrides_generation() {
        let prompt = system_prompt(AgentMode::Agent, Some("be terse"), PromptContext::default());
        assert_eq!(prompt, "be terse");
    }

    #[test]
    fn custom_prompt_still_honours_append() {
        let ctx = PromptContext { append: Some("extra rule"), ..Default::default() };
        let prompt = system_prompt(AgentMode::Agent, Some("be terse"), ctx);
        assert_eq!(prompt, "be terse\n\nextra rule");
    }

    #[test]
    fn default_prompt_includes_mode_and_project_root() {
        let root = p("/work/proj");
        let ctx = PromptContext { project_root: Some(&root), ..Default::default() };
        let prompt = system_prompt(AgentMode::Research, None, ctx);
        assert!(prompt.contains("Operating Mode: `research`"));
        assert!(prompt.contains("/work/proj"));
        assert!(prompt.contains("MUST NOT write"));
    }

    #[test]
    fn dynamic_block_combines_git_and_ci() {
        let ctx = PromptContext {
            git_context: Some("git: main@abc123"),
            ci_context: Some("ci: github-actions"),
            ..Default::default()
        };
        assert_eq!(ctx.dynamic_block().unwrap(), "git: main@abc123\n\nci: github-actions");
    }

    #[test]
    fn dynamic_block_none_when_both_absent() {
        assert!(PromptContext::default().dynamic_block().is_none());
    }

    #[test]
    fn stable_only_clears_volatile_fields() {
        let ctx = PromptContext {
            git_context: Some("volatile"),
            ci_context: Some("volatile"),
            append: Some("stable append"),
            ..Default::default()
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert!(stable.ci_context.is_none());
        assert_eq!(stable.append, Some("stable append"));
    }
}
