// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod cache;
pub mod events;
pub mod executor;
pub mod parse;
pub mod policy;
pub mod registry;
pub mod tool;

pub use cache::{ToolResultCache, ToolResultCacheConfig};
pub use events::{TodoItem, ToolEvent};
pub use executor::{ExecError, ToolExecutorFacade};
pub use parse::{parse_tool_calls_from_text, render_tool_call, ParsedToolCall};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolKind, ToolOutput, ToolOutputPart};

pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::shell::ShellTool;
pub use builtin::todo_write::TodoWriteTool;
pub use builtin::write::WriteTool;
