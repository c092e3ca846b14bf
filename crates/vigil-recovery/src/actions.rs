use serde_json::Value;
use vigil_core::excerpt;

const COMMAND_EXCERPT_CHARS: usize = 80;

/// Renders one tool invocation as a single prose line for the
/// continuation brief. Display only, never parsed back.
pub fn describe_tool_action(name: &str, arguments: &Value) -> String {
    match name {
        "read" | "read_file" => match str_arg(arguments, "path") {
            Some(path) => format!("Read {path}"),
            None => "Read a file".to_string(),
        },
        "write" | "write_file" | "create_file" => match str_arg(arguments, "path") {
            Some(path) => format!("Wrote {path}"),
            None => "Wrote a file".to_string(),
        },
        "edit" | "edit_file" | "apply_patch" => match str_arg(arguments, "path") {
            Some(path) => format!("Edited {path}"),
            None => "Edited a file".to_string(),
        },
        "bash" | "shell" | "run_command" => match str_arg(arguments, "command") {
            Some(command) => format!("Ran `{}`", excerpt(command, COMMAND_EXCERPT_CHARS)),
            None => "Ran a shell command".to_string(),
        },
        "grep" | "search" => match str_arg(arguments, "pattern") {
            Some(pattern) => format!("Searched for \"{}\"", excerpt(pattern, COMMAND_EXCERPT_CHARS)),
            None => "Searched the workspace".to_string(),
        },
        "glob" | "list_files" => match str_arg(arguments, "pattern").or_else(|| str_arg(arguments, "path")) {
            Some(pattern) => format!("Listed files matching {pattern}"),
            None => "Listed files".to_string(),
        },
        "fetch" | "web_fetch" => match str_arg(arguments, "url") {
            Some(url) => format!("Fetched {url}"),
            None => "Fetched a URL".to_string(),
        },
        "update_todos" | "todo_write" => {
            let count = arguments
                .get("items")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            format!("Updated the task checklist ({count} items)")
        }
        "complete_task" | "report_completion" => {
            let status = str_arg(arguments, "status").unwrap_or("unknown");
            format!("Reported task completion ({status})")
        }
        other => format!("Invoked {other}"),
    }
}

/// Path touched by a mutating tool call, for modified-file tracking.
pub fn modified_path(name: &str, arguments: &Value) -> Option<String> {
    match name {
        "write" | "write_file" | "create_file" | "edit" | "edit_file" | "apply_patch" => {
            str_arg(arguments, "path").map(str::to_string)
        }
        _ => None,
    }
}

fn str_arg<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
