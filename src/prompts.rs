use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Appended after every report window.
pub const WINDOW_TASK_PREAMBLE: &str = "\
Task: select locations in the city that are good candidates for placing a coffee vending \
machine inside a building. The text above is a fragment of a CSV table with one row per \
building: `id`, `type` (way or relation), `info` (building tags as JSON), `orgs_count` and \
`orgs` (one JSON object per organization located inside the building). The fragment may \
start or end in the middle of a row; ignore incomplete rows.

Analyse every building: the number of organizations inside, their profile, opening hours, \
and any other tag that hints at foot traffic. Most important: estimate foot traffic inside \
the building.

Answer ONLY with a JSON array. One object per promising building, with the fields:
  \"id\"             - the building id exactly as in the table (integer)
  \"type\"           - the building type exactly as in the table (\"way\" or \"relation\")
  \"name\"           - building name or address
  \"foot_traffic\"   - estimated foot traffic from 1 (low) to 10 (high)
  \"recommendation\" - where inside the building to place the machine and why
Leave out buildings that are not worth a machine.";

/// Appended after the combined corpus of matched report rows.
pub const SYNTHESIS_PROMPT: &str = "\
Task: select locations in the city for placing coffee vending machines inside buildings. \
Above is one JSON object per building that passed a first screening, with the building \
tags and the organizations inside it. Analyse all parameters and produce the final ranked \
list. For each building give: name (number of floors if known), full address, contact \
phone numbers (all you can find), the number of organizations inside and their list, an \
estimate of foot traffic inside the building and a placement recommendation. Write each \
item on a new line and separate buildings with a blank line. Justify the ranking.";

/// Reads a prompt override from `path`, falling back to `default`.
pub fn load_prompt(path: Option<&Path>, default: &str) -> Result<String> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read prompt file: {}", path.display()))?;
            Ok(text.trim().to_string())
        }
        None => Ok(default.to_string()),
    }
}

/// Window or corpus text followed by the task.
pub fn compose_prompt(content: &str, task: &str) -> String {
    format!("{content}\n{task}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_prompt_puts_task_after_content() {
        assert_eq!(compose_prompt("id,type\n1,way", "Task"), "id,type\n1,way\nTask");
    }

    #[test]
    fn load_prompt_prefers_override_file() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = dir.path().join("preamble.txt");
        fs::write(&path, "  custom task\n").expect("write prompt");

        assert_eq!(
            load_prompt(Some(&path), WINDOW_TASK_PREAMBLE).expect("override loads"),
            "custom task"
        );
        assert_eq!(
            load_prompt(None, SYNTHESIS_PROMPT).expect("default used"),
            SYNTHESIS_PROMPT
        );
    }
}
