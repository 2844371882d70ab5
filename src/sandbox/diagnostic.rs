use std::sync::LazyLock;

use regex::Regex;

use super::SCRIPT_NAME;

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{}:(\d+)(?::\d+)?", regex::escape(SCRIPT_NAME))).unwrap()
});

/// Lines shown on each side of the failing line.
const CONTEXT_LINES: usize = 2;

/// Find the first stack frame that points into the user script and return its line.
pub fn line_from_stack(stack: &str) -> Option<usize> {
    FRAME_RE
        .captures_iter(stack)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .find(|line| *line > 0)
}

/// Render a failure as the operator sees it.
///
/// With a usable line: `Error at line N: <message>` and a window of source
/// around the line, the failing line marked with `>`. Otherwise
/// `Error: <message>` and the whole source, numbered.
pub fn render(message: &str, line: Option<usize>, source: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();

    match line.filter(|l| (1..=lines.len()).contains(l)) {
        Some(line) => {
            let start = line.saturating_sub(CONTEXT_LINES).max(1);
            let end = (line + CONTEXT_LINES).min(lines.len());
            format!(
                "Error at line {line}: {message}\n\n{}",
                listing(&lines, start, end, Some(line))
            )
        }
        None => format!(
            "Error: {message}\n\n{}",
            listing(&lines, 1, lines.len(), None)
        ),
    }
}

fn listing(lines: &[&str], start: usize, end: usize, marked: Option<usize>) -> String {
    let width = end.max(1).to_string().len();
    (start..=end)
        .map(|n| {
            let marker = if marked == Some(n) { '>' } else { ' ' };
            format!("{marker} {n:>width$} | {}", lines[n - 1])
        })
        .collect::<Vec<_>>()
        .join("\n")
}
