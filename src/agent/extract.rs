use std::sync::LazyLock;

use regex::Regex;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?(</think>|$)").expect("valid regex"));
static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("valid regex"));
static SELECT_START: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("valid regex"));
static CTE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWITH\s+(RECURSIVE\s+)?[A-Za-z_][A-Za-z0-9_]*\s*(\([^)]*\)\s*)?AS\s*\(").expect("valid regex")
});

/// Isolate a single SELECT (or WITH ... SELECT) statement from model output
/// that may include markdown fences, reasoning blocks or prose. Returns an
/// empty string when none is found.
pub fn extract_sql(raw: &str) -> String {
    let text = THINK_BLOCK.replace_all(raw, "");

    let fenced = FENCED
        .captures_iter(&text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|body| statement_start(body).is_some());
    let source = fenced.unwrap_or(&text);

    let Some(start) = statement_start(source) else { return String::new() };
    let rest = &source[start..];
    rest[..statement_end(rest)].trim().to_string()
}

/// Offset of the first `;`, fence or blank line outside a quoted literal or
/// identifier. Doubled quotes toggle twice and so stay inside the literal.
fn statement_end(sql: &str) -> usize {
    let mut quote: Option<char> = None;
    for (i, c) in sql.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ';' => return i,
            None if sql[i..].starts_with("```") || sql[i..].starts_with("\n\n") => return i,
            None => {}
        }
    }
    sql.len()
}

fn statement_start(text: &str) -> Option<usize> {
    let select = SELECT_START.find(text).map(|m| m.start());
    let cte = CTE_START.find(text).map(|m| m.start());
    match (select, cte) {
        (Some(s), Some(c)) => Some(s.min(c)),
        (s, c) => s.or(c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HVAC: &str = "SELECT SUM(cost_cents) FROM service_log WHERE category='HVAC'";

    #[test]
    fn plain_statement_loses_semicolon() {
        assert_eq!(extract_sql(&format!("  {HVAC};\n")), HVAC);
    }

    #[test]
    fn fenced_block_with_prose() {
        let raw = format!("Here is the query you need:\n\n```sql\n{HVAC};\n```\n\nThis sums the HVAC costs.");
        assert_eq!(extract_sql(&raw), HVAC);
    }

    #[test]
    fn prose_without_fence() {
        let raw = format!("Sure! {HVAC}\n\nThat selects the total.");
        assert_eq!(extract_sql(&raw), HVAC);
    }

    #[test]
    fn reasoning_block_is_ignored() {
        let raw = format!("<think>maybe SELECT * FROM x; no wait</think>\n{HVAC}");
        assert_eq!(extract_sql(&raw), HVAC);
    }

    #[test]
    fn cte_is_kept_whole() {
        let raw = "WITH totals AS (SELECT category, SUM(cost_cents) AS c FROM service_log GROUP BY category)\nSELECT * FROM totals ORDER BY c DESC;";
        assert_eq!(extract_sql(raw), raw.trim_end_matches(';'));
    }

    #[test]
    fn prose_with_word_with_is_not_a_cte() {
        let raw = format!("Query with totals: {HVAC}");
        assert_eq!(extract_sql(&raw), HVAC);
    }

    #[test]
    fn terminators_inside_literals_are_kept() {
        let sql = "SELECT id FROM service_log WHERE notes LIKE '%a;b%'";
        assert_eq!(extract_sql(&format!("{sql};")), sql);

        let sql = "SELECT \"odd;name\" FROM service_log WHERE vendor = 'Bob''s\n\nHVAC'";
        assert_eq!(extract_sql(&format!("```sql\n{sql};\n```")), sql);
    }

    #[test]
    fn no_statement_yields_empty() {
        assert_eq!(extract_sql("I selected nothing, sorry."), "");
        assert_eq!(extract_sql("```\n```"), "");
        assert_eq!(extract_sql(""), "");
    }
}
