//! Parsing of the numbered-list responses returned by the completion service.
//!
//! The parser never fails. Entries it cannot use are counted as malformed and
//! the rest of the batch is kept.

use url::Url;

use crate::models::{CandidateItem, Rankings, Source};

/// Format instructions appended to (or substituted into) the prompt template.
pub const RESPONSE_FORMAT: &str = r#"Respond with a numbered list. For every item use exactly these labeled lines:

1. **Title:** <item title>
**Source:** <the page the item was found on>
**Link:** <absolute URL of the item>
**Categories:** <comma separated categories from the allowed list>
**Summary:** <one or two sentence summary>
**Rankings:** [<category fit>, <profile fit>, <credibility>]

Each ranking is a number between 0 and 1. Do not add any other text."#;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub items: Vec<CandidateItem>,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Source,
    Link,
    Categories,
    Summary,
    Rankings,
}

impl Field {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "title" | "name" => Some(Field::Title),
            "source" => Some(Field::Source),
            "link" | "url" | "item url" => Some(Field::Link),
            "categories" | "category" => Some(Field::Categories),
            "summary" | "description" => Some(Field::Summary),
            "rankings" | "ranking" | "scores" | "score" => Some(Field::Rankings),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RawEntry {
    title: Option<String>,
    link: Option<String>,
    categories: Option<String>,
    summary: Option<String>,
    rankings: Option<String>,
    last_field: Option<Field>,
}

impl RawEntry {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.link.is_none()
            && self.categories.is_none()
            && self.summary.is_none()
            && self.rankings.is_none()
    }

    fn set(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Categories => &mut self.categories,
            Field::Summary => &mut self.summary,
            Field::Rankings => &mut self.rankings,
            // The item's source is always the page it was fetched from.
            Field::Source => {
                self.last_field = Some(field);
                return;
            }
        };
        *slot = Some(value);
        self.last_field = Some(field);
    }
}

/// Turns raw completion text into candidate items.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    categories: Vec<String>,
}

impl ResponseParser {
    pub fn new(categories: Vec<String>) -> Self {
        Self { categories }
    }

    pub fn parse(&self, raw: &str, source: &Source) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();

        for entry in split_entries(raw) {
            match self.build_candidate(entry, source) {
                Some(item) => outcome.items.push(item),
                None => outcome.malformed += 1,
            }
        }

        if outcome.malformed > 0 {
            tracing::debug!(
                source = %source.url,
                kept = outcome.items.len(),
                malformed = outcome.malformed,
                "Dropped malformed response entries"
            );
        }
        outcome
    }

    fn build_candidate(&self, entry: RawEntry, source: &Source) -> Option<CandidateItem> {
        let title = entry.title.filter(|t| !t.is_empty())?;
        let link = entry.link.as_deref().and_then(parse_link)?;

        Some(CandidateItem {
            title,
            source: source.url.clone(),
            link,
            categories: entry
                .categories
                .as_deref()
                .map(|c| self.match_categories(c))
                .unwrap_or_default(),
            summary: entry.summary.unwrap_or_default(),
            rankings: entry
                .rankings
                .as_deref()
                .map(parse_rankings)
                .unwrap_or_default(),
        })
    }

    /// Keep only configured categories, in their configured spelling.
    fn match_categories(&self, value: &str) -> Vec<String> {
        let mut matched: Vec<String> = Vec::new();
        for part in value.split([',', ';']) {
            let wanted = part
                .trim()
                .trim_matches(|c: char| c == '"' || c == '\'' || c == '[' || c == ']' || c == '*')
                .trim();
            if wanted.is_empty() {
                continue;
            }
            if let Some(known) = self
                .categories
                .iter()
                .find(|c| c.eq_ignore_ascii_case(wanted))
            {
                if !matched.contains(known) {
                    matched.push(known.clone());
                }
            }
        }
        matched
    }
}

/// Group lines into entries. A numbered line opens a new entry, and so does a
/// second title within the same entry.
fn split_entries(raw: &str) -> Vec<RawEntry> {
    let mut entries = Vec::new();
    let mut current = RawEntry::default();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (numbered, rest) = strip_numbering(trimmed);
        if numbered && !current.is_empty() {
            entries.push(std::mem::take(&mut current));
        }

        match split_label(rest) {
            Some((field, value)) => {
                if field == Field::Title && current.title.is_some() {
                    entries.push(std::mem::take(&mut current));
                }
                current.set(field, value);
            }
            None => {
                // Unlabeled text continues a multi-line summary.
                if current.last_field == Some(Field::Summary) {
                    if let Some(summary) = current.summary.as_mut() {
                        let extra = strip_emphasis(rest);
                        if !extra.is_empty() {
                            if !summary.is_empty() {
                                summary.push(' ');
                            }
                            summary.push_str(extra);
                        }
                    }
                }
            }
        }
    }

    if !current.is_empty() {
        entries.push(current);
    }
    entries
}

/// Strip a leading "12." or "12)" marker. The marker must be followed by
/// whitespace, emphasis, or the end of the line, so "3.5 times" is text.
fn strip_numbering(line: &str) -> (bool, &str) {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (false, line);
    }
    let rest = &line[digits..];
    let after = match rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
        Some(after) => after,
        None => return (false, line),
    };
    match after.chars().next() {
        None => (true, after),
        Some(c) if c.is_whitespace() || c == '*' || c == '_' => (true, after.trim_start()),
        Some(_) => (false, line),
    }
}

fn strip_emphasis(value: &str) -> &str {
    value.trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
}

/// Recognize `Label: value`, tolerating markdown emphasis, bullets and case.
fn split_label(line: &str) -> Option<(Field, String)> {
    let line = line
        .trim_start_matches(|c: char| c == '-' || c == '•' || c == '#' || c.is_whitespace());
    let colon = line.find(':')?;
    let label = strip_emphasis(&line[..colon]).to_lowercase();
    let field = Field::from_label(&label)?;
    let value = strip_emphasis(&line[colon + 1..]);
    Some((field, value.to_string()))
}

/// Accept bare URLs, `<url>`, and markdown `[text](url)` links.
fn parse_link(value: &str) -> Option<String> {
    let mut candidate = value.trim();
    if let (Some(open), true) = (candidate.find("]("), candidate.ends_with(')')) {
        candidate = &candidate[open + 2..candidate.len() - 1];
    }
    let candidate = candidate.trim_matches(|c: char| c == '<' || c == '>' || c.is_whitespace());

    let url = Url::parse(candidate).ok()?;
    if url.host_str().is_none() || !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    Some(candidate.to_string())
}

/// Parse a `[a, b, c]` ranking vector. Missing, non-numeric, or out-of-range
/// values become 0.
fn parse_rankings(value: &str) -> Rankings {
    let inner = match (value.find('['), value.rfind(']')) {
        (Some(open), Some(close)) if open < close => &value[open + 1..close],
        _ => value,
    };

    let mut scores = [0.0f64; 3];
    for (slot, part) in scores.iter_mut().zip(inner.split(',')) {
        *slot = part
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
            .unwrap_or(0.0);
    }
    Rankings::new(scores[0], scores[1], scores[2])
}

/// Write candidates back in the response format.
pub fn render_entries(items: &[CandidateItem]) -> String {
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        out.push_str(&format!("{}. **Title:** {}\n", index + 1, item.title));
        out.push_str(&format!("**Source:** {}\n", item.source));
        out.push_str(&format!("**Link:** {}\n", item.link));
        out.push_str(&format!("**Categories:** {}\n", item.categories.join(", ")));
        out.push_str(&format!("**Summary:** {}\n", item.summary));
        let [a, b, c] = item.rankings.as_array();
        out.push_str(&format!("**Rankings:** [{}, {}, {}]\n\n", a, b, c));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ResponseParser {
        ResponseParser::new(vec![
            "AI".to_string(),
            "Programming".to_string(),
            "Data Science".to_string(),
        ])
    }

    fn source() -> Source {
        Source::new("https://example.com")
    }

    const TWO_ENTRIES: &str = "
1. **Title:** AI Fundamentals
**Source:** https://example.com
**Link:** https://example.com/ai-fundamentals
**Categories:** AI, Programming
**Summary:** An introduction to artificial intelligence concepts
**Rankings:** [0.8, 0.75, 0.85]

2. **Title:** Machine Learning Basics
**Source:** https://example.com
**Link:** https://example.com/ml-basics
**Categories:** AI, Data Science
**Summary:** Basic concepts in machine learning
**Rankings:** [0.7, 0.8, 0.75]
";

    #[test]
    fn test_parses_well_formed_entries() {
        let outcome = parser().parse(TWO_ENTRIES, &source());
        assert_eq!(outcome.malformed, 0);
        assert_eq!(outcome.items.len(), 2);

        let first = &outcome.items[0];
        assert_eq!(first.title, "AI Fundamentals");
        assert_eq!(first.link, "https://example.com/ai-fundamentals");
        assert_eq!(first.source, "https://example.com");
        assert_eq!(first.categories, vec!["AI", "Programming"]);
        assert_eq!(first.rankings, Rankings::new(0.8, 0.75, 0.85));
        assert_eq!(outcome.items[1].categories, vec!["AI", "Data Science"]);
    }

    #[test]
    fn test_labels_are_case_insensitive_and_plain() {
        let raw = "1) TITLE: Plain entry\n  link :  https://example.com/plain  \nCATEGORIES: ai, unknown\nrankings: [1, 0, 0.5]";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items.len(), 1);
        let item = &outcome.items[0];
        assert_eq!(item.title, "Plain entry");
        assert_eq!(item.link, "https://example.com/plain");
        assert_eq!(item.categories, vec!["AI"]);
        assert_eq!(item.rankings, Rankings::new(1.0, 0.0, 0.5));
    }

    #[test]
    fn test_missing_summary_is_kept() {
        let raw = "1. **Title:** No summary\n**Link:** https://example.com/a\n**Rankings:** [0.5, 0.5, 0.5]";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.malformed, 0);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].summary, "");
    }

    #[test]
    fn test_missing_link_is_dropped_and_counted() {
        let raw = "1. **Title:** No link\n**Summary:** something\n\n2. **Title:** Has link\n**Link:** https://example.com/b";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.malformed, 1);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].title, "Has link");
    }

    #[test]
    fn test_unparseable_link_is_dropped() {
        let raw = "1. **Title:** Bad link\n**Link:** not a url\n2. **Title:** Relative\n**Link:** /b";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items.len(), 0);
        assert_eq!(outcome.malformed, 2);
    }

    #[test]
    fn test_missing_title_is_dropped() {
        let raw = "1. **Link:** https://example.com/a\n**Summary:** orphan";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items.len(), 0);
        assert_eq!(outcome.malformed, 1);
    }

    #[test]
    fn test_bad_rankings_default_to_zero() {
        let raw = "1. **Title:** Odd scores\n**Link:** https://example.com/a\n**Rankings:** [80, high, 0.4]";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].rankings, Rankings::new(0.0, 0.0, 0.4));

        let raw = "1. **Title:** Short scores\n**Link:** https://example.com/b\n**Rankings:** [0.9]";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items[0].rankings, Rankings::new(0.9, 0.0, 0.0));

        let raw = "1. **Title:** NaN\n**Link:** https://example.com/c\n**Rankings:** [NaN, -0.1, inf]";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items[0].rankings, Rankings::default());
    }

    #[test]
    fn test_garbage_degrades_to_zero_items() {
        let outcome = parser().parse("I'm sorry, I can't help with that.", &source());
        assert_eq!(outcome, ParseOutcome::default());

        let outcome = parser().parse("", &source());
        assert!(outcome.items.is_empty());
    }

    #[test]
    fn test_unnumbered_entries_split_on_title() {
        let raw = "Title: One\nLink: https://example.com/1\nTitle: Two\nLink: https://example.com/2";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.items[1].title, "Two");
    }

    #[test]
    fn test_multiline_summary_and_markdown_link() {
        let raw = "1. **Title:** Wrapped\n**Link:** [the post](https://example.com/post)\n**Summary:** First line\ncontinues here.\n**Rankings:** [0.1, 0.2, 0.3]";
        let outcome = parser().parse(raw, &source());
        let item = &outcome.items[0];
        assert_eq!(item.link, "https://example.com/post");
        assert_eq!(item.summary, "First line continues here.");
    }

    #[test]
    fn test_wrapped_summary_starting_with_a_number() {
        let raw = "1. **Title:** Faster kernels\n**Link:** https://example.com/kernels\n**Summary:** The new kernel runs\n3.5 times faster on consumer GPUs.\n**Rankings:** [0.9, 0.9, 0.9]";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.malformed, 0);
        assert_eq!(outcome.items.len(), 1);
        let item = &outcome.items[0];
        assert_eq!(
            item.summary,
            "The new kernel runs 3.5 times faster on consumer GPUs."
        );
        assert_eq!(item.rankings, Rankings::new(0.9, 0.9, 0.9));
    }

    #[test]
    fn test_numbering_markers() {
        assert_eq!(strip_numbering("3. Title: x"), (true, "Title: x"));
        assert_eq!(strip_numbering("12)**Title:** x"), (true, "**Title:** x"));
        assert_eq!(strip_numbering("3.5 times faster"), (false, "3.5 times faster"));
        assert_eq!(strip_numbering("2024.10 release"), (false, "2024.10 release"));
        assert_eq!(strip_numbering("7."), (true, ""));
    }

    #[test]
    fn test_source_is_the_fetched_page() {
        let raw = "1. **Title:** Elsewhere\n**Source:** https://other.org\n**Link:** https://other.org/x";
        let outcome = parser().parse(raw, &source());
        assert_eq!(outcome.items[0].source, "https://example.com");
    }

    #[test]
    fn test_reparsing_rendered_output_is_stable() {
        let first = parser().parse(TWO_ENTRIES, &source());
        let rendered = render_entries(&first.items);
        let second = parser().parse(&rendered, &source());
        assert_eq!(first, second);
        assert_eq!(parser().parse(TWO_ENTRIES, &source()), first);
    }
}
