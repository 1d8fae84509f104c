//! Prompt construction and output cleanup for code generation.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// An error message, stack trace, or code the user says is broken.
    Error,
    Code,
    /// Prose describing something to implement.
    Description,
}

const ERROR_KEYWORDS: [&str; 4] = ["error", "exception", "failed", "traceback"];

static CODE_PATTERNS: LazyLock<[Regex; 11]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)function\s+\w+").expect("valid regex"),
        Regex::new(r"(?i)class\s+\w+").expect("valid regex"),
        Regex::new(r"(?i)def\s+\w+").expect("valid regex"),
        Regex::new(r"(?i)const\s+\w+\s*=").expect("valid regex"),
        Regex::new(r"(?i)let\s+\w+\s*=").expect("valid regex"),
        Regex::new(r"(?i)var\s+\w+\s*=").expect("valid regex"),
        Regex::new(r"(?i)import\s+.*from").expect("valid regex"),
        Regex::new(r"\{[\s\S]*\}").expect("valid regex"),
        Regex::new(r"\[[\s\S]*\]").expect("valid regex"),
        Regex::new(r".*\(\s*\)\s*\{").expect("valid regex"),
        Regex::new(r"(?m).*;$").expect("valid regex"),
    ]
});

static ASSISTANT_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(here's|here is|the code is|the implementation is).*?:\s*")
        .expect("valid regex")
});

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```\w*\n?").expect("valid regex"));

/// Error keywords win over code shape; two or more code patterns make it code.
pub fn classify(content: &str) -> ContentKind {
    let lower = content.to_lowercase();
    if ERROR_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        return ContentKind::Error;
    }
    let matches = CODE_PATTERNS
        .iter()
        .filter(|pattern| pattern.is_match(content))
        .count();
    if matches >= 2 {
        ContentKind::Code
    } else {
        ContentKind::Description
    }
}

const PREAMBLE: &str = "You are an expert programmer. Analyze the content below and produce clean, working code.

Rules:
- Return only code, with no explanations or markdown
- The code must be syntactically correct
- Follow the conventions of the detected language
- When fixing errors, return the corrected version
- When improving code, make it faster and easier to read";

pub fn build_prompt(content: &str) -> String {
    let (instruction, lead_out) = match classify(content) {
        ContentKind::Error => (
            "The user copied an error message or broken code. Provide the corrected version:",
            "Fixed code:",
        ),
        ContentKind::Code => (
            "The user copied some code. Optimize and improve it:",
            "Improved code:",
        ),
        ContentKind::Description => (
            "The user copied a description or requirement. Implement it as code:",
            "Implementation:",
        ),
    };
    format!("{PREAMBLE}\n\n{instruction}\n\n{content}\n\n{lead_out}")
}

/// Strip a chatty lead-in and any markdown fences from model output.
pub fn clean_output(raw: &str) -> String {
    let without_prefix = ASSISTANT_PREFIX.replace(raw.trim_start(), "");
    CODE_FENCE
        .replace_all(&without_prefix, "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_keywords_take_priority() {
        assert_eq!(
            classify("TypeError: x is undefined\n  at function foo() { }"),
            ContentKind::Error
        );
        assert_eq!(classify("Traceback (most recent call last):"), ContentKind::Error);
    }

    #[test]
    fn two_code_patterns_make_code() {
        assert_eq!(classify("function add(a,b){return a-b}"), ContentKind::Code);
        assert_eq!(classify("const x = 1;\nlet y = 2;"), ContentKind::Code);
    }

    #[test]
    fn plain_prose_is_description() {
        assert_eq!(
            classify("write a binary search over a sorted vector"),
            ContentKind::Description
        );
    }

    #[test]
    fn prompt_embeds_content_and_matching_lead_out() {
        let prompt = build_prompt("function add(a,b){return a-b}");
        assert!(prompt.contains("function add(a,b){return a-b}"));
        assert!(prompt.ends_with("Improved code:"));

        let prompt = build_prompt("sort a list of names");
        assert!(prompt.ends_with("Implementation:"));
    }

    #[test]
    fn clean_output_strips_prefix_and_fences() {
        let raw = "Here's the fixed code:\n```javascript\nfunction add(a, b) {\n  return a + b;\n}\n```\n";
        assert_eq!(clean_output(raw), "function add(a, b) {\n  return a + b;\n}");
    }

    #[test]
    fn clean_output_keeps_comments() {
        let raw = "// adds two numbers\nfn add(a: i32, b: i32) -> i32 { a + b }";
        assert_eq!(clean_output(raw), raw);
    }
}
