//! Result parser -- turns a fetched result page into a [`StudentResult`].
//!
//! Results arrive either as an HTML marks table or as a PDF memo. Parsing
//! never panics on unexpected input: anything that does not look like a
//! result sheet comes back as a [`ParseFailure`].

use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};

use crate::fetch::{FetchFailure, PageBody, RawPage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("invalid selector: {0}")]
    BadSelector(String),
    #[error("result links to a PDF memo that could not be retrieved")]
    PdfOnly,
    #[error("unreadable PDF memo: {0}")]
    UnreadablePdf(String),
    #[error("no subject rows found on result page")]
    NoSubjects,
}

impl From<ParseFailure> for FetchFailure {
    fn from(value: ParseFailure) -> Self {
        FetchFailure::ParseUnavailable(value.to_string())
    }
}

/// Marks for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectMark {
    pub code: String,
    pub external: u32,
    pub internal: u32,
    pub total: u32,
    /// Subject result as printed by the site, upper-cased (`P`, `F`, `AB`...).
    pub result: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallResult {
    #[serde(rename = "P")]
    Pass,
    #[serde(rename = "F")]
    Fail,
}

impl OverallResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallResult::Pass => "P",
            OverallResult::Fail => "F",
        }
    }
}

/// Parsed result sheet of one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentResult {
    pub pin: String,
    pub name: String,
    /// Subjects in page order, one entry per code.
    pub subjects: Vec<SubjectMark>,
    pub total: u32,
    pub overall: OverallResult,
}

impl StudentResult {
    pub fn subject(&self, code: &str) -> Option<&SubjectMark> {
        self.subjects.iter().find(|s| s.code == code)
    }
}

#[inline]
pub(crate) fn selector(css: &str) -> Result<Selector, ParseFailure> {
    Selector::parse(css).map_err(|_| ParseFailure::BadSelector(css.to_string()))
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {pattern}: {e}")))
}

fn missing_student_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\b(invalid|not\s+found|no\s+records?|error)\b")
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i:\bname)[ \t]*:[ \t]*([A-Z][A-Z .]*)")
}

fn total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\btotal[ \t]*:?[ \t]*(\d+)")
}

fn overall_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\bresult\s*:?\s*(pass|fail)\b")
}

fn subject_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^(\d{3})")
}

fn pdf_subject_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^(\d{3})[ \t]+(\d+)[ \t]+(\d+)([PF])")
}

fn pdf_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\bName[ \t]*:?[ \t]*([A-Z][A-Z .]*)")
}

fn pdf_total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"GrandTotal\s*:?\s*(\d+)")
}

fn pdf_overall_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\bResult\s*:?\s*(PASS|FAIL)\b")
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\d+")
}

/// Text nodes outside `<script>`/`<style>`, one per line.
fn visible_text(doc: &Html) -> String {
    let mut parts = Vec::new();
    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element())
            .is_some_and(|e| matches!(e.name(), "script" | "style"));
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts.join("\n")
}

/// Whether the site answered with its "no such record" page.
pub fn indicates_missing_student(html: &str) -> bool {
    let doc = Html::parse_document(html);
    missing_student_re().is_match(&visible_text(&doc))
}

/// Target of the first link to a `.pdf` document, as written in the page.
pub fn pdf_link(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let links = selector("a[href]").ok()?;
    doc.select(&links)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .find(|href| href.to_ascii_lowercase().contains(".pdf"))
        .map(str::to_string)
}

fn first_number(cell: &str) -> u32 {
    number_re()
        .find(cell)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parse a fetched result page or memo.
pub fn parse_result_page(page: &RawPage) -> Result<StudentResult, ParseFailure> {
    match &page.body {
        PageBody::Html(html) => parse_html(&page.pin, html),
        PageBody::Pdf(bytes) => parse_pdf_text(&page.pin, &extract_pdf_text(bytes)?),
    }
}

fn extract_pdf_text(bytes: &[u8]) -> Result<String, ParseFailure> {
    // The extractor panics on some malformed documents.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ParseFailure::UnreadablePdf(e.to_string())),
        Err(_) => Err(ParseFailure::UnreadablePdf("extractor panicked".to_string())),
    }
}

/// Parse the text layer of a PDF memo.
///
/// Subject lines read `CODE EXT INTTOT RESULT`, where internal and total
/// marks are printed without a separator (see [`split_combined_marks`]).
pub fn parse_pdf_text(pin: &str, text: &str) -> Result<StudentResult, ParseFailure> {
    let mut subjects: Vec<SubjectMark> = Vec::new();
    for line in text.lines() {
        let Some(caps) = pdf_subject_re().captures(line.trim()) else {
            continue;
        };
        let code = caps[1].to_string();
        if subjects.iter().any(|s| s.code == code) {
            continue;
        }
        let external = caps[2].parse().unwrap_or(0);
        let (internal, total) = split_combined_marks(&caps[3], external);
        subjects.push(SubjectMark {
            code,
            external,
            internal,
            total,
            result: caps[4].to_string(),
        });
    }
    if subjects.is_empty() {
        return Err(ParseFailure::NoSubjects);
    }

    let name = pdf_name_re()
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let total = pdf_total_re()
        .captures(text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let overall = match pdf_overall_re().captures(text) {
        Some(c) if &c[1] == "PASS" => OverallResult::Pass,
        _ => OverallResult::Fail,
    };

    Ok(StudentResult {
        pin: pin.to_string(),
        name,
        subjects,
        total,
        overall,
    })
}

/// Split run-together internal and total marks, e.g. `2072` with 52
/// external marks is 20 internal and 72 total.
///
/// A two- or one-digit internal prefix is accepted when it makes the sum
/// add up; otherwise the last two digits are taken as the total.
pub fn split_combined_marks(combined: &str, external: u32) -> (u32, u32) {
    let digits = combined.len();
    let number = |s: &str| s.parse::<u32>().unwrap_or(0);
    if digits >= 3 {
        for split in [2, 1] {
            let (internal, total) = (number(&combined[..split]), number(&combined[split..]));
            if external.checked_add(internal) == Some(total) {
                return (internal, total);
            }
        }
    }
    if digits > 2 {
        (number(&combined[..digits - 2]), number(&combined[digits - 2..]))
    } else {
        (0, number(combined))
    }
}

fn parse_html(pin: &str, html: &str) -> Result<StudentResult, ParseFailure> {
    let doc = Html::parse_document(html);
    let row_selector = selector("table tr")?;
    let cell_selector = selector("td, th")?;
    let pdf_selector = selector("a[href]")?;

    let mut subjects: Vec<SubjectMark> = Vec::new();
    for row in doc.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 4 {
            continue;
        }
        let Some(code) = subject_code_re()
            .captures(&cells[0])
            .map(|c| c[1].to_string())
        else {
            continue;
        };
        if subjects.iter().any(|s| s.code == code) {
            continue;
        }
        let result = cells
            .get(4)
            .map(|r| r.to_uppercase())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "F".to_string());
        subjects.push(SubjectMark {
            code,
            external: first_number(&cells[1]),
            internal: first_number(&cells[2]),
            total: first_number(&cells[3]),
            result,
        });
    }

    if subjects.is_empty() {
        let links_pdf = doc.select(&pdf_selector).any(|a| {
            a.value()
                .attr("href")
                .is_some_and(|href| href.to_ascii_lowercase().contains(".pdf"))
        });
        return Err(if links_pdf {
            ParseFailure::PdfOnly
        } else {
            ParseFailure::NoSubjects
        });
    }

    let text = visible_text(&doc);
    let name = name_re()
        .captures(&text)
        .map(|c| c[1].trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let total = total_re()
        .captures(&text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let overall = match overall_re().captures(&text) {
        Some(c) if c[1].eq_ignore_ascii_case("pass") => OverallResult::Pass,
        _ => OverallResult::Fail,
    };

    Ok(StudentResult {
        pin: pin.to_string(),
        name,
        subjects,
        total,
        overall,
    })
}
