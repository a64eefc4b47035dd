//! Query Classifier
//!
//! Decides whether a user message plausibly refers to uploaded content, in
//! which case the graph runtime retrieves excerpts before the first REASON.
//! - DocumentGrounded: "what does the report say about margins?", "what was net revenue?",
//!   or any message sent with files
//! - General: "what is AAPL trading at?", "convert 100 USD to EUR"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    DocumentGrounded,
    General,
}

/// Static keyword lists
const DOCUMENT_KEYWORDS: &[&str] = &[
    // The upload itself
    "document", "file", "upload", "attached", "attachment", "pdf", "spreadsheet", "sheet",
    // Typical financial paperwork
    "report", "statement", "filing", "10-k", "10-q", "annual", "quarterly", "invoice",
    "balance sheet", "income statement", "cash flow", "prospectus",
    // Pointers into it
    "this", "above", "page", "section", "table", "summarize", "summary", "according to",
];

/// Figures a follow-up question asks about once statements are uploaded.
const FINANCIAL_METRIC_KEYWORDS: &[&str] = &[
    "revenue", "net income", "profit", "earnings", "margin", "ebitda", "expense",
    "cost", "sales", "assets", "liabilities", "equity", "debt", "dividend", "eps",
    "guidance", "growth", "cash",
];

/// Words that point at a live tool lookup instead.
const LIVE_DATA_KEYWORDS: &[&str] = &[
    "price of", "trading at", "quote", "exchange rate", "convert", "today", "right now",
];

/// Query classifier
pub struct QueryClassifier;

impl QueryClassifier {
    /// Classify a message against the session's current upload state.
    pub fn classify(message: &str, index_is_empty: bool, files_attached: bool) -> QueryKind {
        if index_is_empty {
            return QueryKind::General;
        }
        if files_attached {
            return QueryKind::DocumentGrounded;
        }

        let text = message.to_lowercase();

        let document_score = DOCUMENT_KEYWORDS
            .iter()
            .filter(|kw| contains_word(&text, kw))
            .count();

        let live_score = LIVE_DATA_KEYWORDS
            .iter()
            .filter(|kw| text.contains(**kw))
            .count();

        let metric_score = FINANCIAL_METRIC_KEYWORDS
            .iter()
            .filter(|kw| contains_word(&text, kw))
            .count();

        if document_score >= 2 || ((document_score == 1 || metric_score > 0) && live_score == 0) {
            QueryKind::DocumentGrounded
        } else {
            QueryKind::General
        }
    }

    pub fn should_retrieve(message: &str, index_is_empty: bool, files_attached: bool) -> bool {
        Self::classify(message, index_is_empty, files_attached) == QueryKind::DocumentGrounded
    }
}

/// Keyword match on word boundaries, so "profile" does not hit "file".
fn contains_word(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(|c| c.is_alphanumeric() && c != 's')
    })
}
