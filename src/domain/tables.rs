//! Built-in vocabulary tables.
//!
//! Deliberately small: a handful of synonym groups, detection phrases and
//! canned questions per domain.

use super::{DomainId, DomainTable};

pub static FINANCE: DomainTable = DomainTable {
    id: DomainId::Finance,
    description: "Financial documents (SEC filings, annual reports, financial statements)",
    synonyms: &[
        (
            "revenue",
            &["revenue", "net revenue", "net sales", "total sales", "gross revenue", "operating revenue"],
        ),
        ("expenses", &["total expenses", "operating expenses", "cost of revenue", "cost of sales", "SG&A"]),
        ("net_income", &["net income", "net earnings", "net profit", "net loss", "profit after tax"]),
        ("eps", &["earnings per share", "EPS", "basic EPS", "diluted EPS"]),
        ("cash_flow", &["operating cash flow", "cash from operations", "free cash flow", "capital expenditures"]),
    ],
    patterns: &[
        "form 10-k",
        "form 10-q",
        "securities and exchange commission",
        "consolidated balance sheet",
        "financial statements",
        "management's discussion",
        "earnings per share",
        "fiscal year",
    ],
    filename_keywords: &["10-k", "10k", "10-q", "10q", "annual", "quarterly", "financial", "earnings"],
    templates: &[
        (
            "revenue",
            "What is the total revenue for each reported period? Report the exact figure, the term used, and the source line.",
        ),
        (
            "net_income",
            "What is the net income or loss for each reported period?",
        ),
    ],
};

pub static LEGAL: DomainTable = DomainTable {
    id: DomainId::Legal,
    description: "Legal documents (contracts, agreements, court filings)",
    synonyms: &[
        ("party", &["party", "parties", "licensor", "licensee", "buyer", "seller", "counterparty"]),
        ("termination", &["termination", "cancellation", "expiration", "early termination", "non-renewal"]),
        ("liability", &["liability", "indemnification", "indemnify", "hold harmless", "limitation of liability"]),
        ("governing_law", &["governing law", "choice of law", "jurisdiction", "venue"]),
        ("effective_date", &["effective date", "commencement date", "start date"]),
    ],
    patterns: &[
        "agreement",
        "whereas",
        "in witness whereof",
        "now, therefore",
        "governing law",
        "hereby agree",
        "plaintiff",
        "defendant",
    ],
    filename_keywords: &["contract", "agreement", "nda", "lease", "license", "amendment", "msa"],
    templates: &[
        (
            "parties",
            "Who are the parties to this agreement? List each party with its role and any defined abbreviation.",
        ),
        (
            "termination",
            "Under what conditions can this agreement be terminated, and with how much notice?",
        ),
    ],
};

pub static MEDICAL: DomainTable = DomainTable {
    id: DomainId::Medical,
    description: "Medical documents (clinical reports, drug labels, guidelines)",
    synonyms: &[
        ("adverse_event", &["adverse event", "adverse reaction", "side effect", "adverse effect"]),
        ("dosage", &["dosage", "dose", "dosing", "administration", "posology"]),
        ("indication", &["indication", "indications and usage", "indicated for"]),
        ("contraindication", &["contraindication", "contraindicated", "should not be used"]),
    ],
    patterns: &[
        "patient",
        "diagnosis",
        "dosage and administration",
        "adverse reaction",
        "contraindications",
        "medical history",
        "blood pressure",
    ],
    filename_keywords: &["patient", "clinical", "medical", "diagnosis", "prescription", "drug", "label"],
    templates: &[
        (
            "adverse_events",
            "Which adverse events are reported, and how frequently does each occur?",
        ),
        ("dosage", "What dosage and administration schedule is recommended?"),
    ],
};

pub static ACADEMIC: DomainTable = DomainTable {
    id: DomainId::Academic,
    description: "Academic documents (research papers, theses, technical reports)",
    synonyms: &[
        ("method", &["method", "methods", "methodology", "approach", "experimental setup"]),
        ("result", &["result", "results", "findings", "outcomes", "experiments"]),
        ("conclusion", &["conclusion", "conclusions", "discussion", "summary"]),
        ("limitation", &["limitation", "limitations", "threats to validity", "future work"]),
    ],
    patterns: &[
        "abstract",
        "introduction",
        "related work",
        "methodology",
        "conclusion",
        "references",
        "et al.",
        "arxiv:",
    ],
    filename_keywords: &["paper", "thesis", "dissertation", "arxiv", "conference", "journal", "proceedings"],
    templates: &[
        (
            "methodology",
            "What methodology does this paper use? Describe the design, data sources and key techniques.",
        ),
        ("findings", "What are the key findings, with the figures that support them?"),
    ],
};

pub static ALL: [&DomainTable; 4] = [&FINANCE, &LEGAL, &MEDICAL, &ACADEMIC];
