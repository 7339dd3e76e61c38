//! Error taxonomy for the extraction engine.

/// Failures the engine distinguishes when deciding whether to retry, abort a
/// stream, or abort the whole run.
#[derive(Debug, Clone, PartialEq)]
pub enum TapError {
    /// Bad descriptor graph or missing/invalid configuration. Fatal at startup.
    Configuration(String),
    /// Non-retryable client error from the source (4xx other than 429).
    Fetch { status: u16, message: String },
    /// Retryable failure that exhausted the retry budget.
    TransientFetch { attempts: u32, message: String },
    /// Cursor load or save failed.
    Persistence(String),
    /// The run was stopped between pages.
    Cancelled,
}

impl TapError {
    /// Short machine-friendly label for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TapError::Configuration(_) => "configuration",
            TapError::Fetch { .. } => "fetch",
            TapError::TransientFetch { .. } => "transient_fetch",
            TapError::Persistence(_) => "persistence",
            TapError::Cancelled => "cancelled",
        }
    }

    /// Find the engine error inside a report, looking through any context layers.
    pub fn find(report: &eyre::Report) -> Option<&TapError> {
        report.chain().find_map(|e| e.downcast_ref::<TapError>())
    }
}

impl std::fmt::Display for TapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TapError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            TapError::Fetch { status, message } => write!(f, "fetch failed with HTTP {}: {}", status, message),
            TapError::TransientFetch { attempts, message } => {
                write!(f, "transient fetch failure after {} attempts: {}", attempts, message)
            }
            TapError::Persistence(msg) => write!(f, "cursor persistence failed: {}", msg),
            TapError::Cancelled => write!(f, "extraction cancelled"),
        }
    }
}

impl std::error::Error for TapError {}
