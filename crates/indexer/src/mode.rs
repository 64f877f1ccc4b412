/// Why a full reindex was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    /// Caller asked for it explicitly.
    Forced,
    /// No completed run exists for this collection yet.
    NeverIndexed,
}

/// How a run treats the existing corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Re-embed everything, dropping prior records first.
    Full(FullReason),
    /// Finish the remaining files of an interrupted run.
    Resume,
    /// Re-embed only files changed since the last completed run.
    Incremental,
}

impl IndexMode {
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Full(FullReason::Forced) => "full (forced)",
            Self::Full(FullReason::NeverIndexed) => "full (never indexed)",
            Self::Resume => "resume",
            Self::Incremental => "incremental",
        }
    }
}

/// Decision order is fixed: an explicit force wins, then an interrupted
/// run, then the never-indexed check; incremental only applies once a
/// completed run exists. Resumability is checked before the timestamp
/// because an interrupted first run has no timestamp yet, and restarting
/// it from scratch would discard its completed files.
#[must_use]
pub fn decide_mode(force_full: bool, resumable: bool, resume_timestamp_secs: f64) -> IndexMode {
    if force_full {
        return IndexMode::Full(FullReason::Forced);
    }
    if resumable {
        return IndexMode::Resume;
    }
    if resume_timestamp_secs <= 0.0 {
        return IndexMode::Full(FullReason::NeverIndexed);
    }
    IndexMode::Incremental
}
