use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::TransferError;

/// Per-quantum byte budgets replayed during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthProfile {
    budgets: Vec<u64>,
}

impl BandwidthProfile {
    /// Builds a profile from byte budgets. Every budget must be positive.
    pub fn from_budgets(budgets: Vec<u64>) -> Result<Self, TransferError> {
        if budgets.is_empty() {
            return Err(TransferError::InvalidProfile("no budgets".into()));
        }
        if let Some(i) = budgets.iter().position(|&b| b == 0) {
            return Err(TransferError::InvalidProfile(format!(
                "zero budget at quantum {i}"
            )));
        }
        Ok(Self { budgets })
    }

    /// Profile with the same budget for `len` quanta.
    pub fn constant(budget: u64, len: usize) -> Result<Self, TransferError> {
        Self::from_budgets(vec![budget; len])
    }

    /// Parses a trace: one bandwidth sample per line, in bits per quantum.
    ///
    /// Each sample is divided by 8 and truncated to whole bytes. Blank lines
    /// are skipped.
    pub fn parse_trace(text: &str) -> Result<Self, TransferError> {
        let mut budgets = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let lineno = i + 1;
            let bits: f64 = line.parse().map_err(|e| {
                TransferError::InvalidProfile(format!("line {lineno}: {line:?}: {e}"))
            })?;
            if !bits.is_finite() || bits < 0.0 {
                return Err(TransferError::InvalidProfile(format!(
                    "line {lineno}: {line:?} is not a valid bandwidth"
                )));
            }
            let bytes = (bits / 8.0) as u64;
            if bytes == 0 {
                return Err(TransferError::InvalidProfile(format!(
                    "line {lineno}: {line:?} is below one byte per quantum"
                )));
            }
            budgets.push(bytes);
        }
        Self::from_budgets(budgets)
    }

    /// Loads a trace file from disk.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let text = std::fs::read_to_string(path)?;
        let profile = Self::parse_trace(&text)?;
        info!(
            path = %path.display(),
            quanta = profile.len(),
            min = profile.budgets.iter().min().copied().unwrap_or_default(),
            max = profile.budgets.iter().max().copied().unwrap_or_default(),
            "bandwidth profile loaded"
        );
        Ok(profile)
    }

    pub fn len(&self) -> usize {
        self.budgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.budgets.is_empty()
    }

    pub fn budgets(&self) -> &[u64] {
        &self.budgets
    }
}

/// The run-wide position in a [`BandwidthProfile`].
///
/// Advances by exactly one per chunk and never wraps or resets.
#[derive(Debug, Clone)]
pub struct QuotaCursor {
    profile: Arc<BandwidthProfile>,
    position: usize,
}

impl QuotaCursor {
    pub fn new(profile: Arc<BandwidthProfile>) -> Self {
        Self {
            profile,
            position: 0,
        }
    }

    /// Budget at the current position, without advancing.
    pub fn peek(&self) -> Result<u64, TransferError> {
        self.profile
            .budgets
            .get(self.position)
            .copied()
            .ok_or(TransferError::ProfileExhausted {
                position: self.position,
                len: self.profile.len(),
            })
    }

    /// Budget at the current position; advances the cursor by one.
    pub fn draw(&mut self) -> Result<u64, TransferError> {
        let budget = self.peek()?;
        self.position += 1;
        Ok(budget)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Quanta left before the profile is exhausted.
    pub fn remaining(&self) -> usize {
        self.profile.len() - self.position
    }

    pub fn profile(&self) -> &BandwidthProfile {
        &self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trace_divides_by_eight() {
        let profile = BandwidthProfile::parse_trace("800\n1600.9\n\n  85.5 \n").unwrap();
        assert_eq!(profile.budgets(), &[100, 200, 10]);
    }

    #[test]
    fn parse_trace_reports_line_number() {
        let err = BandwidthProfile::parse_trace("800\nfast\n").unwrap_err();
        match err {
            TransferError::InvalidProfile(msg) => assert!(msg.contains("line 2"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_trace_rejects_zero_budget() {
        assert!(matches!(
            BandwidthProfile::parse_trace("800\n7\n"),
            Err(TransferError::InvalidProfile(_))
        ));
        assert!(matches!(
            BandwidthProfile::parse_trace("-80\n"),
            Err(TransferError::InvalidProfile(_))
        ));
    }

    #[test]
    fn empty_profile_rejected() {
        assert!(BandwidthProfile::parse_trace("\n\n").is_err());
        assert!(BandwidthProfile::from_budgets(vec![]).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");
        std::fs::write(&path, "8000\n4000\n").unwrap();

        let profile = BandwidthProfile::load(&path).unwrap();
        assert_eq!(profile.budgets(), &[1000, 500]);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut cursor = QuotaCursor::new(Arc::new(
            BandwidthProfile::from_budgets(vec![5, 6]).unwrap(),
        ));
        assert_eq!(cursor.peek().unwrap(), 5);
        assert_eq!(cursor.peek().unwrap(), 5);
        assert_eq!(cursor.position(), 0);

        assert_eq!(cursor.draw().unwrap(), 5);
        assert_eq!(cursor.peek().unwrap(), 6);
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn draw_past_end_is_exhausted_not_wrapped() {
        let mut cursor = QuotaCursor::new(Arc::new(BandwidthProfile::constant(10, 2).unwrap()));
        cursor.draw().unwrap();
        cursor.draw().unwrap();
        assert_eq!(cursor.remaining(), 0);

        let err = cursor.draw().unwrap_err();
        assert!(matches!(
            err,
            TransferError::ProfileExhausted {
                position: 2,
                len: 2
            }
        ));
        // A failed draw leaves the cursor where it was.
        assert_eq!(cursor.position(), 2);
        assert!(cursor.peek().is_err());
    }
}
