#![forbid(unsafe_code)]

//! Newline-delimited JSON persistence for the prediction ledger: one
//! append-only stream for ledger records, one for halts. Files are never
//! truncated or rewritten, and streams written by separate processes are
//! safe to concatenate.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use prediction_ledger_core::{replay_projection_analytics, AppendReceipt, LedgerStore, ReplaySummary};
use prediction_ledger_domain::{
    now_utc, CapabilityAdapterGate, EvidenceItem, GateStage, HaltRecord, LedgerRecord,
    Retryability,
};
use serde_json::Value;

pub const POLICY_CODE_APPEND_DENIED: &str = "capability.append_denied";
pub const CAPABILITY_GATE_INVARIANT: &str = "capability_adapter_gate.v1";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("capability denied ({policy_code}) for invocation {invocation_id}")]
    PolicyDenied {
        policy_code: String,
        invocation_id: String,
        halt: Box<HaltRecord>,
    },
    #[error("io error on {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("halt construction error: {0}")]
    Halt(String),
}

/// Append-only NDJSON store over two file paths. Appends serialize first and
/// write the whole line in a single call, so a denied gate or a
/// serialization failure leaves zero bytes behind.
#[derive(Debug)]
pub struct NdjsonLedgerStore {
    records_path: PathBuf,
    halts_path: PathBuf,
    record_lines: u64,
    halt_lines: u64,
}

impl NdjsonLedgerStore {
    /// Opens (or prepares to create) the two streams, resuming line
    /// numbering from whatever is already on disk.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when an existing stream cannot be read.
    pub fn open(records_path: &Path, halts_path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            records_path: records_path.to_path_buf(),
            halts_path: halts_path.to_path_buf(),
            record_lines: count_lines(records_path)?,
            halt_lines: count_lines(halts_path)?,
        })
    }

    #[must_use]
    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    #[must_use]
    pub fn halts_path(&self) -> &Path {
        &self.halts_path
    }

    /// Appends one ledger record under an explicit capability gate.
    ///
    /// # Errors
    /// Returns [`StoreError::PolicyDenied`] (no bytes written) when the gate
    /// is not allowed, [`StoreError::Serialize`] when encoding fails, or
    /// [`StoreError::Io`] when the write fails.
    pub fn try_append_record(
        &mut self,
        gate: &CapabilityAdapterGate,
        record: &LedgerRecord,
    ) -> Result<AppendReceipt, StoreError> {
        self.check_gate(gate)?;
        let line = serde_json::to_string(record)
            .map_err(|err| StoreError::Serialize(err.to_string()))?;
        append_line(&self.records_path, &line)?;
        self.record_lines += 1;
        let receipt = AppendReceipt {
            sequence: self.record_lines,
            evidence_reference: evidence_reference(&self.records_path, self.record_lines),
        };
        tracing::debug!(
            event_kind = record.event_kind(),
            sequence = receipt.sequence,
            "appended ledger record"
        );
        Ok(receipt)
    }

    /// Appends one halt record to the halt stream under an explicit
    /// capability gate.
    ///
    /// # Errors
    /// Same failure surface as [`Self::try_append_record`].
    pub fn try_append_halt(
        &mut self,
        gate: &CapabilityAdapterGate,
        halt: &HaltRecord,
    ) -> Result<AppendReceipt, StoreError> {
        self.check_gate(gate)?;
        let record = LedgerRecord::Halt { halt: halt.clone() };
        let line = serde_json::to_string(&record)
            .map_err(|err| StoreError::Serialize(err.to_string()))?;
        append_line(&self.halts_path, &line)?;
        self.halt_lines += 1;
        tracing::debug!(
            halt_id = halt.halt_id(),
            invariant_id = halt.invariant_id(),
            "appended halt record"
        );
        Ok(AppendReceipt {
            sequence: self.halt_lines,
            evidence_reference: evidence_reference(&self.halts_path, self.halt_lines),
        })
    }

    /// Reads every decodable record from the record stream in append order.
    /// Malformed lines — invalid JSON, non-objects, unrecognized kinds,
    /// halt-shaped records failing validation — are skipped, never raised:
    /// corruption of one line must not block recovery of the rest.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] only when the stream itself cannot be
    /// opened or read.
    pub fn try_read_records(&self) -> Result<Vec<LedgerRecord>, StoreError> {
        read_stream(&self.records_path)
    }

    /// Reads every valid halt from the halt stream, skipping noise.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the stream cannot be read.
    pub fn try_read_halts(&self) -> Result<Vec<HaltRecord>, StoreError> {
        let records = read_stream(&self.halts_path)?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record {
                LedgerRecord::Halt { halt } => Some(halt),
                _ => None,
            })
            .collect())
    }

    /// Rebuilds projection and analytics purely from the record stream.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the stream cannot be read.
    pub fn try_replay(&self) -> Result<ReplaySummary, StoreError> {
        let records = self.try_read_records()?;
        Ok(replay_projection_analytics(records))
    }

    fn check_gate(&self, gate: &CapabilityAdapterGate) -> Result<(), StoreError> {
        if gate.allowed() {
            return Ok(());
        }

        let invocation_id = gate.invocation_id().to_string();
        tracing::warn!(%invocation_id, "capability gate denied ledger append");
        let halt = HaltRecord::new(
            GateStage::CapabilityGate,
            CAPABILITY_GATE_INVARIANT,
            "append_denied",
            &format!("capability gate denied invocation {invocation_id}; no bytes were written"),
            vec![
                EvidenceItem::new("invocation_id", &invocation_id),
                EvidenceItem::new("policy_code", POLICY_CODE_APPEND_DENIED),
            ],
            Retryability::Terminal,
            now_utc(),
        )
        .map_err(|err| StoreError::Halt(err.to_string()))?;

        Err(StoreError::PolicyDenied {
            policy_code: POLICY_CODE_APPEND_DENIED.to_string(),
            invocation_id,
            halt: Box::new(halt),
        })
    }
}

impl LedgerStore for NdjsonLedgerStore {
    fn append_record(
        &mut self,
        gate: &CapabilityAdapterGate,
        record: &LedgerRecord,
    ) -> Result<AppendReceipt> {
        Ok(self.try_append_record(gate, record)?)
    }

    fn append_halt(
        &mut self,
        gate: &CapabilityAdapterGate,
        halt: &HaltRecord,
    ) -> Result<AppendReceipt> {
        Ok(self.try_append_halt(gate, halt)?)
    }

    fn read_records(&self) -> Result<Vec<LedgerRecord>> {
        Ok(self.try_read_records()?)
    }

    fn read_halts(&self) -> Result<Vec<HaltRecord>> {
        Ok(self.try_read_halts()?)
    }

    fn replay(&self) -> Result<ReplaySummary> {
        Ok(self.try_replay()?)
    }
}

fn evidence_reference(path: &Path, line: u64) -> String {
    let file = path
        .file_name()
        .map_or_else(|| "ledger".to_string(), |name| name.to_string_lossy().to_string());
    format!("{file}#{line}")
}

fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    file.write_all(format!("{line}\n").as_bytes())
        .map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    file.flush().map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn count_lines(path: &Path) -> Result<u64, StoreError> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path).map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let reader = BufReader::new(file);
    let mut count = 0_u64;
    for line in reader.lines() {
        line.map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        count += 1;
    }
    Ok(count)
}

fn read_stream(path: &Path) -> Result<Vec<LedgerRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if let Some(record) = LedgerRecord::from_value(&value) {
            records.push(record);
        }
    }
    Ok(records)
}
