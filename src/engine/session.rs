//! Upload session state and chunk plan derivation
//!
//! A session is keyed by the file fingerprint, persists across restarts, and
//! is the unit of resume. Timestamps are Unix milliseconds.

use crate::compression::NetworkClass;
use crate::error::{FcResult, FileChunkError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MIB: u64 = 1024 * 1024;

/// Transfer state of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Uploaded,
    Failed,
    Skipped,
}

/// One entry of the chunk plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub fingerprint: Option<String>,
    pub state: ChunkState,
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    New,
    Probing,
    Uploading,
    Paused,
    Merging,
    Done,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }

    /// Legal moves of the session state machine. `Cancelled` and `Failed`
    /// are reachable from every non-terminal state.
    fn can_transition(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (New, Probing)
                | (Probing, Uploading)
                | (Probing, Done)
                | (Uploading, Paused)
                | (Uploading, Merging)
                | (Paused, Uploading)
                | (Merging, Uploading)
                | (Merging, Done)
        )
    }
}

/// Persisted state of one upload attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Session id; equals the file fingerprint
    pub session_id: String,
    pub file_fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: Option<String>,
    pub chunk_size: u64,
    pub plan: Vec<ChunkDescriptor>,
    pub endpoint_id: Option<String>,
    /// Retry attempts per chunk index
    pub attempt_counters: BTreeMap<u32, u32>,
    pub status: SessionStatus,
    /// Final URL once the server reports the artifact
    pub url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadSession {
    pub fn new(
        fingerprint: String,
        file_name: String,
        file_size: u64,
        file_type: Option<String>,
        chunk_size: u64,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            session_id: fingerprint.clone(),
            file_fingerprint: fingerprint,
            file_name,
            file_size,
            file_type,
            chunk_size,
            plan: build_plan(file_size, chunk_size),
            endpoint_id: None,
            attempt_counters: BTreeMap::new(),
            status: SessionStatus::New,
            url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Store key for this session's fingerprint
    pub fn store_key(fingerprint: &str) -> String {
        format!("session:{fingerprint}")
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: SessionStatus) -> FcResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition(next) {
            return Err(FileChunkError::input(format!(
                "illegal session transition {:?} -> {next:?}",
                self.status
            ))
            .retryable(false));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp_millis();
    }

    pub fn total_chunks(&self) -> usize {
        self.plan.len()
    }

    pub fn set_chunk_state(&mut self, index: u32, state: ChunkState) {
        if let Some(chunk) = self.plan.get_mut(index as usize) {
            chunk.state = state;
            self.touch();
        }
    }

    pub fn pending_chunks(&self) -> Vec<u32> {
        self.plan
            .iter()
            .filter(|c| c.state == ChunkState::Pending)
            .map(|c| c.index)
            .collect()
    }

    /// Indices not yet uploaded (pending, failed, or stuck in flight after a
    /// crash).
    pub fn incomplete_chunks(&self) -> Vec<u32> {
        self.plan
            .iter()
            .filter(|c| !matches!(c.state, ChunkState::Uploaded | ChunkState::Skipped))
            .map(|c| c.index)
            .collect()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.plan
            .iter()
            .filter(|c| c.state == ChunkState::Uploaded)
            .map(|c| c.length)
            .sum()
    }

    pub fn all_uploaded(&self) -> bool {
        self.plan
            .iter()
            .all(|c| matches!(c.state, ChunkState::Uploaded | ChunkState::Skipped))
    }

    pub fn record_attempt(&mut self, index: u32) -> u32 {
        let counter = self.attempt_counters.entry(index).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Whether a persisted session still matches the file and chunking it
    /// would be resumed for.
    pub fn matches(&self, fingerprint: &str, file_size: u64, chunk_size: u64) -> bool {
        self.file_fingerprint == fingerprint
            && self.file_size == file_size
            && self.chunk_size == chunk_size
            && self.plan.len() == build_plan_len(file_size, chunk_size)
    }

    /// Reset transient chunk states after a crash or before a retry pass, so
    /// only `Uploaded` progress is trusted.
    pub fn reset_transient_chunks(&mut self) {
        for chunk in &mut self.plan {
            if matches!(chunk.state, ChunkState::InFlight | ChunkState::Failed) {
                chunk.state = ChunkState::Pending;
            }
        }
        self.touch();
    }
}

/// Chunk size as a function of file size and network class.
pub fn derive_chunk_size(file_size: u64, network: NetworkClass, configured: u64) -> u64 {
    if configured > 0 {
        return configured;
    }

    let base = if file_size <= 100 * MIB {
        MIB
    } else if file_size <= 1024 * MIB {
        4 * MIB
    } else {
        8 * MIB
    };

    match network {
        NetworkClass::Fast | NetworkClass::VeryFast => (base * 2).min(8 * MIB),
        NetworkClass::VerySlow => (base / 2).max(MIB / 4),
        _ => base,
    }
}

fn build_plan_len(file_size: u64, chunk_size: u64) -> usize {
    if file_size == 0 || chunk_size == 0 {
        return 1;
    }
    ((file_size + chunk_size - 1) / chunk_size) as usize
}

/// Derive the ordered chunk plan. Offsets increase strictly, indices are
/// dense from 0, lengths sum to the file size, and an empty file still gets
/// one zero-length chunk.
pub fn build_plan(file_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let count = build_plan_len(file_size, chunk_size);
    (0..count)
        .map(|i| {
            let offset = i as u64 * chunk_size;
            let length = (file_size - offset).min(chunk_size);
            ChunkDescriptor {
                index: i as u32,
                offset,
                length,
                fingerprint: None,
                state: ChunkState::Pending,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_invariants_hold() {
        for (size, chunk) in [
            (2_500_000u64, 1_048_576u64),
            (1_048_576, 1_048_576),
            (1, 1_048_576),
            (10 * MIB, MIB),
        ] {
            let plan = build_plan(size, chunk);
            assert_eq!(plan.len(), ((size + chunk - 1) / chunk) as usize);
            assert_eq!(plan.iter().map(|c| c.length).sum::<u64>(), size);
            for (i, descriptor) in plan.iter().enumerate() {
                assert_eq!(descriptor.index as usize, i);
                if i > 0 {
                    assert!(descriptor.offset > plan[i - 1].offset);
                }
                assert!(descriptor.length > 0);
            }
        }
    }

    #[test]
    fn empty_file_gets_one_zero_length_chunk() {
        let plan = build_plan(0, MIB);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].length, 0);
        assert_eq!(plan[0].offset, 0);
    }

    #[test]
    fn exact_boundary_has_full_final_chunk() {
        let plan = build_plan(3 * MIB, MIB);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.last().unwrap().length, MIB);
    }

    #[test]
    fn chunk_size_scales_with_file_and_network() {
        assert_eq!(
            derive_chunk_size(50 * MIB, NetworkClass::Medium, 0),
            MIB
        );
        assert_eq!(
            derive_chunk_size(500 * MIB, NetworkClass::Medium, 0),
            4 * MIB
        );
        assert_eq!(
            derive_chunk_size(2048 * MIB, NetworkClass::Medium, 0),
            8 * MIB
        );
        assert_eq!(derive_chunk_size(50 * MIB, NetworkClass::Fast, 0), 2 * MIB);
        assert_eq!(
            derive_chunk_size(50 * MIB, NetworkClass::VerySlow, 0),
            MIB / 2
        );
        // Explicit configuration wins
        assert_eq!(derive_chunk_size(50 * MIB, NetworkClass::Fast, 1234), 1234);
    }

    #[test]
    fn status_machine_accepts_the_happy_path() {
        let mut session = UploadSession::new(
            "abc".to_string(),
            "file.bin".to_string(),
            100,
            None,
            10,
        );
        for status in [
            SessionStatus::Probing,
            SessionStatus::Uploading,
            SessionStatus::Paused,
            SessionStatus::Uploading,
            SessionStatus::Merging,
            SessionStatus::Done,
        ] {
            session.transition(status).unwrap();
        }
        assert!(session.status.is_terminal());
    }

    #[test]
    fn status_machine_rejects_illegal_moves() {
        let mut session =
            UploadSession::new("abc".to_string(), "file.bin".to_string(), 100, None, 10);
        assert!(session.transition(SessionStatus::Merging).is_err());

        session.transition(SessionStatus::Cancelled).unwrap();
        assert!(session.transition(SessionStatus::Uploading).is_err());
    }

    #[test]
    fn dedup_hit_short_circuits_to_done() {
        let mut session =
            UploadSession::new("abc".to_string(), "file.bin".to_string(), 100, None, 10);
        session.transition(SessionStatus::Probing).unwrap();
        session.transition(SessionStatus::Done).unwrap();
    }

    #[test]
    fn transient_states_reset_for_resume() {
        let mut session =
            UploadSession::new("abc".to_string(), "f".to_string(), 30, None, 10);
        session.set_chunk_state(0, ChunkState::Uploaded);
        session.set_chunk_state(1, ChunkState::InFlight);
        session.set_chunk_state(2, ChunkState::Failed);

        session.reset_transient_chunks();
        assert_eq!(session.plan[0].state, ChunkState::Uploaded);
        assert_eq!(session.plan[1].state, ChunkState::Pending);
        assert_eq!(session.plan[2].state, ChunkState::Pending);
        assert_eq!(session.pending_chunks(), vec![1, 2]);
    }

    #[test]
    fn session_matching_detects_plan_drift() {
        let session =
            UploadSession::new("abc".to_string(), "f".to_string(), 100, None, 10);
        assert!(session.matches("abc", 100, 10));
        assert!(!session.matches("abc", 100, 20));
        assert!(!session.matches("other", 100, 10));
    }
}
