use crate::session::FuzzedMessage;
use crate::state::HangCandidate;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// File name used when findings are written to a log directory.
pub const FINDINGS_FILE: &str = "findings.json";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    /// The failure threshold was reached on one seed.
    Crash,
    /// Consecutive timeouts confirmed a hang.
    Hang,
}

/// A reproducible finding: the seed that triggered it plus, when known, the
/// mutated message that was sent.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Finding {
    pub kind: FindingKind,
    pub run: u64,
    pub seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_index: Option<usize>,
    /// MD5 of the mutated message, for deduplication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hex: Option<String>,
}

impl Finding {
    pub fn crash(run: u64, seed: u64, last_fuzzed: Option<&FuzzedMessage>) -> Self {
        let digest = last_fuzzed.map(|m| format!("{:x}", md5::compute(&m.bytes)));
        Self {
            kind: FindingKind::Crash,
            run,
            seed,
            message_index: last_fuzzed.map(|m| m.index),
            message_md5: digest,
            message_hex: last_fuzzed.map(|m| hex::encode(&m.bytes)),
        }
    }

    /// The mutated bytes of a hang candidate are gone by the time it is confirmed,
    /// so only its run and seed are kept.
    pub fn hang(candidate: HangCandidate) -> Self {
        Self {
            kind: FindingKind::Hang,
            run: candidate.run,
            seed: candidate.seed,
            message_index: None,
            message_md5: None,
            message_hex: None,
        }
    }
}

/// Writes `findings` as pretty JSON into `dir`, returning the file path.
pub fn write_findings(dir: &Path, findings: &[Finding]) -> Result<PathBuf, anyhow::Error> {
    let path = dir.join(FINDINGS_FILE);
    let json = serde_json::to_string_pretty(findings)
        .map_err(|e| anyhow::anyhow!("Failed to serialize findings: {}", e))?;
    std::fs::write(&path, json)
        .map_err(|e| anyhow::anyhow!("Failed to write findings to {:?}: {}", path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_finding_records_digest_of_last_message() {
        let last = FuzzedMessage {
            index: 2,
            bytes: vec![0xFF, 0xFE, 0xFD],
        };
        let finding = Finding::crash(17, 9001, Some(&last));

        assert_eq!(finding.kind, FindingKind::Crash);
        assert_eq!(finding.seed, 9001);
        assert_eq!(finding.message_index, Some(2));
        assert_eq!(
            finding.message_md5,
            Some(format!("{:x}", md5::compute([0xFFu8, 0xFE, 0xFD]))),
            "Digest should be the MD5 hex string of the mutated message"
        );
        assert_eq!(finding.message_hex.as_deref(), Some("fffefd"));
    }

    #[test]
    fn crash_finding_without_fuzzed_message_has_no_digest() {
        let finding = Finding::crash(1, 1, None);
        assert!(finding.message_md5.is_none());
        assert!(finding.message_index.is_none());
    }

    #[test]
    fn hang_finding_uses_candidate() {
        let finding = Finding::hang(HangCandidate { run: 10, seed: 30 });
        assert_eq!(finding.kind, FindingKind::Hang);
        assert_eq!((finding.run, finding.seed), (10, 30));
    }

    #[test]
    fn findings_are_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let findings = vec![
            Finding::crash(
                3,
                3,
                Some(&FuzzedMessage {
                    index: 0,
                    bytes: b"boom".to_vec(),
                }),
            ),
            Finding::hang(HangCandidate { run: 8, seed: 8 }),
        ];

        let path = write_findings(dir.path(), &findings).unwrap();
        assert_eq!(path.file_name().unwrap(), FINDINGS_FILE);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed[0]["kind"], "crash");
        assert_eq!(parsed[0]["message-hex"], "626f6f6d");
        assert_eq!(parsed[1]["kind"], "hang");
        assert!(parsed[1].get("message-md5").is_none());
    }
}
