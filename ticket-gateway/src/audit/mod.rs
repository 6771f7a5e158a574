//! Audit log (append-only JSONL) + reader
//!
//! イベントは `AuditAction` の型付きバリアントで表し、自由形式の JSON は持たない。
//! `AUDIT_HMAC_KEY` が設定されていれば、各行の HMAC-SHA256 を前行のハッシュと連鎖させて
//! `<path>.hash` に書き、`verify` で改ざん検知できる。
//!
//! 書き込み失敗は呼び出し側へ返さない（監査は業務処理の成否に影響しない）。

use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use ticket_core::{Clock, SystemClock};
use tracing::warn;

use crate::model::PaymentStatus;

/// アクション種別ごとのペイロード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    #[serde(rename_all = "camelCase")]
    CompetitionProvisioned { total_tickets: u32 },
    #[serde(rename_all = "camelCase")]
    TicketsReserved {
        ticket_numbers: Vec<u32>,
        expires_at: u64,
    },
    #[serde(rename_all = "camelCase")]
    ReservationReleased { ticket_numbers: Vec<u32> },
    QcmPassed { identifier: String },
    #[serde(rename_all = "camelCase")]
    QcmBlocked {
        identifier: String,
        blocked_until: u64,
    },
    #[serde(rename_all = "camelCase")]
    OrderCreated {
        ticket_numbers: Vec<u32>,
        total_amount: u64,
        currency: String,
        bonus_ticket_count: u32,
    },
    OrderCommitted { sold: Vec<u32>, bonus: Vec<u32> },
    /// 決済済みなのに RESERVED のまま残っていなかった番号がある
    CommitDiscrepancy {
        expected: u32,
        updated: u32,
        missing: Vec<u32>,
    },
    OrderClosed { status: PaymentStatus, released: u32 },
    CompetitionSoldOut,
    #[serde(rename_all = "camelCase")]
    FreeEntryGranted { ticket_number: u32 },
    #[serde(rename_all = "camelCase")]
    DrawExecuted {
        ticket_number: u32,
        winner_user_id: String,
        raw_index: u64,
        eligible_count: u64,
        eligible_digest: String,
        method: String,
        redraw: bool,
    },
    OwnerDeleted { affected: u32 },
}

impl AuditAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompetitionProvisioned { .. } => "COMPETITION_PROVISIONED",
            Self::TicketsReserved { .. } => "TICKETS_RESERVED",
            Self::ReservationReleased { .. } => "RESERVATION_RELEASED",
            Self::QcmPassed { .. } => "QCM_PASSED",
            Self::QcmBlocked { .. } => "QCM_BLOCKED",
            Self::OrderCreated { .. } => "ORDER_CREATED",
            Self::OrderCommitted { .. } => "ORDER_COMMITTED",
            Self::CommitDiscrepancy { .. } => "COMMIT_DISCREPANCY",
            Self::OrderClosed { .. } => "ORDER_CLOSED",
            Self::CompetitionSoldOut => "COMPETITION_SOLD_OUT",
            Self::FreeEntryGranted { .. } => "FREE_ENTRY_GRANTED",
            Self::DrawExecuted { .. } => "DRAW_EXECUTED",
            Self::OwnerDeleted { .. } => "OWNER_DELETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub action: AuditAction,
}

impl AuditEvent {
    pub fn new(at: u64, action: AuditAction) -> Self {
        Self {
            at,
            competition_id: None,
            user_id: None,
            order_id: None,
            action,
        }
    }

    pub fn competition(mut self, competition_id: &str) -> Self {
        self.competition_id = Some(competition_id.to_string());
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn order(mut self, order_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self
    }
}

/// 監査イベントの送り先（fire-and-forget）
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// ハッシュチェーンの設定
#[derive(Debug, Clone)]
pub struct HashChainConfig {
    pub key: Vec<u8>,
    pub key_id: String,
    /// 未指定なら `<audit path>.hash`
    pub hash_path: Option<PathBuf>,
}

struct ChainState {
    prev_hash: Vec<u8>,
    seq: u64,
}

struct HashChain {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    key: Vec<u8>,
    key_id: String,
    state: Mutex<ChainState>,
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    chain: Option<HashChain>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>, chain: Option<HashChainConfig>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let chain = match chain {
            Some(config) => Some(init_hash_chain(&path, config)?),
            None => None,
        };
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            chain,
        })
    }

    pub fn append(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, kind = event.action.kind(), "audit serialize failed");
                return;
            }
        };
        let mut line_bytes = line.into_bytes();
        line_bytes.push(b'\n');

        // ログ行とハッシュ行の順序を揃えるため writer を握ったままチェーンを進める
        let mut writer = self.writer.lock();
        if let Err(err) = writer.write_all(&line_bytes).and_then(|_| writer.flush()) {
            warn!(error = %err, path = %self.path.display(), "audit write failed");
            return;
        }
        if let Some(chain) = &self.chain {
            chain.append(&line_bytes);
        }
    }

    /// 条件に一致する最新 `limit` 件（古い順）
    pub fn read_events(
        &self,
        competition_id: Option<&str>,
        order_id: Option<&str>,
        limit: usize,
    ) -> Vec<AuditEvent> {
        let limit = limit.clamp(1, 1000);
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let reader = BufReader::new(file);
        let mut bucket: VecDeque<AuditEvent> = VecDeque::with_capacity(limit);
        for line in reader.lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            let ev: AuditEvent = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if competition_id.is_some() && ev.competition_id.as_deref() != competition_id {
                continue;
            }
            if order_id.is_some() && ev.order_id.as_deref() != order_id {
                continue;
            }
            bucket.push_back(ev);
            while bucket.len() > limit {
                bucket.pop_front();
            }
        }
        bucket.into_iter().collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn verify(&self, from_seq: u64, limit: usize) -> AuditVerifyResult {
        let Some(chain) = &self.chain else {
            return AuditVerifyResult::failed(0, 0, "AUDIT_HMAC_KEY not configured");
        };
        let limit = limit.clamp(1, 10_000);

        let audit_file = match File::open(&self.path) {
            Ok(f) => f,
            Err(err) => {
                return AuditVerifyResult::failed(0, 0, &format!("audit log open failed: {err}"))
            }
        };
        let hash_file = match File::open(&chain.path) {
            Ok(f) => f,
            Err(err) => {
                return AuditVerifyResult::failed(0, 0, &format!("audit hash open failed: {err}"))
            }
        };

        let mut audit_reader = BufReader::new(audit_file);
        let mut hash_reader = BufReader::new(hash_file);
        let mut line = String::new();
        let mut hash_line = String::new();
        let mut prev_hash: Vec<u8> = Vec::new();
        let mut checked = 0u64;
        let mut last_seq = 0u64;

        loop {
            line.clear();
            hash_line.clear();
            let read_log = audit_reader.read_line(&mut line).unwrap_or(0);
            let read_hash = hash_reader.read_line(&mut hash_line).unwrap_or(0);
            if read_log == 0 && read_hash == 0 {
                break;
            }
            if read_log == 0 || read_hash == 0 {
                return AuditVerifyResult::failed(
                    checked,
                    last_seq,
                    "audit log and hash length mismatch",
                );
            }

            let entry: AuditHashEntry = match serde_json::from_str(hash_line.trim()) {
                Ok(v) => v,
                Err(_) => {
                    return AuditVerifyResult::failed(checked, last_seq, "hash entry parse failed")
                }
            };

            if entry.seq < from_seq {
                prev_hash = decode_hash(&entry.hash).unwrap_or_default();
                last_seq = entry.seq;
                continue;
            }

            let mut line_bytes = line.as_bytes().to_vec();
            if line_bytes.last() != Some(&b'\n') {
                line_bytes.push(b'\n');
            }
            let expected = compute_hmac(&chain.key, &prev_hash, &line_bytes);
            if encode_hash(&expected) != entry.hash {
                return AuditVerifyResult::failed(checked, entry.seq, "hash mismatch detected");
            }
            prev_hash = expected;
            checked += 1;
            last_seq = entry.seq;
            if checked >= limit as u64 {
                break;
            }
        }

        AuditVerifyResult {
            ok: true,
            checked,
            last_seq,
            error: None,
        }
    }
}

impl AuditSink for AuditLog {
    fn record(&self, event: AuditEvent) {
        self.append(&event);
    }
}

impl HashChain {
    fn append(&self, line_bytes: &[u8]) {
        let mut state = self.state.lock();
        let hash_bytes = compute_hmac(&self.key, &state.prev_hash, line_bytes);
        let prev_hash = (!state.prev_hash.is_empty()).then(|| encode_hash(&state.prev_hash));

        let entry = AuditHashEntry {
            seq: state.seq + 1,
            at: SystemClock.now_millis(),
            key_id: self.key_id.clone(),
            prev_hash,
            hash: encode_hash(&hash_bytes),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "audit hash serialize failed");
                return;
            }
        };
        let mut writer = self.writer.lock();
        let written = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(err) = written {
            warn!(error = %err, path = %self.path.display(), "audit hash write failed");
            return;
        }
        state.seq = entry.seq;
        state.prev_hash = hash_bytes;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditHashEntry {
    pub seq: u64,
    pub at: u64,
    pub key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditVerifyResult {
    pub ok: bool,
    pub checked: u64,
    pub last_seq: u64,
    pub error: Option<String>,
}

impl AuditVerifyResult {
    fn failed(checked: u64, last_seq: u64, error: &str) -> Self {
        Self {
            ok: false,
            checked,
            last_seq,
            error: Some(error.to_string()),
        }
    }
}

fn init_hash_chain(path: &Path, config: HashChainConfig) -> std::io::Result<HashChain> {
    let hash_path = config.hash_path.unwrap_or_else(|| {
        let mut s = path.to_string_lossy().to_string();
        s.push_str(".hash");
        PathBuf::from(s)
    });
    if let Some(parent) = hash_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let hash_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&hash_path)?;
    let (prev_hash, seq) = match load_last_hash(&hash_path) {
        Ok(v) => v,
        Err(msg) => {
            if let Err(err) = backup_corrupt_hash(&hash_path) {
                warn!(error = %err, "audit hash backup failed");
            }
            warn!(reason = %msg, "audit hash invalid, resetting chain");
            (Vec::new(), 0)
        }
    };
    Ok(HashChain {
        path: hash_path,
        writer: Mutex::new(BufWriter::new(hash_file)),
        key: config.key,
        key_id: config.key_id,
        state: Mutex::new(ChainState { prev_hash, seq }),
    })
}

fn load_last_hash(path: &Path) -> Result<(Vec<u8>, u64), String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let len = file.metadata().map_err(|e| e.to_string())?.len();
    if len == 0 {
        return Ok((Vec::new(), 0));
    }
    let read_len = len.min(8192);
    file.seek(SeekFrom::End(-(read_len as i64)))
        .map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; read_len as usize];
    file.read_exact(&mut buf).map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&buf);
    let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok((Vec::new(), 0));
    };
    let entry: AuditHashEntry =
        serde_json::from_str(line).map_err(|_| "hash entry parse failed".to_string())?;
    Ok((decode_hash(&entry.hash).unwrap_or_default(), entry.seq))
}

fn encode_hash(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_hash(value: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .ok()
}

fn backup_corrupt_hash(path: &Path) -> std::io::Result<()> {
    let millis = SystemClock.now_millis();
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("audit.hash");
    let backup_name = format!("{file_name}.bad.{millis}");
    let backup_path = path
        .parent()
        .map(|p| p.join(&backup_name))
        .unwrap_or_else(|| PathBuf::from(backup_name));
    std::fs::rename(path, backup_path)
}

fn compute_hmac(key: &[u8], prev_hash: &[u8], line_bytes: &[u8]) -> Vec<u8> {
    // HMAC は任意長の鍵を受け付ける
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(prev_hash);
    mac.update(line_bytes);
    mac.finalize().into_bytes().to_vec()
}

/// テスト用: 記録したイベントをメモリに溜める
#[cfg(test)]
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.action.kind()).collect()
    }
}

#[cfg(test)]
impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
