use crate::failover::{
    candidate_order, reconcile_after_health_check, reconcile_after_unregister, select,
    FailoverPolicy, FailoverStrategy, StatusTable,
};
use crate::provider::VoiceProvider;
use crate::types::{Capabilities, ErrorKind, ProviderDescriptor, ProviderFailure, ProviderStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 登録済みプロバイダ
#[derive(Clone)]
pub(crate) struct ProviderEntry {
    pub provider: Arc<dyn VoiceProvider>,
    pub descriptor: ProviderDescriptor,
    /// 登録ごとに増える番号（再登録でヘルスキャッシュを無効化する）
    pub generation: u64,
}

/// ヘルスチェック1件分の結果
#[derive(Debug, Clone)]
pub(crate) struct HealthRecord {
    pub provider_id: String,
    pub generation: u64,
    pub status: ProviderStatus,
    pub checked_at: DateTime<Utc>,
}

/// アクティブ変更の理由（ログ用）
#[derive(Debug, Clone, Copy)]
enum ChangeReason {
    HealthCheck,
    Failover,
    Unregister,
}

struct RouterState {
    /// 登録順
    entries: Vec<ProviderEntry>,
    active: String,
    last_errors: HashMap<String, ProviderFailure>,
    last_health_check: Option<DateTime<Utc>>,
    next_generation: u64,
}

impl RouterState {
    fn statuses(&self) -> StatusTable {
        self.entries
            .iter()
            .map(|e| (e.descriptor.id.clone(), e.descriptor.status))
            .collect()
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut ProviderEntry> {
        self.entries.iter_mut().find(|e| e.descriptor.id == id)
    }

    fn set_active(&mut self, next: String, reason: ChangeReason) {
        if next != self.active {
            log::info!(
                "アクティブプロバイダを変更: {} → {} ({:?})",
                self.active,
                next,
                reason
            );
            self.active = next;
        }
    }
}

/// プロバイダ状態表・アクティブポインタ・直近エラーの共有状態
///
/// すべての書き込みは1つのロックの中で行い、
/// ヘルスチェックと失敗観測が同時に起きても更新が失われないようにする。
/// アクティブポインタは `failover` の決定関数の結果でのみ更新する。
#[derive(Clone)]
pub struct SharedState {
    policy: Arc<FailoverPolicy>,
    inner: Arc<Mutex<RouterState>>,
}

impl SharedState {
    pub fn new(policy: FailoverPolicy) -> Self {
        let active = policy.primary_provider_id.clone();
        Self {
            policy: Arc::new(policy),
            inner: Arc::new(Mutex::new(RouterState {
                entries: Vec::new(),
                active,
                last_errors: HashMap::new(),
                last_health_check: None,
                next_generation: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // ロック中にプロバイダを呼ばないので、ポイズンしても状態は整合している
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    /// プロバイダを登録（同名は置き換え、状態は Unknown に戻る）
    pub(crate) fn register(&self, provider: Arc<dyn VoiceProvider>) -> bool {
        let descriptor = ProviderDescriptor::new(provider.id(), provider.capabilities());
        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.last_errors.remove(&descriptor.id);

        let entry = ProviderEntry {
            provider,
            descriptor,
            generation,
        };
        if let Some(existing) = state.entry_mut(&entry.descriptor.id) {
            *existing = entry;
            true
        } else {
            state.entries.push(entry);
            false
        }
    }

    /// 登録解除。アクティブだった場合はプライマリへ戻す
    pub(crate) fn unregister(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.descriptor.id != id);
        if state.entries.len() == before {
            return false;
        }
        state.last_errors.remove(id);

        let next = reconcile_after_unregister(&self.policy, &state.active, id);
        state.set_active(next, ChangeReason::Unregister);
        true
    }

    pub fn active(&self) -> String {
        self.lock().active.clone()
    }

    pub fn status_of(&self, id: &str) -> Option<ProviderStatus> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| e.descriptor.status)
    }

    pub(crate) fn entries(&self) -> Vec<ProviderEntry> {
        self.lock().entries.clone()
    }

    /// 試行順の候補（登録済みかつ機能を満たすもののみ）
    pub(crate) fn candidates<F>(&self, accepts: F) -> Vec<Arc<dyn VoiceProvider>>
    where
        F: Fn(&Capabilities) -> bool,
    {
        let state = self.lock();
        let registered: Vec<String> = state
            .entries
            .iter()
            .map(|e| e.descriptor.id.clone())
            .collect();
        let order = candidate_order(&self.policy, &state.statuses(), &state.active, &registered);

        order
            .iter()
            .filter_map(|id| state.entries.iter().find(|e| &e.descriptor.id == id))
            .filter(|e| accepts(&e.descriptor.capabilities))
            .map(|e| Arc::clone(&e.provider))
            .collect()
    }

    /// 呼び出し成功を記録（楽観的に Available へ）
    pub(crate) fn record_success(&self, id: &str) {
        self.record(id, Some(ProviderStatus::Available), None);
    }

    /// 呼び出し失敗を記録
    ///
    /// API障害・タイムアウト・例外は Degraded、依存関係の問題は Unavailable。
    /// 入力起因の失敗（無音・候補なし・形式不正）は状態を変えない。
    pub(crate) fn record_failure(&self, failure: &ProviderFailure) {
        let status = match failure.error_kind {
            ErrorKind::ApiError | ErrorKind::Timeout | ErrorKind::Exception => {
                Some(ProviderStatus::Degraded)
            }
            ErrorKind::DependencyUnavailable => Some(ProviderStatus::Unavailable),
            _ => None,
        };
        self.record(&failure.provider_id, status, Some(failure.clone()));
    }

    fn record(&self, id: &str, status: Option<ProviderStatus>, failure: Option<ProviderFailure>) {
        let mut state = self.lock();
        if let Some(failure) = failure {
            state.last_errors.insert(id.to_string(), failure);
        }

        let Some(status) = status else {
            return;
        };
        let Some(entry) = state.entry_mut(id) else {
            return;
        };
        if entry.descriptor.status != status {
            log::info!("{}: 状態 {:?} → {:?}", id, entry.descriptor.status, status);
            entry.descriptor.status = status;
        }

        let next = select(&self.policy, &state.statuses(), &state.active);
        state.set_active(next, ChangeReason::Failover);
    }

    /// ヘルスチェック結果を書き込み、アクティブを再決定
    ///
    /// チェック中に再登録・登録解除されたプロバイダの結果は捨てる。
    pub(crate) fn apply_health(&self, records: &[HealthRecord], checked_at: DateTime<Utc>) {
        let mut state = self.lock();
        for record in records {
            let Some(entry) = state.entry_mut(&record.provider_id) else {
                continue;
            };
            if entry.generation != record.generation {
                continue;
            }
            entry.descriptor.status = record.status;
            entry.descriptor.last_checked_at = Some(record.checked_at);
        }
        state.last_health_check = Some(checked_at);

        let next = reconcile_after_health_check(&self.policy, &state.statuses(), &state.active);
        state.set_active(next, ChangeReason::HealthCheck);
    }

    /// 現在の状態のスナップショット
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            active_provider: state.active.clone(),
            strategy: self.policy.strategy,
            providers: state
                .entries
                .iter()
                .map(|e| ProviderSnapshot {
                    descriptor: e.descriptor.clone(),
                    last_error: state.last_errors.get(&e.descriptor.id).cloned(),
                })
                .collect(),
            last_health_check: state.last_health_check,
        }
    }
}

/// プロバイダ単位のスナップショット
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSnapshot {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ProviderFailure>,
}

/// `get_status()` の戻り値
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub active_provider: String,
    pub strategy: FailoverStrategy,
    pub providers: Vec<ProviderSnapshot>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn provider(&self, id: &str) -> Option<&ProviderSnapshot> {
        self.providers.iter().find(|p| p.descriptor.id == id)
    }
}
